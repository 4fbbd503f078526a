mod args;

use std::{env, io, path::Path};

use log::{error, info, warn};
use machine_learning::{Dataset, LinearRegression, TrainableModel};
use parameter_server::{HostBuilder, HostSpec};
use tokio::{net::TcpListener, runtime, signal};
use tokio_util::sync::CancellationToken;
use worker::{
    ClusterDescriptor, LoopConfig, ModelConfig, ReplicaPlacement, Result, Role, SessionConfig,
    SessionCoordinator, TaskEntry, TaskIndex, TrainingConfig, TrainingLoop,
    metrics::SummaryWriter,
};

use crate::args::Args;

const VISIBLE_DEVICES_ENV: &str = "CUDA_VISIBLE_DEVICES";

/// Everything a process reads before any thread is started.
struct Startup {
    args: Args,
    task: TaskIndex,
    config: TrainingConfig,
    cluster: ClusterDescriptor,
    entry: TaskEntry,
}

fn main() -> io::Result<()> {
    env_logger::init();

    let res = load().and_then(|startup| {
        restrict_devices(&startup);

        let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
        rt.block_on(run(startup))
    });

    if let Err(e) = &res {
        error!("{e}");
    }

    Ok(res?)
}

fn load() -> Result<Startup> {
    let args = Args::from_env()?;
    let task = TaskIndex::from_env()?;
    let config = TrainingConfig::load(&args.config, &args.experiment)?;
    let cluster = ClusterDescriptor::load(&args.cluster)?;
    let entry = cluster.entry(task)?;

    Ok(Startup {
        args,
        task,
        config,
        cluster,
        entry,
    })
}

/// Hides every GPU but this task's own from the compute libraries.
fn restrict_devices(startup: &Startup) {
    let devices = startup.entry.visible_devices();
    info!(task = startup.task.get(); "visible devices: {devices:?}");

    // SAFETY: the runtime isn't built yet, this is the only thread of the process.
    unsafe { env::set_var(VISIBLE_DEVICES_ENV, devices) };
}

async fn run(startup: Startup) -> Result<()> {
    let Startup {
        args,
        task,
        config,
        cluster,
        entry,
    } = startup;

    let role = Role::of(task);
    let placement = ReplicaPlacement::new(task, &cluster)?;

    info!(
        task = task.get(), role:% = role, device:% = placement.worker_device();
        "starting experiment {}", args.experiment
    );

    let model = build_model(&config.model);
    let layout = placement.layout(&model.variables());
    let log_dir = worker::config::log_dir(&args.logdir, &args.experiment);

    let listener = TcpListener::bind(entry.address.as_str()).await?;
    let host = HostBuilder::new().build(HostSpec {
        nparams: layout.host_len(task),
        shard_size: config.shard_size,
        optimizer: config.optimizer,
        owns_global_step: task == layout.global_step_host(),
    });

    let shutdown = CancellationToken::new();
    let host_task = tokio::spawn(parameter_server::serve(
        listener,
        host,
        shutdown.clone(),
        config.shutdown_grace(),
    ));

    let stop = CancellationToken::new();
    tokio::spawn(watch_ctrl_c(stop.clone()));

    let session_config = SessionConfig::from_training(&config, &log_dir);
    let coordinator = SessionCoordinator::new(task, role, cluster, layout, session_config);
    let res = train(task, &config, model, coordinator, &log_dir, stop).await;

    info!(task = task.get(); "shutting the variable host down");
    shutdown.cancel();

    match host_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("variable host failed: {e}"),
        Err(e) => warn!("variable host task failed: {e}"),
    }

    res
}

async fn train(
    task: TaskIndex,
    config: &TrainingConfig,
    model: LinearRegression,
    coordinator: SessionCoordinator,
    log_dir: &Path,
    stop: CancellationToken,
) -> Result<()> {
    let features = match &config.model {
        ModelConfig::Linear { features, .. } => *features,
    };

    let dataset = Dataset::load(&config.train_path, features)?;
    let seed = config.seed.map(|seed| seed.wrapping_add(task.get() as u64));
    let batches = dataset.batches(config.batch_size, config.epochs, seed);

    let session = tokio::select! {
        session = coordinator.prepare(&model) => session?,
        _ = stop.cancelled() => {
            info!(task = task.get(); "stopped before the session was ready");
            return Ok(());
        }
    };

    let writer = SummaryWriter::open(log_dir, task, config.summary_flush_period())?;
    let lp = TrainingLoop::new(
        task,
        model,
        session,
        LoopConfig::from(config),
        Some(writer),
        stop,
    );

    lp.run(batches).await?;
    Ok(())
}

fn build_model(config: &ModelConfig) -> LinearRegression {
    match config {
        ModelConfig::Linear { features, init } => LinearRegression::new(*features, init.clone()),
    }
}

async fn watch_ctrl_c(stop: CancellationToken) {
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("received SIGINT, stopping");
            stop.cancel();
        }
        Err(e) => warn!("can't listen for SIGINT: {e}"),
    }
}
