use std::{io, num::NonZeroUsize, path::PathBuf, time::Duration};

use futures::future::try_join_all;
use log::{info, warn};
use machine_learning::TrainableModel;
use tokio::time;

use super::{
    ManagedSession,
    checkpointer::{Checkpointer, Snapshotter},
};
use crate::{
    Result, WorkerErr,
    checkpoint::{Checkpoint, Saver},
    cluster::{ClusterDescriptor, Role, TaskIndex},
    config::TrainingConfig,
    net::{HostClient, RetryPolicy},
    placement::VariableLayout,
};

/// How a session is brought up and kept alive.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Where the checkpoints are read from and written to.
    pub log_dir: PathBuf,
    pub save_model_period: Duration,
    /// How long followers wait between two readiness checks.
    pub recovery_wait: Duration,
    /// How many readiness checks followers make before giving up.
    pub max_recovery_polls: NonZeroUsize,
    pub max_to_keep: usize,
    pub retry: RetryPolicy,
    pub seed: Option<u64>,
}

impl SessionConfig {
    /// Takes the session settings out of an experiment's config.
    pub fn from_training(config: &TrainingConfig, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            save_model_period: config.save_model_period(),
            recovery_wait: config.recovery_wait(),
            max_recovery_polls: config.max_recovery_polls,
            max_to_keep: config.max_to_keep.get(),
            retry: config.retry_policy(),
            seed: config.seed,
        }
    }
}

/// Brings this process' training session up.
///
/// The leader restores the variables from the latest checkpoint or initializes them
/// and keeps checkpointing them, followers wait until the leader is done. The host
/// owning the global step is always set up last, once it reports being initialized
/// every other host is too.
pub struct SessionCoordinator {
    task: TaskIndex,
    role: Role,
    cluster: ClusterDescriptor,
    layout: VariableLayout,
    config: SessionConfig,
}

impl SessionCoordinator {
    /// Creates a new `SessionCoordinator`.
    ///
    /// # Arguments
    /// * `task` - This process' task index.
    /// * `role` - This process' role.
    /// * `cluster` - The address of every host.
    /// * `layout` - Where every variable of the model lives.
    /// * `config` - The session settings.
    pub fn new(
        task: TaskIndex,
        role: Role,
        cluster: ClusterDescriptor,
        layout: VariableLayout,
        config: SessionConfig,
    ) -> Self {
        Self {
            task,
            role,
            cluster,
            layout,
            config,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Prepares a session ready to train `model`.
    ///
    /// # Arguments
    /// * `model` - The model whose variables the layout was built from.
    ///
    /// # Returns
    /// The ready session, a `ConfigurationError` if the model doesn't fit the layout or
    /// `ConnectionLost` if a host is unreachable.
    pub async fn prepare<M: TrainableModel>(&self, model: &M) -> Result<ManagedSession> {
        if model.size() != self.layout.nparams() {
            return Err(WorkerErr::config(format!(
                "the model has {} parameters but the layout places {}",
                model.size(),
                self.layout.nparams()
            )));
        }

        info!(task = self.task.get(), role:% = self.role; "preparing session");
        let mut clients = self.connect_all().await?;

        let checkpointer = match self.role {
            Role::Leader => {
                let saver = Saver::new(&self.config.log_dir, self.config.max_to_keep);
                self.restore_or_initialize(&mut clients, &saver).await?;

                let snapshotter = Snapshotter::new(self.connect_all().await?, self.layout.clone());
                Some(Checkpointer::spawn(
                    snapshotter,
                    saver,
                    self.config.save_model_period,
                ))
            }
            Role::Follower => {
                self.wait_for_leader(&mut clients).await?;
                None
            }
        };

        info!(task = self.task.get(); "session ready");
        Ok(ManagedSession::new(
            self.layout.clone(),
            clients,
            checkpointer,
        ))
    }

    /// Connects to every host, in task order.
    async fn connect_all(&self) -> Result<Vec<HostClient>> {
        let policy = self.config.retry;
        let conns = self
            .cluster
            .addresses()
            .iter()
            .map(|addr| HostClient::connect(addr.as_str(), policy));

        try_join_all(conns).await
    }

    async fn restore_or_initialize(&self, clients: &mut [HostClient], saver: &Saver) -> Result<()> {
        match self.latest_checkpoint(saver) {
            Some(checkpoint) => self.restore(clients, checkpoint).await,
            None => self.initialize(clients).await,
        }
    }

    /// Reads the latest checkpoint if it can be restored into the layout.
    fn latest_checkpoint(&self, saver: &Saver) -> Option<Checkpoint> {
        let path = match saver.latest() {
            Ok(Some(path)) => path,
            Ok(None) => return None,
            Err(e) => {
                warn!("ignoring the checkpoints: {e}");
                return None;
            }
        };

        let checkpoint = match saver.restore(&path) {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                warn!("ignoring the latest checkpoint: {e}");
                return None;
            }
        };

        if !fits(&checkpoint, &self.layout) {
            warn!(
                "checkpoint {} doesn't match the model's variables, ignoring it",
                path.display()
            );
            return None;
        }

        Some(checkpoint)
    }

    async fn restore(&self, clients: &mut [HostClient], checkpoint: Checkpoint) -> Result<()> {
        let mut host_bufs: Vec<Vec<f32>> = self
            .layout
            .hosts()
            .iter()
            .map(|host| vec![0.; host.len])
            .collect();

        for (slot, saved) in self.layout.slots().iter().zip(&checkpoint.variables) {
            host_bufs[slot.host.get()][slot.offset..slot.offset + slot.len]
                .copy_from_slice(&saved.values);
        }

        let global_step = checkpoint.global_step;
        let gs_host = self.layout.global_step_host().get();
        let restores = clients
            .iter_mut()
            .zip(&mut host_bufs)
            .enumerate()
            .filter(|(task, _)| *task != gs_host)
            .map(|(_, (client, buf))| client.restore(global_step, buf));

        try_join_all(restores).await?;
        clients[gs_host]
            .restore(global_step, &mut host_bufs[gs_host])
            .await?;
        info!(global_step = global_step; "restored the variables from a checkpoint");
        Ok(())
    }

    async fn initialize(&self, clients: &mut [HostClient]) -> Result<()> {
        let seed = self.config.seed;
        let layout = &self.layout;
        let gs_host = layout.global_step_host();

        let inits = clients
            .iter_mut()
            .enumerate()
            .map(|(task, client)| (TaskIndex::new(task), client))
            .filter(|(task, _)| *task != gs_host)
            .map(|(task, client)| client.initialize(layout.init_spec(task, seed)));

        try_join_all(inits).await?;
        clients[gs_host.get()]
            .initialize(layout.init_spec(gs_host, seed))
            .await?;
        info!("initialized the variables from scratch");
        Ok(())
    }

    /// Polls the hosts until the leader initialized every one of them.
    ///
    /// # Returns
    /// A `ConfigurationError` if the leader is done but some host holds no variables,
    /// which happens when a process restarts alone, or `ConnectionLost` once the polls
    /// run out.
    async fn wait_for_leader(&self, clients: &mut [HostClient]) -> Result<()> {
        let gs_host = self.layout.global_step_host().get();

        for poll in 1..=self.config.max_recovery_polls.get() {
            let statuses = try_join_all(clients.iter_mut().map(HostClient::status)).await?;
            let pending: Vec<_> = statuses
                .iter()
                .enumerate()
                .filter(|(_, status)| !status.initialized)
                .map(|(task, _)| task)
                .collect();

            if pending.is_empty() {
                return Ok(());
            }

            if statuses[gs_host].initialized {
                return Err(WorkerErr::config(format!(
                    "the leader already set the cluster up but tasks {pending:?} hold no \
                     variables, restart every process of the job"
                )));
            }

            info!(
                task = self.task.get(), pending = pending.len(), poll = poll;
                "waiting for the leader, checking again in {:?}", self.config.recovery_wait
            );

            time::sleep(self.config.recovery_wait).await;
        }

        Err(WorkerErr::ConnectionLost {
            addr: clients[gs_host].addr().to_string(),
            source: io::Error::new(
                io::ErrorKind::TimedOut,
                format!(
                    "the leader didn't set the cluster up after {} checks",
                    self.config.max_recovery_polls
                ),
            ),
        })
    }
}

/// Whether `checkpoint` holds exactly the variables of `layout`.
fn fits(checkpoint: &Checkpoint, layout: &VariableLayout) -> bool {
    checkpoint.variables.len() == layout.slots().len()
        && checkpoint
            .variables
            .iter()
            .zip(layout.slots())
            .all(|(saved, slot)| saved.name == slot.name && saved.values.len() == slot.len)
}
