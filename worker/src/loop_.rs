use std::{fmt, num::NonZeroUsize, time::Instant};

use log::{info, warn};
use machine_learning::TrainableModel;
use tokio_util::sync::CancellationToken;

use crate::{
    Result,
    cluster::TaskIndex,
    config::TrainingConfig,
    feeder::Feeder,
    metrics::{MetricsReporter, SummaryWriter},
    session::TrainingSession,
};

/// The lifecycle of a `TrainingLoop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Initializing,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            LoopState::Initializing => "initializing",
            LoopState::Running => "running",
            LoopState::Stopping => "stopping",
            LoopState::Stopped => "stopped",
        };

        f.write_str(state)
    }
}

/// The settings of a `TrainingLoop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopConfig {
    pub report_frequency: NonZeroUsize,
    /// Stops the cluster once the global step reaches it.
    pub max_steps: Option<u64>,
    pub queue_capacity: NonZeroUsize,
}

impl From<&TrainingConfig> for LoopConfig {
    fn from(config: &TrainingConfig) -> Self {
        Self {
            report_frequency: config.report_frequency,
            max_steps: config.max_steps,
            queue_capacity: config.queue_capacity,
        }
    }
}

/// How a finished loop went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopOutcome {
    /// The steps run by this process.
    pub local_steps: u64,
    /// The last global step observed.
    pub global_step: u64,
}

/// Drives a model through a session until the cluster stops.
///
/// Every iteration takes one example from the feeder, runs a step with it and feeds
/// the reporter. The loop stops once the session says so, which happens after any
/// process asks for it. Asking for it happens here when the external stop token is
/// cancelled, the step limit is reached, the data runs out or a step fails.
pub struct TrainingLoop<M, S> {
    task: TaskIndex,
    model: M,
    session: S,
    config: LoopConfig,
    writer: Option<SummaryWriter>,
    stop: CancellationToken,
    state: LoopState,
}

impl<M, S> TrainingLoop<M, S>
where
    M: TrainableModel,
    S: TrainingSession,
{
    /// Creates a new `TrainingLoop`.
    ///
    /// # Arguments
    /// * `task` - This process' task index.
    /// * `model` - The model to train.
    /// * `session` - A prepared session.
    /// * `config` - The loop settings.
    /// * `writer` - Where to persist the metrics, if anywhere.
    /// * `stop` - Asks the cluster to stop once cancelled.
    pub fn new(
        task: TaskIndex,
        model: M,
        session: S,
        config: LoopConfig,
        writer: Option<SummaryWriter>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            task,
            model,
            session,
            config,
            writer,
            stop,
            state: LoopState::Initializing,
        }
    }

    /// Trains over `examples` until the cluster stops, then tears everything down.
    ///
    /// # Arguments
    /// * `examples` - The training data, consumed on the blocking pool.
    ///
    /// # Returns
    /// How the loop went or the error that ended it.
    pub async fn run<I>(mut self, examples: I) -> Result<LoopOutcome>
    where
        I: IntoIterator<Item = M::Example> + Send + 'static,
        I::IntoIter: Send,
    {
        info!(task = self.task.get(), state:% = self.state; "training loop");

        let mut feeder = Feeder::spawn(
            examples,
            self.config.queue_capacity.get(),
            CancellationToken::new(),
        );

        let res = match self.session.global_step().await {
            Ok(start_step) => {
                let mut reporter = MetricsReporter::new(
                    self.config.report_frequency,
                    start_step,
                    Instant::now(),
                    self.task,
                    self.writer.take(),
                );

                self.transition(LoopState::Running);
                let res = self.train(&mut feeder, &mut reporter, start_step).await;
                reporter.close();
                res
            }
            Err(e) => Err(e),
        };

        self.transition(LoopState::Stopping);

        if let Err(e) = &res {
            warn!(task = self.task.get(); "training failed: {e}");
            self.session.request_stop().await;
        }

        let fed = feeder.shutdown().await;
        let closed = self.session.close().await;
        self.transition(LoopState::Stopped);

        let outcome = res?;
        closed?;

        info!(
            task = self.task.get(), local_steps = outcome.local_steps,
            global_step = outcome.global_step, fed = fed;
            "training finished"
        );

        Ok(outcome)
    }

    async fn train(
        &mut self,
        feeder: &mut Feeder<M::Example>,
        reporter: &mut MetricsReporter,
        start_step: u64,
    ) -> Result<LoopOutcome> {
        let mut outcome = LoopOutcome {
            local_steps: 0,
            global_step: start_step,
        };

        if self.reached_max_steps(start_step) {
            self.session.request_stop().await;
        }

        while !self.session.should_stop() {
            let example = tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    info!(task = self.task.get(); "stop requested");
                    self.session.request_stop().await;
                    break;
                }
                example = feeder.recv() => example,
            };

            let Some(example) = example else {
                info!(task = self.task.get(); "out of training data");
                self.session.request_stop().await;
                break;
            };

            let step = self.session.run_step(&mut self.model, example).await?;
            outcome.local_steps += 1;
            outcome.global_step = step.global_step;

            reporter.update(step.loss, step.global_step);

            if self.stop.is_cancelled() {
                info!(task = self.task.get(); "stop requested");
                self.session.request_stop().await;
            } else if self.reached_max_steps(step.global_step) {
                info!(
                    task = self.task.get(), global_step = step.global_step;
                    "reached the step limit"
                );
                self.session.request_stop().await;
            }
        }

        Ok(outcome)
    }

    fn reached_max_steps(&self, global_step: u64) -> bool {
        self.config
            .max_steps
            .is_some_and(|max_steps| global_step >= max_steps)
    }

    fn transition(&mut self, state: LoopState) {
        info!(
            task = self.task.get(), from:% = self.state, to:% = state;
            "training loop transition"
        );
        self.state = state;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    };

    use machine_learning::{Batch, Example, LinearRegression};

    use super::*;
    use crate::{
        WorkerErr,
        session::{StepOutput, TrainingSession},
    };

    /// A session over an in-memory global step shared by every fake process.
    #[derive(Clone, Default)]
    struct FakeCluster {
        global_step: Arc<AtomicU64>,
        should_stop: Arc<AtomicBool>,
    }

    struct FakeSession {
        cluster: FakeCluster,
        cluster_stop: bool,
        local_stop: bool,
        fail_at: Option<u64>,
        closed: Arc<AtomicBool>,
    }

    impl FakeSession {
        fn new(cluster: &FakeCluster) -> Self {
            Self {
                cluster: cluster.clone(),
                cluster_stop: false,
                local_stop: false,
                fail_at: None,
                closed: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl TrainingSession for FakeSession {
        async fn global_step(&mut self) -> crate::Result<u64> {
            Ok(self.cluster.global_step.load(Ordering::SeqCst))
        }

        async fn run_step<N>(&mut self, _: &mut N, _: N::Example) -> crate::Result<StepOutput>
        where
            N: TrainableModel,
        {
            let global_step = self.cluster.global_step.fetch_add(1, Ordering::SeqCst) + 1;

            if self.fail_at == Some(global_step) {
                return Err(WorkerErr::Protocol {
                    addr: "fake".into(),
                    detail: "injected failure".into(),
                });
            }

            self.cluster_stop = self.cluster.should_stop.load(Ordering::SeqCst);
            Ok(StepOutput {
                loss: 1.0,
                global_step,
            })
        }

        fn should_stop(&self) -> bool {
            self.cluster_stop || self.local_stop
        }

        async fn request_stop(&mut self) {
            self.local_stop = true;
            self.cluster.should_stop.store(true, Ordering::SeqCst);
        }

        async fn close(&mut self) -> crate::Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config(max_steps: Option<u64>) -> LoopConfig {
        LoopConfig {
            report_frequency: NonZeroUsize::new(10).unwrap(),
            max_steps,
            queue_capacity: NonZeroUsize::new(4).unwrap(),
        }
    }

    fn batches(n: usize) -> Vec<Batch> {
        let example = Example {
            features: vec![1.0, 2.0],
            target: 3.0,
        };

        (0..n)
            .map(|_| Batch::from_examples(std::slice::from_ref(&example)).unwrap())
            .collect()
    }

    fn model() -> LinearRegression {
        LinearRegression::new(2, comms::specs::server::ParamGenSpec::Const { value: 0., limit: 0 })
    }

    #[tokio::test]
    async fn stops_at_the_step_limit() {
        let cluster = FakeCluster::default();
        let session = FakeSession::new(&cluster);
        let closed = session.closed.clone();

        let lp = TrainingLoop::new(
            TaskIndex::LEADER,
            model(),
            session,
            config(Some(25)),
            None,
            CancellationToken::new(),
        );

        let outcome = lp.run(batches(100)).await.unwrap();

        assert_eq!(outcome.local_steps, 25);
        assert_eq!(outcome.global_step, 25);
        assert!(cluster.should_stop.load(Ordering::SeqCst));
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn running_out_of_data_stops_the_cluster() {
        let cluster = FakeCluster::default();

        let lp = TrainingLoop::new(
            TaskIndex::new(1),
            model(),
            FakeSession::new(&cluster),
            config(None),
            None,
            CancellationToken::new(),
        );

        let outcome = lp.run(batches(7)).await.unwrap();

        assert_eq!(outcome.local_steps, 7);
        assert!(cluster.should_stop.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn a_cancelled_token_stops_before_the_next_step() {
        let cluster = FakeCluster::default();
        let stop = CancellationToken::new();
        stop.cancel();

        let lp = TrainingLoop::new(
            TaskIndex::LEADER,
            model(),
            FakeSession::new(&cluster),
            config(None),
            None,
            stop,
        );

        let outcome = lp.run(batches(10)).await.unwrap();

        assert_eq!(outcome.local_steps, 0);
        assert!(cluster.should_stop.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn followers_stop_within_one_step_of_a_remote_request() {
        let cluster = FakeCluster::default();
        cluster.global_step.store(40, Ordering::SeqCst);
        cluster.should_stop.store(true, Ordering::SeqCst);

        let lp = TrainingLoop::new(
            TaskIndex::new(2),
            model(),
            FakeSession::new(&cluster),
            config(None),
            None,
            CancellationToken::new(),
        );

        let outcome = lp.run(batches(10)).await.unwrap();

        assert_eq!(outcome.local_steps, 1);
        assert_eq!(outcome.global_step, 41);
    }

    #[tokio::test]
    async fn step_errors_tear_down_and_surface() {
        let cluster = FakeCluster::default();
        let mut session = FakeSession::new(&cluster);
        session.fail_at = Some(3);
        let closed = session.closed.clone();

        let lp = TrainingLoop::new(
            TaskIndex::LEADER,
            model(),
            session,
            config(None),
            None,
            CancellationToken::new(),
        );

        let res = lp.run(batches(10)).await;

        assert!(matches!(res, Err(WorkerErr::Protocol { .. })));
        assert!(cluster.should_stop.load(Ordering::SeqCst));
        assert!(closed.load(Ordering::SeqCst));
    }
}
