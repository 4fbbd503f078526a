//! Session management: bringing the shared variables to a usable state and running
//! training steps against them.

mod checkpointer;
mod coordinator;
mod managed;

use machine_learning::TrainableModel;

pub use coordinator::{SessionConfig, SessionCoordinator};
pub use managed::ManagedSession;

use crate::Result;

/// The result of a single training step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutput {
    /// The loss before the update.
    pub loss: f32,
    /// The global step right after the update.
    pub global_step: u64,
}

/// A handle over the cluster wide training state.
#[allow(unused)]
#[trait_variant::make(TrainingSession: Send)]
pub trait TrainingSessionTemplate {
    /// Reads the current global step.
    async fn global_step(&mut self) -> Result<u64>;

    /// Runs a single training step of `model` over `example`.
    ///
    /// # Arguments
    /// * `model` - The model to compute the loss and gradient with.
    /// * `example` - The input to train on.
    ///
    /// # Returns
    /// The step's loss and the global step after applying its gradient.
    async fn run_step<M>(&mut self, model: &mut M, example: M::Example) -> Result<StepOutput>
    where
        M: TrainableModel;

    /// Whether any process asked the cluster to stop, as of the last step.
    fn should_stop(&self) -> bool;

    /// Asks every process of the cluster to stop, best effort.
    async fn request_stop(&mut self);

    /// Releases every resource held by the session.
    async fn close(&mut self) -> Result<()>;
}
