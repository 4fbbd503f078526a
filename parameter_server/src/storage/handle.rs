use std::ops::Deref;

use tokio::task;

use super::{ParameterStore, Result};
use crate::optimization::Optimizer;

/// A shared, async facing view of a host's `ParameterStore`.
///
/// Store operations lock shards and may fan out on rayon, so they run in place on the
/// worker thread. Hosts must be served from a multi threaded runtime.
pub struct ParameterHandle<O: Optimizer>(ParameterStore<O>);

impl<O: Optimizer> Clone for ParameterHandle<O> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<O: Optimizer> Deref for ParameterHandle<O> {
    type Target = ParameterStore<O>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<O: Optimizer> ParameterHandle<O> {
    pub fn new(store: ParameterStore<O>) -> Self {
        Self(store)
    }
}

impl<O: Optimizer + Send> ParameterHandle<O> {
    /// Overwrites every value, see `ParameterStore::assign`.
    pub async fn assign(&self, values: &[f32]) -> Result<()> {
        task::block_in_place(|| self.0.assign(values))
    }

    /// Runs one optimizer step per shard with `grad`.
    pub async fn apply(&self, grad: &[f32]) -> Result<()> {
        task::block_in_place(|| self.0.apply(grad))
    }

    /// Copies the current values into `out`.
    pub async fn pull(&self, out: &mut [f32]) -> Result<()> {
        task::block_in_place(|| self.0.pull(out))
    }
}
