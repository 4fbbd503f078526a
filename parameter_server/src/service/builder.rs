use std::num::NonZeroUsize;

use comms::specs::server::OptimizerSpec;
use tokio::io::{AsyncRead, AsyncWrite};

use super::{Host, VariableHost};
use crate::{
    optimization::{Adam, GradientDescent, GradientDescentWithMomentum, Optimizer},
    storage::{ParameterHandle, ParameterStore},
};

/// Everything a `VariableHost` needs to know before accepting connections.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostSpec {
    /// The total amount of parameters of every variable placed on the host.
    pub nparams: usize,
    pub shard_size: NonZeroUsize,
    pub optimizer: OptimizerSpec,
    /// Whether the global step lives on this host.
    pub owns_global_step: bool,
}

/// Builds `Host`s given a specification.
#[derive(Debug, Default)]
pub struct HostBuilder;

impl HostBuilder {
    /// Creates a new `HostBuilder`.
    ///
    /// # Returns
    /// A new `HostBuilder` instance.
    pub fn new() -> Self {
        Self
    }

    /// Builds a new `Host` following a spec.
    ///
    /// # Arguments
    /// * `spec` - The specification of the variable host.
    ///
    /// # Returns
    /// A new uninitialized host.
    pub fn build<R, W>(&self, spec: HostSpec) -> Box<dyn Host<R, W>>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        match spec.optimizer {
            OptimizerSpec::Adam {
                learning_rate,
                beta1,
                beta2,
                epsilon,
            } => {
                let factory = |len| Adam::new(len, learning_rate, beta1, beta2, epsilon);
                self.terminate_build(spec, factory)
            }
            OptimizerSpec::GradientDescent { learning_rate } => {
                let factory = |_| GradientDescent::new(learning_rate);
                self.terminate_build(spec, factory)
            }
            OptimizerSpec::GradientDescentWithMomentum {
                learning_rate,
                momentum,
            } => {
                let factory = |len| GradientDescentWithMomentum::new(len, learning_rate, momentum);
                self.terminate_build(spec, factory)
            }
        }
    }

    /// Terminates the build, instanciating the store and the host.
    ///
    /// # Arguments
    /// * `spec` - The specification of the variable host.
    /// * `optimizer_factory` - A factory of optimizers, one per shard.
    ///
    /// # Returns
    /// A new host.
    fn terminate_build<R, W, O, OF>(
        &self,
        spec: HostSpec,
        optimizer_factory: OF,
    ) -> Box<dyn Host<R, W>>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
        O: Optimizer + Send + Sync + 'static,
        OF: FnMut(usize) -> O,
    {
        let store = ParameterStore::new(spec.nparams, spec.shard_size, optimizer_factory);
        let handle = ParameterHandle::new(store);
        Box::new(VariableHost::new(handle, spec.owns_global_step))
    }
}
