use std::{
    num::NonZeroUsize,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use rayon::prelude::*;

use super::{ParameterShard, Result, StoreErr, check_len};
use crate::optimization::Optimizer;

/// The primary storage of the variables a single host owns.
///
/// Partitions the parameters in shards and leverages parallelization to read
/// and write them as fast as possible. The store starts uninitialized, it only
/// serves reads and updates once `assign` filled it.
#[derive(Debug)]
pub struct ParameterStore<O: Optimizer> {
    nparams: usize,
    initialized: Arc<AtomicBool>,
    shards: Arc<[ParameterShard<O>]>,
    shard_size: NonZeroUsize,
}

impl<O: Optimizer> Clone for ParameterStore<O> {
    fn clone(&self) -> Self {
        Self {
            nparams: self.nparams,
            initialized: Arc::clone(&self.initialized),
            shards: Arc::clone(&self.shards),
            shard_size: self.shard_size,
        }
    }
}

impl<O: Optimizer> ParameterStore<O> {
    /// Creates a new uninitialized `ParameterStore`.
    ///
    /// # Arguments
    /// * `nparams` - The total amount of parameters to hold.
    /// * `shard_size` - The maximum amount of parameters per shard.
    /// * `optimizer_factory` - An `Optimizer` factory closure, called with each shard's length.
    ///
    /// # Returns
    /// A new `ParameterStore` instance.
    pub fn new<OF>(nparams: usize, shard_size: NonZeroUsize, mut optimizer_factory: OF) -> Self
    where
        OF: FnMut(usize) -> O,
    {
        let shards: Vec<_> = (0..nparams)
            .step_by(shard_size.get())
            .map(|start| {
                let len = shard_size.get().min(nparams - start);
                ParameterShard::new(len, optimizer_factory(len))
            })
            .collect();

        Self {
            nparams,
            initialized: Arc::new(AtomicBool::new(false)),
            shards: Arc::from(shards),
            shard_size,
        }
    }

    /// Returns the size of the storage.
    ///
    /// # Returns
    /// The amount of parameters in the storage.
    pub fn len(&self) -> usize {
        self.nparams
    }

    /// Whether the store holds no parameters at all.
    pub fn is_empty(&self) -> bool {
        self.nparams == 0
    }

    /// Whether values were assigned to this store.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn ensure_initialized(&self) -> Result<()> {
        if !self.is_initialized() {
            return Err(StoreErr::Uninitialized);
        }

        Ok(())
    }
}

impl<O: Optimizer + Send> ParameterStore<O> {
    /// Overwrites every parameter and marks the store as initialized.
    ///
    /// # Arguments
    /// * `values` - A flat slice with the new value of every parameter.
    ///
    /// # Returns
    /// A `StoreErr::SizeMismatch` if `values` doesn't match the store size.
    pub(super) fn assign(&self, values: &[f32]) -> Result<()> {
        check_len(values.len(), self.nparams)?;

        self.shards
            .par_iter()
            .zip(values.par_chunks(self.shard_size.get()))
            .try_for_each(|(shard, chunk)| shard.assign(chunk))?;

        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    /// Applies a gradient to every shard through their optimizers.
    ///
    /// # Arguments
    /// * `grad` - A flat slice containing a gradient for every parameter.
    ///
    /// # Returns
    /// A `StoreErr` if the store is uninitialized or `grad` doesn't match its size.
    pub(super) fn apply(&self, grad: &[f32]) -> Result<()> {
        self.ensure_initialized()?;
        check_len(grad.len(), self.nparams)?;

        self.shards
            .par_iter()
            .zip(grad.par_chunks(self.shard_size.get()))
            .try_for_each(|(shard, chunk)| shard.apply(chunk))
    }

    /// Gathers all the sharded parameters into a local buffer.
    ///
    /// # Arguments
    /// * `out` - A mutable slice where the parameters will be copied.
    ///
    /// # Returns
    /// A `StoreErr` if the store is uninitialized or `out` doesn't match its size.
    pub(super) fn pull(&self, out: &mut [f32]) -> Result<()> {
        self.ensure_initialized()?;
        check_len(out.len(), self.nparams)?;

        self.shards
            .par_iter()
            .zip(out.par_chunks_mut(self.shard_size.get()))
            .try_for_each(|(shard, chunk)| shard.pull(chunk))
    }
}
