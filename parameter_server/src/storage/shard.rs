use parking_lot::{Mutex, RwLock};

use super::{Result, StoreErr};
use crate::optimization::Optimizer;

/// A contiguous slice of the hosted variables, guarded by its own locks so
/// updates coming from different workers only contend per shard.
#[derive(Debug)]
pub struct ParameterShard<O: Optimizer> {
    params: RwLock<Box<[f32]>>,
    optimizer: Mutex<O>,
}

impl<O: Optimizer> ParameterShard<O> {
    /// Creates a new zeroed `ParameterShard`.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters in this shard.
    /// * `optimizer` - The optimization algorithm.
    ///
    /// # Returns
    /// A new `ParameterShard` instance.
    pub fn new(len: usize, optimizer: O) -> Self {
        Self {
            params: RwLock::new(vec![0.; len].into_boxed_slice()),
            optimizer: Mutex::new(optimizer),
        }
    }

    /// Returns the amount of parameters held by this shard.
    pub fn len(&self) -> usize {
        self.params.read().len()
    }

    /// Overwrites the parameters of this shard.
    ///
    /// # Arguments
    /// * `values` - The new values, must be the same length as the shard.
    ///
    /// # Returns
    /// A `StoreErr::SizeMismatch` if `values` isn't the same size as this shard.
    pub fn assign(&self, values: &[f32]) -> Result<()> {
        let mut params = self.params.write();
        check_len(values.len(), params.len())?;
        params.copy_from_slice(values);
        Ok(())
    }

    /// Applies `grad` to the parameters through the optimizer.
    ///
    /// # Arguments
    /// * `grad` - The gradient for this shard's parameters.
    ///
    /// # Returns
    /// A `StoreErr::SizeMismatch` if `grad` isn't the same size as this shard.
    pub fn apply(&self, grad: &[f32]) -> Result<()> {
        let mut optimizer = self.optimizer.lock();
        let mut params = self.params.write();
        optimizer.update_params(grad, &mut params)
    }

    /// Copies the shard's parameters into the provided destination buffer.
    ///
    /// # Arguments
    /// * `out` - A mutable slice where the parameters will be copied.
    ///
    /// # Returns
    /// A `StoreErr::SizeMismatch` if `out` isn't the same size as this shard.
    pub fn pull(&self, out: &mut [f32]) -> Result<()> {
        let params = self.params.read();
        check_len(out.len(), params.len())?;
        out.copy_from_slice(&params);
        Ok(())
    }
}

pub(crate) fn check_len(got: usize, expected: usize) -> Result<()> {
    if got != expected {
        return Err(StoreErr::SizeMismatch { got, expected });
    }

    Ok(())
}
