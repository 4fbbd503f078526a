use super::Optimizer;
use crate::storage::{Result, check_len};

/// Gradient descent accumulating a decaying sum of the past gradients.
#[derive(Debug)]
pub struct GradientDescentWithMomentum {
    learning_rate: f32,
    momentum: f32,
    velocity: Box<[f32]>,
}

impl GradientDescentWithMomentum {
    /// Creates a new `GradientDescentWithMomentum` optimizer.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters it updates.
    /// * `learning_rate` - The step size.
    /// * `momentum` - How much of the previous velocity survives every update.
    ///
    /// # Returns
    /// A new `GradientDescentWithMomentum` instance.
    pub fn new(len: usize, learning_rate: f32, momentum: f32) -> Self {
        Self {
            learning_rate,
            momentum,
            velocity: vec![0.; len].into(),
        }
    }
}

impl Optimizer for GradientDescentWithMomentum {
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()> {
        check_len(grad.len(), params.len())?;
        check_len(grad.len(), self.velocity.len())?;

        let velocities = self.velocity.iter_mut();

        for ((param, &g), velocity) in params.iter_mut().zip(grad).zip(velocities) {
            *velocity = self.momentum.mul_add(*velocity, g);
            *param -= self.learning_rate * *velocity;
        }

        Ok(())
    }
}
