use super::Optimizer;
use crate::storage::{Result, check_len};

/// Adaptive moment estimation, keeping a running mean of the gradient and of its square
/// for every parameter.
#[derive(Debug)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    step: i32,
    mean: Box<[f32]>,
    variance: Box<[f32]>,
}

impl Adam {
    /// Creates a new `Adam` optimizer.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters it updates.
    /// * `learning_rate` - The step size.
    /// * `beta1` - The decay of the gradient's running mean.
    /// * `beta2` - The decay of the squared gradient's running mean.
    /// * `epsilon` - Keeps the update finite when the variance is close to zero.
    ///
    /// # Returns
    /// A new `Adam` instance.
    pub fn new(len: usize, learning_rate: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            step: 0,
            mean: vec![0.; len].into(),
            variance: vec![0.; len].into(),
        }
    }
}

impl Optimizer for Adam {
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()> {
        check_len(grad.len(), params.len())?;
        check_len(grad.len(), self.mean.len())?;

        self.step = self.step.saturating_add(1);

        // bias corrections of both running means
        let mean_scale = 1. / (1. - self.beta1.powi(self.step));
        let variance_scale = 1. / (1. - self.beta2.powi(self.step));

        for (i, (param, &g)) in params.iter_mut().zip(grad).enumerate() {
            let mean = &mut self.mean[i];
            let variance = &mut self.variance[i];

            *mean += (1. - self.beta1) * (g - *mean);
            *variance += (1. - self.beta2) * (g * g - *variance);

            let mean_hat = *mean * mean_scale;
            let variance_hat = *variance * variance_scale;
            *param -= self.learning_rate * mean_hat / (variance_hat.sqrt() + self.epsilon);
        }

        Ok(())
    }
}
