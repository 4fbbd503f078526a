use ndarray::{Array1, ArrayView1};

use super::LossFn;

/// Mean squared error loss function.
#[derive(Debug, Default, Clone, Copy)]
pub struct Mse;

impl Mse {
    /// Returns a new `Mse`.
    pub fn new() -> Self {
        Self
    }
}

impl LossFn for Mse {
    fn loss(&self, y_pred: ArrayView1<f32>, y: ArrayView1<f32>) -> f32 {
        (&y_pred - &y)
            .mapv(|x| x.powi(2))
            .mean()
            .unwrap_or_default()
    }

    fn loss_prime(&self, y_pred: ArrayView1<f32>, y: ArrayView1<f32>) -> Array1<f32> {
        (&y_pred - &y) * (2.0 / y_pred.len() as f32)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn perfect_predictions_have_no_loss() {
        let y = array![1.0, -2.0];
        assert_eq!(Mse.loss(y.view(), y.view()), 0.0);
        assert_eq!(Mse.loss_prime(y.view(), y.view()), array![0.0, 0.0]);
    }

    #[test]
    fn loss_is_the_mean_of_the_squared_errors() {
        let y_pred = array![1.0, 3.0];
        let y = array![0.0, 0.0];

        assert_eq!(Mse.loss(y_pred.view(), y.view()), 5.0);
        assert_eq!(Mse.loss_prime(y_pred.view(), y.view()), array![1.0, 3.0]);
    }
}
