use comms::specs::server::ParamGenSpec;
use ndarray::{Array1, ArrayView1, ArrayViewMut1};

use super::{TrainableModel, VariableSpec};
use crate::{
    Batch, MlErr, Result,
    loss::{LossFn, Mse},
};

/// A linear regression `y = x · w + b` trained with mean squared error.
#[derive(Debug, Clone)]
pub struct LinearRegression {
    features: usize,
    init: ParamGenSpec,
}

impl LinearRegression {
    /// Creates a new `LinearRegression`.
    ///
    /// # Arguments
    /// * `features` - The amount of input features per example.
    /// * `init` - The generator for the weights, its limit is ignored. The bias starts at zero.
    ///
    /// # Returns
    /// A new `LinearRegression` instance.
    pub fn new(features: usize, init: ParamGenSpec) -> Self {
        Self { features, init }
    }

    /// Predicts the targets of a batch.
    ///
    /// # Arguments
    /// * `params` - The weights followed by the bias.
    /// * `batch` - The batch to predict.
    ///
    /// # Returns
    /// One prediction per example, or an `MlErr` if the sizes don't match.
    pub fn predict(&self, params: &[f32], batch: &Batch) -> Result<Array1<f32>> {
        self.check_params(params.len())?;

        if batch.x.ncols() != self.features {
            return Err(MlErr::SizeMismatch {
                a: "batch",
                b: "features",
                got: batch.x.ncols(),
                expected: self.features,
            });
        }

        let (w, b) = params.split_at(self.features);
        Ok(batch.x.dot(&ArrayView1::from(w)) + b[0])
    }

    fn check_params(&self, len: usize) -> Result<()> {
        if len != self.features + 1 {
            return Err(MlErr::SizeMismatch {
                a: "params",
                b: "model",
                got: len,
                expected: self.features + 1,
            });
        }

        Ok(())
    }
}

impl TrainableModel for LinearRegression {
    type Example = Batch;

    fn variables(&self) -> Vec<VariableSpec> {
        vec![
            VariableSpec {
                name: "linear/weights".into(),
                len: self.features,
                init: self.init.with_limit(self.features),
            },
            VariableSpec {
                name: "linear/bias".into(),
                len: 1,
                init: ParamGenSpec::Const {
                    value: 0.,
                    limit: 1,
                },
            },
        ]
    }

    fn train_step(&mut self, params: &[f32], grad: &mut [f32], batch: &Batch) -> Result<f32> {
        if batch.is_empty() {
            return Err(MlErr::EmptyBatch);
        }

        self.check_params(grad.len())?;
        let y_pred = self.predict(params, batch)?;

        let loss = Mse.loss(y_pred.view(), batch.y.view());
        let d = Mse.loss_prime(y_pred.view(), batch.y.view());

        let (dw, db) = grad.split_at_mut(self.features);
        ArrayViewMut1::from(dw).assign(&batch.x.t().dot(&d));
        db[0] = d.sum();

        Ok(loss)
    }

    fn size(&self) -> usize {
        self.features + 1
    }
}
