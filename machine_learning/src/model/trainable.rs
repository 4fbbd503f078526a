use comms::specs::server::ParamGenSpec;

use crate::Result;

/// A named, flat block of parameters declared by a model.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableSpec {
    pub name: String,
    pub len: usize,
    /// How to fill the variable when training starts from scratch, generates exactly `len` values.
    pub init: ParamGenSpec,
}

/// The narrow interface the training processes drive a model through.
///
/// The model is stateless with respect to its parameters: they live in the variable
/// hosts and are handed in flat, concatenated in the order `variables` declares them.
pub trait TrainableModel: Send {
    /// A single unit of input consumed by one training step.
    type Example: Send + 'static;

    /// Declares the model's variables, in the order `train_step` expects them.
    fn variables(&self) -> Vec<VariableSpec>;

    /// Computes the loss over `example` and its gradient with respect to every parameter.
    ///
    /// # Arguments
    /// * `params` - The current value of every variable, concatenated.
    /// * `grad` - A buffer of the same size where the gradient is written.
    /// * `example` - The input to train on.
    ///
    /// # Returns
    /// The loss before the update or an `MlErr` if the sizes don't match.
    fn train_step(&mut self, params: &[f32], grad: &mut [f32], example: &Self::Example)
    -> Result<f32>;

    /// The total amount of parameters of the model.
    fn size(&self) -> usize {
        self.variables().iter().map(|var| var.len).sum()
    }
}
