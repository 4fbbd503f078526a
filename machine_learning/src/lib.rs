pub mod dataset;
pub mod error;
pub mod loss;
pub mod model;

pub use dataset::{Batch, Batches, Dataset, Example};
pub use error::{MlErr, Result};
pub use model::{LinearRegression, TrainableModel, VariableSpec};
