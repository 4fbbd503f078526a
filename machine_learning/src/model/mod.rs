mod linear;
mod trainable;

pub use linear::LinearRegression;
pub use trainable::{TrainableModel, VariableSpec};
