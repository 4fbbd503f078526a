use std::{
    error::Error,
    fmt::{self, Display},
};

/// The specific result type for the storage module.
pub type Result<T> = std::result::Result<T, StoreErr>;

/// Errors returned by the `ParameterStore` and its shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErr {
    /// A gradient, parameter or external buffer doesn't match the stored amount of parameters.
    SizeMismatch { got: usize, expected: usize },
    /// The store was read or updated before any values were assigned to it.
    Uninitialized,
}

impl Display for StoreErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreErr::SizeMismatch { got, expected } => write!(
                f,
                "the provided buffer length doesn't match the store size, got {got}, expected {expected}"
            ),
            StoreErr::Uninitialized => f.write_str("the variables have not been initialized"),
        }
    }
}

impl Error for StoreErr {}
