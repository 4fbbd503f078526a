use std::{
    error::Error,
    fmt::{self, Display},
};

use rand_distr::{NormalError, uniform::Error as UniformError};

/// The specific result type for variable initialization.
pub type Result<T> = std::result::Result<T, InitErr>;

/// Error returned whenever a host can't build its initial values from an `InitSpec`.
#[derive(Debug)]
pub enum InitErr {
    /// A random distribution was given invalid construction values.
    Distribution(String),
    /// The generators didn't produce exactly as many values as the host stores.
    LengthMismatch { got: usize, expected: usize },
}

impl From<NormalError> for InitErr {
    fn from(value: NormalError) -> Self {
        Self::Distribution(value.to_string())
    }
}

impl From<UniformError> for InitErr {
    fn from(value: UniformError) -> Self {
        Self::Distribution(value.to_string())
    }
}

impl Display for InitErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitErr::Distribution(detail) => write!(f, "invalid distribution: {detail}"),
            InitErr::LengthMismatch { got, expected } => write!(
                f,
                "the init spec generates {got} values but the host stores {expected}"
            ),
        }
    }
}

impl Error for InitErr {}
