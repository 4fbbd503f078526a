use serde::{Deserialize, Serialize};

/// The specification for a random parameter distribution.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionSpec {
    Uniform { low: f32, high: f32 },
    Normal { mean: f32, std_dev: f32 },
    XavierUniform { fan_in: usize, fan_out: usize },
    Kaiming { fan_in: usize },
}

/// The specification for the `ParamGen` trait.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamGenSpec {
    Const {
        value: f32,
        limit: usize,
    },
    Rand {
        distribution: DistributionSpec,
        limit: usize,
    },
    Chained {
        specs: Vec<ParamGenSpec>,
    },
}

impl ParamGenSpec {
    /// Returns a copy of this spec generating exactly `limit` values.
    ///
    /// Chained specs are left untouched, their limits are the sum of their parts.
    pub fn with_limit(&self, limit: usize) -> Self {
        match self {
            Self::Const { value, .. } => Self::Const {
                value: *value,
                limit,
            },
            Self::Rand { distribution, .. } => Self::Rand {
                distribution: *distribution,
                limit,
            },
            Self::Chained { specs } => Self::Chained {
                specs: specs.clone(),
            },
        }
    }

    /// The total amount of values this spec generates.
    pub fn limit(&self) -> usize {
        match self {
            Self::Const { limit, .. } | Self::Rand { limit, .. } => *limit,
            Self::Chained { specs } => specs.iter().map(Self::limit).sum(),
        }
    }
}

/// The specification for the `Optimizer` trait.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerSpec {
    Adam {
        learning_rate: f32,
        beta1: f32,
        beta2: f32,
        epsilon: f32,
    },
    GradientDescent {
        learning_rate: f32,
    },
    GradientDescentWithMomentum {
        learning_rate: f32,
        momentum: f32,
    },
}

impl Default for OptimizerSpec {
    fn default() -> Self {
        Self::Adam {
            learning_rate: 0.001,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}
