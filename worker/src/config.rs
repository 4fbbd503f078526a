use std::{
    collections::HashMap,
    fs,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    time::Duration,
};

use comms::specs::server::{DistributionSpec, OptimizerSpec, ParamGenSpec};
use serde::{Deserialize, Serialize};

use crate::{Result, WorkerErr, net::RetryPolicy};

/// The model to train and how to initialize it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelConfig {
    Linear {
        features: usize,
        /// The generator for the weights, its limit is ignored.
        #[serde(default = "default_linear_init")]
        init: ParamGenSpec,
    },
}

fn default_linear_init() -> ParamGenSpec {
    ParamGenSpec::Rand {
        distribution: DistributionSpec::Uniform {
            low: -0.1,
            high: 0.1,
        },
        limit: 0,
    }
}

/// A single named experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Local steps between two metric reports.
    pub report_frequency: NonZeroUsize,
    #[serde(default = "default_save_model_secs")]
    pub save_model_secs: u64,
    #[serde(default = "default_summary_flush_secs")]
    pub summary_flush_secs: u64,
    /// How often followers poll the hosts while waiting for the leader.
    #[serde(default = "default_recovery_wait_secs")]
    pub recovery_wait_secs: u64,
    /// Readiness checks a follower makes before giving up on the leader.
    #[serde(default = "default_max_recovery_polls")]
    pub max_recovery_polls: NonZeroUsize,
    /// Requests a cluster wide stop once the global step reaches it.
    #[serde(default)]
    pub max_steps: Option<u64>,
    #[serde(default = "default_max_to_keep")]
    pub max_to_keep: NonZeroUsize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: NonZeroUsize,
    #[serde(default = "default_shard_size")]
    pub shard_size: NonZeroUsize,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_connect_retries")]
    pub connect_retries: usize,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default)]
    pub optimizer: OptimizerSpec,
    pub train_path: PathBuf,
    #[serde(default = "default_batch_size")]
    pub batch_size: NonZeroUsize,
    /// Passes over the training data, `None` trains until stopped.
    #[serde(default)]
    pub epochs: Option<usize>,
    pub model: ModelConfig,
}

fn default_save_model_secs() -> u64 {
    120
}

fn default_summary_flush_secs() -> u64 {
    20
}

fn default_recovery_wait_secs() -> u64 {
    30
}

fn default_max_recovery_polls() -> NonZeroUsize {
    NonZeroUsize::new(20).unwrap_or(NonZeroUsize::MIN)
}

fn default_max_to_keep() -> NonZeroUsize {
    NonZeroUsize::new(5).unwrap_or(NonZeroUsize::MIN)
}

fn default_queue_capacity() -> NonZeroUsize {
    NonZeroUsize::new(16).unwrap_or(NonZeroUsize::MIN)
}

fn default_shard_size() -> NonZeroUsize {
    NonZeroUsize::new(1024).unwrap_or(NonZeroUsize::MIN)
}

fn default_connect_retries() -> usize {
    10
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

fn default_batch_size() -> NonZeroUsize {
    NonZeroUsize::new(32).unwrap_or(NonZeroUsize::MIN)
}

impl TrainingConfig {
    /// Selects an experiment out of an experiments document.
    ///
    /// # Arguments
    /// * `json` - A JSON object mapping experiment names to their config.
    /// * `experiment` - The name of the experiment to run.
    ///
    /// # Returns
    /// The experiment's config or a `ConfigurationError`.
    pub fn from_json(json: &str, experiment: &str) -> Result<Self> {
        let mut experiments: HashMap<String, serde_json::Value> = serde_json::from_str(json)
            .map_err(|e| WorkerErr::config(format!("malformed experiments document: {e}")))?;

        let value = experiments
            .remove(experiment)
            .ok_or_else(|| WorkerErr::config(format!("unknown experiment {experiment:?}")))?;

        serde_json::from_value(value)
            .map_err(|e| WorkerErr::config(format!("invalid experiment {experiment:?}: {e}")))
    }

    /// Reads an experiments document and selects `experiment` out of it.
    pub fn load(path: impl AsRef<Path>, experiment: &str) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|e| {
            WorkerErr::config(format!("reading experiments {}: {e}", path.display()))
        })?;

        Self::from_json(&json, experiment)
    }

    pub fn save_model_period(&self) -> Duration {
        Duration::from_secs(self.save_model_secs)
    }

    pub fn summary_flush_period(&self) -> Duration {
        Duration::from_secs(self.summary_flush_secs)
    }

    pub fn recovery_wait(&self) -> Duration {
        Duration::from_secs(self.recovery_wait_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.connect_retries,
            Duration::from_millis(self.retry_backoff_ms),
        )
    }
}

/// The directory where an experiment's checkpoints and metrics live.
pub fn log_dir(root: impl AsRef<Path>, experiment: &str) -> PathBuf {
    root.as_ref().join(experiment)
}
