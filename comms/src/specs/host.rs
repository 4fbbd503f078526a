use serde::{Deserialize, Serialize};

use super::server::ParamGenSpec;

/// A variable host's view of the shared training state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostStatus {
    /// Whether the host's variables hold values yet.
    pub initialized: bool,
    /// The cluster's global step, only present on the host that owns it.
    pub global_step: Option<u64>,
    /// Whether any process asked the cluster to stop.
    pub should_stop: bool,
}

/// Fresh initialization for the variables of a single host.
///
/// `variables` holds one generator spec per variable, in the host's storage order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitSpec {
    pub global_step: u64,
    pub variables: Vec<ParamGenSpec>,
    pub seed: Option<u64>,
}
