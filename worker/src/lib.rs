pub mod checkpoint;
pub mod cluster;
pub mod config;
pub mod error;
pub mod feeder;
pub mod loop_;
pub mod metrics;
pub mod net;
pub mod placement;
pub mod session;

pub use cluster::{ClusterDescriptor, Role, TaskEntry, TaskIndex};
pub use config::{ModelConfig, TrainingConfig};
pub use error::{Result, WorkerErr};
pub use loop_::{LoopConfig, LoopOutcome, LoopState, TrainingLoop};
pub use placement::{ReplicaPlacement, VariableLayout};
pub use session::{ManagedSession, SessionConfig, SessionCoordinator, StepOutput, TrainingSession};
