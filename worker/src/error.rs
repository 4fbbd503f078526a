use std::{error::Error, fmt, io};

use machine_learning::MlErr;

/// The worker module's result type.
pub type Result<T> = std::result::Result<T, WorkerErr>;

/// Training process failures.
#[derive(Debug)]
pub enum WorkerErr {
    /// Missing or invalid task index, cluster document or experiment.
    Configuration(String),
    /// A peer stayed unreachable after every retry.
    ConnectionLost { addr: String, source: io::Error },
    /// A peer answered something the protocol doesn't allow.
    Protocol { addr: String, detail: String },
    Checkpoint(String),
    Model(MlErr),
    Io(io::Error),
}

impl WorkerErr {
    /// Shorthand for a `Configuration` error.
    pub fn config(detail: impl Into<String>) -> Self {
        Self::Configuration(detail.into())
    }
}

impl fmt::Display for WorkerErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerErr::Configuration(detail) => write!(f, "configuration error: {detail}"),
            WorkerErr::ConnectionLost { addr, source } => {
                write!(f, "connection to {addr} lost: {source}")
            }
            WorkerErr::Protocol { addr, detail } => {
                write!(f, "protocol error with {addr}: {detail}")
            }
            WorkerErr::Checkpoint(detail) => write!(f, "checkpoint error: {detail}"),
            WorkerErr::Model(e) => write!(f, "model error: {e}"),
            WorkerErr::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for WorkerErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            WorkerErr::ConnectionLost { source, .. } => Some(source),
            WorkerErr::Model(e) => Some(e),
            WorkerErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for WorkerErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<MlErr> for WorkerErr {
    fn from(value: MlErr) -> Self {
        Self::Model(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<WorkerErr> for io::Error {
    fn from(value: WorkerErr) -> Self {
        match value {
            WorkerErr::Io(e) => e,
            WorkerErr::ConnectionLost { .. } => io::Error::new(io::ErrorKind::NotConnected, value),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
