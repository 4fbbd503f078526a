//! Hosts a slice of a model's variables and serves them to the processes training it.

pub mod initialization;
pub mod optimization;
pub mod service;
pub mod storage;

mod test;

pub use service::{Host, HostBuilder, HostSpec, VariableHost, serve};
