mod client;

pub use client::{HostClient, RetryPolicy};
