mod builder;
mod host;
mod listener;
mod server;

pub use builder::{HostBuilder, HostSpec};
pub use host::VariableHost;
pub use listener::serve;
pub use server::Host;
