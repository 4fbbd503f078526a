mod error;
mod handle;
mod shard;
mod store;

pub use error::{Result, StoreErr};
pub use handle::ParameterHandle;
pub(crate) use shard::check_len;
use shard::ParameterShard;
pub use store::ParameterStore;
