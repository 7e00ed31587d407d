#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![allow(clippy::module_name_repetitions)]

mod config;
mod shard;
mod store;

pub use config::{DEFAULT_INITIAL_CAPACITY, StoreConfig};
pub use shard::{ShardFile, UpdateOp};
pub use store::{Distribution, ShardStore, SlotHandle};
