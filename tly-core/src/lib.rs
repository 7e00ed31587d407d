#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![allow(clippy::module_name_repetitions)]

mod checksum;
pub mod codec;
mod error;
mod key;
mod kind;
mod labels;
mod liveness;
mod naming;

pub use checksum::key_checksum;
pub use codec::{DecodedSlot, ShardHeader, SkippedSlot, SlotScan, decode_slots};
pub use error::{Result, TallyError};
pub use key::{Bound, Component, SampleKey};
pub use kind::{GaugeMode, MetricKind, ShardClass};
pub use labels::LabelSet;
pub use liveness::{Liveness, ProcessState, ProcessTable};
pub use naming::{SHARD_EXTENSION, ShardDirectory, ShardEntry, ShardName};

/// Environment variable naming the shard directory.
pub const SHARD_DIR_ENV: &str = "TALLY_SHARD_DIR";

/// Label added to per-process series of `GaugeMode::All` gauges.
pub const PID_LABEL: &str = "pid";
