#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![allow(clippy::module_name_repetitions)]

mod aggregator;
mod merge;
mod reader;

pub use aggregator::{AggregatedSample, Aggregator, MetricFamily, ScanReport, Snapshot};
pub use merge::{MergeRule, Observation, reduce};
pub use reader::ShardReader;
