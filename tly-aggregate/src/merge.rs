//! Per-class reduction of one series' values across shards.

use serde::Serialize;
use tly_core::{GaugeMode, ProcessState, ShardClass};

/// Rule that produced an aggregated value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeRule {
    /// Counters, histogram and summary components.
    Sum,
    /// Gauge summed over every shard, dead writers included.
    LiveSum,
    /// Gauge summed over shards of processes not known to be dead.
    LiveOnlySum,
    Max,
    Min,
    /// Latest write timestamp wins; ties go to the highest pid.
    MostRecent,
    /// No merge; one series per process.
    PerProcess,
}

impl MergeRule {
    #[must_use]
    pub const fn for_class(class: ShardClass) -> Self {
        match class {
            ShardClass::Counter | ShardClass::Histogram | ShardClass::Summary => Self::Sum,
            ShardClass::Gauge(mode) => match mode {
                GaugeMode::All => Self::PerProcess,
                GaugeMode::LiveAll => Self::LiveOnlySum,
                GaugeMode::LiveSum => Self::LiveSum,
                GaugeMode::Max => Self::Max,
                GaugeMode::Min => Self::Min,
                GaugeMode::MostRecent => Self::MostRecent,
            },
        }
    }

    /// Whether this rule needs to know which writers are alive.
    #[must_use]
    pub const fn needs_liveness(self) -> bool {
        matches!(self, Self::LiveOnlySum)
    }
}

/// One shard's value for a series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub pid: u32,
    pub value: f64,
    pub timestamp_ns: u64,
    pub state: ProcessState,
}

/// Reduce observations with `rule`.
///
/// Returns the merged value and how many observations contributed, or
/// `None` when nothing qualified (every writer of a live-only gauge is
/// dead). `PerProcess` is expanded by the caller and never reaches here.
#[must_use]
pub fn reduce(rule: MergeRule, observations: &[Observation]) -> Option<(f64, usize)> {
    match rule {
        MergeRule::Sum | MergeRule::LiveSum | MergeRule::PerProcess => {
            sum(observations.iter())
        },
        MergeRule::LiveOnlySum => sum(observations.iter().filter(|o| !o.state.is_dead())),
        MergeRule::Max => observations
            .iter()
            .map(|o| o.value)
            .reduce(f64::max)
            .map(|v| (v, observations.len())),
        MergeRule::Min => observations
            .iter()
            .map(|o| o.value)
            .reduce(f64::min)
            .map(|v| (v, observations.len())),
        MergeRule::MostRecent => observations
            .iter()
            .max_by_key(|o| (o.timestamp_ns, o.pid))
            .map(|o| (o.value, 1)),
    }
}

fn sum<'a>(observations: impl Iterator<Item = &'a Observation>) -> Option<(f64, usize)> {
    observations.fold(None, |acc, o| match acc {
        None => Some((o.value, 1)),
        Some((total, n)) => Some((total + o.value, n + 1)),
    })
}
