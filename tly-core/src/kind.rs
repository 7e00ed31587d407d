//! Metric kinds and the shard classes they are stored under.

use crate::{Result, TallyError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
    Summary,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
            Self::Summary => "summary",
        };
        f.write_str(name)
    }
}

/// How a gauge written by many processes is reduced to one value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GaugeMode {
    /// Every process reported separately under an extra `pid` label.
    All,
    /// Sum over processes that are still alive.
    LiveAll,
    /// Sum over every shard, dead processes included.
    LiveSum,
    Max,
    Min,
    /// Value with the latest write timestamp; ties go to the highest pid.
    MostRecent,
}

impl GaugeMode {
    pub const ALL_MODES: [GaugeMode; 6] = [
        Self::All,
        Self::LiveAll,
        Self::LiveSum,
        Self::Max,
        Self::Min,
        Self::MostRecent,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::LiveAll => "liveall",
            Self::LiveSum => "livesum",
            Self::Max => "max",
            Self::Min => "min",
            Self::MostRecent => "mostrecent",
        }
    }

    /// Only `LiveAll` shards stop counting once their writer exits, so the
    /// exit hook may remove them. `LiveSum` keeps a dead writer's last value.
    #[must_use]
    pub const fn is_live_only(self) -> bool {
        matches!(self, Self::LiveAll)
    }

    const fn code(self) -> u8 {
        match self {
            Self::All => 0,
            Self::LiveAll => 1,
            Self::LiveSum => 2,
            Self::Max => 3,
            Self::Min => 4,
            Self::MostRecent => 5,
        }
    }
}

impl FromStr for GaugeMode {
    type Err = TallyError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL_MODES
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| TallyError::Config(format!("unknown gauge mode: {s}")))
    }
}

impl fmt::Display for GaugeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit of shard partitioning: one file per (process, class).
///
/// Gauges carry their merge mode in the class so the aggregator can pick a
/// merge rule from the file name alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardClass {
    Counter,
    Gauge(GaugeMode),
    Histogram,
    Summary,
}

const GAUGE_CODE_BASE: u8 = 0x10;

impl ShardClass {
    #[must_use]
    pub const fn kind(self) -> MetricKind {
        match self {
            Self::Counter => MetricKind::Counter,
            Self::Gauge(_) => MetricKind::Gauge,
            Self::Histogram => MetricKind::Histogram,
            Self::Summary => MetricKind::Summary,
        }
    }

    #[must_use]
    pub const fn gauge_mode(self) -> Option<GaugeMode> {
        match self {
            Self::Gauge(mode) => Some(mode),
            _ => None,
        }
    }

    /// Byte stored in the shard header.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Counter => 0x01,
            Self::Histogram => 0x02,
            Self::Summary => 0x03,
            Self::Gauge(mode) => GAUGE_CODE_BASE + mode.code(),
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0x01 => Ok(Self::Counter),
            0x02 => Ok(Self::Histogram),
            0x03 => Ok(Self::Summary),
            c if c >= GAUGE_CODE_BASE => GaugeMode::ALL_MODES
                .into_iter()
                .find(|mode| GAUGE_CODE_BASE + mode.code() == c)
                .map(Self::Gauge)
                .ok_or_else(|| TallyError::InvalidHeader(format!("unknown class code {c:#x}"))),
            c => Err(TallyError::InvalidHeader(format!(
                "unknown class code {c:#x}"
            ))),
        }
    }

    /// File name prefix, e.g. `counter` or `gauge_max`.
    #[must_use]
    pub fn file_prefix(self) -> String {
        match self {
            Self::Gauge(mode) => format!("gauge_{}", mode.as_str()),
            other => other.kind().to_string(),
        }
    }

    /// Inverse of [`ShardClass::file_prefix`].
    #[must_use]
    pub fn from_file_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "counter" => Some(Self::Counter),
            "histogram" => Some(Self::Histogram),
            "summary" => Some(Self::Summary),
            _ => prefix
                .strip_prefix("gauge_")
                .and_then(|mode| mode.parse().ok())
                .map(Self::Gauge),
        }
    }
}

impl fmt::Display for ShardClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_prefix())
    }
}
