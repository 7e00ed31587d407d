//! Merge every shard in a directory into one metric snapshot.
//!
//! The pass is read-only and may run at any time alongside writers. Values
//! from different shards may be read at slightly different instants; there
//! is no cross-process synchronization.

use crate::merge::{MergeRule, Observation, reduce};
use crate::reader::ShardReader;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tly_core::{
    Liveness, MetricKind, PID_LABEL, ProcessState, ProcessTable, Result, SampleKey, ShardClass,
    ShardDirectory, ShardEntry, TallyError,
};
use tracing::{debug, info, warn};

/// One merged series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedSample {
    pub key: SampleKey,
    pub value: f64,
    pub rule: MergeRule,
    /// Number of shards whose value went into `value`.
    pub contributors: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricFamily {
    pub name: String,
    pub kind: MetricKind,
    pub class: ShardClass,
    /// Sorted by canonical label set, then component.
    pub samples: Vec<AggregatedSample>,
}

/// What the pass saw, for logging and the CLI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub shards_read: usize,
    pub shards_skipped: usize,
    pub slots_read: usize,
    pub slots_skipped: usize,
    /// Slots dropped because their family was already seen under another class.
    pub conflicting_slots: usize,
    /// Per-process series dropped because they already carry a `pid` label.
    pub pid_label_collisions: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    /// Sorted by family name.
    pub families: Vec<MetricFamily>,
    pub report: ScanReport,
}

impl Snapshot {
    #[must_use]
    pub fn family(&self, name: &str) -> Option<&MetricFamily> {
        self.families
            .binary_search_by(|f| f.name.as_str().cmp(name))
            .ok()
            .map(|i| &self.families[i])
    }

    /// Merged value of an exact series, if present.
    #[must_use]
    pub fn value(&self, key: &SampleKey) -> Option<f64> {
        let family = self.family(&key.family)?;
        family
            .samples
            .binary_search_by(|s| s.key.cmp(key))
            .ok()
            .map(|i| family.samples[i].value)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| TallyError::Internal(format!("snapshot serialization failed: {e}")))
    }
}

struct FamilyAccumulator {
    class: ShardClass,
    series: BTreeMap<SampleKey, Vec<Observation>>,
}

pub struct Aggregator {
    dir: ShardDirectory,
    liveness: Box<dyn Liveness>,
}

impl Aggregator {
    /// Aggregator over `dir` using the host process table for liveness.
    pub fn new(dir: ShardDirectory) -> Self {
        Self {
            dir,
            liveness: Box::new(ProcessTable),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Self {
        Self::new(ShardDirectory::new(path.as_ref()))
    }

    #[must_use]
    pub fn with_liveness(mut self, liveness: impl Liveness + 'static) -> Self {
        self.liveness = Box::new(liveness);
        self
    }

    /// Read every shard and merge.
    ///
    /// Fails only if the directory cannot be listed. Unreadable shards and
    /// corrupt slots are skipped and counted in the report.
    pub fn collect(&self) -> Result<Snapshot> {
        let shards = self.dir.list_shards()?;
        let mut report = ScanReport::default();
        let mut families: BTreeMap<String, FamilyAccumulator> = BTreeMap::new();
        let mut states: HashMap<u32, ProcessState> = HashMap::new();

        for shard in &shards {
            let state = *states
                .entry(shard.name.pid)
                .or_insert_with(|| self.process_state(shard));
            self.read_shard(shard, state, &mut families, &mut report);
        }

        let families: Vec<MetricFamily> = families
            .into_iter()
            .filter_map(|(name, acc)| finish_family(name, acc, &mut report))
            .collect();

        info!(
            target: "tally::aggregate",
            dir = %self.dir.path().display(),
            families = families.len(),
            shards_read = report.shards_read,
            shards_skipped = report.shards_skipped,
            slots_skipped = report.slots_skipped,
            "Aggregation complete"
        );

        Ok(Snapshot { families, report })
    }

    fn process_state(&self, shard: &ShardEntry) -> ProcessState {
        // Only live-only gauges care; skip the syscall for everything else.
        if MergeRule::for_class(shard.name.class).needs_liveness() {
            self.liveness.state(shard.name.pid)
        } else {
            ProcessState::Unknown
        }
    }

    fn read_shard(
        &self,
        shard: &ShardEntry,
        state: ProcessState,
        families: &mut BTreeMap<String, FamilyAccumulator>,
        report: &mut ScanReport,
    ) {
        let scanned = ShardReader::open(&shard.path).and_then(|r| r.scan_as(shard.name));
        let (_, scan) = match scanned {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(
                    target: "tally::aggregate",
                    path = %shard.path.display(),
                    error = %e,
                    "Skipping unreadable shard"
                );
                report.shards_skipped += 1;
                return;
            },
        };

        report.shards_read += 1;
        report.slots_skipped += scan.skipped.len();
        for skipped in &scan.skipped {
            warn!(
                target: "tally::aggregate",
                path = %shard.path.display(),
                offset = skipped.offset,
                reason = %skipped.reason,
                "Skipping corrupt slot"
            );
        }
        if let Some(offset) = scan.truncated_at {
            debug!(
                target: "tally::aggregate",
                path = %shard.path.display(),
                offset,
                "Shard tail truncated"
            );
        }

        let class = shard.name.class;
        let mut conflicts = 0usize;
        for slot in scan.slots {
            let acc = families
                .entry(slot.key.family.clone())
                .or_insert_with(|| FamilyAccumulator {
                    class,
                    series: BTreeMap::new(),
                });
            if acc.class != class {
                conflicts += 1;
                continue;
            }
            report.slots_read += 1;
            acc.series.entry(slot.key).or_default().push(Observation {
                pid: shard.name.pid,
                value: slot.value,
                timestamp_ns: slot.timestamp_ns,
                state,
            });
        }

        if conflicts > 0 {
            warn!(
                target: "tally::aggregate",
                path = %shard.path.display(),
                class = %class,
                slots = conflicts,
                "Dropping slots whose family is declared under another class"
            );
            report.conflicting_slots += conflicts;
        }

        debug!(
            target: "tally::aggregate",
            path = %shard.path.display(),
            "Shard merged"
        );
    }
}

fn finish_family(
    name: String,
    acc: FamilyAccumulator,
    report: &mut ScanReport,
) -> Option<MetricFamily> {
    let rule = MergeRule::for_class(acc.class);
    let mut samples = Vec::with_capacity(acc.series.len());

    for (key, observations) in acc.series {
        if rule == MergeRule::PerProcess {
            if key.labels.get(PID_LABEL).is_some() {
                // Adding our own label would merge distinct processes into one series.
                warn!(
                    target: "tally::aggregate",
                    series = %key,
                    "Dropping per-process series that already has a pid label"
                );
                report.pid_label_collisions += observations.len();
                continue;
            }
            for o in &observations {
                let mut key = key.clone();
                key.labels.insert(PID_LABEL, o.pid.to_string());
                samples.push(AggregatedSample {
                    key,
                    value: o.value,
                    rule,
                    contributors: 1,
                });
            }
        } else if let Some((value, contributors)) = reduce(rule, &observations) {
            samples.push(AggregatedSample {
                key,
                value,
                rule,
                contributors,
            });
        }
    }

    if samples.is_empty() {
        return None;
    }
    // Adding the pid label can reorder per-process series.
    samples.sort_by(|a, b| a.key.cmp(&b.key));

    Some(MetricFamily {
        name,
        kind: acc.class.kind(),
        class: acc.class,
        samples,
    })
}
