use crate::config::StoreConfig;
use crate::shard::{ShardFile, UpdateOp};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tly_core::{
    Component, GaugeMode, LabelSet, PID_LABEL, Result, SampleKey, ShardClass, ShardDirectory,
    ShardName, TallyError,
};
use tracing::info;

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

impl UpdateOp {
    /// The op each class uses for an ordinary write.
    #[must_use]
    pub const fn default_for(class: ShardClass) -> Self {
        match class {
            ShardClass::Counter | ShardClass::Histogram | ShardClass::Summary => Self::Add,
            ShardClass::Gauge(GaugeMode::LiveAll | GaugeMode::LiveSum) => Self::Add,
            ShardClass::Gauge(GaugeMode::All | GaugeMode::MostRecent) => Self::Set,
            ShardClass::Gauge(GaugeMode::Max) => Self::SetIfGreater,
            ShardClass::Gauge(GaugeMode::Min) => Self::SetIfLess,
        }
    }
}

/// Resolved location of one series inside this process's shard.
#[derive(Clone)]
pub struct SlotHandle {
    store_id: u64,
    shard: Arc<ShardFile>,
    offset: usize,
}

impl SlotHandle {
    #[must_use]
    pub fn class(&self) -> ShardClass {
        self.shard.name().class
    }

    /// This process's current value for the series.
    #[must_use]
    pub fn value(&self) -> f64 {
        self.shard.read(self.offset).0
    }

    fn apply(&self, value: f64, op: UpdateOp) -> bool {
        self.shard.apply(self.offset, value, op)
    }
}

impl PartialEq for SlotHandle {
    fn eq(&self, other: &Self) -> bool {
        self.store_id == other.store_id
            && Arc::ptr_eq(&self.shard, &other.shard)
            && self.offset == other.offset
    }
}

impl Eq for SlotHandle {}

impl std::fmt::Debug for SlotHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotHandle")
            .field("shard", &self.shard.path())
            .field("offset", &self.offset)
            .finish()
    }
}

/// Write side of the shard directory for exactly one process.
///
/// Shards are opened lazily, one per class, the first time a series of
/// that class is touched. Files stay on disk after the process exits.
pub struct ShardStore {
    id: u64,
    dir: ShardDirectory,
    pid: u32,
    initial_capacity: usize,
    shards: Mutex<HashMap<ShardClass, Arc<ShardFile>>>,
    families: Mutex<HashMap<String, ShardClass>>,
}

impl ShardStore {
    /// Store for the calling process.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        Self::for_process(config, std::process::id())
    }

    /// Store writing shards under an explicit owner pid.
    pub fn for_process(config: &StoreConfig, pid: u32) -> Result<Self> {
        let dir = ShardDirectory::new(&config.shard_dir);
        dir.validate_writable()?;

        info!(
            target: "tally::store",
            dir = %dir.path().display(),
            pid,
            "Opened shard store"
        );

        Ok(Self {
            id: NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed),
            dir,
            pid,
            initial_capacity: config.initial_capacity,
            shards: Mutex::new(HashMap::new()),
            families: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    #[must_use]
    pub fn directory(&self) -> &ShardDirectory {
        &self.dir
    }

    /// Declare `family` under `class`. Redeclaring with the same class is a
    /// no-op; a different class is a configuration error.
    pub fn register(&self, family: &str, class: ShardClass) -> Result<()> {
        let mut families = self.families.lock();
        match families.get(family) {
            Some(&existing) if existing != class => Err(TallyError::KindConflict {
                name: family.to_string(),
                existing: existing.to_string(),
                requested: class.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                families.insert(family.to_string(), class);
                Ok(())
            },
        }
    }

    /// Handle for `key` in this process's `class` shard, allocating the
    /// slot on first use. The same key always yields an equal handle.
    ///
    /// Per-process gauges may not carry a `pid` label; aggregation adds it.
    pub fn get_or_create_slot(&self, class: ShardClass, key: &SampleKey) -> Result<SlotHandle> {
        if class == ShardClass::Gauge(GaugeMode::All) && key.labels.get(PID_LABEL).is_some() {
            return Err(TallyError::Config(format!(
                "label '{PID_LABEL}' is reserved on per-process gauge {}",
                key.family
            )));
        }
        self.register(&key.family, class)?;
        let shard = self.shard(class)?;
        let offset = shard.slot_offset(key)?;
        Ok(SlotHandle {
            store_id: self.id,
            shard,
            offset,
        })
    }

    fn shard(&self, class: ShardClass) -> Result<Arc<ShardFile>> {
        let mut shards = self.shards.lock();
        match shards.entry(class) {
            Entry::Occupied(e) => Ok(e.get().clone()),
            Entry::Vacant(e) => {
                let name = ShardName::new(class, self.pid);
                let shard = ShardFile::shared(&self.dir, name, self.initial_capacity)?;
                Ok(e.insert(shard).clone())
            },
        }
    }

    /// Apply one write. Returns whether the stored value changed.
    ///
    /// Lock-free: handles already carry the shard, so no store lock is taken.
    pub fn update(&self, handle: &SlotHandle, value: f64, op: UpdateOp) -> Result<bool> {
        self.check(handle)?;
        Ok(handle.apply(value, op))
    }

    /// This process's value for a handle obtained from this store.
    pub fn read(&self, handle: &SlotHandle) -> Result<f64> {
        self.check(handle)?;
        Ok(handle.value())
    }

    fn check(&self, handle: &SlotHandle) -> Result<()> {
        if handle.store_id == self.id {
            Ok(())
        } else {
            Err(TallyError::InvalidHandle(
                handle.shard.path().display().to_string(),
            ))
        }
    }

    /// Slots for a histogram with the given bucket upper bounds. A `+Inf`
    /// bucket is appended when missing.
    pub fn histogram(
        &self,
        family: &str,
        labels: &LabelSet,
        bounds: &[f64],
    ) -> Result<Distribution> {
        let mut bounds = bounds.to_vec();
        if bounds.iter().any(|b| b.is_nan()) || bounds.windows(2).any(|w| w[0] >= w[1]) {
            return Err(TallyError::Config(format!(
                "histogram {family} bounds must be strictly increasing"
            )));
        }
        if bounds.last().is_none_or(|b| *b != f64::INFINITY) {
            bounds.push(f64::INFINITY);
        }

        let class = ShardClass::Histogram;
        let mut buckets = Vec::with_capacity(bounds.len());
        for bound in bounds {
            let key = SampleKey::bucket(family, labels.clone(), bound);
            buckets.push((bound, self.get_or_create_slot(class, &key)?));
        }
        self.distribution(class, family, labels, buckets)
    }

    /// Sum and count slots for a summary.
    pub fn summary(&self, family: &str, labels: &LabelSet) -> Result<Distribution> {
        self.distribution(ShardClass::Summary, family, labels, Vec::new())
    }

    fn distribution(
        &self,
        class: ShardClass,
        family: &str,
        labels: &LabelSet,
        buckets: Vec<(f64, SlotHandle)>,
    ) -> Result<Distribution> {
        let key = SampleKey::new(family, labels.clone());
        let sum = self.get_or_create_slot(class, &key.clone().with_component(Component::Sum))?;
        let count = self.get_or_create_slot(class, &key.with_component(Component::Count))?;
        Ok(Distribution { buckets, sum, count })
    }

    /// Flush every open shard's dirty pages.
    pub fn flush(&self) -> Result<()> {
        let shards: Vec<_> = self.shards.lock().values().cloned().collect();
        for shard in shards {
            shard.flush()?;
        }
        Ok(())
    }

    /// Paths of the shards this store has created so far.
    #[must_use]
    pub fn shard_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<_> = self
            .shards
            .lock()
            .values()
            .map(|s| s.path().to_path_buf())
            .collect();
        paths.sort();
        paths
    }
}

/// Pre-resolved slots of one histogram or summary series.
#[derive(Debug, Clone)]
pub struct Distribution {
    /// Upper bound and cumulative count slot, ascending.
    buckets: Vec<(f64, SlotHandle)>,
    sum: SlotHandle,
    count: SlotHandle,
}

impl Distribution {
    pub fn observe(&self, value: f64) {
        for (bound, slot) in &self.buckets {
            if value <= *bound {
                slot.apply(1.0, UpdateOp::Add);
            }
        }
        self.sum.apply(value, UpdateOp::Add);
        self.count.apply(1.0, UpdateOp::Add);
    }

    #[must_use]
    pub fn count(&self) -> f64 {
        self.count.value()
    }

    #[must_use]
    pub fn sum(&self) -> f64 {
        self.sum.value()
    }

    /// Cumulative bucket counts as (upper bound, count).
    #[must_use]
    pub fn buckets(&self) -> Vec<(f64, f64)> {
        self.buckets.iter().map(|(b, s)| (*b, s.value())).collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tly_core::MetricKind;

    fn store(dir: &std::path::Path, pid: u32) -> ShardStore {
        ShardStore::for_process(&StoreConfig::new(dir).with_initial_capacity(4096), pid).unwrap()
    }

    #[test]
    fn test_missing_directory_is_config_error() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::new(dir.path().join("nope"));
        assert!(matches!(ShardStore::open(&config), Err(TallyError::Config(_))));
    }

    #[test]
    fn test_shard_created_on_first_write_only() {
        let dir = tempdir().unwrap();
        let store = store(dir.path(), 321);
        assert!(store.shard_paths().is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        let key = SampleKey::new("jobs_total", LabelSet::new());
        store.get_or_create_slot(ShardClass::Counter, &key).unwrap();
        assert_eq!(store.shard_paths(), vec![dir.path().join("counter_321.db")]);
    }

    #[test]
    fn test_same_key_same_handle() {
        let dir = tempdir().unwrap();
        let store = store(dir.path(), 1);
        let key =
            SampleKey::new("jobs_total", LabelSet::new().with("queue", "a").with("shard", "1"));
        let reordered =
            SampleKey::new("jobs_total", LabelSet::new().with("shard", "1").with("queue", "a"));
        let a = store.get_or_create_slot(ShardClass::Counter, &key).unwrap();
        let b = store.get_or_create_slot(ShardClass::Counter, &reordered).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_stores_on_one_pid_share_allocation() {
        let dir = tempdir().unwrap();
        let first = store(dir.path(), 42);
        let second = store(dir.path(), 42);
        let key = |name: &str| SampleKey::new(name, LabelSet::new());

        let a = first.get_or_create_slot(ShardClass::Counter, &key("a_total")).unwrap();
        let b = second.get_or_create_slot(ShardClass::Counter, &key("b_total")).unwrap();
        let c = first.get_or_create_slot(ShardClass::Counter, &key("c_total")).unwrap();
        first.update(&a, 1.0, UpdateOp::Add).unwrap();
        second.update(&b, 10.0, UpdateOp::Add).unwrap();
        first.update(&c, 100.0, UpdateOp::Add).unwrap();

        // The second store sees the first store's slots and values.
        let c_again = second.get_or_create_slot(ShardClass::Counter, &key("c_total")).unwrap();
        assert_eq!(second.read(&c_again).unwrap(), 100.0);

        let bytes = std::fs::read(dir.path().join("counter_42.db")).unwrap();
        let (_, scan) = tly_core::decode_slots(&bytes).unwrap();
        let values: Vec<_> = scan
            .slots
            .iter()
            .map(|s| (s.key.family.as_str(), s.value))
            .collect();
        assert_eq!(values, vec![("a_total", 1.0), ("b_total", 10.0), ("c_total", 100.0)]);
        assert!(scan.skipped.is_empty());
    }

    #[test]
    fn test_reopen_after_drop_appends_past_existing_slots() {
        let dir = tempdir().unwrap();
        let key = |name: &str| SampleKey::new(name, LabelSet::new());
        {
            let store = store(dir.path(), 43);
            let a = store.get_or_create_slot(ShardClass::Counter, &key("a_total")).unwrap();
            store.update(&a, 5.0, UpdateOp::Add).unwrap();
        }

        let store = store(dir.path(), 43);
        let b = store.get_or_create_slot(ShardClass::Counter, &key("b_total")).unwrap();
        store.update(&b, 7.0, UpdateOp::Add).unwrap();
        let a = store.get_or_create_slot(ShardClass::Counter, &key("a_total")).unwrap();
        assert_eq!(store.read(&a).unwrap(), 5.0);
        assert_eq!(store.read(&b).unwrap(), 7.0);
    }

    #[test]
    fn test_pid_label_reserved_on_per_process_gauge() {
        let dir = tempdir().unwrap();
        let store = store(dir.path(), 44);
        let key = SampleKey::new("rss_bytes", LabelSet::new().with("pid", "7"));

        let result = store.get_or_create_slot(ShardClass::Gauge(GaugeMode::All), &key);
        assert!(matches!(result, Err(TallyError::Config(_))));
        assert!(store.shard_paths().is_empty());

        // Other classes may use the label freely.
        store.get_or_create_slot(ShardClass::Gauge(GaugeMode::Max), &key).unwrap();
    }

    #[test]
    fn test_kind_conflict() {
        let dir = tempdir().unwrap();
        let store = store(dir.path(), 1);
        let key = SampleKey::new("workers", LabelSet::new());
        store.get_or_create_slot(ShardClass::Gauge(GaugeMode::Max), &key).unwrap();

        let err = store.get_or_create_slot(ShardClass::Counter, &key).unwrap_err();
        assert!(matches!(err, TallyError::KindConflict { .. }));
        let err = store
            .get_or_create_slot(ShardClass::Gauge(GaugeMode::Min), &key)
            .unwrap_err();
        assert!(matches!(err, TallyError::KindConflict { .. }));
        assert!(store.register("workers", ShardClass::Gauge(GaugeMode::Max)).is_ok());
    }

    #[test]
    fn test_update_and_read() {
        let dir = tempdir().unwrap();
        let store = store(dir.path(), 1);
        let class = ShardClass::Counter;
        let handle = store
            .get_or_create_slot(class, &SampleKey::new("jobs_total", LabelSet::new()))
            .unwrap();
        store.update(&handle, 2.0, UpdateOp::default_for(class)).unwrap();
        store.update(&handle, 0.5, UpdateOp::default_for(class)).unwrap();
        assert_eq!(store.read(&handle).unwrap(), 2.5);
        assert_eq!(handle.class().kind(), MetricKind::Counter);
    }

    #[test]
    fn test_foreign_handle_rejected() {
        let dir = tempdir().unwrap();
        let a = store(dir.path(), 1);
        let b = store(dir.path(), 2);
        let handle = a
            .get_or_create_slot(ShardClass::Counter, &SampleKey::new("x_total", LabelSet::new()))
            .unwrap();
        assert!(matches!(
            b.update(&handle, 1.0, UpdateOp::Add),
            Err(TallyError::InvalidHandle(_))
        ));
    }

    #[test]
    fn test_default_ops() {
        assert_eq!(UpdateOp::default_for(ShardClass::Counter), UpdateOp::Add);
        assert_eq!(
            UpdateOp::default_for(ShardClass::Gauge(GaugeMode::LiveSum)),
            UpdateOp::Add
        );
        assert_eq!(
            UpdateOp::default_for(ShardClass::Gauge(GaugeMode::MostRecent)),
            UpdateOp::Set
        );
        assert_eq!(
            UpdateOp::default_for(ShardClass::Gauge(GaugeMode::Max)),
            UpdateOp::SetIfGreater
        );
        assert_eq!(
            UpdateOp::default_for(ShardClass::Gauge(GaugeMode::Min)),
            UpdateOp::SetIfLess
        );
    }

    #[test]
    fn test_histogram_observe() {
        let dir = tempdir().unwrap();
        let store = store(dir.path(), 1);
        let hist = store
            .histogram("latency_seconds", &LabelSet::new(), &[0.1, 1.0])
            .unwrap();
        hist.observe(0.05);
        hist.observe(0.5);
        hist.observe(3.0);

        assert_eq!(
            hist.buckets(),
            vec![(0.1, 1.0), (1.0, 2.0), (f64::INFINITY, 3.0)]
        );
        assert_eq!(hist.count(), 3.0);
        assert!((hist.sum() - 3.55).abs() < 1e-9);
    }

    #[test]
    fn test_histogram_rejects_unsorted_bounds() {
        let dir = tempdir().unwrap();
        let store = store(dir.path(), 1);
        assert!(store.histogram("h", &LabelSet::new(), &[1.0, 0.5]).is_err());
        assert!(store.histogram("h", &LabelSet::new(), &[f64::NAN]).is_err());
    }

    #[test]
    fn test_summary_observe() {
        let dir = tempdir().unwrap();
        let store = store(dir.path(), 1);
        let summary = store.summary("payload_bytes", &LabelSet::new()).unwrap();
        summary.observe(100.0);
        summary.observe(28.0);
        assert_eq!(summary.count(), 2.0);
        assert_eq!(summary.sum(), 128.0);
    }
}
