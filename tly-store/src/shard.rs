//! One process's writable, growable, memory-mapped shard file.
//!
//! Slot allocation is serialized by a mutex. Value updates go straight to
//! an `AtomicU64` inside the mapping without taking it. Growth remaps the
//! file; superseded mappings stay alive until the shard is dropped, so a
//! writer that loaded the old base pointer still writes to valid memory.
//! Both mappings are shared views of the same file pages, so the write is
//! visible either way.

use memmap2::MmapMut;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};
use tly_core::codec::{self, HEADER_SIZE, USED_OFFSET};
use tly_core::{Result, SampleKey, ShardDirectory, ShardName, TallyError};
use tracing::{debug, warn};

/// Arithmetic applied to a slot's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOp {
    Add,
    /// Unconditional overwrite.
    Set,
    SetIfGreater,
    SetIfLess,
}

/// Every shard file this process has open, keyed by canonical path. Two
/// independent allocators on one file would hand out the same offset.
static OPEN_SHARDS: Mutex<BTreeMap<PathBuf, Weak<ShardFile>>> = Mutex::new(BTreeMap::new());

struct AllocState {
    current: MmapMut,
    retired: Vec<MmapMut>,
    index: HashMap<SampleKey, usize>,
    used: usize,
}

pub struct ShardFile {
    path: PathBuf,
    name: ShardName,
    file: File,
    base: AtomicPtr<u8>,
    state: Mutex<AllocState>,
}

impl ShardFile {
    /// Open this process's shard for `name`, creating it if needed.
    ///
    /// An existing file (pid reuse, or a store re-created in-process) is
    /// scanned to rebuild the slot index; one whose header cannot be read is
    /// reinitialized.
    pub fn open(dir: &ShardDirectory, name: ShardName, initial_capacity: usize) -> Result<Self> {
        let path = dir.shard_path(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let initial_capacity = codec::align8(initial_capacity.max(HEADER_SIZE * 4));

        let existing_len = file.metadata()?.len() as usize;
        let state = if existing_len == 0 {
            Self::initialize(&file, &path, name, initial_capacity)?
        } else {
            Self::recover(&file, &path, name, initial_capacity)?
        };

        let mut shard = Self {
            path,
            name,
            file,
            base: AtomicPtr::new(std::ptr::null_mut()),
            state: Mutex::new(state),
        };
        let base = shard.state.get_mut().current.as_mut_ptr();
        shard.base.store(base, Ordering::Release);
        Ok(shard)
    }

    /// The process-wide instance of this shard, opening it if no live one
    /// exists. All stores in a process writing the same (class, pid) share
    /// one allocator through this.
    pub fn shared(
        dir: &ShardDirectory,
        name: ShardName,
        initial_capacity: usize,
    ) -> Result<Arc<Self>> {
        let key = std::fs::canonicalize(dir.path())?.join(name.file_name());

        let mut open = OPEN_SHARDS.lock();
        if let Some(shard) = open.get(&key).and_then(Weak::upgrade) {
            debug!(
                target: "tally::store",
                path = %key.display(),
                "Reusing open shard"
            );
            return Ok(shard);
        }

        let shard = Arc::new(Self::open(dir, name, initial_capacity)?);
        open.retain(|_, weak| weak.strong_count() > 0);
        open.insert(key, Arc::downgrade(&shard));
        Ok(shard)
    }

    fn initialize(
        file: &File,
        path: &Path,
        name: ShardName,
        capacity: usize,
    ) -> Result<AllocState> {
        file.set_len(0)?;
        file.set_len(capacity as u64)?;
        // SAFETY: the file is exclusively written by this process (its pid is
        // in the name) and stays open for the mapping's lifetime.
        let mut map = unsafe { MmapMut::map_mut(file)? };
        map[..HEADER_SIZE].copy_from_slice(&codec::encode_header(name.class));

        debug!(
            target: "tally::store",
            path = %path.display(),
            class = %name.class,
            capacity,
            "Created shard"
        );

        Ok(AllocState {
            current: map,
            retired: Vec::new(),
            index: HashMap::new(),
            used: HEADER_SIZE,
        })
    }

    fn recover(
        file: &File,
        path: &Path,
        name: ShardName,
        initial_capacity: usize,
    ) -> Result<AllocState> {
        let len = file.metadata()?.len() as usize;
        if len < initial_capacity || len % 8 != 0 {
            file.set_len(codec::align8(len.max(initial_capacity)) as u64)?;
        }
        // SAFETY: see `initialize`.
        let mut map = unsafe { MmapMut::map_mut(file)? };

        let (header, scan) = match codec::decode_slots(&map[..len.min(map.len())]) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(
                    target: "tally::store",
                    path = %path.display(),
                    error = %e,
                    "Unreadable shard header, reinitializing"
                );
                drop(map);
                return Self::initialize(file, path, name, initial_capacity);
            },
        };
        if header.class != name.class {
            warn!(
                target: "tally::store",
                path = %path.display(),
                found = %header.class,
                expected = %name.class,
                "Shard class does not match file name, reinitializing"
            );
            drop(map);
            return Self::initialize(file, path, name, initial_capacity);
        }

        if let Some(offset) = scan.truncated_at {
            warn!(
                target: "tally::store",
                path = %path.display(),
                offset,
                "Discarding unreadable shard tail"
            );
        }
        for skipped in &scan.skipped {
            warn!(
                target: "tally::store",
                path = %path.display(),
                offset = skipped.offset,
                reason = %skipped.reason,
                "Skipping corrupt slot"
            );
        }

        let mut index = HashMap::with_capacity(scan.slots.len());
        for slot in scan.slots {
            index.entry(slot.key).or_insert(slot.value_offset);
        }
        let used = scan.end;
        map[USED_OFFSET..USED_OFFSET + 4].copy_from_slice(&(used as u32).to_le_bytes());

        debug!(
            target: "tally::store",
            path = %path.display(),
            slots = index.len(),
            used,
            "Reopened shard"
        );

        Ok(AllocState {
            current: map,
            retired: Vec::new(),
            index,
            used,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn name(&self) -> ShardName {
        self.name
    }

    /// Mapped bytes currently available.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.state.lock().current.len()
    }

    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.state.lock().index.len()
    }

    /// Value offset for `key`, appending a zeroed slot on first use.
    pub fn slot_offset(&self, key: &SampleKey) -> Result<usize> {
        let mut state = self.state.lock();
        if let Some(&offset) = state.index.get(key) {
            return Ok(offset);
        }

        let key_bytes = codec::encode_key(key)?;
        let entry = codec::encode_entry(&key_bytes);
        let start = state.used;
        let end = start + entry.len();
        if u32::try_from(end).is_err() {
            return Err(TallyError::Config(format!(
                "shard {} cannot grow past 4 GiB",
                self.path.display()
            )));
        }
        if end > state.current.len() {
            self.grow(&mut state, end)?;
        }

        let base = self.base.load(Ordering::Acquire);
        // SAFETY: [start, end) lies inside the current mapping and past
        // `used`, so no reader or writer references those bytes yet.
        unsafe {
            std::ptr::copy_nonoverlapping(entry.as_ptr(), base.add(start), entry.len());
        }
        self.used_cell().store((end as u32).to_le(), Ordering::Release);
        state.used = end;

        let offset = codec::value_offset(start, key_bytes.len());
        state.index.insert(key.clone(), offset);
        Ok(offset)
    }

    fn grow(&self, state: &mut AllocState, needed: usize) -> Result<()> {
        let old = state.current.len();
        let mut capacity = old.max(HEADER_SIZE);
        while capacity < needed {
            capacity *= 2;
        }
        self.file.set_len(capacity as u64)?;
        // SAFETY: see `initialize`.
        let mut map = unsafe { MmapMut::map_mut(&self.file)? };
        self.base.store(map.as_mut_ptr(), Ordering::Release);
        let previous = std::mem::replace(&mut state.current, map);
        state.retired.push(previous);

        debug!(
            target: "tally::store",
            path = %self.path.display(),
            from = old,
            to = capacity,
            "Grew shard"
        );
        Ok(())
    }

    /// Apply `op` to the slot at `offset`. Returns false when a conditional
    /// op left the value unchanged.
    pub fn apply(&self, offset: usize, value: f64, op: UpdateOp) -> bool {
        let cell = self.cell(offset);
        let changed = match op {
            UpdateOp::Set => {
                cell.store(value.to_bits().to_le(), Ordering::Release);
                true
            },
            UpdateOp::Add | UpdateOp::SetIfGreater | UpdateOp::SetIfLess => cell
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                    let current = f64::from_bits(u64::from_le(raw));
                    let next = match op {
                        UpdateOp::Add => Some(current + value),
                        UpdateOp::SetIfGreater => (value > current).then_some(value),
                        _ => (value < current).then_some(value),
                    };
                    next.map(|n| n.to_bits().to_le())
                })
                .is_ok(),
        };
        if changed {
            self.cell(offset + 8)
                .store(now_ns().to_le(), Ordering::Release);
        }
        changed
    }

    /// Current value and last-write timestamp of the slot at `offset`.
    #[must_use]
    pub fn read(&self, offset: usize) -> (f64, u64) {
        let value = u64::from_le(self.cell(offset).load(Ordering::Acquire));
        let timestamp = u64::from_le(self.cell(offset + 8).load(Ordering::Acquire));
        (f64::from_bits(value), timestamp)
    }

    /// Flush dirty pages to the file.
    pub fn flush(&self) -> Result<()> {
        self.state.lock().current.flush()?;
        Ok(())
    }

    fn cell(&self, offset: usize) -> &AtomicU64 {
        debug_assert_eq!(offset % 8, 0);
        let base = self.base.load(Ordering::Acquire);
        // SAFETY: offsets come from `slot_offset`, are 8-byte aligned inside
        // a committed entry, and every mapping `base` ever pointed to lives
        // as long as `self`.
        unsafe { &*base.add(offset).cast::<AtomicU64>() }
    }

    fn used_cell(&self) -> &AtomicU32 {
        let base = self.base.load(Ordering::Acquire);
        // SAFETY: the header is always mapped and USED_OFFSET is 4-aligned.
        unsafe { &*base.add(USED_OFFSET).cast::<AtomicU32>() }
    }
}

impl std::fmt::Debug for ShardFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardFile")
            .field("path", &self.path)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

pub(crate) fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
}
