use memmap2::Mmap;
use std::fs::File;
use std::path::{Path, PathBuf};
use tly_core::{Result, ShardHeader, ShardName, SlotScan, TallyError, decode_slots};

/// Read-only view of one shard file, possibly owned by another process.
pub struct ShardReader {
    path: PathBuf,
    mmap: Option<Mmap>,
}

impl ShardReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();

        // An empty file cannot be mapped; it simply has no header yet.
        let mmap = if len == 0 {
            None
        } else {
            // SAFETY: the mapping is read-only. The owning process may still
            // append or update values concurrently; the codec never reads past
            // the published `used` length and tolerates stale values.
            Some(unsafe { Mmap::map(&file)? })
        };

        Ok(Self {
            path: path.to_path_buf(),
            mmap,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.mmap.as_ref().map_or(0, |m| m.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decode header and slots. Errors only when the header is unusable.
    pub fn scan(&self) -> Result<(ShardHeader, SlotScan)> {
        let bytes: &[u8] = self.mmap.as_deref().unwrap_or(&[]);
        decode_slots(bytes)
    }

    /// Decode and additionally require the header class to agree with the
    /// file name.
    pub fn scan_as(&self, name: ShardName) -> Result<(ShardHeader, SlotScan)> {
        let (header, scan) = self.scan()?;
        if header.class != name.class {
            return Err(TallyError::InvalidHeader(format!(
                "header class {} does not match file name class {}",
                header.class, name.class
            )));
        }
        Ok((header, scan))
    }
}
