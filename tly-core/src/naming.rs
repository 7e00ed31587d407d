//! Shard directory layout: `<class>_<pid>.db` files in one flat directory.

use crate::{Result, ShardClass, TallyError};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

pub const SHARD_EXTENSION: &str = "db";

/// Class and owner recovered from a shard's file name alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShardName {
    pub class: ShardClass,
    pub pid: u32,
}

impl ShardName {
    #[must_use]
    pub const fn new(class: ShardClass, pid: u32) -> Self {
        Self { class, pid }
    }

    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{}_{}.{}", self.class.file_prefix(), self.pid, SHARD_EXTENSION)
    }

    /// Parse `gauge_max_1234.db`. Returns `None` for anything else.
    #[must_use]
    pub fn parse(file_name: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(".db")?;
        let (prefix, pid) = stem.rsplit_once('_')?;
        if pid.is_empty() || !pid.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let pid = pid.parse().ok()?;
        let class = ShardClass::from_file_prefix(prefix)?;
        Some(Self { class, pid })
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        path.file_name()
            .and_then(|n| n.to_str())
            .and_then(Self::parse)
            .ok_or_else(|| TallyError::InvalidFileName(path.to_path_buf()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardEntry {
    pub path: PathBuf,
    pub name: ShardName,
}

/// The directory every worker writes its shards into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardDirectory {
    root: PathBuf,
}

impl ShardDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn shard_path(&self, name: ShardName) -> PathBuf {
        self.root.join(name.file_name())
    }

    /// Fail with a configuration error unless the directory exists and this
    /// process may create files in it.
    pub fn validate_writable(&self) -> Result<()> {
        let metadata = fs::metadata(&self.root).map_err(|e| {
            TallyError::Config(format!(
                "shard directory {} is not accessible: {e}",
                self.root.display()
            ))
        })?;
        if !metadata.is_dir() {
            return Err(TallyError::Config(format!(
                "shard directory {} is not a directory",
                self.root.display()
            )));
        }
        if !is_writable(&self.root) {
            return Err(TallyError::Config(format!(
                "shard directory {} is not writable",
                self.root.display()
            )));
        }
        Ok(())
    }

    /// Regular files whose names follow the shard convention, sorted by
    /// class then pid. Everything else in the directory is ignored.
    pub fn list_shards(&self) -> Result<Vec<ShardEntry>> {
        let mut shards = Vec::new();
        for path in self.list_files()? {
            match ShardName::from_path(&path) {
                Ok(name) => shards.push(ShardEntry { path, name }),
                Err(_) => trace!(
                    target: "tally::dir",
                    path = %path.display(),
                    "Ignoring non-shard file"
                ),
            }
        }
        shards.sort_by_key(|s| s.name);
        Ok(shards)
    }

    /// Every regular file directly inside the directory, sorted by path.
    /// Subdirectories are never returned.
    pub fn list_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    debug!(target: "tally::dir", error = %e, "Skipping unreadable directory entry");
                    continue;
                },
            };
            // file_type() does not follow symlinks; a link is removed as a file.
            match entry.file_type() {
                Ok(ft) if ft.is_dir() => continue,
                Ok(_) => files.push(entry.path()),
                Err(e) => debug!(
                    target: "tally::dir",
                    path = %entry.path().display(),
                    error = %e,
                    "Skipping entry with unknown type"
                ),
            }
        }
        files.sort();
        Ok(files)
    }
}

#[cfg(unix)]
fn is_writable(path: &Path) -> bool {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    // SAFETY: c_path is a valid NUL-terminated string for the call's duration.
    unsafe { libc::access(c_path.as_ptr(), libc::W_OK | libc::X_OK) == 0 }
}

#[cfg(not(unix))]
fn is_writable(path: &Path) -> bool {
    fs::metadata(path).is_ok_and(|m| !m.permissions().readonly())
}
