//! Removal of shard files that no longer belong to a running process.
//!
//! Only whole files are ever removed. A failure to delete one file is logged
//! and counted; the pass carries on with the rest. The only hard error is a
//! directory that cannot be listed.

use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tly_core::{Liveness, ProcessState, Result, ShardClass, ShardDirectory, ShardEntry};
use tracing::{debug, info, warn};

/// Outcome of one cleanup pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Files selected for deletion.
    pub attempted: usize,
    pub removed: usize,
    pub failed: usize,
    /// Shards kept because their process is alive.
    pub kept_live: usize,
    /// Shards kept because liveness could not be determined.
    pub kept_unknown: usize,
    /// Set when nothing was deleted on purpose.
    pub dry_run: bool,
}

impl CleanupReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

pub struct Cleaner {
    dir: ShardDirectory,
    dry_run: bool,
}

impl Cleaner {
    pub fn new(dir: ShardDirectory) -> Self {
        Self {
            dir,
            dry_run: false,
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Self {
        Self::new(ShardDirectory::new(path.as_ref()))
    }

    /// Report what would be removed without touching the filesystem.
    #[must_use]
    pub fn dry_run(mut self, enabled: bool) -> Self {
        self.dry_run = enabled;
        self
    }

    pub fn directory(&self) -> &ShardDirectory {
        &self.dir
    }

    /// Delete the shards of every process that `liveness` reports dead.
    ///
    /// `Unknown` is treated as alive.
    pub fn sweep(&self, liveness: &dyn Liveness) -> Result<CleanupReport> {
        let shards = self.dir.list_shards()?;
        let mut report = self.report();
        let mut doomed = Vec::new();

        let mut states: HashMap<u32, ProcessState> = HashMap::new();
        for shard in shards {
            let pid = shard.name.pid;
            let state = *states.entry(pid).or_insert_with(|| liveness.state(pid));

            match state {
                ProcessState::Dead => doomed.push(shard.path),
                ProcessState::Alive => report.kept_live += 1,
                ProcessState::Unknown => {
                    debug!(
                        target: "tally::cleanup",
                        path = %shard.path.display(),
                        pid,
                        "Keeping shard of process with unknown state"
                    );
                    report.kept_unknown += 1;
                },
            }
        }

        self.remove_all(&doomed, &mut report);
        info!(
            target: "tally::cleanup",
            dir = %self.dir.path().display(),
            attempted = report.attempted,
            removed = report.removed,
            failed = report.failed,
            kept_live = report.kept_live,
            kept_unknown = report.kept_unknown,
            dry_run = self.dry_run,
            "Sweep complete"
        );
        Ok(report)
    }

    /// Delete every regular file in the directory, shard or not.
    /// Subdirectories and their contents are left alone.
    pub fn reset_all(&self) -> Result<CleanupReport> {
        let files = self.dir.list_files()?;
        let mut report = self.report();
        self.remove_all(&files, &mut report);

        info!(
            target: "tally::cleanup",
            dir = %self.dir.path().display(),
            attempted = report.attempted,
            removed = report.removed,
            failed = report.failed,
            dry_run = self.dry_run,
            "Reset complete"
        );
        Ok(report)
    }

    /// Exit hook for a worker: drop the `LiveAll` gauge shards of `pid`.
    ///
    /// Counters, histograms, summaries and the other gauge modes, `LiveSum`
    /// included, keep contributing after the process is gone, so their
    /// shards stay.
    pub fn mark_process_dead(&self, pid: u32) -> Result<CleanupReport> {
        let shards = self.dir.list_shards()?;
        let doomed: Vec<PathBuf> = shards
            .into_iter()
            .filter(|s| s.name.pid == pid && is_live_only(s))
            .map(|s| s.path)
            .collect();

        let mut report = self.report();
        self.remove_all(&doomed, &mut report);
        debug!(
            target: "tally::cleanup",
            pid,
            removed = report.removed,
            "Process marked dead"
        );
        Ok(report)
    }

    fn report(&self) -> CleanupReport {
        CleanupReport {
            dry_run: self.dry_run,
            ..CleanupReport::default()
        }
    }

    fn remove_all(&self, paths: &[PathBuf], report: &mut CleanupReport) {
        for path in paths {
            report.attempted += 1;
            if self.dry_run {
                debug!(target: "tally::cleanup", path = %path.display(), "Would remove");
                continue;
            }
            match fs::remove_file(path) {
                Ok(()) => {
                    debug!(target: "tally::cleanup", path = %path.display(), "Removed");
                    report.removed += 1;
                },
                Err(e) => {
                    log_failure(path, &e);
                    report.failed += 1;
                },
            }
        }
    }
}

fn is_live_only(shard: &ShardEntry) -> bool {
    match shard.name.class {
        ShardClass::Gauge(mode) => mode.is_live_only(),
        _ => false,
    }
}

fn log_failure(path: &Path, error: &io::Error) {
    if error.kind() == io::ErrorKind::NotFound {
        // Raced with another cleaner.
        debug!(target: "tally::cleanup", path = %path.display(), "Already removed");
    } else {
        warn!(
            target: "tally::cleanup",
            path = %path.display(),
            error = %error,
            "Failed to remove file"
        );
    }
}
