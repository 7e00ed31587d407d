use std::path::{Path, PathBuf};
use tly_aggregate::{Aggregator, ShardReader, Snapshot};
use tly_cleanup::{Cleaner, CleanupReport};
use tly_core::{ProcessTable, Result, SHARD_DIR_ENV, ShardDirectory, TallyError};
use tly_store::StoreConfig;
use tracing::debug;

/// Pick the shard directory: explicit flag, then config file, then the
/// environment (clap already folds `TALLY_SHARD_DIR` into `dir`).
pub fn resolve_dir(dir: Option<PathBuf>, config: Option<&Path>) -> Result<ShardDirectory> {
    if let Some(dir) = dir {
        return Ok(ShardDirectory::new(dir));
    }
    if let Some(path) = config {
        let config = StoreConfig::from_file(path)?;
        debug!(
            target: "tally::cli",
            config = %path.display(),
            "Loaded shard directory from config"
        );
        return Ok(ShardDirectory::new(config.shard_dir));
    }
    Err(TallyError::Config(format!(
        "no shard directory given; pass --dir, --config or set {SHARD_DIR_ENV}"
    )))
}

fn print_report(action: &str, report: &CleanupReport) {
    if report.dry_run {
        println!("Dry run - no files were deleted.");
        println!("  Would remove: {}", report.attempted);
    } else {
        println!("{action}: removed {} of {} file(s)", report.removed, report.attempted);
    }
    if report.kept_live > 0 || report.kept_unknown > 0 {
        println!(
            "  Kept: {} live, {} unknown",
            report.kept_live, report.kept_unknown
        );
    }
    if !report.is_clean() {
        eprintln!("  Failed to remove: {}", report.failed);
    }
}

pub fn sweep(dir: ShardDirectory, dry_run: bool) -> Result<CleanupReport> {
    let cleaner = Cleaner::new(dir).dry_run(dry_run);
    let report = cleaner.sweep(&ProcessTable)?;
    print_report("Sweep", &report);
    Ok(report)
}

pub fn reset(dir: ShardDirectory, dry_run: bool) -> Result<CleanupReport> {
    let cleaner = Cleaner::new(dir).dry_run(dry_run);
    let report = cleaner.reset_all()?;
    print_report("Reset", &report);
    Ok(report)
}

pub fn mark_dead(dir: ShardDirectory, pid: u32, dry_run: bool) -> Result<CleanupReport> {
    let cleaner = Cleaner::new(dir).dry_run(dry_run);
    let report = cleaner.mark_process_dead(pid)?;
    print_report(&format!("Process {pid}"), &report);
    Ok(report)
}

pub fn aggregate(dir: ShardDirectory, json: bool) -> Result<Snapshot> {
    let snapshot = Aggregator::new(dir).collect()?;

    if json {
        println!("{}", snapshot.to_json()?);
        return Ok(snapshot);
    }

    for family in &snapshot.families {
        println!("# {} {} ({})", family.name, family.kind, family.class);
        for sample in &family.samples {
            println!("{} {}", sample.key, sample.value);
        }
    }
    let report = &snapshot.report;
    let dropped = report.slots_skipped + report.conflicting_slots + report.pid_label_collisions;
    if report.shards_skipped > 0 || dropped > 0 {
        eprintln!(
            "Skipped {} shard(s), {} corrupt, {} conflicting, {} pid-labelled slot(s)",
            report.shards_skipped,
            report.slots_skipped,
            report.conflicting_slots,
            report.pid_label_collisions
        );
    }
    Ok(snapshot)
}

pub fn scan_shard(path: &Path) -> Result<()> {
    let reader = ShardReader::open(path)?;
    let (header, scan) = reader.scan()?;

    println!("Shard: {}", path.display());
    println!("  Class: {}", header.class);
    println!("  File size: {} bytes", reader.len());
    println!("  Used: {} bytes", header.used);
    println!("  Valid slots: {}", scan.slots.len());
    println!("  Skipped slots: {}", scan.skipped.len());

    if let Some(offset) = scan.truncated_at {
        println!("  Truncated at offset: {}", offset);
    }
    for slot in &scan.slots {
        println!(
            "    @{} {} = {} (ts {} ns)",
            slot.value_offset, slot.key, slot.value, slot.timestamp_ns
        );
    }
    for skipped in &scan.skipped {
        println!("    skipped @{}: {}", skipped.offset, skipped.reason);
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_resolve_dir_prefers_flag() {
        let dir = resolve_dir(Some(PathBuf::from("/a")), Some(Path::new("/missing.toml"))).unwrap();
        assert_eq!(dir.path(), Path::new("/a"));
    }

    #[test]
    fn test_resolve_dir_from_config() {
        let tmp = tempdir().unwrap();
        let config = tmp.path().join("tally.toml");
        std::fs::write(&config, "shard_dir = \"/var/run/tally\"\n").unwrap();

        let dir = resolve_dir(None, Some(&config)).unwrap();
        assert_eq!(dir.path(), Path::new("/var/run/tally"));
    }

    #[test]
    fn test_resolve_dir_requires_source() {
        assert!(matches!(resolve_dir(None, None), Err(TallyError::Config(_))));
    }

    #[test]
    fn test_mark_dead_reports_clean_removal() {
        let tmp = tempdir().unwrap();
        std::fs::write(tmp.path().join("gauge_liveall_77.db"), b"x").unwrap();
        std::fs::write(tmp.path().join("gauge_livesum_77.db"), b"x").unwrap();

        let report = mark_dead(ShardDirectory::new(tmp.path()), 77, false).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.removed, 1);
        assert!(tmp.path().join("gauge_livesum_77.db").exists());
    }

    #[test]
    fn test_reset_and_sweep_on_missing_directory() {
        let tmp = tempdir().unwrap();
        let missing = ShardDirectory::new(tmp.path().join("missing"));
        assert!(reset(missing.clone(), false).is_err());
        assert!(sweep(missing, false).is_err());
    }
}
