#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "tly")]
#[command(about = "Tally shard directory maintenance and aggregation")]
#[command(version)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "TALLY_SHARD_DIR",
        help = "Shard directory"
    )]
    dir: Option<PathBuf>,
    #[arg(long, global = true, help = "Config file (.toml or .json) naming the shard directory")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Delete shards whose owning process no longer exists
    Sweep {
        #[arg(long, help = "Show what would be deleted without actually deleting")]
        dry_run: bool,
    },
    /// Delete every file in the shard directory, keeping subdirectories
    Reset {
        #[arg(long, help = "Show what would be deleted without actually deleting")]
        dry_run: bool,
    },
    /// Exit hook: drop the live-all gauge shards of a process
    MarkDead {
        #[arg(help = "Process id that exited")]
        pid: u32,
        #[arg(long, help = "Show what would be deleted without actually deleting")]
        dry_run: bool,
    },
    /// Merge all shards and print the result
    Aggregate {
        #[arg(long, help = "Print the snapshot as JSON")]
        json: bool,
    },
    /// Decode a single shard file
    Scan {
        #[arg(help = "Path to shard file")]
        path: PathBuf,
    },
}

fn main() {
    init_tracing();

    let cli = Cli::parse();
    let dir = || tly::commands::resolve_dir(cli.dir.clone(), cli.config.as_deref());

    let result = match cli.command {
        Commands::Sweep { dry_run } => dir()
            .and_then(|d| tly::commands::sweep(d, dry_run))
            .map(drop),
        Commands::Reset { dry_run } => dir()
            .and_then(|d| tly::commands::reset(d, dry_run))
            .map(drop),
        Commands::MarkDead { pid, dry_run } => dir()
            .and_then(|d| tly::commands::mark_dead(d, pid, dry_run))
            .map(drop),
        Commands::Aggregate { json } => dir()
            .and_then(|d| tly::commands::aggregate(d, json))
            .map(drop),
        Commands::Scan { ref path } => tly::commands::scan_shard(path),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
        .with(filter)
        .init();
}
