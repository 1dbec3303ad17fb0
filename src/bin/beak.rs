//! # Beak CLI - snapshot backups as virtual tar trees
//!
//! Thin front end over the beak engine.
//!
//! ## Usage
//! ```bash
//! # Materialize the virtual archive of a directory
//! beak store ~/work /backups/work
//!
//! # Push only the segments the remote is missing
//! beak push /backups/work remote:work
//!
//! # List what a storage holds
//! beak ls remote:work
//!
//! # Restore the newest snapshot (or @2, or "2024-05-01 09:15")
//! beak restore remote:work ~/work-restored --point @0
//! ```

use beak::{
    storage, BeakConfig, BeakError, CacheFs, ChunkingPolicy, ForwardFs, Packer, ProgressTicker,
    Result, ReverseFs, Shutdown, Storage, TreePath,
};
use clap::{Parser, Subcommand};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// Beak - deduplicating snapshot backups, browsable as tar archives
#[derive(Parser)]
#[command(name = "beak")]
#[command(version)]
#[command(about = "Deduplicating snapshot backups, browsable as tar archives")]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pack an origin directory and materialize its segments
    Store {
        /// Origin directory to back up
        origin: PathBuf,
        /// Destination directory for the segments
        dest: PathBuf,

        /// Target segment size in bytes
        #[arg(long)]
        target_size: Option<u64>,

        /// Exclude patterns (gitignore syntax)
        #[arg(short, long)]
        exclude: Vec<String>,
    },

    /// Push local segments a storage is missing
    Push {
        /// Local segment directory
        local: PathBuf,
        /// Storage location (directory, rclone or rsync remote)
        storage: String,
    },

    /// Fetch every intact segment from a storage
    Fetch {
        /// Storage location
        storage: String,
        /// Local destination directory
        local: PathBuf,
    },

    /// Restore a point in time from a storage
    Restore {
        /// Storage location
        storage: String,
        /// Destination directory
        dest: PathBuf,

        /// Point in time: @0 newest, @3 three back, or a datetime prefix
        #[arg(long, default_value = "@0")]
        point: String,
    },

    /// List the contents of a storage
    Ls {
        /// Storage location
        storage: String,
    },

    /// Show snapshot history of a storage
    History {
        /// Storage location
        storage: String,
    },

    /// Compare two points in time
    Diff {
        /// Storage location
        storage: String,
        /// From point
        from: String,
        /// To point
        to: String,
    },

    /// Show the resolved configuration
    Config,
}

fn main() {
    let cli = Cli::parse();
    let filter = if cli.verbose { "beak=debug" } else { "beak=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let shutdown = Shutdown::new();
    if let Err(e) = shutdown.register_signals() {
        eprintln!("{} {}", "warning:".yellow(), e);
    }

    match run(cli, &shutdown) {
        Ok(()) => shutdown.run(),
        Err(e) => {
            shutdown.run();
            eprintln!("{} {}", "error:".red().bold(), e);
            std::process::exit(e.exit_code());
        }
    }
}

/// Guess the backend from the location syntax: `remote:path` is
/// rclone-style, everything else is a local directory
fn storage_for(location: &str) -> Storage {
    match location.split_once(':') {
        Some((remote, _)) if !remote.is_empty() && !location.starts_with('/') => {
            Storage::rclone(location)
        }
        _ => Storage::local(location),
    }
}

fn transfer_bar(prefix: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{prefix} {pos} files {msg}")
            .expect("static template"),
    );
    bar.set_prefix(prefix.to_string());
    bar
}

fn run(cli: Cli, shutdown: &Arc<Shutdown>) -> Result<()> {
    let config = BeakConfig::load()?;

    match cli.command {
        Commands::Store {
            origin,
            dest,
            target_size,
            exclude,
        } => {
            let policy = match target_size {
                Some(t) => ChunkingPolicy::with_target_size(t),
                None => config.chunking_policy()?,
            };
            let mut packer = Packer::new(policy);
            for pattern in &exclude {
                packer.exclude(pattern)?;
            }

            let started = Instant::now();
            let tree = packer.pack(&origin)?;
            let stats = tree.stats().clone();
            if shutdown.is_requested() {
                return Ok(());
            }

            let bar = transfer_bar("storing");
            let ticker_bar = bar.clone();
            let ticker = ProgressTicker::start(move || ticker_bar.tick());
            let view = ForwardFs::new(tree);
            let written = view.store_to(&dest)?;
            drop(ticker);
            bar.finish_and_clear();

            println!(
                "{} {} files and {} dirs into {} segments in {}",
                "stored".green().bold(),
                stats.num_files,
                stats.num_dirs,
                written,
                humantime::format_duration(round_secs(started.elapsed())),
            );
        }

        Commands::Push { local, storage } => {
            let storage = storage_for(&storage);
            let bar = transfer_bar("pushing");
            let stats = storage::sync(&local, &storage, &mut |file| {
                bar.inc(1);
                bar.set_message(file.to_string());
            })?;
            bar.finish_and_clear();
            println!(
                "{} {} segments ({} already present)",
                "pushed".green().bold(),
                stats.pushed,
                stats.skipped
            );
        }

        Commands::Fetch { storage, local } => {
            let storage = storage_for(&storage);
            let listing = storage::list(&storage)?;
            let files: Vec<TreePath> = listing.good.iter().map(|s| s.path.clone()).collect();
            storage::fetch(&storage, &files, &local)?;
            println!("{} {} segments", "fetched".green().bold(), files.len());
        }

        Commands::Restore {
            storage,
            dest,
            point,
        } => {
            let storage = storage_for(&storage);
            let cache = CacheFs::new(storage.clone(), config.cache_dir_for(&storage)?)?;
            let view = ReverseFs::mount(cache, Some(&point))?;
            let restored = view.restore_to(&TreePath::root(), &dest)?;
            println!(
                "{} {} files from {} into {}",
                "restored".green().bold(),
                restored,
                point.cyan(),
                dest.display()
            );
        }

        Commands::Ls { storage } => {
            let storage = storage_for(&storage);
            let listing = storage::list(&storage)?;
            for seg in &listing.good {
                println!("{:>12} {}", seg.size, seg.path.un_root());
            }
            for seg in &listing.bad {
                println!(
                    "{:>12} {} {}",
                    seg.size,
                    seg.path.un_root(),
                    "(size mismatch)".red()
                );
            }
            if !listing.other.is_empty() {
                println!(
                    "{}",
                    format!("{} non-segment files ignored", listing.other.len()).dimmed()
                );
            }
        }

        Commands::History { storage } => {
            let _ = storage_for(&storage);
            return Err(BeakError::unsupported("the history command"));
        }

        Commands::Diff { storage, from, to } => {
            let _ = (storage_for(&storage), from, to);
            return Err(BeakError::unsupported("the diff command"));
        }

        Commands::Config => {
            println!(
                "{}",
                serde_json::to_string_pretty(&config)
                    .map_err(|e| BeakError::InvalidConfiguration(e.to_string()))?
            );
        }
    }
    Ok(())
}

fn round_secs(d: std::time::Duration) -> std::time::Duration {
    std::time::Duration::from_secs(d.as_secs().max(1))
}
