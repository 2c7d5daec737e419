//! Command-line interface definitions.
//!
//! ```bash
//! # Analyze moods for every track in a manifest
//! tunecache run --mode moods --manifest library.csv
//!
//! # Fingerprint a directory tree with 8 workers, retrying earlier failures
//! tunecache run --mode fingerprint --dir ~/Music --threads 8 --retry-errors
//!
//! # Forget recorded failures
//! tunecache clear-errors --mode properties
//!
//! # Inspect a cache file
//! tunecache stats --mode fingerprint
//! ```

use std::path::PathBuf;

use clap::{ArgGroup, Args, Parser, Subcommand};

use crate::mode::Mode;

/// Crash-safe batch analysis of audio libraries through external tools.
///
/// Results are cached per file and reused while the file is unchanged, even
/// after the library moves to another path or machine.
#[derive(Debug, Parser)]
#[command(name = "tunecache")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase verbosity level (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Configuration file (default: tunecache/config.toml in the config dir)
    #[arg(long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Report fatal errors as JSON on stderr
    #[arg(long, global = true)]
    pub json_errors: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Process a library, reusing cached results
    Run(RunArgs),
    /// Truncate a mode's error ledger
    ClearErrors(ClearErrorsArgs),
    /// Summarize a cache file
    Stats(StatsArgs),
}

/// Arguments for `run`.
#[derive(Debug, Args)]
#[command(group(ArgGroup::new("source").required(true).args(["manifest", "dir"])))]
pub struct RunArgs {
    /// What to compute
    #[arg(short, long, value_enum)]
    pub mode: Mode,

    /// Library manifest (CSV: id,artist,title,album,genre,path,duration)
    #[arg(long, value_name = "FILE")]
    pub manifest: Option<PathBuf>,

    /// Directory to scan for audio files
    #[arg(long, value_name = "DIR")]
    pub dir: Option<PathBuf>,

    /// Cache file (default: <cache_dir>/<mode>.json)
    #[arg(long, value_name = "FILE")]
    pub cache: Option<PathBuf>,

    /// Error ledger (default: <cache_dir>/<mode>-errors.csv)
    #[arg(long, value_name = "FILE")]
    pub errors: Option<PathBuf>,

    /// Clear the error ledger first so earlier failures are retried
    #[arg(long)]
    pub retry_errors: bool,

    /// Worker threads (default: available parallelism)
    #[arg(short = 'j', long, value_name = "N")]
    pub threads: Option<usize>,

    /// Save the cache after every N successful computations
    #[arg(long, value_name = "N")]
    pub flush_every: Option<usize>,

    /// Skip content hashing (disables cross-machine reuse where optional)
    #[arg(long)]
    pub no_content_hash: bool,

    /// Hide the progress bar
    #[arg(long)]
    pub no_progress: bool,

    /// Plain progress output for screen readers
    #[arg(long)]
    pub accessible: bool,

    /// Print the run summary as JSON on stdout
    #[arg(long)]
    pub json: bool,
}

/// Arguments for `clear-errors`.
#[derive(Debug, Args)]
pub struct ClearErrorsArgs {
    /// Whose ledger to clear
    #[arg(short, long, value_enum)]
    pub mode: Mode,

    /// Error ledger (default: <cache_dir>/<mode>-errors.csv)
    #[arg(long, value_name = "FILE")]
    pub errors: Option<PathBuf>,
}

/// Arguments for `stats`.
#[derive(Debug, Args)]
pub struct StatsArgs {
    /// Whose cache to inspect
    #[arg(short, long, value_enum)]
    pub mode: Mode,

    /// Cache file (default: <cache_dir>/<mode>.json)
    #[arg(long, value_name = "FILE")]
    pub cache: Option<PathBuf>,
}
