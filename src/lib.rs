//! tunecache - crash-safe batch analysis of audio libraries.
//!
//! Runs an external analysis tool (mood analyzer, `fpcalc`, `ffprobe`) over
//! every track of a library, caching each result against the file's path
//! and modification time. Later runs only pay for files that changed, files
//! that moved are recognized by content hash, and a watchdog kills tools
//! that stop making progress.

pub mod cache;
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod fsutil;
pub mod hashing;
pub mod ledger;
pub mod library;
pub mod logging;
pub mod mode;
pub mod progress;
pub mod signal;
pub mod tool;

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::cache::{CacheStore, CorruptPolicy, Flusher};
use crate::cli::{ClearErrorsArgs, Cli, Commands, RunArgs, StatsArgs};
use crate::config::Config;
use crate::dispatcher::{Dispatcher, DispatcherConfig, RunStats};
use crate::error::ExitCode;
use crate::ledger::ErrorLedger;
use crate::library::{DirectorySource, Library, LibrarySource, ManifestSource};
use crate::progress::{Progress, ProgressCallback};
use crate::tool::{resolve_program, verify_tools, Downmixer, PathSanitizer, ToolInvoker};

/// Run the command described by `cli`.
///
/// # Errors
///
/// Returns fatal errors only: bad configuration, a missing tool, an
/// unreadable library, a corrupt cache in a strict mode, or a failed final
/// save. Failed items are reported through the exit code instead.
pub fn run_app(cli: Cli) -> Result<ExitCode> {
    logging::init_logging(cli.verbose, cli.quiet);
    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    log::debug!("Configuration: {:?}", config);

    match cli.command {
        Commands::Run(args) => run(args, &config, cli.quiet),
        Commands::ClearErrors(args) => clear_errors(&args, &config),
        Commands::Stats(args) => stats(&args, &config),
    }
}

fn run(args: RunArgs, config: &Config, quiet: bool) -> Result<ExitCode> {
    let handler = signal::install_handler().context("installing Ctrl+C handler")?;
    let shutdown = handler.get_flag();
    let mode = args.mode;

    let spec = mode.tool_spec(&config.tools);
    verify_tools([&spec])?;
    let downmixer = if mode.supports_downmix() {
        let mixer = Downmixer::new(
            &config.tools.ffmpeg,
            config.downmix_channels,
            Duration::from_secs(config.downmix_timeout_secs),
        );
        match resolve_program(mixer.spec()) {
            Ok(_) => Some(mixer),
            Err(e) => {
                log::warn!("{}; multichannel files that the tool rejects will fail", e);
                None
            }
        }
    } else {
        None
    };

    let sanitizer = PathSanitizer::new(config.link_dir.clone());
    sanitizer.sweep_orphans();

    let cache_path = args.cache.clone().unwrap_or_else(|| config.cache_path(mode));
    let errors_path = args.errors.clone().unwrap_or_else(|| config.errors_path(mode));

    let store = Arc::new(CacheStore::new());
    let policy = CorruptPolicy::for_mode(mode, config.abort_on_corrupt_cache);
    let loaded = store
        .load(&cache_path, mode, policy)
        .with_context(|| format!("loading cache {}", cache_path.display()))?;
    log::info!("Loaded {} cached results from {}", loaded, cache_path.display());

    let ledger = Arc::new(
        ErrorLedger::load(&errors_path)
            .with_context(|| format!("loading error ledger {}", errors_path.display()))?,
    );
    if args.retry_errors {
        ledger.clear().context("clearing error ledger")?;
    } else if !ledger.is_empty() {
        log::info!(
            "Skipping {} files that failed before (use --retry-errors to retry)",
            ledger.len()
        );
    }

    let show_progress = !(quiet || args.no_progress || args.json);
    let progress: Arc<dyn ProgressCallback> =
        Arc::new(Progress::with_accessible(!show_progress, args.accessible));

    let library = load_library(&args, &shutdown, &progress)?;
    for issue in &library.issues {
        log::warn!("Library: {}", issue);
    }
    sanitizer.sweep_orphans_near(library.items.iter().map(|item| item.path.as_path()));

    let mut dispatcher_config = DispatcherConfig::default()
        .with_threads(args.threads.unwrap_or_else(|| config.worker_threads()))
        .with_flush_every(args.flush_every.unwrap_or(config.flush_every))
        .with_content_hash(config.content_hash && !args.no_content_hash)
        .with_max_duration(config.max_duration(mode))
        .with_shutdown_flag(Arc::clone(&shutdown));
    if show_progress {
        dispatcher_config = dispatcher_config.with_progress_callback(progress);
    }

    let flusher = Flusher::new(&cache_path, &store);
    let mut dispatcher = Dispatcher::new(mode, spec, store, ledger, flusher, dispatcher_config)
        .with_invoker(ToolInvoker::new(config.watchdog()))
        .with_sanitizer(sanitizer);
    if let Some(mixer) = downmixer {
        dispatcher = dispatcher.with_downmixer(mixer);
    }

    let stats = RunStats::new();
    let report = dispatcher
        .run(&library.items, &stats)
        .context("processing library")?;
    let summary = stats.summarize();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else if !quiet {
        println!("{}", summary);
    }

    Ok(ExitCode::for_run(&summary, report.interrupted))
}

fn load_library(
    args: &RunArgs,
    shutdown: &Arc<AtomicBool>,
    progress: &Arc<dyn ProgressCallback>,
) -> Result<Library> {
    let source: Box<dyn LibrarySource> = match (&args.manifest, &args.dir) {
        (Some(manifest), _) => Box::new(ManifestSource {
            path: manifest.clone(),
        }),
        (None, Some(dir)) => {
            Box::new(DirectorySource::new(dir).with_shutdown_flag(Arc::clone(shutdown)))
        }
        (None, None) => anyhow::bail!("either --manifest or --dir is required"),
    };

    progress.on_phase_start("loading", 0);
    let library = source.load();
    progress.on_phase_end("loading");
    let library = library.with_context(|| format!("reading {}", source.describe()))?;
    log::info!("Library holds {} tracks", library.items.len());
    Ok(library)
}

fn clear_errors(args: &ClearErrorsArgs, config: &Config) -> Result<ExitCode> {
    let path: PathBuf = args
        .errors
        .clone()
        .unwrap_or_else(|| config.errors_path(args.mode));
    let ledger = ErrorLedger::load(&path)
        .with_context(|| format!("loading error ledger {}", path.display()))?;
    let count = ledger.len();
    ledger.clear().context("clearing error ledger")?;
    println!("Cleared {} recorded failures from {}", count, path.display());
    Ok(ExitCode::Success)
}

fn stats(args: &StatsArgs, config: &Config) -> Result<ExitCode> {
    let path = args
        .cache
        .clone()
        .unwrap_or_else(|| config.cache_path(args.mode));
    let store = CacheStore::new();
    store
        .load(&path, args.mode, CorruptPolicy::Abort)
        .with_context(|| format!("loading cache {}", path.display()))?;

    let (_, entries) = store.snapshot();
    let hashed = entries.iter().filter(|(_, e)| e.content_hash.is_some()).count();
    let stale = entries.iter().filter(|(_, e)| e.needs_refresh).count();
    println!("{} ({} mode)", path.display(), args.mode);
    println!("  entries:           {}", entries.len());
    println!("  with content hash: {}", hashed);
    println!("  needing refresh:   {}", stale);
    Ok(ExitCode::Success)
}
