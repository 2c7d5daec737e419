//! The processing engine.
//!
//! # Overview
//!
//! The dispatcher drives a fixed pool of workers over the run's items. Each
//! item passes through a strict sequence of phases (see [`worker`]):
//!
//! 1. **Error ledger**: items that failed before are skipped
//! 2. **Cache**: a fresh entry for the path is reused
//! 3. **Cross-machine**: an entry with the same content hash is claimed
//! 4. **Invoke**: the tool runs, with one downmix retry if it rejects the
//!    channel layout
//!
//! Results are published to the shared [`CacheStore`] as they arrive. Every
//! `flush_every` successful computations a snapshot is written, and a final
//! snapshot is always written when the pool drains or is cancelled.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tunecache::cache::{CacheStore, Flusher};
//! use tunecache::config::ToolPaths;
//! use tunecache::dispatcher::{Dispatcher, DispatcherConfig, RunStats};
//! use tunecache::ledger::ErrorLedger;
//! use tunecache::library::WorkItem;
//! use tunecache::mode::Mode;
//! use std::path::Path;
//!
//! let store = Arc::new(CacheStore::new());
//! let ledger = Arc::new(ErrorLedger::load(Path::new("fingerprints-errors.csv")).unwrap());
//! let flusher = Flusher::new("fingerprints.json", &store);
//! let spec = Mode::Fingerprint.tool_spec(&ToolPaths::default());
//! let dispatcher = Dispatcher::new(Mode::Fingerprint, spec, store, ledger, flusher,
//!     DispatcherConfig::default().with_threads(4));
//!
//! let items = vec![WorkItem::new(1, "/music/a.flac")];
//! let stats = RunStats::new();
//! let report = dispatcher.run(&items, &stats).unwrap();
//! println!("{}", stats.summarize());
//! # let _ = report;
//! ```

pub mod stats;
mod worker;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rayon::prelude::*;
use thiserror::Error;

use crate::cache::{CacheError, CacheStore, ContentHashIndex, FlushOutcome, Flusher, PathKey};
use crate::ledger::ErrorLedger;
use crate::library::WorkItem;
use crate::mode::Mode;
use crate::progress::ProgressCallback;
use crate::tool::{Downmixer, PathSanitizer, ToolFailure, ToolInvoker, ToolSpec, WatchdogConfig};

pub use stats::{RunStats, RunSummary};

/// Default number of successful computations between periodic flushes.
pub const DEFAULT_FLUSH_EVERY: usize = 25;

/// How one item left the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Listed in the error ledger; not attempted
    ErrorSkip,
    /// Fresh entry found under the item's own key
    CacheHit,
    /// Entry claimed from another path with the same content
    CrossMachineHit,
    /// Computed by the tool and published
    Success,
    /// Failed and written to the error ledger
    ErrorRecorded(ToolFailure),
    /// Interrupted while in progress
    Cancelled,
    /// Never begun because the run was cancelled
    NotStarted,
}

/// Fatal dispatcher errors. Per-item failures never end up here.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// The worker pool could not be created
    #[error("failed to start worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    /// The final snapshot could not be written
    #[error("final cache flush failed: {0}")]
    Flush(#[from] CacheError),
}

/// Dispatcher settings.
#[derive(Clone)]
pub struct DispatcherConfig {
    /// Worker count
    pub threads: usize,
    /// Successful computations between periodic flushes
    pub flush_every: usize,
    /// Hash file contents even when the mode does not require it
    pub content_hash: bool,
    /// Longest known duration worth attempting
    pub max_duration: Option<Duration>,
    /// Cancellation flag, usually owned by the signal handler
    pub shutdown_flag: Option<Arc<AtomicBool>>,
    /// Progress reporting
    pub progress_callback: Option<Arc<dyn ProgressCallback>>,
}

impl std::fmt::Debug for DispatcherConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherConfig")
            .field("threads", &self.threads)
            .field("flush_every", &self.flush_every)
            .field("content_hash", &self.content_hash)
            .field("max_duration", &self.max_duration)
            .field("shutdown_flag", &self.shutdown_flag)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<callback>"),
            )
            .finish()
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            threads: std::thread::available_parallelism().map_or(4, |n| n.get()),
            flush_every: DEFAULT_FLUSH_EVERY,
            content_hash: true,
            max_duration: None,
            shutdown_flag: None,
            progress_callback: None,
        }
    }
}

impl DispatcherConfig {
    /// Set the worker count (at least 1).
    #[must_use]
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    /// Set the periodic flush interval (at least 1).
    #[must_use]
    pub fn with_flush_every(mut self, n: usize) -> Self {
        self.flush_every = n.max(1);
        self
    }

    /// Enable or disable content hashing.
    #[must_use]
    pub fn with_content_hash(mut self, enabled: bool) -> Self {
        self.content_hash = enabled;
        self
    }

    /// Set the duration limit.
    #[must_use]
    pub fn with_max_duration(mut self, limit: Option<Duration>) -> Self {
        self.max_duration = limit;
        self
    }

    /// Set the shutdown flag for graceful termination.
    #[must_use]
    pub fn with_shutdown_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown_flag = Some(flag);
        self
    }

    /// Set the progress callback.
    #[must_use]
    pub fn with_progress_callback(mut self, callback: Arc<dyn ProgressCallback>) -> Self {
        self.progress_callback = Some(callback);
        self
    }
}

/// Per-item outcomes plus what happened at the end of the run.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    /// `(item id, outcome)` in item order
    pub outcomes: Vec<(u64, Outcome)>,
    /// Result of the final flush
    pub final_flush: FlushOutcome,
    /// Whether cancellation was requested
    pub interrupted: bool,
}

/// Runs one mode's tool over a list of items.
pub struct Dispatcher {
    mode: Mode,
    spec: ToolSpec,
    invoker: ToolInvoker,
    sanitizer: PathSanitizer,
    downmixer: Option<Downmixer>,
    store: Arc<CacheStore>,
    ledger: Arc<ErrorLedger>,
    flusher: Flusher,
    config: DispatcherConfig,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("mode", &self.mode)
            .field("spec", &self.spec)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Create a dispatcher with the default watchdog and no downmix
    /// fallback.
    #[must_use]
    pub fn new(
        mode: Mode,
        spec: ToolSpec,
        store: Arc<CacheStore>,
        ledger: Arc<ErrorLedger>,
        flusher: Flusher,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            mode,
            spec,
            invoker: ToolInvoker::new(WatchdogConfig::default()),
            sanitizer: PathSanitizer::default(),
            downmixer: None,
            store,
            ledger,
            flusher,
            config,
        }
    }

    /// Use a specific invoker.
    #[must_use]
    pub fn with_invoker(mut self, invoker: ToolInvoker) -> Self {
        self.invoker = invoker;
        self
    }

    /// Use a specific path sanitizer.
    #[must_use]
    pub fn with_sanitizer(mut self, sanitizer: PathSanitizer) -> Self {
        self.sanitizer = sanitizer;
        self
    }

    /// Enable the downmix fallback. Ignored for modes whose tool does not
    /// decode audio.
    #[must_use]
    pub fn with_downmixer(mut self, downmixer: Downmixer) -> Self {
        if self.mode.supports_downmix() {
            self.downmixer = Some(downmixer);
        }
        self
    }

    /// The shared cache.
    #[must_use]
    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// The error ledger.
    #[must_use]
    pub fn ledger(&self) -> &Arc<ErrorLedger> {
        &self.ledger
    }

    /// Process `items` and write the final snapshot.
    ///
    /// Per-item failures are recorded and counted in `stats`; they never
    /// make this return an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot be built or the final flush
    /// fails.
    pub fn run(&self, items: &[WorkItem], stats: &RunStats) -> Result<DispatchReport, DispatchError> {
        let local_flag = Arc::new(AtomicBool::new(false));
        let cancel = self.config.shutdown_flag.as_ref().unwrap_or(&local_flag);

        let index = ContentHashIndex::build(&self.store)
            .with_live_keys(items.iter().map(|item| PathKey::new(&item.path)));
        let successes = AtomicUsize::new(0);
        let done = AtomicUsize::new(0);

        if let Some(ref callback) = self.config.progress_callback {
            callback.on_phase_start("processing", items.len());
        }
        log::info!(
            "Processing {} items in {} mode with {} workers",
            items.len(),
            self.mode,
            self.config.threads
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.threads)
            .thread_name(|i| format!("tunecache-worker-{}", i))
            .build()?;

        let context = worker::ItemContext {
            dispatcher: self,
            index: &index,
            cancel,
        };

        let outcomes: Vec<(u64, Outcome)> = pool.install(|| {
            items
                .par_iter()
                .with_max_len(1)
                .map(|item| {
                    let outcome = context.process(item, stats);
                    stats.record(&outcome);

                    if outcome == Outcome::Success {
                        let n = successes.fetch_add(1, Ordering::SeqCst) + 1;
                        if n % self.config.flush_every == 0 {
                            self.periodic_flush(stats);
                        }
                    }

                    let current = done.fetch_add(1, Ordering::Relaxed) + 1;
                    if let Some(ref callback) = self.config.progress_callback {
                        callback.on_progress(current, &item.path.to_string_lossy());
                    }
                    (item.id, outcome)
                })
                .collect()
        });

        if let Some(ref callback) = self.config.progress_callback {
            callback.on_phase_end("processing");
        }

        let interrupted = cancel.load(Ordering::SeqCst);
        if interrupted {
            log::warn!("Run interrupted; saving completed work");
        }

        let final_flush = self.flusher.flush(&self.store)?;
        if let FlushOutcome::Written(n) = final_flush {
            stats.add_flush();
            log::info!("Saved {} cache entries to {}", n, self.flusher.path().display());
        }

        Ok(DispatchReport {
            outcomes,
            final_flush,
            interrupted,
        })
    }

    fn periodic_flush(&self, stats: &RunStats) {
        match self.flusher.try_flush(&self.store) {
            Ok(FlushOutcome::Written(n)) => {
                stats.add_flush();
                log::debug!("Periodic flush wrote {} entries", n);
            }
            Ok(FlushOutcome::Busy) => log::debug!("Periodic flush skipped: another flush running"),
            Ok(FlushOutcome::Unchanged) => {}
            Err(e) => log::warn!("Periodic flush failed (will retry at the next one): {}", e),
        }
    }
}
