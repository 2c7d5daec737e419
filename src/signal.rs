//! Ctrl+C handling.
//!
//! The first interrupt sets a shared [`AtomicBool`]: workers stop taking
//! new items, running tools are killed at their next watchdog tick, and the
//! final cache flush still happens. A second interrupt while that is in
//! progress kills any tool still running and exits immediately with code
//! 130. Tools run in their own process group and never see the terminal's
//! interrupt themselves.
//!
//! ```rust,no_run
//! use tunecache::signal::install_handler;
//!
//! let handler = install_handler().unwrap();
//! let flag = handler.get_flag();
//! // hand `flag` to DispatcherConfig::with_shutdown_flag
//! # let _ = flag;
//! ```

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

/// Exit code after an interrupt (128 + SIGINT).
pub const EXIT_CODE_INTERRUPTED: i32 = 130;

/// Shared shutdown state.
#[derive(Debug, Clone)]
pub struct ShutdownHandler {
    flag: Arc<AtomicBool>,
    signals: Arc<AtomicUsize>,
}

impl ShutdownHandler {
    /// A handler with no shutdown requested.
    #[must_use]
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            signals: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Whether shutdown was requested.
    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Request shutdown without a signal.
    pub fn request_shutdown(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// The flag to hand to workers.
    #[must_use]
    pub fn get_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }

    /// Clear the flag and the interrupt count.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
        self.signals.store(0, Ordering::SeqCst);
    }

    /// Register one interrupt. Returns `true` when it is a repeat, i.e. the
    /// process should exit now.
    pub fn on_signal(&self) -> bool {
        self.flag.store(true, Ordering::SeqCst);
        self.signals.fetch_add(1, Ordering::SeqCst) > 0
    }
}

impl Default for ShutdownHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Signal handler installation failure.
#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    /// `ctrlc` refused the handler
    #[error("Failed to install signal handler: {0}")]
    InstallFailed(#[from] ctrlc::Error),
}

static GLOBAL_HANDLER: OnceLock<ShutdownHandler> = OnceLock::new();

/// Install the process-wide Ctrl+C handler, or return the one already
/// installed with its state reset.
///
/// # Errors
///
/// Returns an error if the OS handler cannot be registered and none was
/// registered before.
pub fn install_handler() -> Result<ShutdownHandler, SignalError> {
    if let Some(handler) = GLOBAL_HANDLER.get() {
        handler.reset();
        return Ok(handler.clone());
    }

    let handler = ShutdownHandler::new();
    let hooked = handler.clone();
    let result = ctrlc::set_handler(move || {
        let mut stderr = std::io::stderr();
        if hooked.on_signal() {
            let _ = writeln!(stderr, "\nInterrupted again. Exiting without cleanup.");
            let _ = stderr.flush();
            crate::tool::kill_running_tools();
            std::process::exit(EXIT_CODE_INTERRUPTED);
        }
        let _ = writeln!(
            stderr,
            "\nInterrupted. Finishing up and saving the cache (Ctrl+C again to exit now)..."
        );
        let _ = stderr.flush();
    });

    match result {
        Ok(()) => {
            let _ = GLOBAL_HANDLER.set(handler.clone());
            Ok(handler)
        }
        Err(ctrlc::Error::MultipleHandlers) => {
            // Registered by someone else in this process, e.g. a test
            log::debug!("Ctrl+C handler already registered; using an unhooked handler");
            Ok(GLOBAL_HANDLER.get_or_init(ShutdownHandler::new).clone())
        }
        Err(e) => Err(e.into()),
    }
}
