//! Run statistics and the end-of-run summary.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytesize::ByteSize;
use serde::Serialize;

use super::Outcome;

/// Counters for one dispatcher run. Shared by reference between workers.
#[derive(Debug)]
pub struct RunStats {
    started: Instant,
    cached: AtomicUsize,
    cross_machine: AtomicUsize,
    recomputed: AtomicUsize,
    skipped: AtomicUsize,
    failed: AtomicUsize,
    timed_out: AtomicUsize,
    cancelled: AtomicUsize,
    not_started: AtomicUsize,
    downmixed: AtomicUsize,
    flushes: AtomicUsize,
}

impl Default for RunStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStats {
    /// Start counting now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            cached: AtomicUsize::new(0),
            cross_machine: AtomicUsize::new(0),
            recomputed: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            timed_out: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
            not_started: AtomicUsize::new(0),
            downmixed: AtomicUsize::new(0),
            flushes: AtomicUsize::new(0),
        }
    }

    /// Count one finished item.
    pub fn record(&self, outcome: &Outcome) {
        let counter = match outcome {
            Outcome::ErrorSkip => &self.skipped,
            Outcome::CacheHit => &self.cached,
            Outcome::CrossMachineHit => &self.cross_machine,
            Outcome::Success => &self.recomputed,
            Outcome::ErrorRecorded(f) if f.is_timeout() => &self.timed_out,
            Outcome::ErrorRecorded(_) => &self.failed,
            Outcome::Cancelled => &self.cancelled,
            Outcome::NotStarted => &self.not_started,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a downmix fallback.
    pub fn add_downmixed(&self) {
        self.downmixed.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a snapshot written to disk.
    pub fn add_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    /// Items computed by running the tool so far.
    #[must_use]
    pub fn recomputed(&self) -> usize {
        self.recomputed.load(Ordering::Relaxed)
    }

    /// Freeze the counters.
    #[must_use]
    pub fn summarize(&self) -> RunSummary {
        let load = |c: &AtomicUsize| c.load(Ordering::Relaxed);
        RunSummary {
            cached: load(&self.cached),
            cross_machine: load(&self.cross_machine),
            recomputed: load(&self.recomputed),
            skipped: load(&self.skipped),
            failed: load(&self.failed),
            timed_out: load(&self.timed_out),
            cancelled: load(&self.cancelled),
            not_started: load(&self.not_started),
            downmixed: load(&self.downmixed),
            flushes: load(&self.flushes),
            elapsed: self.started.elapsed(),
            peak_memory: peak_memory_bytes(),
        }
    }
}

/// Final counts of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Served from the cache
    pub cached: usize,
    /// Served from another path's entry via content hash
    pub cross_machine: usize,
    /// Computed by the tool
    pub recomputed: usize,
    /// Skipped because of an earlier failure
    pub skipped: usize,
    /// Failed this run (not counting stalls)
    pub failed: usize,
    /// Killed by the stall or wall-clock watchdog
    pub timed_out: usize,
    /// Interrupted while running
    pub cancelled: usize,
    /// Never started because of cancellation
    pub not_started: usize,
    /// Needed the downmix fallback
    pub downmixed: usize,
    /// Snapshots written
    pub flushes: usize,
    /// Wall time of the run
    pub elapsed: Duration,
    /// Peak resident memory, where the platform reports it
    pub peak_memory: Option<u64>,
}

impl RunSummary {
    /// Items seen by the run.
    #[must_use]
    pub fn total(&self) -> usize {
        self.cached
            + self.cross_machine
            + self.recomputed
            + self.skipped
            + self.failed
            + self.timed_out
            + self.cancelled
            + self.not_started
    }

    /// Whether any item failed during this run.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.failed > 0 || self.timed_out > 0
    }

    /// Whether the run was cut short.
    #[must_use]
    pub fn interrupted(&self) -> bool {
        self.cancelled > 0 || self.not_started > 0
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Processed {} items in {:.1}s", self.total(), self.elapsed.as_secs_f64())?;
        writeln!(f, "  cached:        {}", self.cached)?;
        writeln!(f, "  cross-machine: {}", self.cross_machine)?;
        writeln!(f, "  recomputed:    {} ({} downmixed)", self.recomputed, self.downmixed)?;
        writeln!(f, "  skipped:       {}", self.skipped)?;
        writeln!(f, "  failed:        {}", self.failed)?;
        writeln!(f, "  timed out:     {}", self.timed_out)?;
        if self.interrupted() {
            writeln!(
                f,
                "  interrupted:   {} cancelled, {} not started",
                self.cancelled, self.not_started
            )?;
        }
        write!(f, "  flushes:       {}", self.flushes)?;
        if let Some(bytes) = self.peak_memory {
            write!(f, "\n  peak memory:   {}", ByteSize::b(bytes))?;
        }
        Ok(())
    }
}

/// Peak resident set size of this process.
#[must_use]
pub fn peak_memory_bytes() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        if let Some(bytes) = std::fs::read_to_string("/proc/self/status")
            .ok()
            .and_then(|status| parse_vm_hwm(&status))
        {
            return Some(bytes);
        }
    }
    let pid = sysinfo::get_current_pid().ok()?;
    let mut system = sysinfo::System::new();
    system.refresh_process(pid);
    system.process(pid).map(|p| p.memory())
}

/// `VmHWM` from `/proc/self/status`, in bytes.
#[must_use]
pub fn parse_vm_hwm(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmHWM:"))?;
    let kib: u64 = line
        .trim_start_matches("VmHWM:")
        .split_whitespace()
        .next()?
        .parse()
        .ok()?;
    Some(kib * 1024)
}
