//! Shared fixtures: fake tools written as shell scripts and a small
//! dispatcher harness around them.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tunecache::cache::{CacheStore, CorruptPolicy, Flusher};
use tunecache::config::ToolPaths;
use tunecache::dispatcher::{DispatchReport, Dispatcher, DispatcherConfig, RunStats, RunSummary};
use tunecache::ledger::ErrorLedger;
use tunecache::library::WorkItem;
use tunecache::mode::Mode;
use tunecache::tool::{ToolInvoker, WatchdogConfig};

/// Write an executable `/bin/sh` script.
#[cfg(unix)]
pub fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// A fake `fpcalc` that logs each call to `calls.log` and prints a
/// fingerprint derived from the input's content.
#[cfg(unix)]
pub fn fake_fpcalc(dir: &Path) -> PathBuf {
    let log = dir.join("calls.log");
    script(
        dir,
        "fpcalc",
        &format!(
            "echo \"$2\" >> '{}'\nprintf '{{\"duration\": 12.5, \"fingerprint\": \"FP-%s\"}}' \"$(cat \"$2\")\"",
            log.display()
        ),
    )
}

/// Number of times the fake tool ran.
pub fn invocations(dir: &Path) -> usize {
    fs::read_to_string(dir.join("calls.log"))
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

/// Create `name` under `dir` with `content`.
pub fn track(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, content).unwrap();
    path
}

/// Work items for `paths`, numbered from 1.
pub fn items(paths: &[PathBuf]) -> Vec<WorkItem> {
    paths
        .iter()
        .enumerate()
        .map(|(i, p)| WorkItem::new(i as u64 + 1, p))
        .collect()
}

/// Watchdog settings that react within a test's patience.
pub fn quick_watchdog() -> WatchdogConfig {
    WatchdogConfig {
        poll_interval: Duration::from_millis(200),
        idle_polls: 50,
        drain_timeout: Duration::from_millis(500),
        ..WatchdogConfig::default()
    }
}

/// A workspace holding the fake tool, the cache file and the ledger.
pub struct Workspace {
    pub dir: TempDir,
    pub tool: PathBuf,
}

impl Workspace {
    #[cfg(unix)]
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let tool = fake_fpcalc(dir.path());
        Self { dir, tool }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn cache_path(&self) -> PathBuf {
        self.path().join("state/fingerprints.json")
    }

    pub fn errors_path(&self) -> PathBuf {
        self.path().join("state/fingerprints-errors.csv")
    }

    pub fn invocations(&self) -> usize {
        invocations(self.path())
    }

    /// Build a dispatcher the way a fresh process would: load the cache and
    /// the ledger from disk.
    pub fn dispatcher(&self, config: DispatcherConfig) -> Dispatcher {
        let store = Arc::new(CacheStore::new());
        store
            .load(&self.cache_path(), Mode::Fingerprint, CorruptPolicy::StartEmpty)
            .unwrap();
        let ledger = Arc::new(ErrorLedger::load(&self.errors_path()).unwrap());
        let flusher = Flusher::new(self.cache_path(), &store);
        let tools = ToolPaths {
            fpcalc: self.tool.clone(),
            ..ToolPaths::default()
        };
        Dispatcher::new(
            Mode::Fingerprint,
            Mode::Fingerprint.tool_spec(&tools),
            store,
            ledger,
            flusher,
            config,
        )
        .with_invoker(ToolInvoker::new(quick_watchdog()).with_scratch_dir(self.path().join("work")))
    }

    /// One complete run with `threads` workers.
    pub fn run(&self, items: &[WorkItem], threads: usize) -> (DispatchReport, RunSummary) {
        let dispatcher = self.dispatcher(DispatcherConfig::default().with_threads(threads));
        let stats = RunStats::new();
        let report = dispatcher.run(items, &stats).unwrap();
        (report, stats.summarize())
    }
}
