//! Supervised execution of external tools.
//!
//! # Overview
//!
//! Analysis tools hang. Some wait forever on a corrupt frame, some spin in a
//! decoder, and a few leave grandchildren behind that keep the output pipes
//! open. The invoker protects the worker from all of these:
//!
//! - stdout and stderr are drained by dedicated threads into shared buffers,
//!   so a full pipe never blocks the child and a stuck pipe never blocks us
//! - a 50 ms tick observes exit and cancellation
//! - every `poll_interval` the child's cumulative CPU time is sampled; after
//!   `idle_polls` samples without progress the child is declared stalled
//! - on Unix the child runs in its own process group and the whole group is
//!   killed, so grandchildren do not survive it
//!
//! Cleanup happens in one place for every exit path, including panics: the
//! child is killed if still running, readers get a bounded wait, and the
//! side output file is removed. Running children are also listed in a
//! process-wide registry so a forced exit can kill them with
//! [`kill_running_tools`].

use std::collections::BTreeSet;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use super::cpu::{default_probe, CpuProbe};
use super::parse::{mentions_channel_limit, summarize_stderr, tail_chars};
use super::{ToolFailure, ToolOutput, ToolSpec};
use crate::fsutil::remove_file_with_retry;

/// Interval at which exit and cancellation are checked.
pub const TICK: Duration = Duration::from_millis(50);

/// Number of stderr lines kept as the rejection reason.
pub const REASON_LINES: usize = 3;

/// Length of the stderr tail attached to a stall.
pub const STDERR_TAIL_CHARS: usize = 400;

/// Liveness settings for one invoker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogConfig {
    /// Interval between CPU samples
    pub poll_interval: Duration,
    /// Consecutive samples without CPU progress before a stall
    pub idle_polls: u32,
    /// Whether the CPU watchdog runs at all
    pub cpu_watchdog: bool,
    /// How long to wait for readers after the child is gone
    pub drain_timeout: Duration,
    /// Hard wall-clock limit, if any
    pub wall_timeout: Option<Duration>,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            idle_polls: 12,
            cpu_watchdog: true,
            drain_timeout: Duration::from_secs(2),
            wall_timeout: None,
        }
    }
}

impl WatchdogConfig {
    /// Wall-clock limit only, no CPU watchdog.
    #[must_use]
    pub fn wall_clock(limit: Duration) -> Self {
        Self {
            cpu_watchdog: false,
            wall_timeout: Some(limit),
            ..Self::default()
        }
    }
}

/// Output bytes collected by a reader thread.
struct PipeReader {
    buffer: Arc<Mutex<Vec<u8>>>,
    done: Receiver<()>,
}

impl PipeReader {
    fn spawn<R: Read + Send + 'static>(mut pipe: R) -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let (tx, done) = mpsc::channel();
        let sink = Arc::clone(&buffer);
        thread::spawn(move || {
            let mut chunk = [0u8; 8192];
            loop {
                match pipe.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => sink
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .extend_from_slice(&chunk[..n]),
                }
            }
            let _ = tx.send(());
        });
        Self { buffer, done }
    }

    /// Wait until `deadline` for EOF, then take whatever arrived.
    fn finish(self, deadline: Instant) -> String {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if self.done.recv_timeout(remaining).is_err() {
            log::debug!("Output pipe still open after drain timeout");
        }
        let bytes = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Process groups of tools that are still running.
#[derive(Debug, Default)]
pub struct RunningTools(Mutex<BTreeSet<u32>>);

impl RunningTools {
    /// An empty registry.
    #[must_use]
    pub const fn new() -> Self {
        Self(Mutex::new(BTreeSet::new()))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<u32>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track the process group led by `pid`.
    pub fn insert(&self, pid: u32) {
        self.lock().insert(pid);
    }

    /// Stop tracking `pid`.
    pub fn remove(&self, pid: u32) {
        self.lock().remove(&pid);
    }

    /// Whether `pid` is tracked.
    #[must_use]
    pub fn contains(&self, pid: u32) -> bool {
        self.lock().contains(&pid)
    }

    /// Kill every tracked group and forget it. Returns how many there were.
    pub fn kill_all(&self) -> usize {
        let groups = std::mem::take(&mut *self.lock());
        for pgid in &groups {
            kill_process_group(*pgid);
        }
        groups.len()
    }
}

static RUNNING: RunningTools = RunningTools::new();

/// Kill every tool this process is currently running.
///
/// Tools run in their own process group and do not see the terminal's
/// interrupt, so this is called before exiting without cleanup.
pub fn kill_running_tools() -> usize {
    RUNNING.kill_all()
}

/// Kills the child when dropped unless it was reaped.
struct ChildGuard {
    child: Child,
    reaped: bool,
}

impl ChildGuard {
    fn new(child: Child) -> Self {
        RUNNING.insert(child.id());
        Self {
            child,
            reaped: false,
        }
    }

    fn mark_reaped(&mut self) {
        self.reaped = true;
        RUNNING.remove(self.child.id());
    }

    fn kill(&mut self) {
        if self.reaped {
            return;
        }
        kill_process_group(self.child.id());
        let _ = self.child.kill();
        let _ = self.child.wait();
        self.mark_reaped();
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    let status = Command::new("kill")
        .args(["-s", "KILL", "--", &format!("-{}", pgid)])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(e) = status {
        log::debug!("Could not signal process group {}: {}", pgid, e);
    }
}

#[cfg(not(unix))]
fn kill_process_group(pid: u32) {
    let pid = sysinfo::Pid::from_u32(pid);
    let mut system = sysinfo::System::new();
    if system.refresh_process(pid) {
        if let Some(process) = system.process(pid) {
            process.kill();
        }
    }
}

/// Removes the side output file when dropped.
struct SideFile(PathBuf);

impl Drop for SideFile {
    fn drop(&mut self) {
        if let Err(e) = remove_file_with_retry(&self.0) {
            log::warn!("Could not remove {}: {}", self.0.display(), e);
        }
    }
}

enum Supervised {
    Exited(ExitStatus),
    Stalled,
    TimedOut(Duration),
    Cancelled,
}

/// What happened during one supervised run.
struct RawRun {
    outcome: Supervised,
    stdout: String,
    stderr: String,
    elapsed: Duration,
    cpu: Duration,
}

/// Runs tools under the watchdog.
pub struct ToolInvoker {
    watchdog: WatchdogConfig,
    scratch_dir: PathBuf,
    probe_factory: fn() -> Box<dyn CpuProbe>,
    seq: AtomicU64,
}

impl std::fmt::Debug for ToolInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolInvoker")
            .field("watchdog", &self.watchdog)
            .field("scratch_dir", &self.scratch_dir)
            .finish_non_exhaustive()
    }
}

impl ToolInvoker {
    /// Create an invoker writing side files under the system temp directory.
    #[must_use]
    pub fn new(watchdog: WatchdogConfig) -> Self {
        Self {
            watchdog,
            scratch_dir: std::env::temp_dir().join("tunecache-work"),
            probe_factory: default_probe,
            seq: AtomicU64::new(0),
        }
    }

    /// Put side files in `dir` instead.
    #[must_use]
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    /// Use a different CPU probe.
    #[must_use]
    pub fn with_probe(mut self, factory: fn() -> Box<dyn CpuProbe>) -> Self {
        self.probe_factory = factory;
        self
    }

    /// Liveness settings.
    #[must_use]
    pub fn watchdog(&self) -> &WatchdogConfig {
        &self.watchdog
    }

    /// A fresh scratch path with extension `ext`, unique within the process.
    pub fn scratch_path(&self, prefix: &str, ext: &str) -> std::io::Result<PathBuf> {
        fs::create_dir_all(&self.scratch_dir)?;
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .scratch_dir
            .join(format!("{}-{}-{}.{}", prefix, std::process::id(), seq, ext)))
    }

    /// Run `spec` against `input` and return its payload.
    ///
    /// The payload is stdout, or the `{output}` side file when the argument
    /// template has one. The side file is deleted on every path.
    ///
    /// # Errors
    ///
    /// Any [`ToolFailure`] except `ParseFailure` and `DurationExceeded`,
    /// which belong to the caller.
    pub fn invoke(
        &self,
        spec: &ToolSpec,
        input: &Path,
        cancel: &AtomicBool,
    ) -> Result<ToolOutput, ToolFailure> {
        let side = if spec.writes_side_file() {
            let path = self
                .scratch_path("tc-out", &spec.output_extension)
                .map_err(|e| spawn_failure(spec, &e))?;
            Some(SideFile(path))
        } else {
            None
        };

        let raw = self.run(spec, input, side.as_ref().map(|s| s.0.as_path()), cancel)?;
        let mut output = interpret(raw)?;

        if let Some(side) = &side {
            output.payload = match fs::read(&side.0) {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(_) => String::new(),
            };
        }
        if output.payload.trim().is_empty() {
            return Err(ToolFailure::EmptyOutput);
        }
        Ok(output)
    }

    /// Run `spec` with `{output}` bound to a caller-owned `output` path.
    ///
    /// The caller decides what an acceptable output is, so an empty stdout
    /// is not a failure here.
    ///
    /// # Errors
    ///
    /// Same as [`ToolInvoker::invoke`] minus `EmptyOutput`.
    pub fn invoke_into(
        &self,
        spec: &ToolSpec,
        input: &Path,
        output: &Path,
        cancel: &AtomicBool,
    ) -> Result<ToolOutput, ToolFailure> {
        let raw = self.run(spec, input, Some(output), cancel)?;
        interpret(raw)
    }

    fn run(
        &self,
        spec: &ToolSpec,
        input: &Path,
        output: Option<&Path>,
        cancel: &AtomicBool,
    ) -> Result<RawRun, ToolFailure> {
        if !input.exists() {
            return Err(ToolFailure::NotFound(input.to_path_buf()));
        }
        if cancel.load(Ordering::SeqCst) {
            return Err(ToolFailure::Cancelled);
        }

        let mut command = Command::new(&spec.program);
        command
            .args(spec.render_args(input, output))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        log::trace!("Spawning {} for {}", spec.name, input.display());
        let started = Instant::now();
        let mut child = command.spawn().map_err(|e| spawn_failure(spec, &e))?;
        let stdout = child.stdout.take().map(PipeReader::spawn);
        let stderr = child.stderr.take().map(PipeReader::spawn);
        let mut guard = ChildGuard::new(child);

        let (outcome, cpu) = self.supervise(&mut guard, spec, cancel, started)?;
        guard.kill();
        let elapsed = started.elapsed();

        let deadline = Instant::now() + self.watchdog.drain_timeout;
        let stdout = stdout.map(|r| r.finish(deadline)).unwrap_or_default();
        let stderr = stderr.map(|r| r.finish(deadline)).unwrap_or_default();

        Ok(RawRun {
            outcome,
            stdout,
            stderr,
            elapsed,
            cpu,
        })
    }

    /// Poll loop: returns once the child exited or must be killed.
    fn supervise(
        &self,
        guard: &mut ChildGuard,
        spec: &ToolSpec,
        cancel: &AtomicBool,
        started: Instant,
    ) -> Result<(Supervised, Duration), ToolFailure> {
        let pid = guard.child.id();
        let mut probe = (self.probe_factory)();
        let mut next_sample = started + self.watchdog.poll_interval;
        let mut last_cpu: Option<Duration> = None;
        let mut idle = 0u32;

        loop {
            match guard.child.try_wait() {
                Ok(Some(status)) => {
                    guard.mark_reaped();
                    return Ok((Supervised::Exited(status), last_cpu.unwrap_or_default()));
                }
                Ok(None) => {}
                Err(e) => return Err(spawn_failure(spec, &e)),
            }

            if cancel.load(Ordering::SeqCst) {
                log::debug!("Cancelling {} (pid {})", spec.name, pid);
                return Ok((Supervised::Cancelled, last_cpu.unwrap_or_default()));
            }

            let now = Instant::now();
            if let Some(limit) = self.watchdog.wall_timeout {
                if now.duration_since(started) >= limit {
                    return Ok((Supervised::TimedOut(limit), last_cpu.unwrap_or_default()));
                }
            }

            if self.watchdog.cpu_watchdog && now >= next_sample {
                next_sample += self.watchdog.poll_interval;
                if let Some(cpu) = probe.cpu_time(pid) {
                    match last_cpu {
                        Some(prev) if cpu <= prev => idle += 1,
                        _ => idle = 0,
                    }
                    last_cpu = Some(cpu);
                    log::trace!("{} pid {}: cpu {:?}, idle polls {}", spec.name, pid, cpu, idle);
                    if idle >= self.watchdog.idle_polls {
                        log::debug!(
                            "{} (pid {}) made no CPU progress in {} polls",
                            spec.name,
                            pid,
                            idle
                        );
                        return Ok((Supervised::Stalled, cpu));
                    }
                }
            }

            thread::sleep(TICK);
        }
    }
}

fn spawn_failure(spec: &ToolSpec, e: &std::io::Error) -> ToolFailure {
    ToolFailure::Spawn {
        program: spec.name.clone(),
        message: e.to_string(),
    }
}

/// Map a supervised run to output or failure.
fn interpret(raw: RawRun) -> Result<ToolOutput, ToolFailure> {
    match raw.outcome {
        Supervised::Cancelled => Err(ToolFailure::Cancelled),
        Supervised::TimedOut(limit) => Err(ToolFailure::TimedOut(limit)),
        Supervised::Stalled => Err(ToolFailure::Stalled {
            elapsed: raw.elapsed,
            cpu: raw.cpu,
            stderr_tail: tail_chars(&raw.stderr, STDERR_TAIL_CHARS),
        }),
        Supervised::Exited(status) if !status.success() => {
            let lines = summarize_stderr(&raw.stderr, REASON_LINES);
            let reason = if lines.is_empty() {
                "no error output".to_string()
            } else {
                lines.join(" | ")
            };
            if mentions_channel_limit(&lines) {
                Err(ToolFailure::ChannelCountUnsupported { reason })
            } else {
                Err(ToolFailure::ToolRejected {
                    code: status.code(),
                    reason,
                })
            }
        }
        Supervised::Exited(_) => Ok(ToolOutput {
            payload: raw.stdout,
            stderr: raw.stderr,
            elapsed: raw.elapsed,
            cpu: raw.cpu,
        }),
    }
}
