//! Progress reporting with indicatif.
//!
//! [`ProgressCallback`] is what the library reports to; [`Progress`] draws
//! it in the terminal. Two phases are known: `loading` (a spinner while the
//! library is read or walked) and `processing` (a bar over the work
//! items). Any other phase name gets a plain bar.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

/// Receives progress from long-running operations.
pub trait ProgressCallback: Send + Sync {
    /// A phase with `total` items begins.
    fn on_phase_start(&self, phase: &str, total: usize);

    /// Item number `current` (1-based) finished; `path` is its file.
    fn on_progress(&self, current: usize, path: &str);

    /// The phase is over.
    fn on_phase_end(&self, phase: &str);

    /// Replace the status message.
    fn on_message(&self, _message: &str) {}
}

/// Terminal progress bars.
pub struct Progress {
    multi: MultiProgress,
    active: Mutex<Option<(String, ProgressBar)>>,
    quiet: bool,
    accessible: bool,
}

impl std::fmt::Debug for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Progress")
            .field("quiet", &self.quiet)
            .field("accessible", &self.accessible)
            .finish_non_exhaustive()
    }
}

impl Progress {
    /// Create a reporter; `quiet` disables all drawing.
    ///
    /// ```
    /// use tunecache::progress::Progress;
    /// let progress = Progress::new(false);
    /// ```
    #[must_use]
    pub fn new(quiet: bool) -> Self {
        Self::with_accessible(quiet, false)
    }

    /// Create a reporter that avoids animation and non-ASCII glyphs.
    #[must_use]
    pub fn with_accessible(quiet: bool, accessible: bool) -> Self {
        Self {
            multi: MultiProgress::new(),
            active: Mutex::new(None),
            quiet,
            accessible,
        }
    }

    fn spinner_style(&self) -> ProgressStyle {
        let template = if self.accessible {
            "{msg} [{elapsed_precise}] {pos} files"
        } else {
            "{spinner:.green} {msg} [{elapsed_precise}] {pos} files"
        };
        ProgressStyle::with_template(template)
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ ")
    }

    fn bar_style(&self) -> ProgressStyle {
        if self.accessible {
            ProgressStyle::with_template(
                "[{elapsed_precise}] [{bar:40}] {pos}/{len} ({percent}%) {msg} (ETA: {eta})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-")
        } else {
            ProgressStyle::with_template(
                "[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg} (ETA: {eta})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█>-")
        }
    }

    fn with_active(&self, f: impl FnOnce(&mut Option<(String, ProgressBar)>)) {
        f(&mut self.active.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

impl ProgressCallback for Progress {
    fn on_phase_start(&self, phase: &str, total: usize) {
        if self.quiet {
            return;
        }
        let bar = if phase == "loading" {
            let bar = self.multi.add(ProgressBar::new_spinner());
            bar.set_style(self.spinner_style());
            bar.set_message("Loading library");
            let tick = if self.accessible { 500 } else { 100 };
            bar.enable_steady_tick(Duration::from_millis(tick));
            bar
        } else {
            let bar = self.multi.add(ProgressBar::new(total as u64));
            bar.set_style(self.bar_style());
            bar.set_message(if phase == "processing" {
                "Processing".to_string()
            } else {
                phase.to_string()
            });
            bar
        };
        self.with_active(|active| {
            if let Some((_, old)) = active.replace((phase.to_string(), bar)) {
                old.finish_and_clear();
            }
        });
    }

    fn on_progress(&self, current: usize, path: &str) {
        if self.quiet {
            return;
        }
        self.with_active(|active| {
            if let Some((_, bar)) = active {
                bar.set_position(current as u64);
                bar.set_message(truncate_path(path, 30));
            }
        });
    }

    fn on_phase_end(&self, phase: &str) {
        if self.quiet {
            return;
        }
        self.with_active(|active| {
            if active.as_ref().is_some_and(|(name, _)| name == phase) {
                if let Some((_, bar)) = active.take() {
                    bar.finish_with_message("done");
                }
            }
        });
    }

    fn on_message(&self, message: &str) {
        if self.quiet {
            return;
        }
        self.with_active(|active| {
            if let Some((_, bar)) = active {
                bar.set_message(message.to_string());
            }
        });
    }
}

/// Shorten a path to at most `max_len` characters, keeping the file name.
fn truncate_path(path: &str, max_len: usize) -> String {
    if path.chars().count() <= max_len {
        return path.to_string();
    }
    let file_name = std::path::Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let len = file_name.chars().count();
    if len + 4 > max_len {
        let tail: String = file_name.chars().skip(len + 3 - max_len).collect();
        return format!("...{}", tail);
    }
    format!(".../{}", file_name)
}
