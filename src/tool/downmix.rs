//! Stereo downmix for tools that reject multichannel input.
//!
//! The converter runs under a plain wall-clock limit. Its output is a
//! temporary WAV owned by the returned [`DownmixedFile`], which deletes it on
//! drop; a failed conversion removes whatever partial file was written.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use super::invoker::{ToolInvoker, WatchdogConfig};
use super::{ToolFailure, ToolSpec};
use crate::fsutil::remove_file_with_retry;

/// Default wall-clock limit for one conversion.
pub const DEFAULT_DOWNMIX_TIMEOUT: Duration = Duration::from_secs(300);

/// A converted temporary file, deleted when dropped.
#[derive(Debug)]
pub struct DownmixedFile {
    path: PathBuf,
}

impl DownmixedFile {
    /// Location of the converted audio.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DownmixedFile {
    fn drop(&mut self) {
        if let Err(e) = remove_file_with_retry(&self.path) {
            log::warn!("Could not remove {}: {}", self.path.display(), e);
        }
    }
}

/// Runs the converter.
#[derive(Debug)]
pub struct Downmixer {
    spec: ToolSpec,
    invoker: ToolInvoker,
}

impl Downmixer {
    /// Build a downmixer around `ffmpeg` producing `channels` channels.
    #[must_use]
    pub fn new(ffmpeg: impl Into<PathBuf>, channels: u32, timeout: Duration) -> Self {
        let channels = channels.to_string();
        let spec = ToolSpec::new(
            "ffmpeg",
            ffmpeg,
            [
                "-nostdin", "-y", "-v", "error", "-i", "{input}", "-ac", channels.as_str(), "{output}",
            ],
        )
        .with_output_extension("wav");
        Self {
            spec,
            invoker: ToolInvoker::new(WatchdogConfig::wall_clock(timeout)),
        }
    }

    /// Write temporary files under `dir`.
    #[must_use]
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.invoker = self.invoker.with_scratch_dir(dir);
        self
    }

    /// The converter invocation.
    #[must_use]
    pub fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    /// Convert `input` to a temporary file.
    ///
    /// # Errors
    ///
    /// The converter's [`ToolFailure`], or `EmptyOutput` when it exited
    /// cleanly without writing anything.
    pub fn downmix(&self, input: &Path, cancel: &AtomicBool) -> Result<DownmixedFile, ToolFailure> {
        let path = self
            .invoker
            .scratch_path("tc-mix", &self.spec.output_extension)
            .map_err(|e| ToolFailure::Spawn {
                program: self.spec.name.clone(),
                message: e.to_string(),
            })?;
        // Owning the path from here on removes partial output on failure
        let file = DownmixedFile { path };

        self.invoker
            .invoke_into(&self.spec, input, file.path(), cancel)?;

        let written = fs::metadata(file.path()).map(|m| m.len()).unwrap_or(0);
        if written == 0 {
            return Err(ToolFailure::EmptyOutput);
        }
        log::debug!(
            "Downmixed {} to {} ({} bytes)",
            input.display(),
            file.path().display(),
            written
        );
        Ok(file)
    }
}
