//! External tool invocation.
//!
//! Everything that touches a child process lives here:
//!
//! * [`invoker`]: spawns a tool, drains its output and watches its CPU time
//!   so a hung tool is killed instead of blocking a worker forever.
//! * [`cpu`]: the per-platform [`cpu::CpuProbe`] behind the watchdog.
//! * [`sanitize`]: hands tools an ASCII-only path for files whose names
//!   they cannot open.
//! * [`downmix`]: converts multichannel audio to stereo for tools that
//!   reject it.
//! * [`parse`]: typed builders for tool output.

pub mod cpu;
pub mod downmix;
pub mod invoker;
pub mod parse;
pub mod sanitize;

use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

pub use downmix::{DownmixedFile, Downmixer};
pub use invoker::{kill_running_tools, ToolInvoker, WatchdogConfig};
pub use sanitize::PathSanitizer;

/// Placeholder replaced by the input path.
pub const INPUT_PLACEHOLDER: &str = "{input}";

/// Placeholder replaced by a temporary output path.
pub const OUTPUT_PLACEHOLDER: &str = "{output}";

/// How to run one external tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSpec {
    /// Short name used in logs and error messages
    pub name: String,
    /// Executable, either a bare name looked up in `PATH` or a path
    pub program: PathBuf,
    /// Argument template
    pub args: Vec<String>,
    /// Extension for the temporary `{output}` file
    pub output_extension: String,
}

impl ToolSpec {
    /// Create a spec from an argument template.
    #[must_use]
    pub fn new<I, S>(name: &str, program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.to_string(),
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            output_extension: "out".to_string(),
        }
    }

    /// Set the extension of the temporary output file.
    #[must_use]
    pub fn with_output_extension(mut self, ext: &str) -> Self {
        self.output_extension = ext.to_string();
        self
    }

    /// Whether the tool writes its result to a side file.
    #[must_use]
    pub fn writes_side_file(&self) -> bool {
        self.args.iter().any(|a| a.contains(OUTPUT_PLACEHOLDER))
    }

    /// Substitute the placeholders.
    #[must_use]
    pub fn render_args(&self, input: &Path, output: Option<&Path>) -> Vec<OsString> {
        self.args
            .iter()
            .map(|arg| match arg.as_str() {
                INPUT_PLACEHOLDER => input.as_os_str().to_os_string(),
                OUTPUT_PLACEHOLDER => output
                    .map(|o| o.as_os_str().to_os_string())
                    .unwrap_or_default(),
                _ => {
                    let mut rendered = arg.replace(INPUT_PLACEHOLDER, &input.to_string_lossy());
                    if let Some(o) = output {
                        rendered = rendered.replace(OUTPUT_PLACEHOLDER, &o.to_string_lossy());
                    }
                    OsString::from(rendered)
                }
            })
            .collect()
    }
}

/// Successful tool run.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    /// The payload: stdout, or the side file's contents
    pub payload: String,
    /// Everything written to stderr
    pub stderr: String,
    /// Wall time of the run
    pub elapsed: Duration,
    /// Last CPU time observed by the watchdog
    pub cpu: Duration,
}

/// Why processing one item failed. All of these are recoverable: the item is
/// recorded in the error ledger and the run continues.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolFailure {
    /// The input file does not exist
    #[error("file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The tool exited with a non-zero status
    #[error("rejected (exit {}): {reason}", .code.map_or_else(|| "signal".to_string(), |c| c.to_string()))]
    ToolRejected {
        /// Exit code, `None` when killed by a signal
        code: Option<i32>,
        /// Last meaningful stderr lines
        reason: String,
    },

    /// The tool cannot handle this many channels
    #[error("unsupported channel count: {reason}")]
    ChannelCountUnsupported {
        /// Last meaningful stderr lines
        reason: String,
    },

    /// Clean exit but nothing was produced
    #[error("tool produced no output")]
    EmptyOutput,

    /// Output did not decode into the expected result
    #[error("unparseable output: {0}")]
    ParseFailure(String),

    /// The CPU watchdog saw no progress and killed the tool
    #[error("stalled after {:.1}s ({:.1}s CPU): {stderr_tail}", .elapsed.as_secs_f64(), .cpu.as_secs_f64())]
    Stalled {
        /// Wall time until the kill
        elapsed: Duration,
        /// Last CPU time observed
        cpu: Duration,
        /// End of stderr
        stderr_tail: String,
    },

    /// The wall-clock limit was reached
    #[error("timed out after {:.0}s", .0.as_secs_f64())]
    TimedOut(Duration),

    /// The run was cancelled by the user
    #[error("cancelled")]
    Cancelled,

    /// The file is longer than the tool can handle; checked before spawning
    #[error("duration {:.0}s exceeds the {:.0}s limit", .actual.as_secs_f64(), .limit.as_secs_f64())]
    DurationExceeded {
        /// Known duration of the file
        actual: Duration,
        /// Configured limit
        limit: Duration,
    },

    /// The tool could not be started or supervised
    #[error("failed to run {program}: {message}")]
    Spawn {
        /// Tool name
        program: String,
        /// OS error text
        message: String,
    },
}

impl ToolFailure {
    /// Stable short code for logs and the ledger.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::ToolRejected { .. } => "rejected",
            Self::ChannelCountUnsupported { .. } => "channels",
            Self::EmptyOutput => "empty_output",
            Self::ParseFailure(_) => "parse",
            Self::Stalled { .. } => "stalled",
            Self::TimedOut(_) => "timed_out",
            Self::Cancelled => "cancelled",
            Self::DurationExceeded { .. } => "too_long",
            Self::Spawn { .. } => "spawn",
        }
    }

    /// Whether the failure came from the stall or wall-clock watchdog.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Stalled { .. } | Self::TimedOut(_))
    }
}

/// Fatal startup problems with the configured tools.
#[derive(Error, Debug)]
pub enum ToolError {
    /// The executable is neither a file nor found in `PATH`
    #[error("{name} executable not found: {} (set tools.{name} in the config)", .program.display())]
    MissingBinary {
        /// Tool name
        name: String,
        /// Configured program
        program: PathBuf,
    },
}

/// Locate `program` in `PATH`, trying `PATHEXT` suffixes on Windows.
#[must_use]
pub fn find_in_path(program: &Path) -> Option<PathBuf> {
    let path_var = env::var_os("PATH")?;
    let extensions: Vec<String> = if cfg!(windows) {
        env::var("PATHEXT")
            .unwrap_or_else(|_| ".EXE;.CMD;.BAT;.COM".to_string())
            .split(';')
            .map(|e| e.to_string())
            .chain(std::iter::once(String::new()))
            .collect()
    } else {
        vec![String::new()]
    };

    env::split_paths(&path_var).find_map(|dir| {
        extensions.iter().find_map(|ext| {
            let mut name = program.as_os_str().to_os_string();
            name.push(ext);
            let candidate = dir.join(name);
            candidate.is_file().then_some(candidate)
        })
    })
}

/// Resolve the executable of `spec`.
///
/// # Errors
///
/// Returns [`ToolError::MissingBinary`] when it cannot be found.
pub fn resolve_program(spec: &ToolSpec) -> Result<PathBuf, ToolError> {
    let program = &spec.program;
    let found = if program.components().count() > 1 || program.is_absolute() {
        program.is_file().then(|| program.clone())
    } else {
        find_in_path(program)
    };
    found.ok_or_else(|| ToolError::MissingBinary {
        name: spec.name.clone(),
        program: program.clone(),
    })
}

/// Check every tool a run needs before any work starts.
///
/// # Errors
///
/// Returns the first missing tool.
pub fn verify_tools<'a>(specs: impl IntoIterator<Item = &'a ToolSpec>) -> Result<(), ToolError> {
    for spec in specs {
        let resolved = resolve_program(spec)?;
        log::debug!("Using {} at {}", spec.name, resolved.display());
    }
    Ok(())
}
