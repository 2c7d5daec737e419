//! Exit codes and structured error output.

use serde::Serialize;

use crate::dispatcher::RunSummary;

/// Process exit codes.
///
/// - 0: every item was cached, reused or computed (earlier failures that
///   were skipped do not count)
/// - 1: fatal error before or after processing
/// - 3: the run completed but at least one item failed
/// - 130: interrupted by the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExitCode {
    /// Completed without new failures
    Success = 0,
    /// Fatal error
    GeneralError = 1,
    /// Completed with failed items
    PartialFailure = 3,
    /// Interrupted (Ctrl+C)
    Interrupted = 130,
}

impl ExitCode {
    /// Numeric exit code.
    #[must_use]
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Machine-readable code prefix.
    #[must_use]
    pub fn code_prefix(self) -> &'static str {
        match self {
            Self::Success => "TC000",
            Self::GeneralError => "TC001",
            Self::PartialFailure => "TC003",
            Self::Interrupted => "TC130",
        }
    }

    /// Exit code for a finished run. Interruption wins over failures.
    #[must_use]
    pub fn for_run(summary: &RunSummary, interrupted: bool) -> Self {
        if interrupted || summary.interrupted() {
            Self::Interrupted
        } else if summary.has_failures() {
            Self::PartialFailure
        } else {
            Self::Success
        }
    }
}

/// Fatal error as printed by `--json-errors`.
#[derive(Debug, Serialize)]
pub struct StructuredError {
    /// Code such as "TC001"
    pub code: String,
    /// Numeric exit code
    pub exit_code: i32,
    /// Message including its cause chain
    pub message: String,
    /// Whether the run was interrupted
    pub interrupted: bool,
}

impl StructuredError {
    /// Describe `err` exiting with `exit_code`.
    #[must_use]
    pub fn new(err: &anyhow::Error, exit_code: ExitCode) -> Self {
        Self {
            code: exit_code.code_prefix().to_string(),
            exit_code: exit_code.as_i32(),
            message: format!("{:#}", err),
            interrupted: exit_code == ExitCode::Interrupted,
        }
    }
}
