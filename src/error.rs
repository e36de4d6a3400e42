//! Error types for the supervisor.

use std::path::PathBuf;

use thiserror::Error;

/// Why a single attempt did not succeed. Every variant is retryable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttemptFailure {
    /// The script was still running when the deadline passed and was killed.
    #[error("script timed out after {seconds}s")]
    ScriptTimeout { seconds: u64 },

    /// The interpreter exited unsuccessfully. `code` is `None` when it was
    /// terminated by a signal.
    #[error("script exited with {}", describe_code(.code))]
    NonZeroExit { code: Option<i32> },

    /// The script could not be written out or the interpreter not started.
    #[error("failed to launch script: {message}")]
    LaunchFailed { message: String },

    #[error("output file not found: {}", .path.display())]
    OutputMissing { path: PathBuf },

    #[error("output file is not a JSON object: {message}")]
    OutputNotJson { message: String },

    #[error("output is missing required field '{name}'")]
    MissingRequiredField { name: String },

    #[error("output status is {status}, expected \"success\"")]
    StatusNotSuccess { status: String },
}

fn describe_code(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("exit code {}", c),
        None => "termination by signal".to_string(),
    }
}

impl AttemptFailure {
    /// Stable short name used in structured log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ScriptTimeout { .. } => "script_timeout",
            Self::NonZeroExit { .. } => "non_zero_exit",
            Self::LaunchFailed { .. } => "launch_failed",
            Self::OutputMissing { .. } => "output_missing",
            Self::OutputNotJson { .. } => "output_not_json",
            Self::MissingRequiredField { .. } => "missing_required_field",
            Self::StatusNotSuccess { .. } => "status_not_success",
        }
    }
}

/// Failures that end a supervisor run outright.
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// A successful script did not report the address the autoscaler needs.
    /// Never retried.
    #[error("validated output has no usable '{field}' field")]
    AutoscalerFieldMissing { field: String },

    #[error("failed to write {what} to {}: {source}", .path.display())]
    Write {
        what: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
