//! Typed error hierarchy for the aiflow daemon.
//!
//! Two enums cover the subsystems that need matchable failure modes:
//! - `RunnerError`: subprocess execution failures, where the caller must
//!   distinguish a deadline from a spawn failure from cancellation
//! - `TrackerError`: tracker API failures, where the retry loop must
//!   distinguish transport faults from client errors
//!
//! Everything else in the crate propagates `anyhow::Error` with context.

use std::time::Duration;

use thiserror::Error;

/// Errors from the subprocess runner.
///
/// A non-zero exit code is NOT an error; it is a valid `RunOutcome`. These
/// variants cover the cases where no meaningful exit code exists.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The run was cancelled before or during execution (daemon shutdown).
    #[error("run cancelled")]
    Cancelled,

    /// The stage command exceeded its configured timeout and was killed.
    #[error("subprocess timed out after {after:?}")]
    TimedOut { after: Duration },

    /// The stage command could not be started at all.
    #[error("failed to spawn stage command {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// I/O against the running child failed (stdin write, wait).
    #[error("subprocess I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    /// True when the failure should be recorded as a timeout rather than a
    /// generic execution error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RunnerError::TimedOut { .. })
    }
}

/// Errors from the tracker API client.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// Transport-level failure from the HTTP client.
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// The API answered but reported an application-level error.
    #[error("tracker API error: {0}")]
    Api(String),

    /// A workflow state name or id could not be resolved from the cache.
    #[error("unknown workflow state: {0}")]
    UnknownState(String),

    /// The retry budget was exhausted without a successful response.
    #[error("tracker request failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<TrackerError>,
    },
}

impl TrackerError {
    /// Whether a retry could plausibly succeed. HTTP 4xx responses other
    /// than 429 and application-level API errors are permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            TrackerError::Http(e) => match e.status() {
                Some(status) if status.is_client_error() => {
                    status == reqwest::StatusCode::TOO_MANY_REQUESTS
                }
                _ => true,
            },
            TrackerError::Api(_) => false,
            TrackerError::UnknownState(_) => false,
            TrackerError::RetriesExhausted { .. } => false,
        }
    }
}
