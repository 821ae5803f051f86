//! Remote delivery error types.

use thiserror::Error;

/// Errors that can occur fetching scripts over HTTP.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// HTTP request failed.
    #[error("Script request failed: {0}")]
    RequestFailed(String),

    /// Response body was not valid JSON.
    #[error("Failed to parse script response: {0}")]
    Parse(String),

    /// Request timed out.
    #[error("Script request timed out after {0}ms")]
    Timeout(u64),

    /// Delivery endpoint is unreachable.
    #[error("Script endpoint unavailable: {0}")]
    Unavailable(String),

    /// All retry attempts exhausted.
    #[error("All script fetch attempts exhausted after {attempts} tries: {last_error}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The last error observed.
        last_error: String,
    },
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RemoteError::Timeout(0)
        } else if err.is_connect() {
            RemoteError::Unavailable(err.to_string())
        } else {
            RemoteError::RequestFailed(err.to_string())
        }
    }
}

impl From<RemoteError> for nudge_script::ScriptError {
    fn from(err: RemoteError) -> Self {
        nudge_script::ScriptError::Remote(err.to_string())
    }
}
