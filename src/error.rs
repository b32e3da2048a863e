//! Errors raised by the fetch layer.
//!
//! Aggregation never fails: missing or malformed census fields are coerced
//! to zero, so there is no error type for it.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FetchError {
    /// The store answered with a non-success status.
    #[error("Remote store returned {status}: {message}")]
    Remote { status: u16, message: String },

    /// The request never produced a response (connect, timeout, TLS...).
    #[error("Remote request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The response body was not the expected array of rows.
    #[error("Failed to decode remote response: {0}")]
    Decode(String),

    /// The store does not expose the requested operation (e.g. the bounds RPC).
    #[error("Unsupported remote operation: {0}")]
    UnsupportedOperation(String),

    #[error("Invalid remote configuration: {0}")]
    Config(String),
}

impl FetchError {
    /// Whether a retry of the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Transport(_) => true,
            FetchError::Remote { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, FetchError>;
