//! Error types for pull operations.

use std::io;
use thiserror::Error;

/// Errors that can occur outside of per-entry processing.
#[derive(Error, Debug)]
pub enum PullError {
    /// I/O error during file operations.
    #[error(transparent)]
    IoError(#[from] io::Error),

    /// HTTP client construction or request error.
    #[error(transparent)]
    ReqwestError(#[from] reqwest::Error),

    /// JSON serialization/deserialization error.
    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),

    /// The media store rejected a write.
    #[error("Storage failed: {0}")]
    Storage(String),

    /// The pipeline worker went away before delivering its result.
    #[error("Pipeline failed: {0}")]
    Pipeline(String),
}

/// Why a single fetch attempt produced no usable payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The attempt exceeded its time budget.
    #[error("request timed out")]
    Timeout,

    /// Connection, TLS or body-read failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The server answered outside the 2xx range.
    #[error("HTTP {0}")]
    Status(u16),

    /// A 2xx answer whose body is too small to be real media.
    #[error("payload of {len} bytes is below the {min} byte integrity threshold")]
    Undersized {
        /// Bytes received.
        len: usize,
        /// Required minimum (exclusive).
        min: usize,
    },

    /// The body is, or claims to be, larger than the configured ceiling.
    #[error("payload exceeds the {limit} byte limit")]
    Oversized {
        /// Largest accepted body.
        limit: usize,
    },
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout
        } else if let Some(status) = e.status() {
            FetchError::Status(status.as_u16())
        } else {
            FetchError::Transport(e.to_string())
        }
    }
}
