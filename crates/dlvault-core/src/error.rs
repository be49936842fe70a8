//! Error taxonomy for the download subsystem.
//!
//! Mirrors the rest of the workspace: no raw `std::io::Error` leaks into a
//! trait signature, every variant is serializable so it can cross an
//! event/API boundary, and recoverability is a first-class query rather
//! than something callers infer from the variant name.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors a [`crate::ports::Downloader`] can report from `download`/`remove`.
#[derive(Debug, Clone, Serialize, Deserialize, Error, PartialEq, Eq)]
pub enum DownloadError {
    /// Local I/O failure (disk full, permission denied, path gone).
    #[error("io error: {message}")]
    Io { message: String },

    /// Transport/network failure, optionally carrying an HTTP-like status.
    #[error("network error: {message}")]
    Network {
        message: String,
        status_code: Option<u16>,
    },

    /// The worker was cancelled cooperatively; not a failure of the task.
    #[error("cancelled")]
    Cancelled,

    /// The remote resource does not exist (non-retryable).
    #[error("not found")]
    NotFound,

    /// Anything else, carrying a human-readable message.
    #[error("{message}")]
    Other { message: String },
}

impl DownloadError {
    #[must_use]
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn network(message: impl Into<String>, status_code: Option<u16>) -> Self {
        Self::Network {
            message: message.into(),
            status_code,
        }
    }

    #[must_use]
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }

    /// Whether a fresh attempt might succeed. `NotFound` and `Cancelled` are
    /// not retried by the worker; everything else is, subject to backoff
    /// and `minRetryCount`.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !matches!(self, Self::NotFound | Self::Cancelled)
    }

    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Errors a [`crate::ports::DownloadIndex`] implementation can report.
///
/// Per the error handling design, index I/O errors are logged and
/// swallowed by the scheduler rather than surfaced to listeners — this
/// type exists so implementations have something structured to log.
#[derive(Debug, Clone, Serialize, Deserialize, Error, PartialEq, Eq)]
pub enum IndexError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl IndexError {
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }
}
