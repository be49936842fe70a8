//! Errors the public controller can reject a call with. These are
//! programmer errors (spec §7): calling after `release()`, or passing
//! the reserved "resume" sentinel to a stop call.

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ControllerError {
    /// A call arrived after `release()` completed.
    #[error("download manager has been released")]
    Released,

    /// `stopDownloads`/`stopDownload` was called with `NONE`, which
    /// means "resume" and is only valid via `startDownloads`.
    #[error("manual stop reason NONE is reserved for resuming; use start_downloads/start_download")]
    InvalidManualStopReason,
}
