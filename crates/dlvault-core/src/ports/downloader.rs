//! The [`Downloader`] contract: the thing that actually moves bytes (or
//! deletes them) for a single download.
//!
//! `download` and `remove` are specified as blocking calls — the worker
//! that owns a `Downloader` runs it on a dedicated task via
//! `tokio::task::spawn_blocking`, the idiomatic stand-in for "its own OS
//! thread", and relies on `cancel` to interrupt an in-flight `download`
//! cooperatively rather than forcibly.

use std::sync::Arc;

use crate::{DownloadError, DownloadRecord};

/// Point-in-time counters a [`Downloader`] can report for diagnostics.
/// Transient: never persisted by the index, never required to survive a
/// restart.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DownloadCounters {
    pub bytes_downloaded: u64,
    pub bytes_total: Option<u64>,
}

/// A single download/removal unit. One instance is created per active
/// worker by a [`DownloaderFactory`] and is never reused across workers.
pub trait Downloader: Send + Sync {
    /// Blocking: fetch the content described by the record this
    /// downloader was created for, invoking `on_progress` with the
    /// cumulative byte count as data arrives. Must return promptly after
    /// `cancel` is called.
    fn download(&self, on_progress: &dyn Fn(u64) + Send + Sync) -> Result<(), DownloadError>;

    /// Blocking: delete whatever `download` would have produced.
    fn remove(&self) -> Result<(), DownloadError>;

    /// Request cooperative cancellation of an in-flight `download` or
    /// `remove` call. Must not block.
    fn cancel(&self);

    /// Bytes transferred so far, for progress reporting outside of the
    /// `on_progress` callback (e.g. the SIGKILL path).
    fn downloaded_bytes(&self) -> u64;

    fn counters(&self) -> DownloadCounters;
}

/// Creates a [`Downloader`] for a given record. Implementations typically
/// dispatch on `record.kind` (the `Action`'s opaque content-type tag).
pub trait DownloaderFactory: Send + Sync {
    fn create_downloader(&self, record: &DownloadRecord) -> Arc<dyn Downloader>;
}
