//! The [`DownloadIndex`] contract: a persistent key/value store of
//! [`DownloadRecord`]s, keyed by id, that survives process restarts.
//!
//! Mirrors the repository ports elsewhere in the workspace: async,
//! `sqlx`-free in its signature, and reporting failures through a single
//! domain error type the scheduler logs and swallows rather than
//! propagates to listeners.

use async_trait::async_trait;

use crate::{DownloadRecord, DownloadState, IndexError};

/// Persistent storage for download records.
///
/// Implementations must be safe to call concurrently from the scheduler
/// task (writes are always serialized by the scheduler itself, but reads
/// — e.g. a startup scan racing a late write from a prior run — are not
/// ruled out).
#[async_trait]
pub trait DownloadIndex: Send + Sync {
    /// Fetch one record by id, or `None` if absent.
    async fn get(&self, id: &str) -> Result<Option<DownloadRecord>, IndexError>;

    /// Fetch all records whose state is in `states`. An empty slice
    /// matches every state (used by the scheduler's startup scan, which
    /// filters out `completed`/`failed`/`removed` and everything else
    /// locally rather than pushing that filter into every backend).
    async fn get_states(&self, states: &[DownloadState]) -> Result<Vec<DownloadRecord>, IndexError>;

    /// Insert or overwrite a record by id.
    async fn put(&self, record: &DownloadRecord) -> Result<(), IndexError>;

    /// Delete a record by id. Deleting an absent id is not an error.
    async fn delete(&self, id: &str) -> Result<(), IndexError>;

    /// Set `manual_stop_reason` on every record currently stored.
    async fn set_manual_stop_reason(&self, reason: i32) -> Result<(), IndexError>;

    /// Set `manual_stop_reason` on exactly one record. A no-op if the id
    /// is absent.
    async fn set_manual_stop_reason_for(&self, id: &str, reason: i32) -> Result<(), IndexError>;
}
