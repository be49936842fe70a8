//! Listener dispatch (C6): the four events a [`crate::DownloadManager`]
//! publishes, always delivered in posted order on a dedicated observer
//! task.

use dlvault_core::{DownloadRecord, NotMetRequirements, Requirements};

/// Receives the four lifecycle events a [`crate::DownloadManager`]
/// publishes. All callbacks run on the manager's observer task, in
/// posted order; a listener is free to add or remove other listeners
/// from within a callback.
///
/// Every method defaults to a no-op so embedders can implement only the
/// events they care about — directly grounded in the teacher's
/// `NoopDownloadEmitter`/`NoopEmitter` pattern for exactly this reason.
pub trait DownloadManagerListener: Send + Sync {
    /// The startup scan has finished and every persisted non-terminal
    /// download has been re-driven through `initialize`.
    fn on_initialized(&self) {}

    /// A download's persisted state changed (including bootstrap
    /// re-publications on load).
    fn on_download_state_changed(&self, _record: &DownloadRecord) {}

    /// The active-worker table just became empty (rising edge only).
    fn on_idle(&self) {}

    /// The requirements watcher reported a new not-met mask.
    fn on_requirements_state_changed(&self, _requirements: Requirements, _not_met: NotMetRequirements) {}
}

/// A listener that discards every event. Useful for tests and for
/// embedders that drive the manager purely through its snapshot
/// accessors.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopListener;

impl DownloadManagerListener for NoopListener {}

/// Events posted from the scheduler actor to the observer task, one per
/// [`DownloadManagerListener`] method.
#[derive(Debug, Clone)]
pub(crate) enum ListenerEvent {
    Initialized,
    DownloadStateChanged(DownloadRecord),
    Idle,
    RequirementsStateChanged(Requirements, NotMetRequirements),
}
