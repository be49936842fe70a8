//! Commands posted onto the scheduler's single-threaded event loop.
//!
//! Every external producer — the public controller, the requirements
//! watcher's callback, and each worker's completion — enqueues one of
//! these; the loop runs them FIFO, which is what gives per-id state
//! transitions their sequential ordering guarantee (spec §5).

use dlvault_core::{Action, DownloadError, ManualStopReason, NotMetRequirements};
use tokio::sync::oneshot;

pub(crate) enum Command {
    Load,
    AddDownload(Action),
    RemoveDownload(String),
    SetManualStopReason {
        id: Option<String>,
        reason: ManualStopReason,
    },
    SetNotMetRequirements(NotMetRequirements),
    WorkerStopped {
        id: String,
        is_remove_worker: bool,
        is_canceled: bool,
        error: Option<DownloadError>,
    },
    Release(oneshot::Sender<()>),
}
