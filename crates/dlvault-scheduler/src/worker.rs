//! The worker (`DownloadThread`, C2 glue): runs one [`Downloader`] to
//! completion on a blocking task, honoring cooperative cancellation and,
//! for fetch workers, the bounded-backoff retry loop from spec §4.4.

use std::sync::Arc;
use std::time::Duration;

use dlvault_core::{DownloadError, Downloader};
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::command::Command;

/// Outcome of an admission attempt (`startDownloadThread`, spec §4.1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AdmissionOutcome {
    /// An `ActiveWorker` exists and is a remove worker; it cannot be
    /// preempted. The caller stays in its current scheduling state.
    WaitRemovalToFinish,
    /// An `ActiveWorker` exists and is a fetch worker; it has been
    /// canceled. The caller proceeds as if admitted — the real worker
    /// starts once the canceled one's completion event re-drives things.
    WaitDownloadCancellation,
    /// No worker exists, a fetch slot was requested, and the cap is hit.
    TooManyDownloads,
    /// A fresh `ActiveWorker` was created and bound.
    Succeeded,
}

/// A handle to a running worker, keyed by download id in the scheduler's
/// active table. At most one per `Download` at any time (spec §3
/// invariant).
pub(crate) struct ActiveWorker {
    pub is_remove_worker: bool,
    pub is_canceled: bool,
    cancel: CancellationToken,
    downloader: Arc<dyn Downloader>,
}

impl ActiveWorker {
    pub fn cancel(&mut self) {
        if !self.is_canceled {
            self.is_canceled = true;
            self.cancel.cancel();
            self.downloader.cancel();
        }
    }
}

/// Spawn a worker task for `id`. The task runs the retry loop (fetch) or
/// a single blocking call (remove) on its own task via
/// `spawn_blocking` — the async stand-in for "its own OS thread" — and
/// posts exactly one [`Command::WorkerStopped`] back to the scheduler
/// loop when it finishes, success or not, canceled or not.
pub(crate) fn spawn_worker(
    id: String,
    is_remove_worker: bool,
    downloader: Arc<dyn Downloader>,
    min_retry_count: u32,
    progress_tx: watch::Sender<(u64, Option<u64>)>,
    cmd_tx: mpsc::UnboundedSender<Command>,
) -> ActiveWorker {
    let cancel = CancellationToken::new();
    let worker_cancel = cancel.clone();
    let worker_downloader = Arc::clone(&downloader);

    tokio::spawn(async move {
        let final_error = if is_remove_worker {
            run_remove_worker(Arc::clone(&worker_downloader)).await
        } else {
            run_fetch_worker(Arc::clone(&worker_downloader), worker_cancel.clone(), min_retry_count, progress_tx).await
        };
        let is_canceled = worker_cancel.is_cancelled();
        tracing::debug!(
            target: "dlvault.scheduler",
            id = %id,
            is_remove_worker,
            is_canceled,
            failed = final_error.is_some(),
            "worker stopped",
        );
        let _ = cmd_tx.send(Command::WorkerStopped {
            id,
            is_remove_worker,
            is_canceled,
            error: final_error,
        });
    });

    ActiveWorker {
        is_remove_worker,
        is_canceled: false,
        cancel,
        downloader,
    }
}

/// Fetch retry loop (spec §4.4): on I/O failure, reset the error count
/// only if `downloaded_bytes` advanced past the position recorded at the
/// last error; otherwise increment. Rethrow once the count exceeds
/// `min_retry_count`; otherwise sleep a linear, 5s-capped backoff and
/// retry. Cancellation short-circuits both the in-flight call and the
/// backoff sleep.
async fn run_fetch_worker(
    downloader: Arc<dyn Downloader>,
    cancel: CancellationToken,
    min_retry_count: u32,
    progress_tx: watch::Sender<(u64, Option<u64>)>,
) -> Option<DownloadError> {
    let mut error_count: u32 = 0;
    let mut last_error_bytes: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            return None;
        }

        let d = Arc::clone(&downloader);
        let tx = progress_tx.clone();
        let blocking = tokio::task::spawn_blocking(move || {
            let on_progress = |downloaded: u64| {
                let total = d.counters().bytes_total;
                let _ = tx.send((downloaded, total));
            };
            d.download(&on_progress)
        });

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                downloader.cancel();
                return None;
            }
            joined = blocking => match joined {
                Ok(r) => r,
                Err(join_err) => Err(DownloadError::other(format!("download task panicked: {join_err}"))),
            },
        };

        match result {
            Ok(()) => return None,
            Err(err) => {
                if cancel.is_cancelled() || err.is_cancelled() {
                    return None;
                }
                if !err.is_recoverable() {
                    return Some(err);
                }

                let current_bytes = downloader.downloaded_bytes();
                if current_bytes > last_error_bytes {
                    error_count = 0;
                } else {
                    error_count += 1;
                }
                last_error_bytes = current_bytes;

                if error_count > min_retry_count {
                    return Some(err);
                }

                let backoff_ms = u64::from(error_count.saturating_sub(1)).saturating_mul(1000).min(5000);
                tracing::warn!(
                    target: "dlvault.scheduler",
                    error = %err,
                    error_count,
                    backoff_ms,
                    "fetch worker retrying after error",
                );
                tokio::select! {
                    () = cancel.cancelled() => return None,
                    () = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                }
            }
        }
    }
}

/// Remove worker (spec §4.4): a single blocking call. Not retried; a
/// failure is logged and returned as the final error, but (per §7/§9)
/// the state machine still transitions to `removed` regardless.
async fn run_remove_worker(downloader: Arc<dyn Downloader>) -> Option<DownloadError> {
    let result = tokio::task::spawn_blocking(move || downloader.remove()).await;
    match result {
        Ok(Ok(())) => None,
        Ok(Err(err)) => {
            tracing::warn!(
                target: "dlvault.scheduler",
                error = %err,
                "remove worker failed; download still transitions to removed",
            );
            Some(err)
        }
        Err(join_err) => Some(DownloadError::other(format!("remove task panicked: {join_err}"))),
    }
}
