//! Scheduler Core (C5): the single-threaded event loop that owns every
//! `Download`, the active-worker table, and all Index I/O.
//!
//! Rendered as a `tokio::task` actor driven by an internal
//! `tokio::sync::mpsc` command channel — the idiomatic equivalent of
//! "post closures to a single-threaded loop that runs them FIFO". Split
//! in two halves for borrow-checker reasons as much as design clarity:
//! [`SchedulerRuntime`] holds the resources a [`Download`] transition
//! needs to request admission (the active-worker table, the
//! simultaneous-download counter, the index, the downloader factory),
//! while [`Scheduler`] owns the `downloads` map itself and the runtime
//! side by side, so a transition can borrow one `Download` mutably from
//! the map and the runtime independently without aliasing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dlvault_core::{
    Action, DownloadIndex, DownloadRecord, DownloadState, Downloader, DownloaderFactory,
    ManualStopReason, NotMetRequirements, model::MANUAL_STOP_REASON_NONE,
};
use tokio::sync::{mpsc, oneshot, watch};

use crate::command::Command;
use crate::config::DownloadManagerConfig;
use crate::download::Download;
use crate::listener::ListenerEvent;
use crate::progress::ProgressThrottle;
use crate::worker::{self, ActiveWorker, AdmissionOutcome};

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// The shared resources a [`Download`] transition needs in order to
/// request admission: the active-worker table, the simultaneous-fetch
/// counter, the persistence and downloader-factory ports, and the
/// config. Deliberately excludes the `downloads` map itself.
pub(crate) struct SchedulerRuntime {
    active: HashMap<String, ActiveWorker>,
    simultaneous_downloads: u32,
    config: DownloadManagerConfig,
    index: Arc<dyn DownloadIndex>,
    downloader_factory: Option<Arc<dyn DownloaderFactory>>,
    cmd_tx: Option<mpsc::UnboundedSender<Command>>,
}

impl SchedulerRuntime {
    fn new(
        index: Arc<dyn DownloadIndex>,
        downloader_factory: Arc<dyn DownloaderFactory>,
        config: DownloadManagerConfig,
        cmd_tx: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            active: HashMap::new(),
            simultaneous_downloads: 0,
            config,
            index,
            downloader_factory: Some(downloader_factory),
            cmd_tx: Some(cmd_tx),
        }
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(index: Arc<dyn DownloadIndex>, config: DownloadManagerConfig) -> Self {
        Self {
            active: HashMap::new(),
            simultaneous_downloads: 0,
            config,
            index,
            downloader_factory: None,
            cmd_tx: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn simultaneous_downloads(&self) -> u32 {
        self.simultaneous_downloads
    }

    fn active_is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub(crate) fn cancel_worker(&mut self, id: &str) {
        if let Some(worker) = self.active.get_mut(id) {
            worker.cancel();
        }
    }

    /// `startDownloadThread` (spec §4.1): the admission function. Called
    /// only from within a [`Download`] transition.
    ///
    /// The scheduler calls `Download::start` on every download after
    /// `load()` and whenever a fetch slot frees up (spec §4.1), including
    /// ones that are already `Downloading` with a live worker covering
    /// exactly this request. Per the §3 invariant, that worker is the
    /// *only* live worker for the download, so cancelling it here on
    /// every redundant re-admission would cancel-and-restart healthy
    /// fetches in a loop once more than one download is active at a
    /// time. Only cancel when the request actually needs a different
    /// operation (remove pre-empting a fetch) or when the existing
    /// worker is already being torn down (a fetch restart requested
    /// before the prior cancellation's completion event has reaped it).
    pub(crate) fn start_download_thread(&mut self, id: &str, is_remove: bool, record: &DownloadRecord) -> AdmissionOutcome {
        if let Some(existing) = self.active.get_mut(id) {
            if existing.is_remove_worker {
                return AdmissionOutcome::WaitRemovalToFinish;
            }
            if !is_remove && !existing.is_canceled {
                return AdmissionOutcome::Succeeded;
            }
            existing.cancel();
            return AdmissionOutcome::WaitDownloadCancellation;
        }

        if !is_remove && self.simultaneous_downloads >= self.config.max_simultaneous_downloads {
            return AdmissionOutcome::TooManyDownloads;
        }

        let (Some(factory), Some(cmd_tx)) = (self.downloader_factory.as_ref(), self.cmd_tx.as_ref()) else {
            // Test-only runtime with no real worker infrastructure: admit
            // without spawning, for unit tests of the state machine.
            if !is_remove {
                self.simultaneous_downloads += 1;
            }
            return AdmissionOutcome::Succeeded;
        };

        let downloader: Arc<dyn Downloader> = factory.create_downloader(record);
        let (progress_tx, mut progress_rx) = watch::channel((0u64, None::<u64>));
        {
            let id = id.to_string();
            tokio::spawn(async move {
                let mut throttle = ProgressThrottle::default();
                while progress_rx.changed().await.is_ok() {
                    if throttle.should_emit() {
                        let (downloaded, total) = *progress_rx.borrow();
                        tracing::debug!(target: "dlvault.scheduler", id = %id, downloaded, total, "fetch progress");
                    }
                }
            });
        }

        let worker = worker::spawn_worker(
            id.to_string(),
            is_remove,
            downloader,
            self.config.min_retry_count,
            progress_tx,
            cmd_tx.clone(),
        );
        self.active.insert(id.to_string(), worker);
        if !is_remove {
            self.simultaneous_downloads += 1;
        }
        AdmissionOutcome::Succeeded
    }
}

/// The scheduler actor's full state: the `Download` collection plus the
/// runtime it hands to each transition.
pub(crate) struct Scheduler {
    downloads: HashMap<String, Download>,
    runtime: SchedulerRuntime,
    not_met_requirements: NotMetRequirements,
    manual_stop_reason: ManualStopReason,
    listener_tx: mpsc::UnboundedSender<ListenerEvent>,
    was_idle: bool,
    releasing: Option<oneshot::Sender<()>>,
}

impl Scheduler {
    pub(crate) fn spawn(
        index: Arc<dyn DownloadIndex>,
        downloader_factory: Arc<dyn DownloaderFactory>,
        config: DownloadManagerConfig,
        listener_tx: mpsc::UnboundedSender<ListenerEvent>,
    ) -> mpsc::UnboundedSender<Command> {
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        let runtime = SchedulerRuntime::new(index, downloader_factory, config, cmd_tx.clone());
        let mut scheduler = Self {
            downloads: HashMap::new(),
            runtime,
            not_met_requirements: NotMetRequirements::empty(),
            manual_stop_reason: MANUAL_STOP_REASON_NONE,
            listener_tx,
            was_idle: true,
            releasing: None,
        };

        let _ = cmd_tx.send(Command::Load);

        tokio::spawn(async move {
            while let Some(command) = cmd_rx.recv().await {
                scheduler.handle(command).await;
                if scheduler.releasing.is_some() && scheduler.runtime.active_is_empty() {
                    if let Some(ack) = scheduler.releasing.take() {
                        let _ = ack.send(());
                    }
                    break;
                }
            }
        });

        cmd_tx
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Load => self.load().await,
            Command::AddDownload(action) => self.add_download(action).await,
            Command::RemoveDownload(id) => self.remove_download(id).await,
            Command::SetManualStopReason { id, reason } => self.set_manual_stop_reason(id, reason).await,
            Command::SetNotMetRequirements(mask) => self.set_not_met_requirements(mask).await,
            Command::WorkerStopped {
                id,
                is_remove_worker,
                is_canceled,
                error,
            } => self.handle_worker_stopped(id, is_remove_worker, is_canceled, error).await,
            Command::Release(ack) => self.begin_release(ack).await,
        }
    }

    /// `load` (spec §4.1): scan for non-terminal records, `initialize`
    /// each one, publish `onInitialized`, then `start` every download and
    /// evaluate idle.
    async fn load(&mut self) {
        let states = [
            DownloadState::Queued,
            DownloadState::Stopped,
            DownloadState::Downloading,
            DownloadState::Removing,
            DownloadState::Restarting,
        ];
        let records = match self.runtime.index.get_states(&states).await {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!(target: "dlvault.scheduler", error = %err, "failed to scan download index at startup");
                Vec::new()
            }
        };

        let mut loaded = Vec::with_capacity(records.len());
        for record in records {
            let id = record.id.clone();
            let persisted_state = record.state;
            let download = Download::from_record(record, self.not_met_requirements, self.manual_stop_reason);
            self.downloads.insert(id.clone(), download);
            loaded.push((id, persisted_state));
        }

        for (id, persisted_state) in &loaded {
            self.run_transition(id, |d, id, rt| d.initialize(*persisted_state, id, rt)).await;
        }

        let _ = self.listener_tx.send(ListenerEvent::Initialized);

        let ids: Vec<String> = loaded.into_iter().map(|(id, _)| id).collect();
        for id in &ids {
            self.run_transition(id, Download::start).await;
        }

        self.evaluate_idle();
    }

    /// `addDownloadInternal(action)` (spec §4.1).
    async fn add_download(&mut self, action: Action) {
        let id = action.id.clone();

        if self.downloads.contains_key(&id) {
            let now = now_ms();
            self.run_transition(&id, move |d, id, rt| d.add_action(&action, now, id, rt)).await;
            return;
        }

        let persisted = match self.runtime.index.get(&id).await {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(target: "dlvault.scheduler", id = %id, error = %err, "failed to read persisted record for add");
                None
            }
        };

        let now = now_ms();
        let (download, persisted_state) = if let Some(mut record) = persisted {
            if record.kind != action.kind {
                tracing::warn!(
                    target: "dlvault.scheduler",
                    id = %id,
                    expected_kind = %record.kind,
                    actual_kind = %action.kind,
                    "addDownload: content-type mismatch merging into persisted record",
                );
            }
            record.apply_action(&action, now);
            let state = record.state;
            (Download::from_record(record, self.not_met_requirements, self.manual_stop_reason), state)
        } else {
            (
                Download::new(&action, now, self.not_met_requirements, self.manual_stop_reason),
                DownloadState::Queued,
            )
        };

        self.downloads.insert(id.clone(), download);
        self.run_transition(&id, move |d, id, rt| d.initialize(persisted_state, id, rt)).await;
    }

    /// `removeDownloadInternal(id)` (spec §4.1).
    async fn remove_download(&mut self, id: String) {
        if let Some(download) = self.downloads.get(&id) {
            // Idempotent: a download already being removed is a no-op,
            // so a repeated removeDownload doesn't double-publish.
            if matches!(download.state, DownloadState::Removing | DownloadState::Restarting) {
                return;
            }
            self.run_transition(&id, Download::remove).await;
            return;
        }

        let record = match self.runtime.index.get(&id).await {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(target: "dlvault.scheduler", id = %id, error = %err, "failed to read persisted record for remove");
                return;
            }
        };
        // A persisted record already in a terminal state (completed,
        // failed, or removed) has nothing left to remove.
        if record.state.is_finished() {
            return;
        }

        let download = Download::from_record(record, self.not_met_requirements, self.manual_stop_reason);
        self.downloads.insert(id.clone(), download);
        self.run_transition(&id, |d, id, rt| d.initialize(DownloadState::Removing, id, rt)).await;
    }

    /// `setManualStopReason(id?, reason)` (spec §4.1).
    async fn set_manual_stop_reason(&mut self, id: Option<String>, reason: ManualStopReason) {
        match id {
            None => {
                self.manual_stop_reason = reason;
                let ids: Vec<String> = self.downloads.keys().cloned().collect();
                for id in ids {
                    if let Some(d) = self.downloads.get_mut(&id) {
                        d.manual_stop_reason = reason;
                    }
                    self.run_transition(&id, Download::update_stop_state).await;
                }
                if let Err(err) = self.runtime.index.set_manual_stop_reason(reason).await {
                    tracing::warn!(target: "dlvault.scheduler", error = %err, "failed to persist global manual stop reason");
                }
            }
            Some(id) => {
                if let Some(d) = self.downloads.get_mut(&id) {
                    d.manual_stop_reason = reason;
                    self.run_transition(&id, Download::update_stop_state).await;
                }
                if let Err(err) = self.runtime.index.set_manual_stop_reason_for(&id, reason).await {
                    tracing::warn!(target: "dlvault.scheduler", id = %id, error = %err, "failed to persist manual stop reason");
                }
            }
        }
        self.evaluate_idle();
    }

    /// `setNotMetRequirements(mask)` (spec §4.1).
    async fn set_not_met_requirements(&mut self, mask: NotMetRequirements) {
        self.not_met_requirements = mask;
        let ids: Vec<String> = self.downloads.keys().cloned().collect();
        for id in ids {
            if let Some(d) = self.downloads.get_mut(&id) {
                d.set_not_met_requirements(mask);
                self.run_transition(&id, Download::update_stop_state).await;
            }
        }
        self.evaluate_idle();
    }

    /// `onDownloadThreadStopped(worker, finalError)` (spec §4.1): the
    /// scheduler-level completion handler. Updates the active-worker
    /// table and the simultaneous-download counter first, then hands off
    /// to the owning `Download`'s own `onDownloadThreadStopped`.
    async fn handle_worker_stopped(
        &mut self,
        id: String,
        is_remove_worker: bool,
        is_canceled: bool,
        error: Option<dlvault_core::DownloadError>,
    ) {
        self.runtime.active.remove(&id);
        let slot_opened = if !is_remove_worker {
            if self.runtime.simultaneous_downloads > 0 {
                self.runtime.simultaneous_downloads -= 1;
            }
            true
        } else {
            false
        };

        self.run_transition(&id, move |d, id, rt| d.on_thread_stopped(id, is_canceled, error.clone(), rt))
            .await;

        if slot_opened {
            let ids: Vec<String> = self.downloads.keys().cloned().collect();
            for id in ids {
                if self.runtime.simultaneous_downloads >= self.runtime.config.max_simultaneous_downloads {
                    break;
                }
                self.run_transition(&id, Download::start).await;
            }
        }

        self.evaluate_idle();
    }

    async fn begin_release(&mut self, ack: oneshot::Sender<()>) {
        let ids: Vec<String> = self.runtime.active.keys().cloned().collect();
        for id in ids {
            self.runtime.cancel_worker(&id);
        }
        self.releasing = Some(ack);
    }

    /// Run one `Download` transition and publish iff it reports it
    /// changed something.
    async fn run_transition<F>(&mut self, id: &str, f: F)
    where
        F: FnOnce(&mut Download, &str, &mut SchedulerRuntime) -> bool,
    {
        let emitted = match self.downloads.get_mut(id) {
            Some(download) => f(download, id, &mut self.runtime),
            None => false,
        };
        if emitted {
            self.publish(id).await;
        }
    }

    /// Persist and notify (spec §4.3 "publish"): materialize the record,
    /// write it to the index (errors logged and swallowed, per §7), send
    /// the listener event, and drop terminal downloads from the
    /// collection once published.
    async fn publish(&mut self, id: &str) {
        let Some(download) = self.downloads.get(id) else {
            return;
        };
        let record = download.to_record(now_ms());

        // `removed` is deleted outright so a later `removeDownload(id)`
        // can never resurrect it; `completed`/`failed` stay persisted for
        // history and are just written like any other state.
        if record.state == DownloadState::Removed {
            if let Err(err) = self.runtime.index.delete(id).await {
                tracing::warn!(target: "dlvault.scheduler", id = %id, error = %err, "failed to delete removed download record");
            }
        } else if let Err(err) = self.runtime.index.put(&record).await {
            tracing::warn!(target: "dlvault.scheduler", id = %id, error = %err, "failed to persist download record");
        }

        let is_finished = record.state.is_finished();
        tracing::info!(target: "dlvault.scheduler", id = %id, state = ?record.state, "download state changed");
        let _ = self.listener_tx.send(ListenerEvent::DownloadStateChanged(record));

        if is_finished {
            self.downloads.remove(id);
        }
    }

    fn evaluate_idle(&mut self) {
        let now_idle = self.runtime.active_is_empty();
        if now_idle && !self.was_idle {
            self.was_idle = true;
            let _ = self.listener_tx.send(ListenerEvent::Idle);
        } else if !now_idle {
            self.was_idle = false;
        }
    }
}
