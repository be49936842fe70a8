//! The public controller (C7): `DownloadManager`, the composition root
//! an embedder constructs once and holds for the life of the process.
//!
//! Wraps the scheduler actor's command channel and fans out its
//! [`ListenerEvent`]s to every registered [`DownloadManagerListener`] on
//! a dedicated observer task, while maintaining the snapshot state
//! (`is_idle`, `is_initialized`, per-id states) the synchronous accessors
//! read without round-tripping through the actor.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use dlvault_core::{
    Action, DownloadIndex, DownloadState, DownloaderFactory, ManualStopReason,
    MANUAL_STOP_REASON_UNDEFINED, NotMetRequirements, RequirementsListener, RequirementsWatcher,
    Requirements, model::MANUAL_STOP_REASON_NONE,
};
use tokio::sync::{mpsc, oneshot};

use crate::command::Command;
use crate::config::DownloadManagerConfig;
use crate::error::ControllerError;
use crate::listener::{DownloadManagerListener, ListenerEvent};
use crate::scheduler::Scheduler;

struct Snapshot {
    states: HashMap<String, DownloadState>,
    is_idle: bool,
    is_initialized: bool,
    requirements: Requirements,
    not_met: NotMetRequirements,
}

impl Snapshot {
    fn new(requirements: Requirements, not_met: NotMetRequirements) -> Self {
        Self {
            states: HashMap::new(),
            is_idle: true,
            is_initialized: false,
            requirements,
            not_met,
        }
    }
}

struct RequirementsBridge {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl RequirementsListener for RequirementsBridge {
    fn on_requirements_state_changed(&self, not_met: NotMetRequirements) {
        let _ = self.cmd_tx.send(Command::SetNotMetRequirements(not_met));
    }
}

/// The embedder-facing download manager (spec §1/§6). Cheap to clone:
/// internally it is just a command-channel handle and shared snapshot
/// state, both already `Arc`-backed.
#[derive(Clone)]
pub struct DownloadManager {
    cmd_tx: mpsc::UnboundedSender<Command>,
    index: Arc<dyn DownloadIndex>,
    requirements_watcher: Arc<dyn RequirementsWatcher>,
    listeners: Arc<RwLock<Vec<Arc<dyn DownloadManagerListener>>>>,
    snapshot: Arc<RwLock<Snapshot>>,
    released: Arc<std::sync::atomic::AtomicBool>,
}

impl DownloadManager {
    /// Construct and start a manager: spawns the scheduler actor, starts
    /// the requirements watcher, and spawns the observer task that
    /// dispatches events to listeners while keeping the snapshot current.
    #[must_use]
    pub fn new(
        index: Arc<dyn DownloadIndex>,
        downloader_factory: Arc<dyn DownloaderFactory>,
        requirements_watcher: Arc<dyn RequirementsWatcher>,
        config: DownloadManagerConfig,
    ) -> Self {
        let (listener_tx, mut listener_rx) = mpsc::unbounded_channel::<ListenerEvent>();
        let requirements = config.requirements;

        let cmd_tx = Scheduler::spawn(Arc::clone(&index), downloader_factory, config, listener_tx.clone());

        let initial_not_met = requirements_watcher.start(requirements, Arc::new(RequirementsBridge { cmd_tx: cmd_tx.clone() }));
        let _ = cmd_tx.send(Command::SetNotMetRequirements(initial_not_met));

        let listeners: Arc<RwLock<Vec<Arc<dyn DownloadManagerListener>>>> = Arc::new(RwLock::new(Vec::new()));
        let snapshot = Arc::new(RwLock::new(Snapshot::new(requirements, initial_not_met)));

        {
            let listeners = Arc::clone(&listeners);
            let snapshot = Arc::clone(&snapshot);
            tokio::spawn(async move {
                while let Some(event) = listener_rx.recv().await {
                    {
                        let mut snap = snapshot.write().unwrap_or_else(std::sync::PoisonError::into_inner);
                        match &event {
                            ListenerEvent::Initialized => snap.is_initialized = true,
                            ListenerEvent::DownloadStateChanged(record) => {
                                if record.state.is_finished() {
                                    snap.states.remove(&record.id);
                                } else {
                                    snap.states.insert(record.id.clone(), record.state);
                                }
                                // A download entering a state that owns an
                                // `ActiveWorker` (downloading/removing/
                                // restarting) means the scheduler is no
                                // longer idle; only the dedicated `Idle`
                                // event (the rising edge back to empty)
                                // flips this back to true.
                                if matches!(
                                    record.state,
                                    DownloadState::Downloading | DownloadState::Removing | DownloadState::Restarting
                                ) {
                                    snap.is_idle = false;
                                }
                            }
                            ListenerEvent::Idle => snap.is_idle = true,
                            ListenerEvent::RequirementsStateChanged(requirements, not_met) => {
                                snap.requirements = *requirements;
                                snap.not_met = *not_met;
                            }
                        }
                    }
                    // Snapshot first so listeners invoked from within this
                    // dispatch observe state consistent with the event.
                    let observers: Vec<_> = listeners
                        .read()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .clone();
                    for listener in &observers {
                        match &event {
                            ListenerEvent::Initialized => listener.on_initialized(),
                            ListenerEvent::DownloadStateChanged(record) => listener.on_download_state_changed(record),
                            ListenerEvent::Idle => listener.on_idle(),
                            ListenerEvent::RequirementsStateChanged(requirements, not_met) => {
                                listener.on_requirements_state_changed(*requirements, *not_met);
                            }
                        }
                    }
                }
            });
        }

        Self {
            cmd_tx,
            index,
            requirements_watcher,
            listeners,
            snapshot,
            released: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    fn send(&self, command: Command) -> Result<(), ControllerError> {
        if self.released.load(std::sync::atomic::Ordering::Acquire) {
            return Err(ControllerError::Released);
        }
        let _ = self.cmd_tx.send(command);
        Ok(())
    }

    /// `addDownload(action)` (spec §4.1).
    pub fn add_download(&self, action: Action) -> Result<(), ControllerError> {
        self.send(Command::AddDownload(action))
    }

    /// `removeDownload(id)` (spec §4.1).
    pub fn remove_download(&self, id: impl Into<String>) -> Result<(), ControllerError> {
        self.send(Command::RemoveDownload(id.into()))
    }

    /// Clear every download's manual stop reason (resume all).
    pub fn start_downloads(&self) -> Result<(), ControllerError> {
        self.send(Command::SetManualStopReason {
            id: None,
            reason: MANUAL_STOP_REASON_NONE,
        })
    }

    /// Set a manual stop reason on every download. `reason` defaults to
    /// `UNDEFINED` ("stopped, no specific reason") when omitted; an
    /// explicit `NONE` is rejected — use [`Self::start_downloads`] to
    /// resume instead.
    pub fn stop_downloads(&self, reason: Option<ManualStopReason>) -> Result<(), ControllerError> {
        let reason = reason.unwrap_or(MANUAL_STOP_REASON_UNDEFINED);
        if reason == MANUAL_STOP_REASON_NONE {
            return Err(ControllerError::InvalidManualStopReason);
        }
        self.send(Command::SetManualStopReason { id: None, reason })
    }

    /// Clear one download's manual stop reason.
    pub fn start_download(&self, id: impl Into<String>) -> Result<(), ControllerError> {
        self.send(Command::SetManualStopReason {
            id: Some(id.into()),
            reason: MANUAL_STOP_REASON_NONE,
        })
    }

    /// Set a manual stop reason on one download. `reason` defaults to
    /// `UNDEFINED` when omitted; an explicit `NONE` is rejected — use
    /// [`Self::start_download`] to resume instead.
    pub fn stop_download(
        &self,
        id: impl Into<String>,
        reason: Option<ManualStopReason>,
    ) -> Result<(), ControllerError> {
        let reason = reason.unwrap_or(MANUAL_STOP_REASON_UNDEFINED);
        if reason == MANUAL_STOP_REASON_NONE {
            return Err(ControllerError::InvalidManualStopReason);
        }
        self.send(Command::SetManualStopReason {
            id: Some(id.into()),
            reason,
        })
    }

    /// Replace the requested requirements set and restart the watcher
    /// against it.
    pub fn set_requirements(&self, requirements: Requirements) -> Result<(), ControllerError> {
        if self.released.load(std::sync::atomic::Ordering::Acquire) {
            return Err(ControllerError::Released);
        }
        self.requirements_watcher.stop();
        let not_met = self
            .requirements_watcher
            .start(requirements, Arc::new(RequirementsBridge { cmd_tx: self.cmd_tx.clone() }));
        {
            let mut snap = self.snapshot.write().unwrap_or_else(std::sync::PoisonError::into_inner);
            snap.requirements = requirements;
        }
        let _ = self.cmd_tx.send(Command::SetNotMetRequirements(not_met));

        // Dispatched directly rather than through the scheduler actor:
        // the requested `Requirements` set lives on the controller, not
        // in scheduler state, so there is no actor-side event to ride on.
        let listeners = self.listeners.read().unwrap_or_else(std::sync::PoisonError::into_inner).clone();
        for listener in &listeners {
            listener.on_requirements_state_changed(requirements, not_met);
        }
        Ok(())
    }

    /// Register a listener; it receives every event posted from this
    /// call onward, in order.
    pub fn add_listener(&self, listener: Arc<dyn DownloadManagerListener>) {
        self.listeners.write().unwrap_or_else(std::sync::PoisonError::into_inner).push(listener);
    }

    /// Remove every listener pointer-equal to `listener`.
    pub fn remove_listener(&self, listener: &Arc<dyn DownloadManagerListener>) {
        let mut listeners = self.listeners.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Number of downloads currently tracked in memory (non-terminal).
    #[must_use]
    pub fn download_count(&self) -> usize {
        self.snapshot.read().unwrap_or_else(std::sync::PoisonError::into_inner).states.len()
    }

    /// Snapshot of every in-memory (non-terminal) download's state.
    #[must_use]
    pub fn all_download_states(&self) -> HashMap<String, DownloadState> {
        self.snapshot.read().unwrap_or_else(std::sync::PoisonError::into_inner).states.clone()
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.snapshot.read().unwrap_or_else(std::sync::PoisonError::into_inner).is_idle
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.snapshot.read().unwrap_or_else(std::sync::PoisonError::into_inner).is_initialized
    }

    #[must_use]
    pub fn requirements(&self) -> (Requirements, NotMetRequirements) {
        let snap = self.snapshot.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        (snap.requirements, snap.not_met)
    }

    /// The durable index backing this manager, for callers that want to
    /// read persisted records directly (e.g. a CLI `list` command).
    #[must_use]
    pub fn download_index(&self) -> Arc<dyn DownloadIndex> {
        Arc::clone(&self.index)
    }

    /// Idempotent. Cancels every active worker and waits for the active
    /// table to drain before returning; every call after the first
    /// (including a concurrent one) observes the same completion.
    pub async fn release(&self) {
        if self.released.swap(true, std::sync::atomic::Ordering::AcqRel) {
            return;
        }
        self.requirements_watcher.stop();
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Release(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

/// Free-function composition root, mirroring the teacher's own
/// `build_download_manager`: constructs the manager from its four ports.
/// Embedders register listeners afterward via
/// [`DownloadManager::add_listener`].
#[must_use]
pub fn build_download_manager(
    index: Arc<dyn DownloadIndex>,
    downloader_factory: Arc<dyn DownloaderFactory>,
    requirements_watcher: Arc<dyn RequirementsWatcher>,
    config: DownloadManagerConfig,
) -> DownloadManager {
    DownloadManager::new(index, downloader_factory, requirements_watcher, config)
}
