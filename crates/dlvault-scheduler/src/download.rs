//! The per-item state machine (C4): the authoritative in-memory lifecycle
//! for one download, rematerialized into a [`DownloadRecord`] on every
//! change.
//!
//! A [`Download`] never talks to the index, a worker thread, or a
//! listener directly; its methods only mutate local fields and, when they
//! need to start or cancel a worker, call into [`SchedulerRuntime`] (the
//! shared resources the scheduler actor owns: the active-worker table and
//! the simultaneous-download counter). The scheduler actor decides whether
//! to persist and notify, based on the `bool` each transition returns —
//! "did this call change something worth publishing". That centralizes
//! the actual publish (persist + notify) at the single call site in
//! `scheduler.rs`, which is what gives us the publish-once guarantee
//! without needing reference-identity bookkeeping inside the state
//! machine itself.

use dlvault_core::{
    Action, DownloadError, DownloadRecord, DownloadState, FailureReason, ManualStopReason,
    NotMetRequirements, can_start,
};

use crate::scheduler::SchedulerRuntime;
use crate::worker::AdmissionOutcome;

/// In-memory lifecycle state for one download, owned exclusively by the
/// scheduler actor.
#[derive(Clone, Debug)]
pub(crate) struct Download {
    pub id: String,
    kind: String,
    uri: String,
    cache_key: Option<String>,
    stream_keys: Vec<String>,
    custom_metadata: Vec<u8>,
    start_time_ms: i64,

    pub state: DownloadState,
    failure_reason: FailureReason,
    not_met_requirements: NotMetRequirements,
    pub manual_stop_reason: ManualStopReason,
}

impl Download {
    /// Construct a brand-new, never-persisted download from an `Action`,
    /// inheriting the scheduler's current global requirements mask and
    /// manual-stop-reason (§9: "newly added downloads inherit the global
    /// reason at construction time").
    pub fn new(action: &Action, now_ms: i64, not_met: NotMetRequirements, manual_stop_reason: ManualStopReason) -> Self {
        Self {
            id: action.id.clone(),
            kind: action.kind.clone(),
            uri: action.uri.clone(),
            cache_key: action.cache_key.clone(),
            stream_keys: action.stream_keys.clone(),
            custom_metadata: action.custom_metadata.clone(),
            start_time_ms: now_ms,
            state: DownloadState::Queued,
            failure_reason: FailureReason::None,
            not_met_requirements: not_met,
            manual_stop_reason,
        }
    }

    /// Rehydrate from a persisted record, overriding `notMetRequirements`
    /// and `manualStopReason` with the scheduler's current values (the
    /// record's own copies are last-known-good, not authoritative — the
    /// live scheduler state is).
    pub fn from_record(record: DownloadRecord, not_met: NotMetRequirements, manual_stop_reason: ManualStopReason) -> Self {
        Self {
            id: record.id,
            kind: record.kind,
            uri: record.uri,
            cache_key: record.cache_key,
            stream_keys: record.stream_keys,
            custom_metadata: record.custom_metadata,
            start_time_ms: record.start_time_ms,
            state: record.state,
            failure_reason: record.failure_reason,
            not_met_requirements: not_met,
            manual_stop_reason,
        }
    }

    /// Pure function: materialize the persisted record for this download
    /// as of `now_ms`.
    pub fn to_record(&self, now_ms: i64) -> DownloadRecord {
        DownloadRecord {
            id: self.id.clone(),
            kind: self.kind.clone(),
            uri: self.uri.clone(),
            cache_key: self.cache_key.clone(),
            stream_keys: self.stream_keys.clone(),
            custom_metadata: self.custom_metadata.clone(),
            state: self.state,
            failure_reason: self.failure_reason,
            not_met_requirements: self.not_met_requirements,
            manual_stop_reason: self.manual_stop_reason,
            start_time_ms: self.start_time_ms,
            update_time_ms: now_ms,
        }
    }

    pub fn set_not_met_requirements(&mut self, mask: NotMetRequirements) {
        self.not_met_requirements = mask;
    }

    fn can_start(&self) -> bool {
        can_start(self.manual_stop_reason, self.not_met_requirements)
    }

    fn is_in_remove_state(&self) -> bool {
        matches!(self.state, DownloadState::Removing | DownloadState::Restarting)
    }

    /// A worker must be attached for this state; used by the scheduler's
    /// completion handler to detect spurious completions.
    fn expects_worker(&self) -> bool {
        matches!(
            self.state,
            DownloadState::Downloading | DownloadState::Removing | DownloadState::Restarting
        )
    }

    /// `initialize(initialState)` (spec §4.2): set state, then either
    /// admit (if already in a remove state), start-or-queue (if
    /// eligible), or fall to `stopped`. Always reports "please publish" —
    /// bootstrapping listeners need the notification even when the net
    /// state is unchanged from `initial_state`.
    pub fn initialize(&mut self, initial_state: DownloadState, id: &str, runtime: &mut SchedulerRuntime) -> bool {
        self.state = initial_state;
        if self.is_in_remove_state() {
            self.admit(id, runtime);
        } else if self.can_start() {
            self.start_or_queue(id, runtime);
        } else {
            self.state = DownloadState::Stopped;
        }
        true
    }

    /// `addAction(action)`: merge content, re-run `initialize` on the
    /// record's current (pre-merge) state.
    pub fn add_action(&mut self, action: &Action, now_ms: i64, id: &str, runtime: &mut SchedulerRuntime) -> bool {
        if action.kind != self.kind {
            tracing::warn!(
                target: "dlvault.scheduler",
                id = %id,
                expected_kind = %self.kind,
                actual_kind = %action.kind,
                "addAction: content-type mismatch; merging anyway",
            );
        }
        self.uri = action.uri.clone();
        self.cache_key = action.cache_key.clone();
        self.custom_metadata = action.custom_metadata.clone();
        for key in &action.stream_keys {
            if !self.stream_keys.contains(key) {
                self.stream_keys.push(key.clone());
            }
        }
        let _ = now_ms;
        let resume_state = self.state;
        self.initialize(resume_state, id, runtime)
    }

    /// `remove()`: `initialize(removing)`.
    pub fn remove(&mut self, id: &str, runtime: &mut SchedulerRuntime) -> bool {
        self.initialize(DownloadState::Removing, id, runtime)
    }

    /// `start()`: re-drive admission for a download that is already
    /// queued/downloading (idempotent re-admission, used to fill freed
    /// fetch slots) or already in a remove state; no-op otherwise.
    pub fn start(&mut self, id: &str, runtime: &mut SchedulerRuntime) -> bool {
        match self.state {
            DownloadState::Queued | DownloadState::Downloading => {
                self.start_or_queue(id, runtime);
                true
            }
            _ if self.is_in_remove_state() => {
                self.admit(id, runtime);
                true
            }
            _ => false,
        }
    }

    /// Feeds both `setNotMetRequirements` and `setManualStopReason`:
    /// resume a stopped download if it can now start, or stop a running
    /// one if it no longer can. A no-op (and no publish) for every other
    /// combination.
    pub fn update_stop_state(&mut self, id: &str, runtime: &mut SchedulerRuntime) -> bool {
        if self.can_start() && self.state == DownloadState::Stopped {
            self.start_or_queue(id, runtime);
            true
        } else if !self.can_start() && matches!(self.state, DownloadState::Downloading | DownloadState::Queued) {
            runtime.cancel_worker(id);
            self.state = DownloadState::Stopped;
            true
        } else {
            false
        }
    }

    /// Download-level `onDownloadThreadStopped(isCanceled, finalError)`
    /// (spec §4.2). Called by the scheduler's own completion handler
    /// (C5) after it has already updated the active-worker table and the
    /// simultaneous-download counter.
    pub fn on_thread_stopped(
        &mut self,
        id: &str,
        is_canceled: bool,
        error: Option<DownloadError>,
        runtime: &mut SchedulerRuntime,
    ) -> bool {
        if !self.expects_worker() {
            return false; // spurious: nothing was waiting on this worker
        }
        if is_canceled {
            // The state machine preempted a worker so a new one (fetch or
            // remove, whichever the current state now calls for) can
            // start; re-drive admission rather than assuming fetch. Only
            // publish if that re-admission actually changed the observable
            // state — re-admitting into the same `removing`/`restarting`
            // value it already had is not a distinct transition.
            let before = self.state;
            self.admit(id, runtime);
            return self.state != before;
        }
        match self.state {
            DownloadState::Restarting => self.initialize(DownloadState::Queued, id, runtime),
            DownloadState::Removing => {
                // A failed remove is logged by the caller and discarded;
                // the download still reaches `removed` so a stuck id
                // never blocks a future `addDownload` for the same id.
                self.state = DownloadState::Removed;
                true
            }
            DownloadState::Downloading => {
                if error.is_some() {
                    self.failure_reason = FailureReason::Unknown;
                    self.state = DownloadState::Failed;
                } else {
                    self.state = DownloadState::Completed;
                }
                true
            }
            _ => false,
        }
    }

    /// `startOrQueue` (requires `!isInRemoveState()`): admit as a fetch
    /// worker, falling to `queued` under the simultaneous-download cap.
    fn start_or_queue(&mut self, id: &str, runtime: &mut SchedulerRuntime) {
        debug_assert!(!self.is_in_remove_state());
        let record = self.to_record(0);
        let outcome = runtime.start_download_thread(id, false, &record);
        debug_assert!(
            !matches!(outcome, AdmissionOutcome::WaitRemovalToFinish),
            "a fetch admission must never collide with an in-flight remove worker for the same id",
        );
        self.apply_admission_outcome(outcome);
    }

    /// Generic admission, used when the current state (remove or not) is
    /// itself the deciding factor — `initialize`'s remove branch and the
    /// canceled-worker re-admit path in `on_thread_stopped`.
    fn admit(&mut self, id: &str, runtime: &mut SchedulerRuntime) {
        let is_remove = self.is_in_remove_state();
        let record = self.to_record(0);
        let outcome = runtime.start_download_thread(id, is_remove, &record);
        self.apply_admission_outcome(outcome);
    }

    fn apply_admission_outcome(&mut self, outcome: AdmissionOutcome) {
        match outcome {
            AdmissionOutcome::Succeeded | AdmissionOutcome::WaitDownloadCancellation => {
                if !self.is_in_remove_state() {
                    self.state = DownloadState::Downloading;
                }
            }
            AdmissionOutcome::TooManyDownloads => {
                self.state = DownloadState::Queued;
            }
            AdmissionOutcome::WaitRemovalToFinish => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DownloadManagerConfig;
    use dlvault_core::model::MANUAL_STOP_REASON_NONE;
    use dlvault_db::InMemoryDownloadIndex;
    use std::sync::Arc;

    fn runtime(max: u32) -> SchedulerRuntime {
        SchedulerRuntime::new_for_test(
            Arc::new(InMemoryDownloadIndex::new()),
            DownloadManagerConfig::new().with_max_simultaneous_downloads(max),
        )
    }

    fn action(id: &str) -> Action {
        Action::new(id, "stream", "uri://x")
    }

    #[test]
    fn initialize_met_requirements_goes_downloading() {
        let mut rt = runtime(1);
        let mut d = Download::new(&action("a"), 0, NotMetRequirements::empty(), MANUAL_STOP_REASON_NONE);
        let emitted = d.initialize(DownloadState::Queued, "a", &mut rt);
        assert!(emitted);
        assert_eq!(d.state, DownloadState::Downloading);
        assert_eq!(rt.simultaneous_downloads(), 1);
    }

    #[test]
    fn initialize_unmet_requirements_goes_stopped() {
        let mut rt = runtime(1);
        let mut d = Download::new(&action("a"), 0, NotMetRequirements::NETWORK, MANUAL_STOP_REASON_NONE);
        d.initialize(DownloadState::Queued, "a", &mut rt);
        assert_eq!(d.state, DownloadState::Stopped);
        assert_eq!(rt.simultaneous_downloads(), 0);
    }

    #[test]
    fn second_download_queues_under_cap() {
        let mut rt = runtime(1);
        let mut a = Download::new(&action("a"), 0, NotMetRequirements::empty(), MANUAL_STOP_REASON_NONE);
        a.initialize(DownloadState::Queued, "a", &mut rt);
        assert_eq!(a.state, DownloadState::Downloading);

        let mut b = Download::new(&action("b"), 0, NotMetRequirements::empty(), MANUAL_STOP_REASON_NONE);
        b.initialize(DownloadState::Queued, "b", &mut rt);
        assert_eq!(b.state, DownloadState::Queued);
    }

    #[test]
    fn update_stop_state_noop_when_nothing_changes() {
        let mut rt = runtime(1);
        let mut d = Download::new(&action("a"), 0, NotMetRequirements::empty(), MANUAL_STOP_REASON_NONE);
        d.initialize(DownloadState::Queued, "a", &mut rt);
        assert_eq!(d.state, DownloadState::Downloading);

        // Still can_start, still downloading: no transition, no publish.
        let emitted = d.update_stop_state("a", &mut rt);
        assert!(!emitted);
        assert_eq!(d.state, DownloadState::Downloading);
    }

    #[test]
    fn on_thread_stopped_ignores_spurious_completion() {
        let mut rt = runtime(1);
        let mut d = Download::new(&action("a"), 0, NotMetRequirements::NETWORK, MANUAL_STOP_REASON_NONE);
        d.initialize(DownloadState::Queued, "a", &mut rt);
        assert_eq!(d.state, DownloadState::Stopped);

        let emitted = d.on_thread_stopped("a", false, None, &mut rt);
        assert!(!emitted);
        assert_eq!(d.state, DownloadState::Stopped);
    }

    #[test]
    fn on_thread_stopped_downloading_completes() {
        let mut rt = runtime(1);
        let mut d = Download::new(&action("a"), 0, NotMetRequirements::empty(), MANUAL_STOP_REASON_NONE);
        d.initialize(DownloadState::Queued, "a", &mut rt);
        assert_eq!(d.state, DownloadState::Downloading);

        let emitted = d.on_thread_stopped("a", false, None, &mut rt);
        assert!(emitted);
        assert_eq!(d.state, DownloadState::Completed);
    }

    #[test]
    fn on_thread_stopped_downloading_fails() {
        let mut rt = runtime(1);
        let mut d = Download::new(&action("a"), 0, NotMetRequirements::empty(), MANUAL_STOP_REASON_NONE);
        d.initialize(DownloadState::Queued, "a", &mut rt);

        let emitted = d.on_thread_stopped("a", false, Some(DownloadError::other("boom")), &mut rt);
        assert!(emitted);
        assert_eq!(d.state, DownloadState::Failed);
    }

    #[test]
    fn on_thread_stopped_removing_completes_to_removed_even_on_error() {
        let mut rt = runtime(1);
        let mut d = Download::new(&action("a"), 0, NotMetRequirements::empty(), MANUAL_STOP_REASON_NONE);
        d.initialize(DownloadState::Removing, "a", &mut rt);
        assert_eq!(d.state, DownloadState::Removing);

        let emitted = d.on_thread_stopped("a", false, Some(DownloadError::other("disk error")), &mut rt);
        assert!(emitted);
        assert_eq!(d.state, DownloadState::Removed);
    }
}
