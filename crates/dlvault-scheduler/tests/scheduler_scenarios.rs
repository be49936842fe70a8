//! End-to-end scenarios against a real [`DownloadManager`], driven through
//! fake `Downloader`/`DownloadIndex`/`RequirementsWatcher` implementations.
//!
//! These exercise the literal scenarios from the state-machine design: cap
//! enforcement, precondition gating, manual stop, remove-during-download,
//! and the retry/backoff boundary. Each fake `Downloader`'s `download`/
//! `remove` call blocks (on a plain thread, via `spawn_blocking`) until the
//! test explicitly queues an outcome for that id, so assertions can pin
//! down exactly which transition has and hasn't happened yet.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dlvault_core::{
    Action, DownloadCounters, DownloadError, DownloadRecord, DownloadState, Downloader,
    DownloaderFactory, NotMetRequirements, RequirementsListener, RequirementsWatcher, Requirements,
};
use dlvault_db::InMemoryDownloadIndex;
use dlvault_scheduler::{DownloadManager, DownloadManagerConfig, DownloadManagerListener};

/// One scripted outcome for a single `download`/`remove` call.
enum Step {
    FetchSuccess,
    FetchError { bytes_at_error: u64 },
    RemoveSuccess,
}

/// Hands out [`FakeDownloader`]s backed by a per-id queue of [`Step`]s.
/// The queue outlives any one downloader instance, so steps queued before
/// a worker is (re-)admitted are still there when the new instance starts
/// polling — this is what lets a single test model "cancel the fetch
/// worker, then let the remove worker that replaces it finish" as two
/// steps pushed back to back.
#[derive(Default)]
struct FakeFactory {
    queues: Mutex<HashMap<String, Arc<Mutex<VecDeque<Step>>>>>,
}

impl FakeFactory {
    fn queue_for(&self, id: &str) -> Arc<Mutex<VecDeque<Step>>> {
        Arc::clone(
            self.queues
                .lock()
                .unwrap()
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(VecDeque::new()))),
        )
    }

    fn push(&self, id: &str, step: Step) {
        self.queue_for(id).lock().unwrap().push_back(step);
    }
}

impl DownloaderFactory for FakeFactory {
    fn create_downloader(&self, record: &DownloadRecord) -> Arc<dyn Downloader> {
        Arc::new(FakeDownloader {
            queue: self.queue_for(&record.id),
            cancelled: Arc::new(AtomicBool::new(false)),
            bytes: AtomicU64::new(0),
        })
    }
}

struct FakeDownloader {
    queue: Arc<Mutex<VecDeque<Step>>>,
    cancelled: Arc<AtomicBool>,
    bytes: AtomicU64,
}

impl Downloader for FakeDownloader {
    fn download(&self, on_progress: &dyn Fn(u64) + Send + Sync) -> Result<(), DownloadError> {
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                return Err(DownloadError::Cancelled);
            }
            let step = self.queue.lock().unwrap().pop_front();
            match step {
                Some(Step::FetchSuccess) => {
                    self.bytes.store(100, Ordering::Release);
                    on_progress(100);
                    return Ok(());
                }
                Some(Step::FetchError { bytes_at_error }) => {
                    self.bytes.store(bytes_at_error, Ordering::Release);
                    return Err(DownloadError::network("simulated transient failure", Some(503)));
                }
                Some(Step::RemoveSuccess) => {
                    // Queued out of order (a remove outcome while this
                    // instance expects a fetch outcome); put it back and
                    // wait for the right one.
                    self.queue.lock().unwrap().push_front(Step::RemoveSuccess);
                    std::thread::sleep(Duration::from_millis(5));
                }
                None => std::thread::sleep(Duration::from_millis(5)),
            }
        }
    }

    fn remove(&self) -> Result<(), DownloadError> {
        loop {
            let step = self.queue.lock().unwrap().pop_front();
            match step {
                Some(Step::RemoveSuccess) => return Ok(()),
                Some(other) => {
                    self.queue.lock().unwrap().push_front(other);
                    std::thread::sleep(Duration::from_millis(5));
                }
                None => std::thread::sleep(Duration::from_millis(5)),
            }
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    fn downloaded_bytes(&self) -> u64 {
        self.bytes.load(Ordering::Acquire)
    }

    fn counters(&self) -> DownloadCounters {
        DownloadCounters {
            bytes_downloaded: self.downloaded_bytes(),
            bytes_total: None,
        }
    }
}

/// A `RequirementsWatcher` the test drives directly: `start` returns a
/// preset initial mask and captures the listener; [`Self::push`] replays
/// later changes through it, exactly like a real watcher's background
/// callback would.
#[derive(Default)]
struct FakeRequirementsWatcher {
    initial: Mutex<NotMetRequirements>,
    listener: Mutex<Option<Arc<dyn RequirementsListener>>>,
}

impl FakeRequirementsWatcher {
    fn new(initial: NotMetRequirements) -> Self {
        Self {
            initial: Mutex::new(initial),
            listener: Mutex::new(None),
        }
    }

    fn push(&self, mask: NotMetRequirements) {
        if let Some(listener) = self.listener.lock().unwrap().clone() {
            listener.on_requirements_state_changed(mask);
        }
    }
}

impl RequirementsWatcher for FakeRequirementsWatcher {
    fn start(&self, _requirements: Requirements, listener: Arc<dyn RequirementsListener>) -> NotMetRequirements {
        *self.listener.lock().unwrap() = Some(listener);
        *self.initial.lock().unwrap()
    }

    fn stop(&self) {
        *self.listener.lock().unwrap() = None;
    }
}

/// Records every `onDownloadStateChanged`/`onIdle` event in posted order,
/// for assertions about exactly what fired and how many times.
#[derive(Default)]
struct RecordingListener {
    events: Mutex<Vec<(String, DownloadState)>>,
    idle_count: AtomicU32,
}

impl RecordingListener {
    fn last_state(&self, id: &str) -> Option<DownloadState> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(event_id, _)| event_id == id)
            .map(|(_, state)| *state)
    }

    fn count_state(&self, id: &str, state: DownloadState) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(event_id, s)| event_id == id && *s == state)
            .count()
    }
}

impl DownloadManagerListener for RecordingListener {
    fn on_download_state_changed(&self, record: &DownloadRecord) {
        self.events.lock().unwrap().push((record.id.clone(), record.state));
    }

    fn on_idle(&self) {
        self.idle_count.fetch_add(1, Ordering::SeqCst);
    }
}

async fn wait_for(mut predicate: impl FnMut() -> bool, what: &str) {
    for _ in 0..500 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn wait_for_state(listener: &RecordingListener, id: &str, state: DownloadState) {
    wait_for(|| listener.last_state(id) == Some(state), &format!("{id} to reach {state:?}")).await;
}

fn build_manager(
    config: DownloadManagerConfig,
    factory: Arc<FakeFactory>,
    watcher: Arc<FakeRequirementsWatcher>,
) -> (DownloadManager, Arc<RecordingListener>) {
    let index = Arc::new(InMemoryDownloadIndex::new());
    let listener = Arc::new(RecordingListener::default());
    let manager = DownloadManager::new(index, factory, watcher, config);
    manager.add_listener(Arc::clone(&listener));
    (manager, listener)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cap_enforcement_queues_second_download_until_a_slot_frees() {
    let factory = Arc::new(FakeFactory::default());
    let watcher = Arc::new(FakeRequirementsWatcher::new(NotMetRequirements::empty()));
    let config = DownloadManagerConfig::new()
        .with_max_simultaneous_downloads(1)
        .with_min_retry_count(0);
    let (manager, listener) = build_manager(config, Arc::clone(&factory), watcher);

    manager.add_download(Action::new("a", "demo", "uri://a")).unwrap();
    wait_for_state(&listener, "a", DownloadState::Downloading).await;

    manager.add_download(Action::new("b", "demo", "uri://b")).unwrap();
    wait_for_state(&listener, "b", DownloadState::Queued).await;
    // B must not sneak past the cap while A is still running.
    assert_ne!(listener.last_state("b"), Some(DownloadState::Downloading));

    factory.push("a", Step::FetchSuccess);
    wait_for_state(&listener, "a", DownloadState::Completed).await;
    wait_for_state(&listener, "b", DownloadState::Downloading).await;

    factory.push("b", Step::FetchSuccess);
    wait_for_state(&listener, "b", DownloadState::Completed).await;

    assert_eq!(listener.idle_count.load(Ordering::SeqCst), 1, "onIdle must fire exactly once, on the final rising edge");
    manager.release().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn is_idle_accessor_tracks_active_downloads_not_just_the_initial_value() {
    let factory = Arc::new(FakeFactory::default());
    let watcher = Arc::new(FakeRequirementsWatcher::new(NotMetRequirements::empty()));
    let config = DownloadManagerConfig::new().with_max_simultaneous_downloads(1);
    let (manager, listener) = build_manager(config, Arc::clone(&factory), watcher);

    assert!(manager.is_idle(), "nothing has started yet");

    manager.add_download(Action::new("a", "demo", "uri://a")).unwrap();
    wait_for_state(&listener, "a", DownloadState::Downloading).await;
    assert!(!manager.is_idle(), "a live fetch worker means the manager is not idle");

    factory.push("a", Step::FetchSuccess);
    wait_for_state(&listener, "a", DownloadState::Completed).await;
    assert!(manager.is_idle());

    manager.release().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn freeing_a_slot_does_not_disrupt_an_unrelated_in_flight_download() {
    // max=2: A and B both get admitted as fetch workers. C then queues
    // behind the cap. When A completes and frees a slot, the scheduler
    // calls `start()` on every remaining download (spec §4.1) to let C
    // take the slot — that must not re-cancel B's already-healthy fetch
    // worker just because it was re-admitted along the way.
    let factory = Arc::new(FakeFactory::default());
    let watcher = Arc::new(FakeRequirementsWatcher::new(NotMetRequirements::empty()));
    let config = DownloadManagerConfig::new()
        .with_max_simultaneous_downloads(2)
        .with_min_retry_count(0);
    let (manager, listener) = build_manager(config, Arc::clone(&factory), watcher);

    manager.add_download(Action::new("a", "demo", "uri://a")).unwrap();
    wait_for_state(&listener, "a", DownloadState::Downloading).await;
    manager.add_download(Action::new("b", "demo", "uri://b")).unwrap();
    wait_for_state(&listener, "b", DownloadState::Downloading).await;

    manager.add_download(Action::new("c", "demo", "uri://c")).unwrap();
    wait_for_state(&listener, "c", DownloadState::Queued).await;

    factory.push("a", Step::FetchSuccess);
    wait_for_state(&listener, "a", DownloadState::Completed).await;
    wait_for_state(&listener, "c", DownloadState::Downloading).await;

    // B must have reached `downloading` exactly once: its live worker
    // was never preempted by the scheduler re-admitting it alongside C.
    assert_eq!(listener.count_state("b", DownloadState::Downloading), 1);

    factory.push("b", Step::FetchSuccess);
    wait_for_state(&listener, "b", DownloadState::Completed).await;
    factory.push("c", Step::FetchSuccess);
    wait_for_state(&listener, "c", DownloadState::Completed).await;

    manager.release().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn precondition_gating_holds_then_releases_on_requirements_met() {
    let factory = Arc::new(FakeFactory::default());
    let watcher = Arc::new(FakeRequirementsWatcher::new(NotMetRequirements::NETWORK));
    let config = DownloadManagerConfig::new().with_max_simultaneous_downloads(2);
    let (manager, listener) = build_manager(config, Arc::clone(&factory), watcher.clone());

    manager.add_download(Action::new("a", "demo", "uri://a")).unwrap();
    wait_for_state(&listener, "a", DownloadState::Stopped).await;

    watcher.push(NotMetRequirements::empty());
    wait_for_state(&listener, "a", DownloadState::Downloading).await;

    factory.push("a", Step::FetchSuccess);
    wait_for_state(&listener, "a", DownloadState::Completed).await;
    manager.release().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn manual_stop_then_resume_completes() {
    let factory = Arc::new(FakeFactory::default());
    let watcher = Arc::new(FakeRequirementsWatcher::new(NotMetRequirements::empty()));
    let config = DownloadManagerConfig::new().with_max_simultaneous_downloads(1);
    let (manager, listener) = build_manager(config, Arc::clone(&factory), watcher);

    manager.add_download(Action::new("a", "demo", "uri://a")).unwrap();
    wait_for_state(&listener, "a", DownloadState::Downloading).await;

    manager.stop_download("a", Some(7)).unwrap();
    wait_for_state(&listener, "a", DownloadState::Stopped).await;

    manager.start_download("a").unwrap();
    wait_for_state(&listener, "a", DownloadState::Downloading).await;

    factory.push("a", Step::FetchSuccess);
    wait_for_state(&listener, "a", DownloadState::Completed).await;

    assert_eq!(listener.count_state("a", DownloadState::Failed), 0);
    manager.release().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remove_during_download_cancels_the_fetch_and_finishes_as_removed() {
    let factory = Arc::new(FakeFactory::default());
    let watcher = Arc::new(FakeRequirementsWatcher::new(NotMetRequirements::empty()));
    let config = DownloadManagerConfig::new().with_max_simultaneous_downloads(1);
    let (manager, listener) = build_manager(config, Arc::clone(&factory), watcher);

    manager.add_download(Action::new("a", "demo", "uri://a")).unwrap();
    wait_for_state(&listener, "a", DownloadState::Downloading).await;

    manager.remove_download("a").unwrap();
    wait_for_state(&listener, "a", DownloadState::Removing).await;

    factory.push("a", Step::RemoveSuccess);
    wait_for_state(&listener, "a", DownloadState::Removed).await;

    assert_eq!(listener.count_state("a", DownloadState::Completed), 0);
    assert_eq!(listener.count_state("a", DownloadState::Failed), 0);
    manager.release().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retry_then_success_reaches_completed_without_an_intervening_failure() {
    let factory = Arc::new(FakeFactory::default());
    let watcher = Arc::new(FakeRequirementsWatcher::new(NotMetRequirements::empty()));
    let config = DownloadManagerConfig::new()
        .with_max_simultaneous_downloads(1)
        .with_min_retry_count(2);
    let (manager, listener) = build_manager(config, Arc::clone(&factory), watcher);

    // First failure makes no progress (bytes stay at 0); the second
    // advances to 1, which resets the error count before the cap is hit.
    factory.push("a", Step::FetchError { bytes_at_error: 0 });
    factory.push("a", Step::FetchError { bytes_at_error: 1 });
    factory.push("a", Step::FetchSuccess);

    manager.add_download(Action::new("a", "demo", "uri://a")).unwrap();
    wait_for_state(&listener, "a", DownloadState::Completed).await;

    assert_eq!(listener.count_state("a", DownloadState::Downloading), 1);
    assert_eq!(listener.count_state("a", DownloadState::Completed), 1);
    assert_eq!(listener.count_state("a", DownloadState::Failed), 0);
    manager.release().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retry_exhausted_reaches_failed() {
    let factory = Arc::new(FakeFactory::default());
    let watcher = Arc::new(FakeRequirementsWatcher::new(NotMetRequirements::empty()));
    let config = DownloadManagerConfig::new()
        .with_max_simultaneous_downloads(1)
        .with_min_retry_count(1);
    let (manager, listener) = build_manager(config, Arc::clone(&factory), watcher);

    // Both failures make no progress, so the error count climbs past
    // `min_retry_count` without ever resetting.
    factory.push("a", Step::FetchError { bytes_at_error: 0 });
    factory.push("a", Step::FetchError { bytes_at_error: 0 });

    manager.add_download(Action::new("a", "demo", "uri://a")).unwrap();
    wait_for_state(&listener, "a", DownloadState::Failed).await;

    assert_eq!(listener.count_state("a", DownloadState::Completed), 0);
    manager.release().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remove_download_twice_is_idempotent() {
    let factory = Arc::new(FakeFactory::default());
    let watcher = Arc::new(FakeRequirementsWatcher::new(NotMetRequirements::empty()));
    let config = DownloadManagerConfig::new().with_max_simultaneous_downloads(1);
    let (manager, listener) = build_manager(config, Arc::clone(&factory), watcher);

    manager.add_download(Action::new("a", "demo", "uri://a")).unwrap();
    wait_for_state(&listener, "a", DownloadState::Downloading).await;

    manager.remove_download("a").unwrap();
    wait_for_state(&listener, "a", DownloadState::Removing).await;
    manager.remove_download("a").unwrap();

    factory.push("a", Step::RemoveSuccess);
    wait_for_state(&listener, "a", DownloadState::Removed).await;

    // Exactly one `removing` publish, no matter how many times remove was
    // requested while already removing.
    assert_eq!(listener.count_state("a", DownloadState::Removing), 1);
    assert_eq!(listener.count_state("a", DownloadState::Removed), 1);

    // And once it has actually finished removing and been evicted, a
    // further call must not resurrect it from whatever the index holds.
    manager.remove_download("a").unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(listener.count_state("a", DownloadState::Removing), 1);
    assert_eq!(listener.count_state("a", DownloadState::Removed), 1);

    manager.release().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn release_stops_delivering_events_afterward() {
    let factory = Arc::new(FakeFactory::default());
    let watcher = Arc::new(FakeRequirementsWatcher::new(NotMetRequirements::empty()));
    let config = DownloadManagerConfig::new().with_max_simultaneous_downloads(1);
    let (manager, listener) = build_manager(config, Arc::clone(&factory), watcher);

    manager.add_download(Action::new("a", "demo", "uri://a")).unwrap();
    wait_for_state(&listener, "a", DownloadState::Downloading).await;

    manager.release().await;
    let events_at_release = listener.events.lock().unwrap().len();

    // Calling into a released manager must not panic and must not enqueue
    // further work; the scheduler loop has already quit.
    assert!(manager.add_download(Action::new("b", "demo", "uri://b")).is_err());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(listener.events.lock().unwrap().len(), events_at_release);
}
