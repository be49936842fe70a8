//! `dlvaultctl`: a small composition-root binary for exercising a
//! [`dlvault_scheduler::DownloadManager`] from a terminal. Wires together
//! an index (in-memory by default, `SQLite` with `--db`), a synthetic
//! `Downloader` that sleeps and fails on a schedule, and a no-op
//! `RequirementsWatcher` — there is no real network or filesystem I/O
//! behind any of it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

use dlvault_core::{
    Action, DownloadCounters, DownloadError, DownloadIndex, DownloadRecord, Downloader,
    DownloaderFactory, NotMetRequirements, RequirementsListener, RequirementsWatcher, Requirements,
};
use dlvault_db::{InMemoryDownloadIndex, SqliteDownloadIndex, setup_database};
use dlvault_scheduler::{DownloadManager, DownloadManagerConfig, DownloadManagerListener};

#[derive(Parser)]
#[command(name = "dlvaultctl")]
#[command(about = "Exercise a download scheduler from the command line")]
struct Cli {
    /// Persist to a `SQLite` file instead of an in-memory index.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Maximum concurrent fetch workers.
    #[arg(long, default_value_t = 2, global = true)]
    max_concurrent: u32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add (or update) a download and wait for it to reach a terminal state.
    Add {
        id: String,
        uri: String,
        /// Name containing "flaky" to exercise the retry/backoff path.
        #[arg(long, default_value = "demo")]
        kind: String,
    },
    /// List every non-terminal download and its state.
    List,
    /// Set a manual stop reason on one download. Omit `reason` to stop
    /// without a specific reason (`UNDEFINED`).
    Stop { id: String, reason: Option<i32> },
    /// Clear a download's manual stop reason.
    Start { id: String },
}

/// A synthetic [`Downloader`]: no network or disk I/O, just a sleep loop
/// that reports progress and fails on a per-id attempt schedule.
struct SyntheticDownloader {
    id: String,
    attempt: u32,
    cancelled: Arc<AtomicBool>,
    bytes: AtomicU64,
}

const CHUNKS: u64 = 5;
const CHUNK_BYTES: u64 = 1 << 20;

impl Downloader for SyntheticDownloader {
    fn download(&self, on_progress: &dyn Fn(u64) + Send + Sync) -> Result<(), DownloadError> {
        let should_fail = self.id.contains("flaky") && self.attempt <= 2;
        for chunk in 1..=CHUNKS {
            if self.cancelled.load(Ordering::Acquire) {
                return Err(DownloadError::Cancelled);
            }
            std::thread::sleep(Duration::from_millis(150));
            let downloaded = chunk * CHUNK_BYTES;
            self.bytes.store(downloaded, Ordering::Release);
            on_progress(downloaded);
        }
        if should_fail {
            return Err(DownloadError::network("simulated transient failure", Some(503)));
        }
        Ok(())
    }

    fn remove(&self) -> Result<(), DownloadError> {
        Ok(())
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
            bytes_total: Some(CHUNKS * CHUNK_BYTES),
        }
    }
}

/// Hands out a fresh [`SyntheticDownloader`] per admission, tracking how
/// many times each id has been attempted so "flaky" ids eventually
/// succeed instead of failing forever.
struct SyntheticDownloaderFactory {
    attempts: Mutex<HashMap<String, u32>>,
}

impl DownloaderFactory for SyntheticDownloaderFactory {
    fn create_downloader(&self, record: &DownloadRecord) -> Arc<dyn Downloader> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let count = attempts.entry(record.id.clone()).or_insert(0);
            *count += 1;
            *count
        };
        Arc::new(SyntheticDownloader {
            id: record.id.clone(),
            attempt,
            cancelled: Arc::new(AtomicBool::new(false)),
            bytes: AtomicU64::new(0),
        })
    }
}

/// Reports every requirement as met, always. There is no real network or
/// power state to observe in this demo binary.
struct NoopRequirementsWatcher;

impl RequirementsWatcher for NoopRequirementsWatcher {
    fn start(&self, _requirements: Requirements, _listener: Arc<dyn RequirementsListener>) -> NotMetRequirements {
        NotMetRequirements::empty()
    }

    fn stop(&self) {}
}

/// Prints every lifecycle event to stdout.
struct PrintingListener;

impl DownloadManagerListener for PrintingListener {
    fn on_initialized(&self) {
        println!("scheduler initialized");
    }

    fn on_download_state_changed(&self, record: &DownloadRecord) {
        println!("{}: {:?}", record.id, record.state);
    }

    fn on_idle(&self) {
        println!("scheduler idle");
    }
}

async fn build_index(db: Option<PathBuf>) -> Result<Arc<dyn DownloadIndex>> {
    match db {
        Some(path) => {
            let pool = setup_database(&path).await?;
            Ok(Arc::new(SqliteDownloadIndex::new(pool)))
        }
        None => Ok(Arc::new(InMemoryDownloadIndex::new())),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let index = build_index(cli.db).await?;
    let factory = Arc::new(SyntheticDownloaderFactory {
        attempts: Mutex::new(HashMap::new()),
    });
    let config = DownloadManagerConfig::new().with_max_simultaneous_downloads(cli.max_concurrent);
    let manager = DownloadManager::new(index, factory, Arc::new(NoopRequirementsWatcher), config);
    manager.add_listener(Arc::new(PrintingListener));

    // Give `load()` a moment to finish its startup scan before dispatching.
    tokio::time::sleep(Duration::from_millis(20)).await;

    match cli.command {
        Commands::Add { id, uri, kind } => {
            manager.add_download(Action::new(id, kind, uri))?;
            loop {
                tokio::time::sleep(Duration::from_millis(100)).await;
                if manager.is_idle() && manager.all_download_states().is_empty() {
                    break;
                }
            }
        }
        Commands::List => {
            for (id, state) in manager.all_download_states() {
                println!("{id}: {state:?}");
            }
        }
        Commands::Stop { id, reason } => {
            manager.stop_download(id, reason)?;
        }
        Commands::Start { id } => {
            manager.start_download(id)?;
        }
    }

    manager.release().await;
    Ok(())
}
