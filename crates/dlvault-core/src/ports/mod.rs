//! Port definitions (trait abstractions) for external systems the
//! scheduler depends on.
//!
//! Ports define the interfaces the core domain expects from
//! infrastructure. They contain no implementation details and use only
//! domain types.
//!
//! # Design Rules
//!
//! - No `sqlx` types in any signature
//! - No process/filesystem implementation details
//! - Traits are minimal and CRUD-focused

pub mod downloader;
pub mod index;
pub mod requirements_watcher;

pub use downloader::{DownloadCounters, Downloader, DownloaderFactory};
pub use index::DownloadIndex;
pub use requirements_watcher::{RequirementsListener, RequirementsWatcher};
