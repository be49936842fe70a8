#![deny(unused_crate_dependencies)]

//! Domain types and port traits for a persistent, multi-item download
//! manager: the data model the scheduler operates on, and the contracts
//! the scheduler expects from its collaborators (index, downloader,
//! requirements watcher).

pub mod error;
pub mod model;
pub mod ports;

pub use error::{DownloadError, IndexError};
pub use model::{
    Action, DownloadRecord, DownloadState, FailureReason, ManualStopReason,
    MANUAL_STOP_REASON_UNDEFINED, NotMetRequirements, Requirements, can_start,
};
pub use ports::{
    DownloadCounters, DownloadIndex, Downloader, DownloaderFactory, RequirementsListener,
    RequirementsWatcher,
};

#[cfg(test)]
use mockall as _;
#[cfg(test)]
use tokio as _;
#[cfg(test)]
use tokio_test as _;
