#![deny(unused_crate_dependencies)]

//! The scheduler (C2-C7): a single-threaded event loop, rendered as a
//! `tokio` actor, that owns every download's lifecycle, its active
//! worker table, and the durable index. See [`DownloadManager`] for the
//! embedder-facing entry point.

pub mod config;
mod command;
mod controller;
mod download;
pub mod error;
mod listener;
mod progress;
mod scheduler;
mod worker;

pub use config::DownloadManagerConfig;
pub use controller::{DownloadManager, build_download_manager};
pub use error::ControllerError;
pub use listener::{DownloadManagerListener, NoopListener};
pub use progress::ProgressThrottle;

#[cfg(test)]
use mockall as _;
#[cfg(test)]
use tempfile as _;
#[cfg(test)]
use tokio_test as _;
