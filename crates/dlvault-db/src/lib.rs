#![deny(unsafe_code)]

//! `SQLite`-backed [`dlvault_core::DownloadIndex`] implementation, plus an
//! in-memory one for tests and embedders that don't need durability.

pub mod memory;
pub mod repositories;
pub mod setup;

pub use memory::InMemoryDownloadIndex;
pub use repositories::SqliteDownloadIndex;
pub use setup::{setup_database, setup_test_database};
