//! Scheduler configuration: the simultaneous-download cap, retry
//! threshold, and default requirements, all overridable by the embedder
//! that constructs a [`crate::DownloadManager`].

use dlvault_core::Requirements;

/// Defaults match the documented defaults: at most one concurrent fetch,
/// a `minRetryCount` of 5, and a network-only requirement.
#[derive(Clone, Debug)]
pub struct DownloadManagerConfig {
    pub max_simultaneous_downloads: u32,
    pub min_retry_count: u32,
    pub requirements: Requirements,
}

impl Default for DownloadManagerConfig {
    fn default() -> Self {
        Self {
            max_simultaneous_downloads: 1,
            min_retry_count: 5,
            requirements: Requirements::network_only(),
        }
    }
}

impl DownloadManagerConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_max_simultaneous_downloads(mut self, max: u32) -> Self {
        self.max_simultaneous_downloads = max;
        self
    }

    #[must_use]
    pub const fn with_min_retry_count(mut self, min_retry_count: u32) -> Self {
        self.min_retry_count = min_retry_count;
        self
    }

    #[must_use]
    pub const fn with_requirements(mut self, requirements: Requirements) -> Self {
        self.requirements = requirements;
        self
    }
}
