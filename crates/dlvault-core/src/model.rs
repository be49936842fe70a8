//! Core data model: the persisted [`DownloadRecord`], the [`Action`] used to
//! add or update one, and the small value types (state, failure reason,
//! requirements bitmask, manual-stop marker) that govern its lifecycle.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Sentinel meaning "no manual stop in effect". Any other value is an
/// opaque reason code chosen by the caller (e.g. distinguishing "user
/// paused" from "app backgrounded"); `NONE` is the only value the
/// scheduler itself interprets.
pub type ManualStopReason = i32;

/// No manual stop in effect.
pub const MANUAL_STOP_REASON_NONE: ManualStopReason = 0;

/// Reserved sentinel for "stopped, but no specific reason was given" —
/// what a caller gets from [`crate::ports::DownloadIndex`] or the
/// scheduler's `stopDownload`/`stopDownloads` when no reason code was
/// supplied. Distinct from `NONE` so "never stopped" and "stopped without
/// a reason" remain distinguishable; application-defined reason codes are
/// expected to start from 1 and never collide with it.
pub const MANUAL_STOP_REASON_UNDEFINED: ManualStopReason = -1;

/// Why a download ended in [`DownloadState::Failed`]. Kept deliberately
/// small: the underlying [`crate::DownloadError`] is logged, but listeners
/// only need to know whether a retry is plausible.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    #[default]
    None,
    Unknown,
}

bitflags! {
    /// Bitmask of externally-gated preconditions that are currently not
    /// met. A `Download` may only run while this is empty; see
    /// `canStart` in the scheduler.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct NotMetRequirements: u32 {
        const NETWORK = 1 << 0;
        const NETWORK_UNMETERED = 1 << 1;
        const CHARGING = 1 << 2;
        const IDLE = 1 << 3;
        const STORAGE_NOT_LOW = 1 << 4;
    }
}

/// The set of requirements a caller wants enforced. Passed to
/// [`crate::ports::RequirementsWatcher::start`], which reports back
/// whichever of these are currently not met as a [`NotMetRequirements`]
/// mask.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirements {
    pub network: bool,
    pub network_unmetered: bool,
    pub charging: bool,
    pub idle: bool,
    pub storage_not_low: bool,
}

impl Requirements {
    /// Default requirements: require *some* network connection and
    /// nothing else, matching the documented default.
    #[must_use]
    pub const fn network_only() -> Self {
        Self {
            network: true,
            network_unmetered: false,
            charging: false,
            idle: false,
            storage_not_low: false,
        }
    }
}

/// Lifecycle state of a [`DownloadRecord`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    Queued,
    Stopped,
    Downloading,
    Completed,
    Failed,
    Removing,
    Restarting,
    Removed,
}

impl DownloadState {
    /// `completed`, `failed`, and `removed` are terminal: no further
    /// worker will ever run for a record in one of these states.
    #[must_use]
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Removed)
    }
}

/// `canStart() == manualStopReason == NONE && notMetRequirements == 0`
/// (spec §3), shared by [`DownloadRecord::can_start`] and the scheduler's
/// own in-memory `Download` so the two never drift.
#[must_use]
pub fn can_start(manual_stop_reason: ManualStopReason, not_met_requirements: NotMetRequirements) -> bool {
    manual_stop_reason == MANUAL_STOP_REASON_NONE && not_met_requirements.is_empty()
}

/// A request to add a new download or update an existing one's content
/// (uri/cache key/stream keys/custom metadata). Mirrors the wire shape
/// callers of `addDownload` pass in.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
    pub kind: String,
    pub uri: String,
    pub cache_key: Option<String>,
    pub stream_keys: Vec<String>,
    #[serde(with = "serde_bytes_as_base64")]
    pub custom_metadata: Vec<u8>,
}

impl Action {
    #[must_use]
    pub fn new(id: impl Into<String>, kind: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            uri: uri.into(),
            cache_key: None,
            stream_keys: Vec::new(),
            custom_metadata: Vec::new(),
        }
    }
}

/// A download's persisted, durable record: the unit of truth the
/// [`crate::ports::DownloadIndex`] stores and the scheduler rehydrates on
/// `load`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub id: String,
    pub kind: String,
    pub uri: String,
    pub cache_key: Option<String>,
    pub stream_keys: Vec<String>,
    #[serde(with = "serde_bytes_as_base64")]
    pub custom_metadata: Vec<u8>,
    pub state: DownloadState,
    pub failure_reason: FailureReason,
    pub not_met_requirements: NotMetRequirements,
    pub manual_stop_reason: ManualStopReason,
    pub start_time_ms: i64,
    pub update_time_ms: i64,
}

impl DownloadRecord {
    /// `canStart() == manualStopReason == NONE && notMetRequirements == 0`.
    #[must_use]
    pub fn can_start(&self) -> bool {
        can_start(self.manual_stop_reason, self.not_met_requirements)
    }

    /// Merge an [`Action`]'s content into this record: union `stream_keys`
    /// by value preserving first-seen order, replace uri/cache
    /// key/custom metadata, and bump `update_time_ms`.
    pub fn apply_action(&mut self, action: &Action, now_ms: i64) {
        self.uri = action.uri.clone();
        self.cache_key = action.cache_key.clone();
        self.custom_metadata = action.custom_metadata.clone();
        for key in &action.stream_keys {
            if !self.stream_keys.contains(key) {
                self.stream_keys.push(key.clone());
            }
        }
        self.update_time_ms = now_ms;
    }

    #[must_use]
    pub fn from_action(action: &Action, now_ms: i64) -> Self {
        Self {
            id: action.id.clone(),
            kind: action.kind.clone(),
            uri: action.uri.clone(),
            cache_key: action.cache_key.clone(),
            stream_keys: action.stream_keys.clone(),
            custom_metadata: action.custom_metadata.clone(),
            state: DownloadState::Queued,
            failure_reason: FailureReason::None,
            not_met_requirements: NotMetRequirements::empty(),
            manual_stop_reason: MANUAL_STOP_REASON_NONE,
            start_time_ms: now_ms,
            update_time_ms: now_ms,
        }
    }
}

mod serde_bytes_as_base64 {
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
