//! Builder-style options for writing frames and the archive-open
//! configuration surface.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::frame::{CanonicalEncoding, FrameId, FrameRole};
use crate::constants::DEFAULT_WAL_SIZE;

/// When the WAL forces dirty bytes to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalFsyncPolicy {
    /// fsync only at commit boundaries.
    OnCommit,
    /// fsync whenever dirty bytes reach the threshold.
    EveryNBytes(u64),
    /// fsync after every append.
    EveryRecord,
}

impl Default for WalFsyncPolicy {
    fn default() -> Self {
        Self::OnCommit
    }
}

/// Pressure policy: commit synchronously before the ring stalls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProactiveCommitPolicy {
    /// Trigger when pending bytes reach this share of the ring; `None`
    /// disables the policy.
    pub threshold_percent: Option<u8>,
    /// Only apply the threshold while the ring is at most this large.
    pub max_wal_size_bytes: Option<u64>,
    /// Floor below which the policy never triggers.
    pub min_pending_bytes: u64,
}

impl Default for ProactiveCommitPolicy {
    fn default() -> Self {
        Self {
            threshold_percent: Some(75),
            max_wal_size_bytes: None,
            min_pending_bytes: 64 * 1024,
        }
    }
}

/// Advisory QoS hint for the caller's I/O scheduling; the core does not
/// interpret it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IoQueueQos {
    #[default]
    Default,
    Utility,
    Background,
}

/// Options consumed once at archive create/open.
#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    pub wal_size_bytes: u64,
    pub wal_fsync_policy: WalFsyncPolicy,
    pub wal_proactive_commit: ProactiveCommitPolicy,
    pub wal_replay_state_snapshot_enabled: bool,
    /// Expected embedding dimension; 0 until the first embedding fixes it.
    pub dimension_hint: u32,
    pub io_queue_label: String,
    pub io_queue_qos: IoQueueQos,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            wal_size_bytes: DEFAULT_WAL_SIZE,
            wal_fsync_policy: WalFsyncPolicy::default(),
            wal_proactive_commit: ProactiveCommitPolicy::default(),
            wal_replay_state_snapshot_enabled: true,
            dimension_hint: 0,
            io_queue_label: "wv2.io".to_string(),
            io_queue_qos: IoQueueQos::default(),
        }
    }
}

/// Options for `rewrite_live_set`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompactionOptions {
    /// Zero the payload bytes of deleted and superseded frames in the
    /// destination while preserving their metadata and ids.
    pub zero_dead_payloads: bool,
}

/// Tunable options for writing a frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutOptions {
    pub timestamp_ms: Option<i64>,
    pub kind: Option<String>,
    #[serde(default)]
    pub role: FrameRole,
    #[serde(default)]
    pub parent_id: Option<FrameId>,
    #[serde(default)]
    pub search_text: Option<String>,
    #[serde(default)]
    pub encoding: CanonicalEncoding,
    pub uri: Option<String>,
    pub title: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Default for PutOptions {
    fn default() -> Self {
        Self {
            timestamp_ms: None,
            kind: None,
            role: FrameRole::default(),
            parent_id: None,
            search_text: None,
            encoding: CanonicalEncoding::default(),
            uri: None,
            title: None,
            metadata: BTreeMap::new(),
        }
    }
}

impl PutOptions {
    #[must_use]
    pub fn builder() -> PutOptionsBuilder {
        PutOptionsBuilder::default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PutOptionsBuilder {
    inner: PutOptions,
}

impl PutOptionsBuilder {
    #[must_use]
    pub fn timestamp_ms(mut self, timestamp_ms: i64) -> Self {
        self.inner.timestamp_ms = Some(timestamp_ms);
        self
    }

    pub fn kind<S: Into<String>>(mut self, kind: S) -> Self {
        self.inner.kind = Some(kind.into());
        self
    }

    #[must_use]
    pub fn role(mut self, role: FrameRole) -> Self {
        self.inner.role = role;
        self
    }

    #[must_use]
    pub fn parent(mut self, parent_id: FrameId) -> Self {
        self.inner.parent_id = Some(parent_id);
        self
    }

    pub fn search_text<S: Into<String>>(mut self, text: S) -> Self {
        self.inner.search_text = Some(text.into());
        self
    }

    #[must_use]
    pub fn encoding(mut self, encoding: CanonicalEncoding) -> Self {
        self.inner.encoding = encoding;
        self
    }

    pub fn uri<S: Into<String>>(mut self, uri: S) -> Self {
        self.inner.uri = Some(uri.into());
        self
    }

    pub fn title<S: Into<String>>(mut self, title: S) -> Self {
        self.inner.title = Some(title.into());
        self
    }

    pub fn metadata_entry<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.inner.metadata.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn build(self) -> PutOptions {
        self.inner
    }
}
