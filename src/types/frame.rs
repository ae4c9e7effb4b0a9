//! Frame metadata: the atomic unit stored in the archive.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub type FrameId = u64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameStatus {
    #[default]
    Active,
    /// Hidden from search; payload bytes are retained until compaction.
    Deleted,
}

/// Determines search eligibility: blobs are never indexed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameRole {
    Chunk,
    #[default]
    Document,
    System,
    Blob,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CanonicalEncoding {
    #[default]
    Plain,
    Zstd,
}

/// Compression level of a surrogate frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tier {
    Full,
    Gist,
    Micro,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub id: FrameId,
    /// Capture time of the underlying event, not ingest time.
    pub timestamp_ms: i64,
    pub status: FrameStatus,
    /// Dot-namespaced kind, e.g. `photo.root`, `video.segment`, `surrogate`.
    pub kind: String,
    pub role: FrameRole,
    pub parent_id: Option<FrameId>,
    pub supersedes: Option<FrameId>,
    pub superseded_by: Option<FrameId>,
    pub search_text: Option<String>,
    pub encoding: CanonicalEncoding,
    pub payload_offset: u64,
    pub payload_length: u64,
    pub uri: Option<String>,
    pub title: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// crc32 of the payload bytes as stored (post-compression).
    pub payload_checksum: u32,
}

impl Frame {
    /// A frame is a search candidate when it is active, not superseded, and
    /// its role admits indexing.
    #[must_use]
    pub fn is_searchable(&self) -> bool {
        self.status == FrameStatus::Active
            && self.superseded_by.is_none()
            && self.role != FrameRole::Blob
    }
}

/// Aggregate counters for dashboards and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub frame_count: u64,
    pub active_count: u64,
    pub pending_frame_count: u64,
    pub pending_embedding_count: u64,
    pub has_lex_index: bool,
    pub has_vec_index: bool,
    pub committed_seq: u64,
    pub logical_stamp: u64,
}

/// One row of the chronological listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineEntry {
    pub frame_id: FrameId,
    pub timestamp_ms: i64,
    pub kind: String,
    pub preview: String,
}

/// Bounds for [`crate::archive::Archive::timeline`]; default lists everything
/// oldest-first.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimelineQuery {
    pub limit: Option<usize>,
    pub since_ms: Option<i64>,
    pub until_ms: Option<i64>,
    pub reverse: bool,
}
