//! Core `Archive` type orchestrating `.wv2` lifecycle, mutations, and reads.

pub mod compact;
pub mod frame;
pub mod lifecycle;
pub mod mutation;

pub use lifecycle::Archive;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::embedding::{Embedding, EmbeddingIdentity};
use crate::types::frame::{Frame, FrameId, FrameStatus};

/// WAL payload for a staged `put`. The frame carries a zero payload offset
/// until commit assigns one in the data region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PutRecord {
    pub frame: Frame,
    /// Payload bytes as stored (post-compression).
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) struct SupersedeRecord {
    pub old_id: FrameId,
    pub new_id: FrameId,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) struct DeleteRecord {
    pub frame_id: FrameId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct EmbedRecord {
    pub frame_id: FrameId,
    pub vector: Vec<f32>,
    pub identity: EmbeddingIdentity,
}

/// Compact committed-state attestation carried by checkpoint records when
/// replay snapshots are enabled.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) struct CheckpointSnapshot {
    pub state_hash: u64,
}

/// A staged-but-uncommitted operation, tagged with its WAL sequence so
/// overlay consumers can apply increments past a watermark.
#[derive(Debug, Clone)]
pub(crate) enum PendingOp {
    Put { frame_id: FrameId },
    Delete { frame_id: FrameId },
    Supersede { old_id: FrameId, new_id: FrameId },
    Embed,
}

/// Text-index effect of a staged op, consumed by the engine-cache overlay.
#[derive(Debug, Clone)]
pub(crate) enum PendingOpView {
    Index { frame_id: FrameId, text: String },
    Remove { frame_id: FrameId },
}

/// In-memory view of everything staged since the last commit, rebuilt from
/// WAL replay on open.
#[derive(Debug, Default)]
pub(crate) struct PendingState {
    /// New frames in replay order.
    pub frames: Vec<Frame>,
    /// Encoded payload bytes for pending frames.
    pub payloads: HashMap<FrameId, Vec<u8>>,
    /// Sequence-tagged op log for incremental overlay application.
    pub ops: Vec<(u64, PendingOp)>,
    /// Status flips staged against committed frames.
    pub status_overrides: HashMap<FrameId, FrameStatus>,
    /// Staged supersede edges, old -> new.
    pub superseded: HashMap<FrameId, FrameId>,
    /// Reverse edges, new -> old.
    pub supersedes: HashMap<FrameId, FrameId>,
    pub embeddings: Vec<Embedding>,
}

impl PendingState {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn latest_embedding_sequence(&self) -> u64 {
        self.embeddings.last().map_or(0, |e| e.sequence)
    }
}

/// Index blob staged out-of-band for the next commit.
#[derive(Debug, Clone)]
pub(crate) struct StagedBlob {
    pub bytes: Vec<u8>,
    pub stamp: u64,
    pub doc_count: u64,
    pub version: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct StagedVecBlob {
    pub bytes: Vec<u8>,
    pub stamp: u64,
    pub vector_count: u64,
    pub dimension: u32,
    pub similarity: crate::vec::Similarity,
}
