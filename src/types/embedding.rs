//! Embedding records staged against frames.

use serde::{Deserialize, Serialize};

/// Which model produced a vector. Stored alongside staged embeddings so a
/// store never silently mixes incompatible vector spaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingIdentity {
    pub provider: String,
    pub model: String,
    pub dimension: u32,
    pub normalized: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub frame_id: u64,
    pub vector: Vec<f32>,
    pub normalized: bool,
    /// Monotone assignment order within the session.
    pub sequence: u64,
}

/// Incremental diff returned by `pending_embedding_mutations`. Consumers track
/// `latest_sequence` and ask only for what is new.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingEmbeddingDiff {
    pub embeddings: Vec<Embedding>,
    pub latest_sequence: u64,
}
