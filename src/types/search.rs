//! Request/response types for the unified search surface.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::frame::{FrameId, FrameStatus};

/// Which engine family served a vector query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VecEngineKind {
    Cpu,
    Gpu,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VecEnginePreference {
    CpuOnly,
    GpuPreferred,
    #[default]
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SearchMode {
    TextOnly,
    VectorOnly,
    /// Reciprocal-rank fusion of both lanes; `alpha` weights the text lane.
    Hybrid { alpha: f32 },
}

impl Default for SearchMode {
    fn default() -> Self {
        Self::Hybrid { alpha: 0.5 }
    }
}

/// Which lanes contributed a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResultSource {
    Text,
    Vector,
    Timeline,
    Structured,
}

/// Deterministic, commutative result filter. The id allowlist is pushed down
/// into the engines; the rest is applied after scoring.
#[derive(Debug, Clone, Default)]
pub struct FrameFilter {
    pub kinds: Option<Vec<String>>,
    pub id_allowlist: Option<BTreeSet<FrameId>>,
    /// Half-open capture-time range `[start_ms, end_ms)`.
    pub time_range: Option<(i64, i64)>,
    pub status: Option<FrameStatus>,
}

impl FrameFilter {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.kinds.is_none()
            && self.id_allowlist.is_none()
            && self.time_range.is_none()
            && self.status.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub query: String,
    pub embedding: Option<Vec<f32>>,
    pub mode: SearchMode,
    pub top_k: usize,
    pub filter: FrameFilter,
    /// Restrict to the committed view, ignoring staged mutations.
    pub committed_only: bool,
    pub engine_preference: VecEnginePreference,
}

impl SearchRequest {
    #[must_use]
    pub fn text<S: Into<String>>(query: S, top_k: usize) -> Self {
        Self {
            query: query.into(),
            mode: SearchMode::TextOnly,
            top_k,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn vector(embedding: Vec<f32>, top_k: usize) -> Self {
        Self {
            embedding: Some(embedding),
            mode: SearchMode::VectorOnly,
            top_k,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn hybrid<S: Into<String>>(query: S, embedding: Vec<f32>, top_k: usize) -> Self {
        Self {
            query: query.into(),
            embedding: Some(embedding),
            mode: SearchMode::default(),
            top_k,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub frame_id: FrameId,
    pub score: f32,
    pub sources: BTreeSet<ResultSource>,
    /// Snippet hint from the lexical lane, when that lane matched.
    pub snippet: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,
    pub total_candidates: usize,
    /// Engine family that served the vector lane, when one ran.
    pub vec_engine: Option<VecEngineKind>,
    pub elapsed_ms: u128,
}
