//! Unified search over the archive: engine cache resolution, staged-mutation
//! overlay, mode dispatch, and reciprocal-rank fusion.
//!
//! The entrypoint refuses empty queries, pushes the id allowlist down into
//! the engines, post-filters everything else, and never returns a frame that
//! is deleted or superseded in the requested view.

pub mod cache;
pub mod fusion;

use std::collections::BTreeSet;
use std::time::Instant;

use crate::error::{ArchiveError, Result};
use crate::lex::LexIndex;
use crate::types::frame::{Frame, FrameId, FrameStatus};
use crate::types::search::{
    FrameFilter, ResultSource, SearchHit, SearchMode, SearchRequest, SearchResponse,
    VecEngineKind, VecEnginePreference,
};
use crate::vec::{self, CpuVecEngine, Similarity, VecArtifact, VecEngine};

use crate::archive::Archive;
use cache::{EngineCache, TextSourceKey, VectorSourceKey};
use fusion::{FusedHit, rrf_fuse};

const SNIPPET_CHARS: usize = 160;

impl Archive {
    /// Search the archive. The default view is the union of committed and
    /// staged state; `committed_only` restricts to the live TOC.
    pub fn search(&mut self, request: SearchRequest) -> Result<SearchResponse> {
        let start = Instant::now();
        let wants_text = !matches!(request.mode, SearchMode::VectorOnly);
        let wants_vector = !matches!(request.mode, SearchMode::TextOnly);

        if wants_text && !wants_vector && request.query.trim().is_empty() {
            return Err(ArchiveError::InvalidQuery {
                reason: "text search requires a non-empty query".into(),
            });
        }
        if wants_vector && !wants_text && request.embedding.is_none() {
            return Err(ArchiveError::InvalidQuery {
                reason: "vector search requires a query embedding".into(),
            });
        }
        if request.top_k == 0 {
            return Ok(SearchResponse::default());
        }

        // Over-fetch when a post-filter will thin the candidate set.
        let fetch_k = if request.filter.is_empty() {
            request.top_k
        } else {
            vec::validate_top_k(request.top_k.saturating_mul(4))
        };
        let allow = request.filter.id_allowlist.clone();

        let run_text = wants_text && !request.query.trim().is_empty();
        let text_hits = if run_text {
            self.text_lane(&request, fetch_k, allow.as_ref())?
        } else {
            Vec::new()
        };

        let mut vec_engine_kind = None;
        let vector_hits = match (&request.embedding, wants_vector) {
            (Some(embedding), true) => {
                let (hits, kind) = self.vector_lane(&request, embedding, fetch_k, allow.as_ref())?;
                vec_engine_kind = kind;
                hits
            }
            _ => Vec::new(),
        };

        let fused = match request.mode {
            SearchMode::TextOnly => single_lane(&text_hits, ResultSource::Text),
            SearchMode::VectorOnly => single_lane(&vector_hits, ResultSource::Vector),
            SearchMode::Hybrid { alpha } => rrf_fuse(&text_hits, &vector_hits, alpha),
        };
        let total_candidates = fused.len();

        let mut hits = Vec::with_capacity(request.top_k);
        for candidate in fused {
            if hits.len() >= request.top_k {
                break;
            }
            let Some(frame) = self.visible_frame(candidate.frame_id, request.committed_only) else {
                continue;
            };
            if !passes_filter(&frame, &request.filter) {
                continue;
            }
            let snippet = if candidate.sources.contains(&ResultSource::Text) {
                frame
                    .search_text
                    .as_deref()
                    .map(|text| text.chars().take(SNIPPET_CHARS).collect())
            } else {
                None
            };
            hits.push(SearchHit {
                frame_id: candidate.frame_id,
                score: candidate.score,
                sources: candidate.sources,
                snippet,
            });
        }

        Ok(SearchResponse {
            hits,
            total_candidates,
            vec_engine: vec_engine_kind,
            elapsed_ms: start.elapsed().as_millis(),
        })
    }

    /// Frame visible to search in the requested view, or `None`.
    fn visible_frame(&self, frame_id: FrameId, committed_only: bool) -> Option<Frame> {
        if committed_only {
            let &row = self.frame_rows.get(&frame_id)?;
            let frame = self.frames[row].clone();
            return frame.is_searchable().then_some(frame);
        }
        let frame = self.frame_meta(frame_id).ok()?;
        frame.is_searchable().then_some(frame)
    }

    // -- Text lane ----------------------------------------------------------

    fn text_lane(
        &mut self,
        request: &SearchRequest,
        fetch_k: usize,
        allow: Option<&BTreeSet<FrameId>>,
    ) -> Result<Vec<(FrameId, f32)>> {
        if request.committed_only {
            let Some(index) = self.open_committed_lex_read_only()? else {
                return Ok(Vec::new());
            };
            return Ok(collect_lex(&index, &request.query, fetch_k, allow));
        }

        let slot = cache::cache_for(&self.identity());
        let mut guard = slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        self.resolve_text_engine(&mut guard)?;
        let Some(index) = guard.text_engine.as_ref() else {
            return Ok(Vec::new());
        };
        Ok(collect_lex(index, &request.query, fetch_k, allow))
    }

    fn current_text_key(&self) -> TextSourceKey {
        if let Some(staged) = &self.staged_lex {
            TextSourceKey::Staged { stamp: staged.stamp }
        } else if self.slot.lex.is_present() {
            TextSourceKey::Committed {
                checksum: self.slot.lex.checksum,
            }
        } else {
            TextSourceKey::Empty
        }
    }

    /// Bring the cached text engine up to the current source key and staged
    /// watermark.
    fn resolve_text_engine(&mut self, cached: &mut EngineCache) -> Result<()> {
        let want = self.current_text_key();
        let latest_seq = self.pending.ops.last().map_or(0, |(seq, _)| *seq);

        let stale = cached.text_key != want
            || cached.text_engine.is_none()
            || cached.text_applied_seq > latest_seq;
        if stale {
            let base = match want {
                TextSourceKey::Empty => LexIndex::new(),
                TextSourceKey::Committed { .. } => {
                    if self.pending.is_empty() {
                        // Reader hot path: mmap-backed, no copy.
                        self.open_committed_lex_read_only()?
                            .unwrap_or_else(LexIndex::new)
                    } else {
                        self.materialize_committed_lex()?.unwrap_or_default()
                    }
                }
                TextSourceKey::Staged { .. } => {
                    let bytes = self
                        .staged_lex
                        .as_ref()
                        .map(|s| s.bytes.clone())
                        .unwrap_or_default();
                    LexIndex::deserialize(&bytes)?
                }
            };
            cached.text_key = want;
            cached.text_engine = Some(base);
            cached.text_applied_seq = 0;
        }

        // Fold in staged ops past the watermark.
        let pending_ops: Vec<(u64, crate::archive::PendingOpView)> = self
            .pending_text_ops(cached.text_applied_seq);
        if pending_ops.is_empty() {
            return Ok(());
        }
        let engine = cached.text_engine.as_mut().ok_or_else(|| ArchiveError::Encoding {
            reason: "text engine missing after resolution".into(),
        })?;
        if engine.is_read_only() {
            *engine = engine.to_mutable()?;
        }
        for (seq, op) in pending_ops {
            match op {
                crate::archive::PendingOpView::Index { frame_id, text } => {
                    engine.index(frame_id, &text)?;
                }
                crate::archive::PendingOpView::Remove { frame_id } => {
                    engine.remove(frame_id)?;
                }
            }
            cached.text_applied_seq = seq;
        }
        Ok(())
    }

    // -- Vector lane --------------------------------------------------------

    fn vector_lane(
        &mut self,
        request: &SearchRequest,
        embedding: &[f32],
        fetch_k: usize,
        allow: Option<&BTreeSet<FrameId>>,
    ) -> Result<(Vec<(FrameId, f32)>, Option<VecEngineKind>)> {
        if request.committed_only {
            let Some(artifact) = self.committed_vec_artifact()? else {
                return Ok((Vec::new(), None));
            };
            let mut engine = CpuVecEngine::from_artifact(&artifact)?;
            let hits = engine.search_filtered(embedding, fetch_k, allow)?;
            return Ok((hits, Some(VecEngineKind::Cpu)));
        }

        let slot = cache::cache_for(&self.identity());
        let mut guard = slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        self.resolve_vec_engine(&mut guard, request.engine_preference, request.top_k)?;
        let Some(engine) = guard.vec_engine.as_mut() else {
            return Ok((Vec::new(), None));
        };
        let kind = engine.kind();
        let hits = engine.search_filtered(embedding, fetch_k, allow)?;
        Ok((hits, Some(kind)))
    }

    fn current_vec_key(&self, kind: VecEngineKind) -> Result<VectorSourceKey> {
        if let Some(staged) = &self.staged_vec {
            return Ok(VectorSourceKey::Staged {
                stamp: staged.stamp,
                similarity: staged.similarity,
                dims: staged.dimension,
                kind,
            });
        }
        if self.slot.vec.is_present() {
            let (similarity, dims) = self.committed_vec_shape()?;
            return Ok(VectorSourceKey::Committed {
                checksum: self.slot.vec.checksum,
                similarity,
                dims,
                kind,
            });
        }
        if !self.pending.embeddings.is_empty() {
            let dims = self.pending.embeddings[0].vector.len() as u32;
            return Ok(VectorSourceKey::PendingOnly { dims, kind });
        }
        Ok(VectorSourceKey::None)
    }

    fn resolve_vec_engine(
        &mut self,
        cached: &mut EngineCache,
        preference: VecEnginePreference,
        top_k: usize,
    ) -> Result<()> {
        let count_hint = self.frames.len() + self.pending.frames.len();
        let desired_kind = *vec::engine_order(preference, count_hint, top_k)
            .iter()
            .find(|kind| **kind == VecEngineKind::Cpu || vec::gpu_available())
            .unwrap_or(&VecEngineKind::Cpu);
        let want = self.current_vec_key(desired_kind)?;

        if want == VectorSourceKey::None {
            cached.reset_vec();
            return Ok(());
        }

        let diff_latest = self.pending.latest_embedding_sequence();
        let went_backwards = cached.last_pending_embedding_sequence > diff_latest;
        if cached.vec_key != want || cached.vec_engine.is_none() || went_backwards {
            let artifact = match want {
                VectorSourceKey::Staged { .. } => {
                    let bytes = self
                        .staged_vec
                        .as_ref()
                        .map(|s| s.bytes.clone())
                        .unwrap_or_default();
                    VecArtifact::decode(&bytes)?
                }
                VectorSourceKey::Committed { .. } => self
                    .committed_vec_artifact()?
                    .ok_or_else(|| ArchiveError::InvalidToc {
                        reason: "vector manifest vanished during resolution".into(),
                    })?,
                VectorSourceKey::PendingOnly { dims, .. } => {
                    VecArtifact::empty(dims, Similarity::Cosine)
                }
                VectorSourceKey::None => unreachable!("handled above"),
            };
            cached.vec_engine = Some(vec::build_engine(&artifact, preference, top_k)?);
            cached.vec_key = want;
            cached.last_pending_embedding_sequence = 0;
        }

        let diff =
            self.pending_embedding_mutations(Some(cached.last_pending_embedding_sequence));
        if !diff.embeddings.is_empty() {
            let engine = cached.vec_engine.as_mut().ok_or_else(|| ArchiveError::Encoding {
                reason: "vector engine missing after resolution".into(),
            })?;
            for embedding in &diff.embeddings {
                engine.add(embedding.frame_id, &embedding.vector)?;
            }
        }
        cached.last_pending_embedding_sequence = diff.latest_sequence;
        Ok(())
    }
}

fn collect_lex(
    index: &LexIndex,
    query: &str,
    fetch_k: usize,
    allow: Option<&BTreeSet<FrameId>>,
) -> Vec<(FrameId, f32)> {
    index
        .search(query, fetch_k, allow)
        .into_iter()
        .map(|hit| (hit.frame_id, hit.score))
        .collect()
}

fn single_lane(hits: &[(FrameId, f32)], source: ResultSource) -> Vec<FusedHit> {
    hits.iter()
        .map(|(frame_id, score)| FusedHit {
            frame_id: *frame_id,
            score: *score,
            sources: [source].into_iter().collect(),
        })
        .collect()
}

/// Deterministic, commutative post-filter; engines already honored the id
/// allowlist.
fn passes_filter(frame: &Frame, filter: &FrameFilter) -> bool {
    if let Some(kinds) = &filter.kinds {
        if !kinds.iter().any(|kind| kind == &frame.kind) {
            return false;
        }
    }
    if let Some((start, end)) = filter.time_range {
        if frame.timestamp_ms < start || frame.timestamp_ms >= end {
            return false;
        }
    }
    if let Some(status) = filter.status {
        if frame.status != status {
            return false;
        }
    } else if frame.status != FrameStatus::Active {
        return false;
    }
    true
}
