//! Reciprocal Rank Fusion for combining the text and vector lanes.
//!
//! `score(f) = alpha / (k + rank_text) + (1 - alpha) / (k + rank_vec)` with
//! the standard k = 60 (Cormack, Clarke & Buettcher, SIGIR 2009). Ranks are
//! 1-indexed; an absent lane contributes nothing. Ties break by ascending
//! frame id, which makes repeated fusions byte-for-byte identical.

use std::collections::BTreeSet;
use std::collections::HashMap;

use crate::constants::RRF_K;
use crate::types::frame::FrameId;
use crate::types::search::ResultSource;

#[derive(Debug, Clone, PartialEq)]
pub struct FusedHit {
    pub frame_id: FrameId,
    pub score: f32,
    pub sources: BTreeSet<ResultSource>,
}

/// Fuse two ranked lists (already ordered best-first by their own scores).
#[must_use]
pub fn rrf_fuse(
    text: &[(FrameId, f32)],
    vector: &[(FrameId, f32)],
    alpha: f32,
) -> Vec<FusedHit> {
    let mut fused: HashMap<FrameId, FusedHit> = HashMap::new();

    for (rank, (frame_id, _)) in text.iter().enumerate() {
        let contribution = alpha / (RRF_K + (rank + 1) as f32);
        let entry = fused.entry(*frame_id).or_insert_with(|| FusedHit {
            frame_id: *frame_id,
            score: 0.0,
            sources: BTreeSet::new(),
        });
        entry.score += contribution;
        entry.sources.insert(ResultSource::Text);
    }
    for (rank, (frame_id, _)) in vector.iter().enumerate() {
        let contribution = (1.0 - alpha) / (RRF_K + (rank + 1) as f32);
        let entry = fused.entry(*frame_id).or_insert_with(|| FusedHit {
            frame_id: *frame_id,
            score: 0.0,
            sources: BTreeSet::new(),
        });
        entry.score += contribution;
        entry.sources.insert(ResultSource::Vector);
    }

    let mut out: Vec<FusedHit> = fused.into_values().collect();
    out.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.frame_id.cmp(&b.frame_id))
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranked(ids: &[FrameId]) -> Vec<(FrameId, f32)> {
        ids.iter()
            .enumerate()
            .map(|(rank, id)| (*id, 1.0 - rank as f32 * 0.1))
            .collect()
    }

    #[test]
    fn overlap_outranks_single_lane() {
        // Text [A=1, B=2, C=3], vector [C=3, B=2, D=4]: C > B > A = D, and
        // the A/D tie resolves to the lower id.
        let fused = rrf_fuse(&ranked(&[1, 2, 3]), &ranked(&[3, 2, 4]), 0.5);
        let ids: Vec<FrameId> = fused.iter().map(|h| h.frame_id).collect();
        assert_eq!(ids, vec![3, 2, 1, 4]);
    }

    #[test]
    fn symmetric_ranks_fuse_to_equal_scores() {
        let fused = rrf_fuse(&ranked(&[1, 2]), &ranked(&[2, 1]), 0.5);
        assert_eq!(fused.len(), 2);
        assert!((fused[0].score - fused[1].score).abs() < 1e-7);
        assert_eq!(fused[0].frame_id, 1, "tie resolves to the lower id");
    }

    #[test]
    fn alpha_weights_the_text_lane() {
        let text_heavy = rrf_fuse(&ranked(&[1]), &ranked(&[2]), 0.9);
        assert_eq!(text_heavy[0].frame_id, 1);
        let vector_heavy = rrf_fuse(&ranked(&[1]), &ranked(&[2]), 0.1);
        assert_eq!(vector_heavy[0].frame_id, 2);
    }

    #[test]
    fn sources_tag_contributing_lanes() {
        let fused = rrf_fuse(&ranked(&[1, 2]), &ranked(&[2, 3]), 0.5);
        let both = fused.iter().find(|h| h.frame_id == 2).expect("2");
        assert!(both.sources.contains(&ResultSource::Text));
        assert!(both.sources.contains(&ResultSource::Vector));
        let text_only = fused.iter().find(|h| h.frame_id == 1).expect("1");
        assert_eq!(text_only.sources.len(), 1);
    }

    #[test]
    fn empty_lanes_fuse_cleanly() {
        assert!(rrf_fuse(&[], &[], 0.5).is_empty());
        let one_lane = rrf_fuse(&ranked(&[5, 6]), &[], 0.5);
        assert_eq!(
            one_lane.iter().map(|h| h.frame_id).collect::<Vec<_>>(),
            vec![5, 6]
        );
    }

    #[test]
    fn repeated_fusion_is_deterministic() {
        let text = ranked(&[9, 4, 7, 1]);
        let vector = ranked(&[4, 1, 9, 8]);
        let first = rrf_fuse(&text, &vector, 0.5);
        for _ in 0..10 {
            assert_eq!(rrf_fuse(&text, &vector, 0.5), first);
        }
    }
}
