//! Heap-based top-K selection: a min-heap of size K, one linear pass over the
//! score stream, O(n log k). Exact score ties resolve to the lower frame id.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

#[derive(Debug, Clone, Copy)]
struct Candidate {
    score: f32,
    frame_id: u64,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher score wins; on ties the lower frame id ranks higher, so it
        // compares as greater and survives eviction.
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.frame_id.cmp(&self.frame_id))
    }
}

#[derive(Debug)]
pub struct TopK {
    k: usize,
    heap: BinaryHeap<Reverse<Candidate>>,
}

impl TopK {
    #[must_use]
    pub fn new(k: usize) -> Self {
        Self {
            k,
            heap: BinaryHeap::with_capacity(k.saturating_add(1)),
        }
    }

    pub fn push(&mut self, frame_id: u64, score: f32) {
        if self.k == 0 {
            return;
        }
        let candidate = Candidate { score, frame_id };
        if self.heap.len() < self.k {
            self.heap.push(Reverse(candidate));
        } else if self
            .heap
            .peek()
            .is_some_and(|Reverse(worst)| candidate > *worst)
        {
            self.heap.pop();
            self.heap.push(Reverse(candidate));
        }
    }

    /// Drain into final order: score descending, frame id ascending on ties.
    #[must_use]
    pub fn into_sorted(self) -> Vec<(u64, f32)> {
        let mut out: Vec<Candidate> = self.heap.into_iter().map(|Reverse(c)| c).collect();
        out.sort_by(|a, b| b.cmp(a));
        out.into_iter().map(|c| (c.frame_id, c.score)).collect()
    }
}
