//! Process-wide engine cache keyed by archive identity.
//!
//! Holds the most recently materialized text and vector engines per archive.
//! Validity keys are derived from committed-artifact checksums (or staged
//! stamps), so a commit naturally invalidates the cache; staged mutations are
//! layered on incrementally via sequence watermarks.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use crate::lex::LexIndex;
use crate::types::search::VecEngineKind;
use crate::vec::{Similarity, VecEngine};

/// Canonical path plus creation stamp; stable across commits, distinct
/// across re-created files at the same path.
pub type ArchiveIdentity = (PathBuf, u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextSourceKey {
    #[default]
    Empty,
    Committed {
        checksum: u64,
    },
    Staged {
        stamp: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VectorSourceKey {
    #[default]
    None,
    PendingOnly {
        dims: u32,
        kind: VecEngineKind,
    },
    Committed {
        checksum: u64,
        similarity: Similarity,
        dims: u32,
        kind: VecEngineKind,
    },
    Staged {
        stamp: u64,
        similarity: Similarity,
        dims: u32,
        kind: VecEngineKind,
    },
}

#[derive(Default)]
pub struct EngineCache {
    pub text_key: TextSourceKey,
    pub text_engine: Option<LexIndex>,
    /// WAL sequence of the last staged op folded into the text engine.
    pub text_applied_seq: u64,
    pub vec_key: VectorSourceKey,
    pub vec_engine: Option<Box<dyn VecEngine>>,
    /// Watermark for the pending-embedding diff protocol. Reset when the
    /// sequence goes backwards (a commit wiped the pending list).
    pub last_pending_embedding_sequence: u64,
}

impl EngineCache {
    pub fn reset_text(&mut self) {
        self.text_key = TextSourceKey::Empty;
        self.text_engine = None;
        self.text_applied_seq = 0;
    }

    pub fn reset_vec(&mut self) {
        self.vec_key = VectorSourceKey::None;
        self.vec_engine = None;
        self.last_pending_embedding_sequence = 0;
    }
}

static REGISTRY: Lazy<Mutex<HashMap<ArchiveIdentity, Arc<Mutex<EngineCache>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Fetch or create the cache slot for an archive. Multiple archives coexist
/// without interference.
pub fn cache_for(identity: &ArchiveIdentity) -> Arc<Mutex<EngineCache>> {
    let mut registry = REGISTRY.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    registry
        .entry(identity.clone())
        .or_insert_with(|| Arc::new(Mutex::new(EngineCache::default())))
        .clone()
}

/// Drop the cache slot; driven by archive close.
pub fn evict(identity: &ArchiveIdentity) {
    let mut registry = REGISTRY.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    registry.remove(identity);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_slots_are_independent() {
        let a = (PathBuf::from("/tmp/a.wv2"), 1u64);
        let b = (PathBuf::from("/tmp/b.wv2"), 1u64);
        let slot_a = cache_for(&a);
        let slot_b = cache_for(&b);
        slot_a.lock().expect("a").text_applied_seq = 42;
        assert_eq!(slot_b.lock().expect("b").text_applied_seq, 0);
        assert_eq!(slot_a.lock().expect("a2").text_applied_seq, 42);
        evict(&a);
        assert_eq!(cache_for(&a).lock().expect("a3").text_applied_seq, 0);
        evict(&b);
    }
}
