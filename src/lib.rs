#![deny(clippy::all, clippy::pedantic)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
#![cfg_attr(
    test,
    allow(
        clippy::uninlined_format_args,
        clippy::cast_possible_truncation,
        clippy::float_cmp,
        clippy::cast_precision_loss
    )
)]
#![allow(clippy::module_name_repetitions)]
//
// Strategic lint exceptions, allowed project-wide:
//
// Documentation lints: internal helpers are self-documenting; public APIs
// still carry proper docs.
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
//
// Cast safety: casts here are bounded by real-world constraints (file sizes,
// frame counts, ring offsets); try_into everywhere would add noise without
// adding safety.
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_lossless)]
//
// Storage-engine functions are naturally long; splitting them hurts
// readability more than it helps.
#![allow(clippy::too_many_lines)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::similar_names)]
// e.g. frame_id, old_id, new_id are intentionally similar
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::unreadable_literal)] // binary-format magic is clearer as hex
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::map_unwrap_or)]
#![allow(clippy::len_without_is_empty)]
#![allow(clippy::match_same_arms)]
//
// Low-value pedantic lints that add noise:
#![allow(clippy::must_use_candidate)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::redundant_closure_for_method_calls)]
#![allow(clippy::explicit_iter_loop)]
#![allow(clippy::single_match_else)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::default_trait_access)]
#![allow(clippy::if_not_else)]
#![allow(clippy::inline_always)]
#![allow(clippy::manual_let_else)]
#![allow(clippy::ignored_unit_patterns)]
#![allow(clippy::unnecessary_wraps)]
#![allow(clippy::unused_self)]
#![allow(clippy::struct_field_names)]

/// The wv2-core crate version (matches `Cargo.toml`).
pub const WV2_CORE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod archive;
pub mod constants;
pub mod context;
pub mod error;
pub mod io;
pub mod lex;
mod lock;
pub mod providers;
pub mod search;
mod toc;
pub mod types;
pub mod vec;

pub use archive::Archive;
pub use context::{ContextConfig, ContextItem, ContextMode, ContextWindow, TierPolicy};
pub use error::{ArchiveError, Result};
pub use io::wal::{WalRecordKind, WalStats};
pub use lex::{LexBacking, LexIndex, LexSearchHit};
pub use lock::{FileLock, LockMode};
pub use providers::{
    Embedder, ExecutionMode, ExtractedChunk, Extractor, HeuristicTokenCounter, TokenCounter,
    enforce_on_device,
};
pub use search::cache::{TextSourceKey, VectorSourceKey};
pub use search::fusion::{FusedHit, rrf_fuse};
pub use types::{
    ArchiveOptions, CanonicalEncoding, CompactionOptions, Embedding, EmbeddingIdentity, Frame,
    FrameFilter, FrameId, FrameRole, FrameStatus, IoQueueQos, PendingEmbeddingDiff,
    ProactiveCommitPolicy, PutOptions, PutOptionsBuilder, ResultSource, SearchHit, SearchMode,
    SearchRequest, SearchResponse, Stats, Tier, TimelineEntry, TimelineQuery, VecEngineKind,
    VecEnginePreference, WalFsyncPolicy,
};
pub use vec::{CpuVecEngine, Similarity, VecArtifact, VecEngine, build_engine, engine_order};
#[cfg(feature = "gpu")]
pub use vec::GpuVecEngine;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_put_commit_reopen_searches() {
        let dir = tempdir().expect("tmp");
        let path = dir.path().join("memory.wv2");

        let mut archive = Archive::create(&path).expect("create");
        let options = PutOptions::builder().search_text("hello world").build();
        let id = archive.put(b"hello world", options).expect("put");
        assert_eq!(id, 1);
        archive.commit().expect("commit");
        drop(archive);

        let mut reopened = Archive::open(&path).expect("open");
        let stats = reopened.stats();
        assert_eq!(stats.frame_count, 1);
        assert!(stats.has_lex_index);
        assert_eq!(reopened.wal_stats().pending_bytes, 0);

        let response = reopened
            .search(SearchRequest::text("hello", 5))
            .expect("search");
        assert_eq!(
            response.hits.iter().map(|h| h.frame_id).collect::<Vec<_>>(),
            vec![1]
        );
    }

    #[test]
    fn supersede_hides_old_frame_in_every_mode() {
        let dir = tempdir().expect("tmp");
        let path = dir.path().join("supersede.wv2");

        let mut archive = Archive::create(&path).expect("create");
        let first = archive
            .put(b"v1", PutOptions::builder().search_text("versioned note v1").build())
            .expect("put v1");
        let second = archive
            .put(b"v2", PutOptions::builder().search_text("versioned note v2").build())
            .expect("put v2");
        archive.supersede(first, second).expect("supersede");
        archive.commit().expect("commit");

        let response = archive
            .search(SearchRequest::text("versioned", 5))
            .expect("search");
        assert_eq!(
            response.hits.iter().map(|h| h.frame_id).collect::<Vec<_>>(),
            vec![second]
        );

        let old = archive.frame_meta(first).expect("old meta");
        assert_eq!(old.superseded_by, Some(second));
        let new = archive.frame_meta(second).expect("new meta");
        assert_eq!(new.supersedes, Some(first));
        // Old frame stays addressable.
        assert_eq!(archive.frame_content(first).expect("content"), b"v1");
    }

    #[test]
    fn frame_ids_are_strictly_monotone() {
        let dir = tempdir().expect("tmp");
        let path = dir.path().join("monotone.wv2");

        let mut archive = Archive::create(&path).expect("create");
        let mut last = 0;
        for i in 0..10u32 {
            let id = archive
                .put(format!("frame {i}").as_bytes(), PutOptions::default())
                .expect("put");
            assert!(id > last, "ids must strictly increase");
            last = id;
        }
        archive.delete(3).expect("delete");
        archive.commit().expect("commit");
        drop(archive);

        // Deletion never frees an id, and reopen continues the sequence.
        let mut reopened = Archive::open(&path).expect("open");
        let next = reopened.put(b"after reopen", PutOptions::default()).expect("put");
        assert!(next > last);
    }

    #[test]
    fn staged_frames_appear_in_default_view_only() {
        let dir = tempdir().expect("tmp");
        let path = dir.path().join("pending.wv2");

        let mut archive = Archive::create(&path).expect("create");
        archive
            .put(b"committed", PutOptions::builder().search_text("committed doc").build())
            .expect("put");
        archive.commit().expect("commit");
        let staged = archive
            .put(b"staged", PutOptions::builder().search_text("staged doc").build())
            .expect("put staged");

        let union = archive
            .search(SearchRequest::text("doc", 10))
            .expect("union search");
        assert_eq!(union.hits.len(), 2);

        let mut committed_only = SearchRequest::text("doc", 10);
        committed_only.committed_only = true;
        let committed = archive.search(committed_only).expect("committed search");
        assert_eq!(committed.hits.len(), 1);
        assert!(committed.hits.iter().all(|h| h.frame_id != staged));
    }

    #[test]
    fn put_batch_assigns_contiguous_ids() {
        let dir = tempdir().expect("tmp");
        let path = dir.path().join("batch.wv2");

        let mut archive = Archive::create(&path).expect("create");
        let items: Vec<(Vec<u8>, PutOptions)> = (0..5)
            .map(|i| {
                let text = format!("batch doc {i}");
                (
                    text.clone().into_bytes(),
                    PutOptions::builder().search_text(text).build(),
                )
            })
            .collect();
        let ids = archive.put_batch(items).expect("batch");
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        archive.commit().expect("commit");

        let response = archive
            .search(SearchRequest::text("batch", 10))
            .expect("search");
        assert_eq!(response.hits.len(), 5);
    }

    #[test]
    fn empty_commit_is_a_no_op() {
        let dir = tempdir().expect("tmp");
        let path = dir.path().join("noop.wv2");

        let mut archive = Archive::create(&path).expect("create");
        archive.put(b"one", PutOptions::default()).expect("put");
        archive.commit().expect("commit");

        let stamp = archive.stats().logical_stamp;
        let checkpoints = archive.wal_stats().checkpoint_count;
        archive.commit().expect("second commit");
        assert_eq!(archive.stats().logical_stamp, stamp, "no toc flip");
        assert_eq!(
            archive.wal_stats().checkpoint_count,
            checkpoints,
            "no new checkpoint"
        );
    }

    #[test]
    fn zstd_payload_roundtrip() {
        let dir = tempdir().expect("tmp");
        let path = dir.path().join("zstd.wv2");

        let mut archive = Archive::create(&path).expect("create");
        let body = "repetitive repetitive repetitive payload ".repeat(64);
        let id = archive
            .put(
                body.as_bytes(),
                PutOptions::builder().encoding(CanonicalEncoding::Zstd).build(),
            )
            .expect("put");
        archive.commit().expect("commit");
        drop(archive);

        let mut reopened = Archive::open(&path).expect("open");
        let meta = reopened.frame_meta(id).expect("meta");
        assert!(meta.payload_length < body.len() as u64, "compressed on disk");
        assert_eq!(reopened.frame_content(id).expect("content"), body.as_bytes());
    }

    #[test]
    fn timeline_orders_by_capture_time() {
        let dir = tempdir().expect("tmp");
        let path = dir.path().join("timeline.wv2");

        let mut archive = Archive::create(&path).expect("create");
        archive
            .put(
                b"late",
                PutOptions::builder().timestamp_ms(2_000).search_text("late").build(),
            )
            .expect("put late");
        archive
            .put(
                b"early",
                PutOptions::builder().timestamp_ms(1_000).search_text("early").build(),
            )
            .expect("put early");

        let entries = archive.timeline(TimelineQuery::default()).expect("timeline");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].preview, "early");

        let reversed = archive
            .timeline(TimelineQuery {
                reverse: true,
                limit: Some(1),
                ..TimelineQuery::default()
            })
            .expect("reverse");
        assert_eq!(reversed[0].preview, "late");
    }

    #[test]
    fn read_only_handle_rejects_writes() {
        let dir = tempdir().expect("tmp");
        let path = dir.path().join("ro.wv2");

        {
            let mut archive = Archive::create(&path).expect("create");
            archive
                .put(b"doc", PutOptions::builder().search_text("read only doc").build())
                .expect("put");
            archive.commit().expect("commit");
        }

        let mut reader = Archive::open_read_only(&path).expect("open ro");
        let err = reader.put(b"nope", PutOptions::default()).expect_err("put");
        assert!(matches!(err, ArchiveError::ReadOnly { .. }));
        let response = reader
            .search(SearchRequest::text("doc", 5))
            .expect("search still works");
        assert_eq!(response.hits.len(), 1);
    }

    #[test]
    fn parent_must_exist_and_be_active() {
        let dir = tempdir().expect("tmp");
        let path = dir.path().join("parent.wv2");

        let mut archive = Archive::create(&path).expect("create");
        let err = archive
            .put(b"orphan", PutOptions::builder().parent(99).build())
            .expect_err("missing parent");
        assert!(matches!(err, ArchiveError::FrameNotFound { frame_id: 99 }));

        let parent = archive.put(b"root", PutOptions::default()).expect("root");
        archive
            .put(b"child", PutOptions::builder().parent(parent).build())
            .expect("child of active parent");

        archive.delete(parent).expect("delete");
        let err = archive
            .put(b"child2", PutOptions::builder().parent(parent).build())
            .expect_err("deleted parent");
        assert!(matches!(err, ArchiveError::FrameNotFound { .. }));
    }

    #[test]
    fn supersede_rejects_self_and_double() {
        let dir = tempdir().expect("tmp");
        let path = dir.path().join("cycle.wv2");

        let mut archive = Archive::create(&path).expect("create");
        let a = archive.put(b"a", PutOptions::default()).expect("a");
        let b = archive.put(b"b", PutOptions::default()).expect("b");

        assert!(archive.supersede(a, a).is_err());
        archive.supersede(a, b).expect("supersede");
        let err = archive.supersede(a, b).expect_err("double supersede");
        assert!(matches!(err, ArchiveError::Encoding { .. }));
    }
}
