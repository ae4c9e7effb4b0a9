//! Compaction: rewriting the committed live set into a fresh archive.

use std::sync::atomic::{AtomicBool, Ordering};

use wv2_core::{
    Archive, ArchiveError, CompactionOptions, EmbeddingIdentity, PutOptions, SearchRequest,
};

use tempfile::tempdir;

fn identity(dims: u32) -> EmbeddingIdentity {
    EmbeddingIdentity {
        provider: "test".into(),
        model: "unit".into(),
        dimension: dims,
        normalized: true,
    }
}

fn populated_archive(path: &std::path::Path) -> Archive {
    let mut archive = Archive::create(path).expect("create");
    let keep = archive
        .put(
            b"keep me around",
            PutOptions::builder().search_text("durable keeper note").build(),
        )
        .expect("keep");
    let stale = archive
        .put(
            b"stale version",
            PutOptions::builder().search_text("stale note").build(),
        )
        .expect("stale");
    let replacement = archive
        .put(
            b"fresh version",
            PutOptions::builder().search_text("fresh note").build(),
        )
        .expect("replacement");
    archive.supersede(stale, replacement).expect("supersede");
    let doomed = archive
        .put(b"doomed", PutOptions::builder().search_text("doomed note").build())
        .expect("doomed");
    archive.delete(doomed).expect("delete");
    archive
        .stage_embedding(keep, vec![1.0, 0.0], &identity(2))
        .expect("embed");
    archive.commit().expect("commit");
    archive
}

#[test]
fn rewrite_preserves_live_frames_and_ids() {
    let dir = tempdir().expect("tmp");
    let source_path = dir.path().join("source.wv2");
    let dest_path = dir.path().join("dest.wv2");

    let mut source = populated_archive(&source_path);
    let source_stats = source.stats();
    source
        .rewrite_live_set(&dest_path, CompactionOptions::default(), None)
        .expect("rewrite");

    // Source stays fully intact until the caller swaps.
    assert_eq!(source.stats(), source_stats);

    let mut dest = Archive::open(&dest_path).expect("open dest");
    let dest_stats = dest.stats();
    assert_eq!(dest_stats.frame_count, source_stats.frame_count);
    assert_eq!(dest_stats.committed_seq, source_stats.committed_seq);
    assert_eq!(dest.wal_stats().pending_bytes, 0, "destination wal starts empty");

    // Ids and payloads carry over, including hidden frames.
    assert_eq!(dest.frame_content(1).expect("keep"), b"keep me around");
    assert_eq!(dest.frame_content(2).expect("stale"), b"stale version");
    let meta = dest.frame_meta(2).expect("meta");
    assert_eq!(meta.superseded_by, Some(3));

    // Indexes carried over verbatim.
    let text = dest
        .search(SearchRequest::text("fresh", 5))
        .expect("text search");
    assert_eq!(text.hits[0].frame_id, 3);
    let vector = dest
        .search(SearchRequest::vector(vec![1.0, 0.0], 5))
        .expect("vector search");
    assert_eq!(vector.hits[0].frame_id, 1);
}

#[test]
fn zeroing_dead_payloads_keeps_metadata() {
    let dir = tempdir().expect("tmp");
    let source_path = dir.path().join("zsource.wv2");
    let dest_path = dir.path().join("zdest.wv2");

    let mut source = populated_archive(&source_path);
    source
        .rewrite_live_set(
            &dest_path,
            CompactionOptions {
                zero_dead_payloads: true,
            },
            None,
        )
        .expect("rewrite");

    let mut dest = Archive::open(&dest_path).expect("open dest");
    // The superseded frame's metadata and id survive, its bytes do not.
    let stale = dest.frame_meta(2).expect("meta");
    assert_eq!(stale.superseded_by, Some(3));
    let content = dest.frame_content(2).expect("zeroed payload still reads");
    assert!(content.iter().all(|&b| b == 0));

    // Live payloads are untouched.
    assert_eq!(dest.frame_content(1).expect("keep"), b"keep me around");
}

#[test]
fn cancellation_leaves_no_partial_destination() {
    let dir = tempdir().expect("tmp");
    let source_path = dir.path().join("csource.wv2");
    let dest_path = dir.path().join("cdest.wv2");

    let mut source = populated_archive(&source_path);
    let cancel = AtomicBool::new(true);
    let err = source
        .rewrite_live_set(&dest_path, CompactionOptions::default(), Some(&cancel))
        .expect_err("canceled");
    assert!(matches!(err, ArchiveError::Canceled));
    assert!(!dest_path.exists(), "partial destination must be removed");
    assert!(cancel.load(Ordering::Relaxed));
}
