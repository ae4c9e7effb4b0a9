//! Unified search: mode dispatch, pending overlay, filters, fusion, and the
//! engine cache's behavior across commits.

use std::collections::BTreeSet;

use wv2_core::{
    Archive, EmbeddingIdentity, FrameFilter, LexIndex, PutOptions, ResultSource, SearchMode,
    SearchRequest, Similarity, VecEnginePreference,
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

fn seeded_archive(path: &std::path::Path) -> Archive {
    let mut archive = Archive::create(path).expect("create");
    for (text, kind, ts) in [
        ("ring buffer write ahead log", "note.tech", 1_000i64),
        ("cosine similarity over embeddings", "note.tech", 2_000),
        ("grocery list apples and rye bread", "note.home", 3_000),
        ("write amplification in storage engines", "note.tech", 4_000),
    ] {
        archive
            .put(
                text.as_bytes(),
                PutOptions::builder()
                    .search_text(text)
                    .kind(kind)
                    .timestamp_ms(ts)
                    .build(),
            )
            .expect("put");
    }
    archive.commit().expect("commit");
    archive
}

#[test]
fn text_search_ranks_and_snippets() {
    let dir = tempdir().expect("tmp");
    let mut archive = seeded_archive(&dir.path().join("text.wv2"));

    let response = archive
        .search(SearchRequest::text("write log", 10))
        .expect("search");
    assert!(!response.hits.is_empty());
    // Frame 1 matches both terms and must outrank the single-term match.
    assert_eq!(response.hits[0].frame_id, 1);
    let snippet = response.hits[0].snippet.as_deref().expect("snippet");
    assert!(snippet.contains("write ahead log"));
    assert!(response.hits[0].sources.contains(&ResultSource::Text));
}

#[test]
fn vector_search_over_pending_then_committed() {
    let dir = tempdir().expect("tmp");
    let mut archive = seeded_archive(&dir.path().join("vector.wv2"));

    archive
        .stage_embedding(1, vec![1.0, 0.0], &identity(2))
        .expect("embed 1");
    archive
        .stage_embedding(2, vec![0.0, 1.0], &identity(2))
        .expect("embed 2");

    // Pending-only source: no vector blob committed yet.
    let response = archive
        .search(SearchRequest::vector(vec![1.0, 0.0], 2))
        .expect("pending search");
    assert_eq!(response.hits[0].frame_id, 1);
    assert!(response.hits[0].sources.contains(&ResultSource::Vector));

    archive.commit().expect("commit");
    let response = archive
        .search(SearchRequest::vector(vec![0.0, 1.0], 2))
        .expect("committed search");
    assert_eq!(response.hits[0].frame_id, 2);
}

#[test]
fn exact_vector_ties_resolve_to_ascending_ids() {
    let dir = tempdir().expect("tmp");
    let path = dir.path().join("ties.wv2");
    let mut archive = Archive::create(&path).expect("create");
    for _ in 0..3 {
        archive.put(b"v", PutOptions::default()).expect("put");
    }
    archive
        .stage_embedding(1, vec![1.0, 0.0], &identity(2))
        .expect("e1");
    archive
        .stage_embedding(2, vec![1.0, 0.0], &identity(2))
        .expect("e2");
    archive
        .stage_embedding(3, vec![0.0, 1.0], &identity(2))
        .expect("e3");
    archive.commit().expect("commit");

    let response = archive
        .search(SearchRequest::vector(vec![1.0, 0.0], 2))
        .expect("search");
    assert_eq!(
        response.hits.iter().map(|h| h.frame_id).collect::<Vec<_>>(),
        vec![1, 2]
    );
}

#[test]
fn hybrid_fusion_is_deterministic_and_tagged() {
    let dir = tempdir().expect("tmp");
    let mut archive = seeded_archive(&dir.path().join("hybrid.wv2"));
    for frame_id in 1..=4u64 {
        let angle = frame_id as f32 * 0.4;
        archive
            .stage_embedding(frame_id, vec![angle.cos(), angle.sin()], &identity(2))
            .expect("embed");
    }
    archive.commit().expect("commit");

    let request = SearchRequest {
        query: "write storage".into(),
        embedding: Some(vec![0.4f32.cos(), 0.4f32.sin()]),
        mode: SearchMode::Hybrid { alpha: 0.5 },
        top_k: 4,
        ..SearchRequest::default()
    };
    let first = archive.search(request.clone()).expect("first");
    assert!(!first.hits.is_empty());
    for _ in 0..5 {
        let again = archive.search(request.clone()).expect("again");
        assert_eq!(
            again.hits.iter().map(|h| h.frame_id).collect::<Vec<_>>(),
            first.hits.iter().map(|h| h.frame_id).collect::<Vec<_>>(),
        );
    }

    // A frame ranked by both lanes carries both source tags.
    let both = first
        .hits
        .iter()
        .find(|h| h.sources.len() == 2)
        .expect("a frame served by both lanes");
    assert!(both.sources.contains(&ResultSource::Text));
    assert!(both.sources.contains(&ResultSource::Vector));
}

#[test]
fn filters_narrow_results() {
    let dir = tempdir().expect("tmp");
    let mut archive = seeded_archive(&dir.path().join("filters.wv2"));

    let mut by_kind = SearchRequest::text("write", 10);
    by_kind.filter = FrameFilter {
        kinds: Some(vec!["note.tech".into()]),
        ..FrameFilter::default()
    };
    let response = archive.search(by_kind).expect("kind filter");
    assert!(!response.hits.is_empty());

    let mut by_time = SearchRequest::text("write", 10);
    by_time.filter = FrameFilter {
        time_range: Some((3_500, 10_000)),
        ..FrameFilter::default()
    };
    let response = archive.search(by_time).expect("time filter");
    assert_eq!(
        response.hits.iter().map(|h| h.frame_id).collect::<Vec<_>>(),
        vec![4]
    );

    let mut by_id = SearchRequest::text("write", 10);
    by_id.filter = FrameFilter {
        id_allowlist: Some([4u64].into_iter().collect::<BTreeSet<_>>()),
        ..FrameFilter::default()
    };
    let response = archive.search(by_id).expect("id filter");
    assert_eq!(
        response.hits.iter().map(|h| h.frame_id).collect::<Vec<_>>(),
        vec![4]
    );
}

#[test]
fn deleted_and_superseded_frames_never_surface() {
    let dir = tempdir().expect("tmp");
    let mut archive = seeded_archive(&dir.path().join("hidden.wv2"));

    archive.delete(3).expect("delete");
    let replacement = archive
        .put(
            b"replacement",
            PutOptions::builder().search_text("write ahead replacement").build(),
        )
        .expect("put");
    archive.supersede(1, replacement).expect("supersede");
    archive.commit().expect("commit");

    let response = archive
        .search(SearchRequest::text("write", 10))
        .expect("search");
    let ids: Vec<u64> = response.hits.iter().map(|h| h.frame_id).collect();
    assert!(!ids.contains(&1), "superseded frame leaked");
    assert!(!ids.contains(&3), "deleted frame leaked");
    assert!(ids.contains(&replacement));

    // Also hidden while the mutations are only staged.
    archive.delete(4).expect("stage delete");
    let staged = archive
        .search(SearchRequest::text("write", 10))
        .expect("staged search");
    assert!(staged.hits.iter().all(|h| h.frame_id != 4));
}

#[test]
fn staged_blobs_publish_at_commit() {
    let dir = tempdir().expect("tmp");
    let path = dir.path().join("staged.wv2");
    let mut archive = Archive::create(&path).expect("create");
    let id = archive
        .put(b"payload", PutOptions::default())
        .expect("put");

    // An out-of-band indexer hands us finished blobs.
    let mut lex = LexIndex::new();
    lex.index(id, "externally built lexical index").expect("index");
    let lex_bytes = lex.serialize().expect("serialize");
    archive
        .stage_lex_index_for_next_commit(lex_bytes, 1, 1)
        .expect("stage lex");

    let mut cpu = wv2_core::CpuVecEngine::new(2, Similarity::Cosine);
    wv2_core::VecEngine::add(&mut cpu, id, &[0.6, 0.8]).expect("add");
    let vec_bytes = wv2_core::VecEngine::serialize(&cpu).expect("serialize");
    archive
        .stage_vec_index_for_next_commit(vec_bytes, 1, 2, Similarity::Cosine)
        .expect("stage vec");

    archive.commit().expect("commit");
    drop(archive);

    let mut reopened = Archive::open(&path).expect("open");
    let text = reopened
        .search(SearchRequest::text("externally", 5))
        .expect("text");
    assert_eq!(text.hits[0].frame_id, id);
    let vector = reopened
        .search(SearchRequest::vector(vec![0.6, 0.8], 5))
        .expect("vector");
    assert_eq!(vector.hits[0].frame_id, id);
}

#[test]
fn dimension_mismatch_is_rejected_at_staging() {
    let dir = tempdir().expect("tmp");
    let path = dir.path().join("dims.wv2");
    let mut archive = Archive::create(&path).expect("create");
    let id = archive.put(b"a", PutOptions::default()).expect("put");
    archive
        .stage_embedding(id, vec![1.0, 0.0, 0.0], &identity(3))
        .expect("first embedding fixes dims");

    let id2 = archive.put(b"b", PutOptions::default()).expect("put");
    let err = archive
        .stage_embedding(id2, vec![1.0, 0.0], &identity(2))
        .expect_err("dims differ");
    assert!(matches!(err, wv2_core::ArchiveError::DimensionMismatch { .. }));
}

#[test]
fn unnormalized_vector_with_normalized_identity_is_rejected() {
    let dir = tempdir().expect("tmp");
    let path = dir.path().join("norm.wv2");
    let mut archive = Archive::create(&path).expect("create");
    let id = archive.put(b"a", PutOptions::default()).expect("put");
    let err = archive
        .stage_embedding(id, vec![3.0, 4.0], &identity(2))
        .expect_err("norm is 5");
    assert!(matches!(err, wv2_core::ArchiveError::Encoding { .. }));
}

#[test]
fn invalid_queries_error_out() {
    let dir = tempdir().expect("tmp");
    let mut archive = seeded_archive(&dir.path().join("invalid.wv2"));

    let err = archive
        .search(SearchRequest::text("   ", 5))
        .expect_err("empty text");
    assert!(matches!(err, wv2_core::ArchiveError::InvalidQuery { .. }));

    let vector_without_embedding = SearchRequest {
        mode: SearchMode::VectorOnly,
        top_k: 5,
        ..SearchRequest::default()
    };
    let err = archive
        .search(vector_without_embedding)
        .expect_err("missing embedding");
    assert!(matches!(err, wv2_core::ArchiveError::InvalidQuery { .. }));
}

#[test]
fn cpu_only_preference_is_honored() {
    let dir = tempdir().expect("tmp");
    let mut archive = seeded_archive(&dir.path().join("pref.wv2"));
    archive
        .stage_embedding(1, vec![1.0, 0.0], &identity(2))
        .expect("embed");
    archive.commit().expect("commit");

    let request = SearchRequest {
        embedding: Some(vec![1.0, 0.0]),
        mode: SearchMode::VectorOnly,
        top_k: 3,
        engine_preference: VecEnginePreference::CpuOnly,
        ..SearchRequest::default()
    };
    let response = archive.search(request).expect("search");
    assert_eq!(response.vec_engine, Some(wv2_core::VecEngineKind::Cpu));
}

#[test]
fn two_archives_keep_independent_caches() {
    let dir = tempdir().expect("tmp");
    let mut a = seeded_archive(&dir.path().join("a.wv2"));
    let mut b = Archive::create(dir.path().join("b.wv2")).expect("create b");
    b.put(
        b"only in b",
        PutOptions::builder().search_text("unique phrase").build(),
    )
    .expect("put");
    b.commit().expect("commit b");

    let in_b = b
        .search(SearchRequest::text("unique", 5))
        .expect("search b");
    assert_eq!(in_b.hits.len(), 1);
    let in_a = a
        .search(SearchRequest::text("unique", 5))
        .expect("search a");
    assert!(in_a.hits.is_empty());
}
