//! Hybrid retrieval benchmarks.
//!
//! Measures text, vector, and fused query latency over a synthetic corpus,
//! plus the cost of the first (cache-cold) query after a commit.
//!
//! # Running
//!
//! ```bash
//! cargo bench --bench hybrid_search_benchmark
//! ```

use criterion::{Criterion, criterion_group, criterion_main};
use wv2_core::{
    Archive, EmbeddingIdentity, PutOptions, SearchMode, SearchRequest,
};

const DIMS: u32 = 16;

fn embedding_for(seed: u64) -> Vec<f32> {
    let mut v: Vec<f32> = (0..DIMS)
        .map(|d| ((seed.wrapping_mul(2_654_435_761) >> d) & 0xFF) as f32 / 255.0)
        .collect();
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-6);
    v.iter_mut().for_each(|x| *x /= norm);
    v
}

fn setup_corpus(size: usize) -> std::path::PathBuf {
    let path = std::env::temp_dir().join(format!("bench_{size}.wv2"));
    let _ = std::fs::remove_file(&path);

    let topics = [
        "ring buffer write ahead logging",
        "cosine similarity nearest neighbour",
        "token budget context assembly",
        "reciprocal rank fusion hybrid retrieval",
        "supersede chains and frame status",
    ];
    let identity = EmbeddingIdentity {
        provider: "bench".into(),
        model: "synthetic".into(),
        dimension: DIMS,
        normalized: true,
    };

    let mut archive = Archive::create(&path).unwrap();
    for i in 0..size {
        let text = format!("Document {i} about {}", topics[i % topics.len()]);
        let id = archive
            .put(
                text.as_bytes(),
                PutOptions::builder().search_text(text.clone()).build(),
            )
            .unwrap();
        archive
            .stage_embedding(id, embedding_for(i as u64), &identity)
            .unwrap();
    }
    archive.commit().unwrap();
    path
}

fn bench_query_modes(c: &mut Criterion) {
    let path = setup_corpus(2_000);

    c.bench_function("text_query_top10", |b| {
        let mut archive = Archive::open(&path).unwrap();
        b.iter(|| {
            let response = archive
                .search(SearchRequest::text("hybrid retrieval fusion", 10))
                .unwrap();
            assert!(!response.hits.is_empty());
        });
    });

    c.bench_function("vector_query_top10", |b| {
        let mut archive = Archive::open(&path).unwrap();
        let query = embedding_for(3);
        b.iter(|| {
            let response = archive
                .search(SearchRequest::vector(query.clone(), 10))
                .unwrap();
            assert!(!response.hits.is_empty());
        });
    });

    c.bench_function("hybrid_query_top10", |b| {
        let mut archive = Archive::open(&path).unwrap();
        let query = embedding_for(3);
        b.iter(|| {
            let request = SearchRequest {
                query: "hybrid retrieval fusion".into(),
                embedding: Some(query.clone()),
                mode: SearchMode::Hybrid { alpha: 0.5 },
                top_k: 10,
                ..SearchRequest::default()
            };
            let response = archive.search(request).unwrap();
            assert!(!response.hits.is_empty());
        });
    });
}

fn bench_cold_engine_materialization(c: &mut Criterion) {
    let path = setup_corpus(2_000);

    c.bench_function("first_query_after_open", |b| {
        b.iter(|| {
            let mut archive = Archive::open(&path).unwrap();
            let response = archive
                .search(SearchRequest::text("frame status", 10))
                .unwrap();
            assert!(!response.hits.is_empty());
        });
    });
}

criterion_group!(benches, bench_query_modes, bench_cold_engine_materialization);
criterion_main!(benches);
