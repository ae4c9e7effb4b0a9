//! Context builder: token budgets, emission order, and surrogate tiers.

use wv2_core::{
    Archive, ContextConfig, ContextMode, FrameRole, HeuristicTokenCounter, PutOptions,
    SearchMode, Tier, TierPolicy, TokenCounter,
};

use tempfile::tempdir;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

fn archive_with_notes(path: &std::path::Path, count: usize) -> Archive {
    let mut archive = Archive::create(path).expect("create");
    for i in 0..count {
        let text = format!(
            "note {i} covering retrieval budgets and deterministic assembly of windows"
        );
        archive
            .put(
                text.as_bytes(),
                PutOptions::builder().search_text(text.clone()).build(),
            )
            .expect("put");
    }
    archive.commit().expect("commit");
    archive
}

#[test]
fn window_never_exceeds_the_token_budget() {
    let dir = tempdir().expect("tmp");
    let mut archive = archive_with_notes(&dir.path().join("budget.wv2"), 20);
    let counter = HeuristicTokenCounter;

    for budget in [5usize, 17, 40, 100] {
        let config = ContextConfig {
            max_context_tokens: budget,
            search_top_k: 20,
            search_mode: SearchMode::TextOnly,
            ..ContextConfig::default()
        };
        let window = archive
            .build_context("retrieval budgets", None, &config, &counter)
            .expect("build");
        assert!(
            window.total_tokens <= budget,
            "budget {budget} exceeded: {}",
            window.total_tokens
        );
        let recounted: usize = window.items.iter().map(|item| counter.count(&item.text)).sum();
        assert_eq!(recounted, window.total_tokens);
    }
}

#[test]
fn items_keep_retrieval_order_and_snippet_caps() {
    let dir = tempdir().expect("tmp");
    let mut archive = archive_with_notes(&dir.path().join("order.wv2"), 6);
    let counter = HeuristicTokenCounter;

    let config = ContextConfig {
        max_context_tokens: 1000,
        snippet_max_tokens: 4,
        search_top_k: 6,
        search_mode: SearchMode::TextOnly,
        ..ContextConfig::default()
    };
    let window = archive
        .build_context("deterministic assembly", None, &config, &counter)
        .expect("build");
    assert!(!window.items.is_empty());
    for item in &window.items {
        assert!(item.tokens <= 4, "snippet over its cap");
    }

    // Emission must follow retrieval order, not token count.
    let request = wv2_core::SearchRequest::text("deterministic assembly", 6);
    let hits = archive.search(request).expect("search");
    let hit_order: Vec<u64> = hits.hits.iter().map(|h| h.frame_id).collect();
    let item_order: Vec<u64> = window.items.iter().map(|i| i.frame_id).collect();
    assert_eq!(item_order, hit_order[..item_order.len()]);
}

#[test]
fn max_snippets_bounds_the_item_count() {
    let dir = tempdir().expect("tmp");
    let mut archive = archive_with_notes(&dir.path().join("snippets.wv2"), 12);
    let counter = HeuristicTokenCounter;

    let config = ContextConfig {
        max_context_tokens: 10_000,
        max_snippets: 3,
        search_top_k: 12,
        search_mode: SearchMode::TextOnly,
        ..ContextConfig::default()
    };
    let window = archive
        .build_context("retrieval", None, &config, &counter)
        .expect("build");
    assert_eq!(window.items.len(), 3);
}

#[test]
fn dense_cached_mode_expands_parents_through_surrogates() {
    let dir = tempdir().expect("tmp");
    let path = dir.path().join("surrogate.wv2");
    let mut archive = Archive::create(&path).expect("create");
    let now = 1_000 * DAY_MS;

    let parent = archive
        .put(
            b"full transcript of the meeting",
            PutOptions::builder()
                .role(FrameRole::Document)
                .timestamp_ms(now - 14 * DAY_MS)
                .build(),
        )
        .expect("parent");
    let _surrogate = archive
        .put(
            b"summary: roadmap decisions and owners for the quarter",
            PutOptions::builder()
                .kind("surrogate")
                .parent(parent)
                .timestamp_ms(now - 14 * DAY_MS)
                .metadata_entry("surrogate.gist", "roadmap decisions and owners")
                .metadata_entry("surrogate.micro", "roadmap")
                .build(),
        )
        .expect("surrogate");
    let chunk = archive
        .put(
            b"we agreed to ship the indexer in march",
            PutOptions::builder()
                .role(FrameRole::Chunk)
                .parent(parent)
                .search_text("ship the indexer in march")
                .timestamp_ms(now - 14 * DAY_MS)
                .build(),
        )
        .expect("chunk");
    archive.commit().expect("commit");

    let counter = HeuristicTokenCounter;
    let config = ContextConfig {
        mode: ContextMode::DenseCached,
        max_context_tokens: 500,
        search_top_k: 5,
        search_mode: SearchMode::TextOnly,
        tier_policy: TierPolicy::AgeOnly {
            recent_days: 7,
            old_days: 30,
        },
        deterministic_now_ms: Some(now),
        ..ContextConfig::default()
    };
    let window = archive
        .build_context("indexer march", None, &config, &counter)
        .expect("build");

    let surrogate_item = window
        .items
        .iter()
        .find(|item| item.surrogate_for.is_some())
        .expect("surrogate expansion present");
    assert_eq!(surrogate_item.surrogate_for, Some(parent));
    assert_eq!(surrogate_item.tier, Some(Tier::Gist), "14 days old lands in gist");
    assert_eq!(surrogate_item.text, "roadmap decisions and owners");

    let chunk_item = window
        .items
        .iter()
        .find(|item| item.frame_id == chunk)
        .expect("chunk snippet present");
    assert!(chunk_item.text.contains("indexer"));

    // Fast mode skips the expansion entirely.
    let fast = ContextConfig {
        mode: ContextMode::Fast,
        deterministic_now_ms: Some(now),
        search_mode: SearchMode::TextOnly,
        ..ContextConfig::default()
    };
    let fast_window = archive
        .build_context("indexer march", None, &fast, &counter)
        .expect("fast build");
    assert!(fast_window.items.iter().all(|item| item.surrogate_for.is_none()));
}

#[test]
fn surrogate_budget_is_enforced() {
    let dir = tempdir().expect("tmp");
    let path = dir.path().join("surrogate-budget.wv2");
    let mut archive = Archive::create(&path).expect("create");
    let now = 1_000 * DAY_MS;

    let parent = archive
        .put(b"parent", PutOptions::builder().timestamp_ms(now).build())
        .expect("parent");
    let long_gist = "one two three four five six seven eight nine ten".repeat(4);
    archive
        .put(
            b"surrogate payload",
            PutOptions::builder()
                .kind("surrogate")
                .parent(parent)
                .timestamp_ms(now)
                .metadata_entry("surrogate.gist", long_gist)
                .build(),
        )
        .expect("surrogate");
    archive
        .put(
            b"chunk body",
            PutOptions::builder()
                .role(FrameRole::Chunk)
                .parent(parent)
                .search_text("budget enforcement chunk")
                .timestamp_ms(now)
                .build(),
        )
        .expect("chunk");
    archive.commit().expect("commit");

    let counter = HeuristicTokenCounter;
    let config = ContextConfig {
        mode: ContextMode::DenseCached,
        max_context_tokens: 200,
        surrogate_max_tokens: 6,
        search_top_k: 5,
        search_mode: SearchMode::TextOnly,
        tier_policy: TierPolicy::AgeOnly {
            recent_days: 1_000_000,
            old_days: 2_000_000,
        },
        deterministic_now_ms: Some(now),
        ..ContextConfig::default()
    };
    let window = archive
        .build_context("budget enforcement", None, &config, &counter)
        .expect("build");
    let surrogate_item = window
        .items
        .iter()
        .find(|item| item.surrogate_for.is_some())
        .expect("surrogate present");
    assert!(surrogate_item.tokens <= 6);
    assert_eq!(surrogate_item.tier, Some(Tier::Full));
}
