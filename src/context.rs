//! Deterministic token-budgeted context assembly.
//!
//! Greedy over the ranked retrieval: each candidate contributes a truncated
//! snippet, optionally preceded by a surrogate of its parent, until the token
//! budget is reached. Items are emitted in retrieval order and never
//! re-sorted; token accounting goes through the shared [`TokenCounter`], so
//! the same inputs always assemble the same window.

use crate::archive::Archive;
use crate::constants::{
    ACCESS_COUNT_KEY, SURROGATE_GIST_KEY, SURROGATE_KIND, SURROGATE_MICRO_KEY,
};
use crate::error::Result;
use crate::providers::TokenCounter;
use crate::types::frame::{Frame, FrameId, FrameRole, Tier};
use crate::types::search::{SearchMode, SearchRequest};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ContextMode {
    /// Raw top-K snippets.
    #[default]
    Fast,
    /// Also expands parents through surrogate tiers.
    DenseCached,
}

/// How a surrogate's tier is chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum TierPolicy {
    /// Always `full`.
    #[default]
    Disabled,
    /// Recent frames get `full`, mid-age `gist`, old `micro`.
    AgeOnly { recent_days: u32, old_days: u32 },
    /// Weighted recency + access frequency against two thresholds.
    Importance {
        full_threshold: f32,
        gist_threshold: f32,
    },
}

#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub mode: ContextMode,
    pub max_context_tokens: usize,
    pub expansion_max_tokens: usize,
    pub snippet_max_tokens: usize,
    pub max_snippets: usize,
    pub max_surrogates: usize,
    pub surrogate_max_tokens: usize,
    pub search_top_k: usize,
    pub search_mode: SearchMode,
    pub tier_policy: TierPolicy,
    /// Pins "now" for reproducible tier selection in tests.
    pub deterministic_now_ms: Option<i64>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            mode: ContextMode::Fast,
            max_context_tokens: 2048,
            expansion_max_tokens: 256,
            snippet_max_tokens: 256,
            max_snippets: 12,
            max_surrogates: 4,
            surrogate_max_tokens: 128,
            search_top_k: 16,
            search_mode: SearchMode::default(),
            tier_policy: TierPolicy::default(),
            deterministic_now_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContextItem {
    pub frame_id: FrameId,
    pub text: String,
    pub tokens: usize,
    /// Set when this item is a surrogate expansion of another frame.
    pub surrogate_for: Option<FrameId>,
    pub tier: Option<Tier>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextWindow {
    pub items: Vec<ContextItem>,
    pub total_tokens: usize,
}

impl Archive {
    /// Assemble a context window for `query` under the configured budget.
    pub fn build_context(
        &mut self,
        query: &str,
        embedding: Option<Vec<f32>>,
        config: &ContextConfig,
        counter: &dyn TokenCounter,
    ) -> Result<ContextWindow> {
        let request = SearchRequest {
            query: query.to_string(),
            embedding,
            mode: config.search_mode,
            top_k: config.search_top_k,
            ..SearchRequest::default()
        };
        // Search already hides superseded and non-active frames.
        let response = self.search(request)?;
        let now_ms = config
            .deterministic_now_ms
            .unwrap_or_else(crate::archive::lifecycle::now_ms);

        let mut window = ContextWindow::default();
        let mut surrogates_used = 0usize;

        'candidates: for hit in &response.hits {
            if window.items.len() >= config.max_snippets {
                break;
            }
            let Ok(frame) = self.frame_meta(hit.frame_id) else {
                continue;
            };

            if config.mode == ContextMode::DenseCached
                && frame.role == FrameRole::Chunk
                && surrogates_used < config.max_surrogates
            {
                if let Some(parent_id) = frame.parent_id {
                    if let Some(item) =
                        self.surrogate_item(parent_id, config, counter, now_ms)?
                    {
                        if window.total_tokens + item.tokens > config.max_context_tokens {
                            break 'candidates;
                        }
                        window.total_tokens += item.tokens;
                        window.items.push(item);
                        surrogates_used += 1;
                    }
                }
            }

            let Some(preview) =
                self.frame_preview(hit.frame_id, usize::MAX)?
            else {
                continue;
            };
            let text = counter.truncate(&preview, config.snippet_max_tokens);
            let tokens = counter.count(&text);
            if window.total_tokens + tokens > config.max_context_tokens {
                break;
            }
            window.total_tokens += tokens;
            window.items.push(ContextItem {
                frame_id: hit.frame_id,
                text,
                tokens,
                surrogate_for: None,
                tier: None,
            });
        }

        Ok(window)
    }

    /// Gist-tier expansion of a chunk's parent, bounded by the surrogate
    /// budget. Returns `None` when the parent has no surrogate child.
    fn surrogate_item(
        &mut self,
        parent_id: FrameId,
        config: &ContextConfig,
        counter: &dyn TokenCounter,
        now_ms: i64,
    ) -> Result<Option<ContextItem>> {
        let Some(surrogate) = self.find_surrogate(parent_id) else {
            return Ok(None);
        };
        let tier = select_tier(&config.tier_policy, &surrogate, now_ms);
        let Some(text) = self.tier_text(&surrogate, tier)? else {
            return Ok(None);
        };
        let budget = config.surrogate_max_tokens.min(config.expansion_max_tokens);
        let text = counter.truncate(&text, budget);
        let tokens = counter.count(&text);
        Ok(Some(ContextItem {
            frame_id: surrogate.id,
            text,
            tokens,
            surrogate_for: Some(parent_id),
            tier: Some(tier),
        }))
    }

    /// Lowest-id active surrogate child of `parent_id`.
    fn find_surrogate(&self, parent_id: FrameId) -> Option<Frame> {
        self.union_frames()
            .into_iter()
            .filter(|frame| {
                frame.kind == SURROGATE_KIND
                    && frame.parent_id == Some(parent_id)
                    && frame.is_searchable()
            })
            .min_by_key(|frame| frame.id)
    }

    /// Text for one tier of a surrogate frame. Reduced tiers live in frame
    /// metadata; `full` is the payload itself.
    fn tier_text(&mut self, surrogate: &Frame, tier: Tier) -> Result<Option<String>> {
        let gist = surrogate.metadata.get(SURROGATE_GIST_KEY).cloned();
        let micro = surrogate.metadata.get(SURROGATE_MICRO_KEY).cloned();
        let full = self.frame_preview(surrogate.id, usize::MAX)?;
        Ok(match tier {
            Tier::Full => full,
            Tier::Gist => gist.or(full),
            Tier::Micro => micro.or(gist).or(full),
        })
    }
}

const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

fn select_tier(policy: &TierPolicy, frame: &Frame, now_ms: i64) -> Tier {
    match *policy {
        TierPolicy::Disabled => Tier::Full,
        TierPolicy::AgeOnly {
            recent_days,
            old_days,
        } => {
            let age_days = (now_ms - frame.timestamp_ms).max(0) / MS_PER_DAY;
            if age_days <= i64::from(recent_days) {
                Tier::Full
            } else if age_days <= i64::from(old_days) {
                Tier::Gist
            } else {
                Tier::Micro
            }
        }
        TierPolicy::Importance {
            full_threshold,
            gist_threshold,
        } => {
            let age_days = (now_ms - frame.timestamp_ms).max(0) as f32 / MS_PER_DAY as f32;
            let recency = 1.0 / (1.0 + age_days);
            let accesses: f32 = frame
                .metadata
                .get(ACCESS_COUNT_KEY)
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(0.0);
            let frequency = (accesses / 10.0).min(1.0);
            let score = 0.7 * recency + 0.3 * frequency;
            if score >= full_threshold {
                Tier::Full
            } else if score >= gist_threshold {
                Tier::Gist
            } else {
                Tier::Micro
            }
        }
    }
}
