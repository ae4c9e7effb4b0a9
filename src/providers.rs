//! Collaborator interfaces the core consumes but does not implement:
//! embedding models, token counting, and source extraction. The core owns a
//! shared immutable reference to each provider; lifetimes exceed any single
//! session.

use crate::error::{ArchiveError, Result};
use crate::types::embedding::EmbeddingIdentity;

/// Whether a provider may leave the device to do its work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    OnDeviceOnly,
    MayUseNetwork,
}

/// Text-to-vector provider. Implementations should be cheap to call and
/// deterministic for identical input.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|text| self.embed(text)).collect()
    }

    fn dimension(&self) -> u32;

    /// True when produced vectors are L2-normalized.
    fn normalize(&self) -> bool;

    fn identity(&self) -> EmbeddingIdentity;

    fn execution_mode(&self) -> ExecutionMode;
}

/// Reject providers that would leave the device when the archive was opened
/// with `require_on_device`.
pub fn enforce_on_device(embedder: &dyn Embedder, require_on_device: bool) -> Result<()> {
    if require_on_device && embedder.execution_mode() == ExecutionMode::MayUseNetwork {
        let identity = embedder.identity();
        return Err(ArchiveError::ProviderRejected {
            reason: format!(
                "{}/{} may use the network but the session requires on-device execution",
                identity.provider, identity.model
            ),
        });
    }
    Ok(())
}

/// Deterministic token accounting shared by the context builder and its
/// callers: same input, same output, always.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;

    /// Longest prefix of `text` with at most `max_tokens` tokens.
    fn truncate(&self, text: &str, max_tokens: usize) -> String;
}

/// One extracted unit from a source document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedChunk {
    pub text: String,
    pub metadata: Vec<(String, String)>,
    pub capture_time_ms: i64,
}

/// Source-to-chunks provider (OCR, captioning, decoding live behind it).
/// Called by ingest orchestrators, never by the core itself.
pub trait Extractor: Send + Sync {
    fn extract(&self, source_url: &str) -> Result<Vec<ExtractedChunk>>;
}

/// Whitespace/punctuation token counter. Not a model tokenizer, but
/// deterministic and stable across releases, which is what budget enforcement
/// needs.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicTokenCounter;

impl HeuristicTokenCounter {
    fn token_spans(text: &str) -> impl Iterator<Item = (usize, usize)> + '_ {
        let mut spans = Vec::new();
        let mut start: Option<usize> = None;
        for (idx, ch) in text.char_indices() {
            if ch.is_alphanumeric() {
                if start.is_none() {
                    start = Some(idx);
                }
            } else {
                if let Some(s) = start.take() {
                    spans.push((s, idx));
                }
                if !ch.is_whitespace() {
                    // Punctuation counts as its own token.
                    spans.push((idx, idx + ch.len_utf8()));
                }
            }
        }
        if let Some(s) = start {
            spans.push((s, text.len()));
        }
        spans.into_iter()
    }
}

impl TokenCounter for HeuristicTokenCounter {
    fn count(&self, text: &str) -> usize {
        Self::token_spans(text).count()
    }

    fn truncate(&self, text: &str, max_tokens: usize) -> String {
        if max_tokens == 0 {
            return String::new();
        }
        match Self::token_spans(text).nth(max_tokens - 1) {
            Some((_, end)) => text[..end].to_string(),
            None => text.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_is_deterministic() {
        let counter = HeuristicTokenCounter;
        let text = "The quick brown fox, jumping over 2 lazy dogs.";
        assert_eq!(counter.count(text), counter.count(text));
        assert_eq!(counter.count(text), 11);
    }

    #[test]
    fn truncate_respects_budget_and_boundaries() {
        let counter = HeuristicTokenCounter;
        let text = "alpha beta gamma delta";
        let cut = counter.truncate(text, 2);
        assert_eq!(cut, "alpha beta");
        assert!(counter.count(&cut) <= 2);
        assert_eq!(counter.truncate(text, 100), text);
        assert_eq!(counter.truncate(text, 0), "");
    }

    #[test]
    fn truncate_never_splits_chars() {
        let counter = HeuristicTokenCounter;
        let text = "héllo wörld übermut";
        let cut = counter.truncate(text, 2);
        assert_eq!(cut, "héllo wörld");
    }

    struct NetworkEmbedder;

    impl Embedder for NetworkEmbedder {
        fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![0.0; 4])
        }
        fn dimension(&self) -> u32 {
            4
        }
        fn normalize(&self) -> bool {
            true
        }
        fn identity(&self) -> EmbeddingIdentity {
            EmbeddingIdentity {
                provider: "remote".into(),
                model: "m1".into(),
                dimension: 4,
                normalized: true,
            }
        }
        fn execution_mode(&self) -> ExecutionMode {
            ExecutionMode::MayUseNetwork
        }
    }

    #[test]
    fn on_device_policy_rejects_network_providers() {
        let err = enforce_on_device(&NetworkEmbedder, true).expect_err("must reject");
        assert!(matches!(err, ArchiveError::ProviderRejected { .. }));
        enforce_on_device(&NetworkEmbedder, false).expect("allowed when not required");
    }
}
