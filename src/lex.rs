//! Serializable inverted index with BM25 scoring.
//!
//! Two engine modes over one on-disk format: a mutable owned engine used for
//! staging, and a read-only engine that treats a memory-mapped region as its
//! authoritative backing (the hot path for reader-only consumers — postings
//! are parsed lazily out of the region, never copied wholesale). Both modes
//! must return identical results for the same query over the same bytes.
//!
//! Blob layout (little-endian):
//!
//! ```text
//! magic u32 "WV2L" | version u16 | flags u16 | doc_count u64 | total_len u64
//! doc table: doc_count * (frame_id u64, token_len u32)
//! term_count u64
//! per term: term_len u16 | term bytes | df u32 | df * (frame_id u64, tf u32)
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use memmap2::Mmap;

use crate::constants::{LEX_BLOB_MAGIC, LEX_BLOB_VERSION};
use crate::error::{ArchiveError, Result};

const BM25_K1: f32 = 1.2;
const BM25_B: f32 = 0.75;

const HEADER_LEN: usize = 4 + 2 + 2 + 8 + 8;

#[derive(Debug, Clone, PartialEq)]
pub struct LexSearchHit {
    pub frame_id: u64,
    pub score: f32,
    /// First query term that matched, usable as a highlight hint.
    pub matched_term: Option<String>,
}

/// Byte source for a read-only engine.
#[derive(Clone)]
pub enum LexBacking {
    Owned(Arc<Vec<u8>>),
    Mapped {
        map: Arc<Mmap>,
        offset: usize,
        len: usize,
    },
}

impl LexBacking {
    fn bytes(&self) -> &[u8] {
        match self {
            Self::Owned(bytes) => bytes,
            Self::Mapped { map, offset, len } => &map[*offset..*offset + *len],
        }
    }
}

impl std::fmt::Debug for LexBacking {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Owned(bytes) => write!(f, "LexBacking::Owned({} bytes)", bytes.len()),
            Self::Mapped { len, .. } => write!(f, "LexBacking::Mapped({len} bytes)"),
        }
    }
}

#[derive(Debug)]
enum Mode {
    Mutable {
        /// term -> frame_id -> term frequency
        postings: BTreeMap<String, BTreeMap<u64, u32>>,
        doc_lengths: BTreeMap<u64, u32>,
        total_len: u64,
    },
    ReadOnly {
        backing: LexBacking,
        /// term -> (postings byte offset, document frequency)
        terms: BTreeMap<String, (usize, u32)>,
        doc_lengths: HashMap<u64, u32>,
        total_len: u64,
    },
}

#[derive(Debug)]
pub struct LexIndex {
    mode: Mode,
}

/// Lowercased alphanumeric runs; everything else separates tokens.
#[must_use]
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            for lower in ch.to_lowercase() {
                current.push(lower);
            }
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

impl Default for LexIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl LexIndex {
    #[must_use]
    pub fn new() -> Self {
        Self {
            mode: Mode::Mutable {
                postings: BTreeMap::new(),
                doc_lengths: BTreeMap::new(),
                total_len: 0,
            },
        }
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        matches!(self.mode, Mode::ReadOnly { .. })
    }

    #[must_use]
    pub fn doc_count(&self) -> u64 {
        match &self.mode {
            Mode::Mutable { doc_lengths, .. } => doc_lengths.len() as u64,
            Mode::ReadOnly { doc_lengths, .. } => doc_lengths.len() as u64,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.doc_count() == 0
    }

    /// Tokenize `text` and insert postings for `frame_id`. Re-indexing an
    /// existing document replaces its previous postings.
    pub fn index(&mut self, frame_id: u64, text: &str) -> Result<()> {
        let Mode::Mutable {
            postings,
            doc_lengths,
            total_len,
        } = &mut self.mode
        else {
            return Err(read_only_error("index"));
        };

        if doc_lengths.contains_key(&frame_id) {
            remove_doc(postings, doc_lengths, total_len, frame_id);
        }

        let tokens = tokenize(text);
        let length = tokens.len() as u32;
        doc_lengths.insert(frame_id, length);
        *total_len += u64::from(length);
        for token in tokens {
            *postings.entry(token).or_default().entry(frame_id).or_insert(0) += 1;
        }
        Ok(())
    }

    /// Tombstone every posting of `frame_id`. Unknown ids are a no-op.
    pub fn remove(&mut self, frame_id: u64) -> Result<()> {
        let Mode::Mutable {
            postings,
            doc_lengths,
            total_len,
        } = &mut self.mode
        else {
            return Err(read_only_error("remove"));
        };
        remove_doc(postings, doc_lengths, total_len, frame_id);
        Ok(())
    }

    /// BM25 over the current postings. `allow` pushes an id allowlist down
    /// into scoring. Ties break by ascending frame id.
    #[must_use]
    pub fn search(
        &self,
        query: &str,
        top_k: usize,
        allow: Option<&BTreeSet<u64>>,
    ) -> Vec<LexSearchHit> {
        let terms = {
            let mut t = tokenize(query);
            t.sort();
            t.dedup();
            t
        };
        if terms.is_empty() || top_k == 0 {
            return Vec::new();
        }

        let doc_count = self.doc_count();
        if doc_count == 0 {
            return Vec::new();
        }
        let avg_len = (self.total_len() as f32 / doc_count as f32).max(1.0);

        let mut scores: HashMap<u64, (f32, &str)> = HashMap::new();
        for term in &terms {
            let Some(posting) = self.postings_for(term) else {
                continue;
            };
            let df = posting.len() as f32;
            let idf = (1.0 + (doc_count as f32 - df + 0.5) / (df + 0.5)).ln();
            for (frame_id, tf) in posting {
                if let Some(allow) = allow {
                    if !allow.contains(&frame_id) {
                        continue;
                    }
                }
                let doc_len = self.doc_length(frame_id).unwrap_or(0) as f32;
                let tf = tf as f32;
                let norm = tf * (BM25_K1 + 1.0)
                    / (tf + BM25_K1 * (1.0 - BM25_B + BM25_B * doc_len / avg_len));
                let entry = scores.entry(frame_id).or_insert((0.0, term.as_str()));
                entry.0 += idf * norm;
            }
        }

        let mut hits: Vec<LexSearchHit> = scores
            .into_iter()
            .map(|(frame_id, (score, term))| LexSearchHit {
                frame_id,
                score,
                matched_term: Some(term.to_string()),
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.frame_id.cmp(&b.frame_id))
        });
        hits.truncate(top_k);
        hits
    }

    fn total_len(&self) -> u64 {
        match &self.mode {
            Mode::Mutable { total_len, .. } | Mode::ReadOnly { total_len, .. } => *total_len,
        }
    }

    fn doc_length(&self, frame_id: u64) -> Option<u32> {
        match &self.mode {
            Mode::Mutable { doc_lengths, .. } => doc_lengths.get(&frame_id).copied(),
            Mode::ReadOnly { doc_lengths, .. } => doc_lengths.get(&frame_id).copied(),
        }
    }

    /// Postings for one term, materialized as `(frame_id, tf)` pairs in
    /// ascending id order.
    fn postings_for(&self, term: &str) -> Option<Vec<(u64, u32)>> {
        match &self.mode {
            Mode::Mutable { postings, .. } => postings
                .get(term)
                .map(|m| m.iter().map(|(id, tf)| (*id, *tf)).collect()),
            Mode::ReadOnly { backing, terms, .. } => {
                let (offset, df) = *terms.get(term)?;
                let bytes = backing.bytes();
                let mut out = Vec::with_capacity(df as usize);
                let mut pos = offset;
                for _ in 0..df {
                    let id = read_u64(bytes, pos)?;
                    let tf = read_u32(bytes, pos + 8)?;
                    out.push((id, tf));
                    pos += 12;
                }
                Some(out)
            }
        }
    }

    /// Full snapshot in the blob format.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let doc_count = self.doc_count();
        let mut buf = Vec::new();
        buf.extend_from_slice(&LEX_BLOB_MAGIC.to_le_bytes());
        buf.extend_from_slice(&LEX_BLOB_VERSION.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&doc_count.to_le_bytes());
        buf.extend_from_slice(&self.total_len().to_le_bytes());

        match &self.mode {
            Mode::Mutable {
                postings,
                doc_lengths,
                ..
            } => {
                for (frame_id, len) in doc_lengths {
                    buf.extend_from_slice(&frame_id.to_le_bytes());
                    buf.extend_from_slice(&len.to_le_bytes());
                }
                buf.extend_from_slice(&(postings.len() as u64).to_le_bytes());
                for (term, posting) in postings {
                    encode_term(&mut buf, term)?;
                    buf.extend_from_slice(&(posting.len() as u32).to_le_bytes());
                    for (frame_id, tf) in posting {
                        buf.extend_from_slice(&frame_id.to_le_bytes());
                        buf.extend_from_slice(&tf.to_le_bytes());
                    }
                }
            }
            Mode::ReadOnly {
                doc_lengths, terms, ..
            } => {
                let mut sorted_docs: Vec<_> = doc_lengths.iter().collect();
                sorted_docs.sort_by_key(|(id, _)| **id);
                for (frame_id, len) in sorted_docs {
                    buf.extend_from_slice(&frame_id.to_le_bytes());
                    buf.extend_from_slice(&len.to_le_bytes());
                }
                buf.extend_from_slice(&(terms.len() as u64).to_le_bytes());
                for term in terms.keys() {
                    encode_term(&mut buf, term)?;
                    let posting = self.postings_for(term).unwrap_or_default();
                    buf.extend_from_slice(&(posting.len() as u32).to_le_bytes());
                    for (frame_id, tf) in posting {
                        buf.extend_from_slice(&frame_id.to_le_bytes());
                        buf.extend_from_slice(&tf.to_le_bytes());
                    }
                }
            }
        }
        Ok(buf)
    }

    /// Mutable copy of the snapshot; the staging path for copy-on-write.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let parsed = Parsed::from_bytes(bytes)?;
        let mut postings: BTreeMap<String, BTreeMap<u64, u32>> = BTreeMap::new();
        for (term, (offset, df)) in &parsed.terms {
            let mut map = BTreeMap::new();
            let mut pos = *offset;
            for _ in 0..*df {
                let id = read_u64(bytes, pos).ok_or_else(truncated)?;
                let tf = read_u32(bytes, pos + 8).ok_or_else(truncated)?;
                map.insert(id, tf);
                pos += 12;
            }
            postings.insert(term.clone(), map);
        }
        Ok(Self {
            mode: Mode::Mutable {
                postings,
                doc_lengths: parsed.doc_lengths.into_iter().collect(),
                total_len: parsed.total_len,
            },
        })
    }

    /// Read-only open over a region; the region stays authoritative and all
    /// write operations fail.
    pub fn deserialize_read_only(backing: LexBacking) -> Result<Self> {
        let parsed = Parsed::from_bytes(backing.bytes())?;
        Ok(Self {
            mode: Mode::ReadOnly {
                terms: parsed.terms,
                doc_lengths: parsed.doc_lengths.into_iter().collect(),
                total_len: parsed.total_len,
                backing,
            },
        })
    }

    /// Materialize a mutable engine with identical contents, regardless of
    /// the current mode.
    pub fn to_mutable(&self) -> Result<Self> {
        match &self.mode {
            Mode::Mutable { .. } => {
                let bytes = self.serialize()?;
                Self::deserialize(&bytes)
            }
            Mode::ReadOnly { .. } => {
                let bytes = self.serialize()?;
                Self::deserialize(&bytes)
            }
        }
    }
}

fn read_only_error(op: &str) -> ArchiveError {
    ArchiveError::ReadOnly {
        reason: format!("lexical index is mmap-backed; {op} requires a mutable copy"),
    }
}

fn truncated() -> ArchiveError {
    ArchiveError::Encoding {
        reason: "lexical blob truncated".into(),
    }
}

fn remove_doc(
    postings: &mut BTreeMap<String, BTreeMap<u64, u32>>,
    doc_lengths: &mut BTreeMap<u64, u32>,
    total_len: &mut u64,
    frame_id: u64,
) {
    let Some(length) = doc_lengths.remove(&frame_id) else {
        return;
    };
    *total_len = total_len.saturating_sub(u64::from(length));
    postings.retain(|_, posting| {
        posting.remove(&frame_id);
        !posting.is_empty()
    });
}

fn encode_term(buf: &mut Vec<u8>, term: &str) -> Result<()> {
    let len = u16::try_from(term.len()).map_err(|_| ArchiveError::Encoding {
        reason: format!("term longer than 64 KiB: {} bytes", term.len()),
    })?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(term.as_bytes());
    Ok(())
}

fn read_u32(bytes: &[u8], pos: usize) -> Option<u32> {
    bytes
        .get(pos..pos + 4)
        .and_then(|s| s.try_into().ok())
        .map(u32::from_le_bytes)
}

fn read_u64(bytes: &[u8], pos: usize) -> Option<u64> {
    bytes
        .get(pos..pos + 8)
        .and_then(|s| s.try_into().ok())
        .map(u64::from_le_bytes)
}

fn read_u16(bytes: &[u8], pos: usize) -> Option<u16> {
    bytes
        .get(pos..pos + 2)
        .and_then(|s| s.try_into().ok())
        .map(u16::from_le_bytes)
}

/// Shared structural parse used by both deserialize paths.
struct Parsed {
    doc_lengths: Vec<(u64, u32)>,
    total_len: u64,
    terms: BTreeMap<String, (usize, u32)>,
}

impl Parsed {
    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(truncated());
        }
        let magic = read_u32(bytes, 0).ok_or_else(truncated)?;
        if magic != LEX_BLOB_MAGIC {
            return Err(ArchiveError::Encoding {
                reason: format!("bad lexical blob magic 0x{magic:08x}"),
            });
        }
        let version = read_u16(bytes, 4).ok_or_else(truncated)?;
        if version != LEX_BLOB_VERSION {
            return Err(ArchiveError::Encoding {
                reason: format!("unsupported lexical blob version {version}"),
            });
        }
        let doc_count = read_u64(bytes, 8).ok_or_else(truncated)?;
        let total_len = read_u64(bytes, 16).ok_or_else(truncated)?;

        let mut pos = HEADER_LEN;
        let mut doc_lengths = Vec::with_capacity(doc_count as usize);
        for _ in 0..doc_count {
            let id = read_u64(bytes, pos).ok_or_else(truncated)?;
            let len = read_u32(bytes, pos + 8).ok_or_else(truncated)?;
            doc_lengths.push((id, len));
            pos += 12;
        }

        let term_count = read_u64(bytes, pos).ok_or_else(truncated)?;
        pos += 8;
        let mut terms = BTreeMap::new();
        for _ in 0..term_count {
            let term_len = read_u16(bytes, pos).ok_or_else(truncated)? as usize;
            pos += 2;
            let term_bytes = bytes.get(pos..pos + term_len).ok_or_else(truncated)?;
            let term = std::str::from_utf8(term_bytes)
                .map_err(|_| ArchiveError::Encoding {
                    reason: "lexical term is not valid utf-8".into(),
                })?
                .to_string();
            pos += term_len;
            let df = read_u32(bytes, pos).ok_or_else(truncated)?;
            pos += 4;
            let postings_bytes = (df as usize) * 12;
            if bytes.len() < pos + postings_bytes {
                return Err(truncated());
            }
            terms.insert(term, (pos, df));
            pos += postings_bytes;
        }

        Ok(Self {
            doc_lengths,
            total_len,
            terms,
        })
    }
}
