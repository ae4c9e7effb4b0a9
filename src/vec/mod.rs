//! Dense-vector index: two interchangeable engines over one contiguous
//! row-major f32 matrix, selected by workload.

pub mod cpu;
#[cfg(feature = "gpu")]
pub mod gpu;
pub mod topk;

use std::collections::{BTreeSet, HashMap};

use crate::constants::{
    GPU_AUTO_MAX_TOP_K, GPU_AUTO_MAX_VECTORS, MAX_TOP_K, VEC_BLOB_ENCODING_ROW_MAJOR_F32,
    VEC_BLOB_MAGIC, VEC_BLOB_VERSION,
};
use crate::error::{ArchiveError, Result};
use crate::types::search::{VecEngineKind, VecEnginePreference};

pub use cpu::CpuVecEngine;
#[cfg(feature = "gpu")]
pub use gpu::GpuVecEngine;

/// Scoring metric carried in the vector blob header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Similarity {
    DotProduct = 0,
    /// Cosine similarity; rows and queries are L2-normalized at insert and
    /// query time, so scoring itself is a plain dot product.
    #[default]
    Cosine = 1,
}

impl TryFrom<u8> for Similarity {
    type Error = ArchiveError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::DotProduct),
            1 => Ok(Self::Cosine),
            other => Err(ArchiveError::Encoding {
                reason: format!("unknown similarity tag {other}"),
            }),
        }
    }
}

/// Engine contract shared by the CPU and GPU paths. Search takes `&mut self`
/// because the GPU engine may flush its dirty range to the device first.
pub trait VecEngine: Send {
    fn kind(&self) -> VecEngineKind;
    fn dims(&self) -> u32;
    fn len(&self) -> usize;
    fn contains(&self, frame_id: u64) -> bool;

    /// Overwrite the row when `frame_id` exists, append otherwise.
    fn add(&mut self, frame_id: u64, vector: &[f32]) -> Result<()>;

    fn add_batch(&mut self, frame_ids: &[u64], vectors: &[Vec<f32>]) -> Result<()> {
        if frame_ids.len() != vectors.len() {
            return Err(ArchiveError::Encoding {
                reason: format!(
                    "batch shape mismatch: {} ids, {} vectors",
                    frame_ids.len(),
                    vectors.len()
                ),
            });
        }
        for (frame_id, vector) in frame_ids.iter().zip(vectors) {
            self.add(*frame_id, vector)?;
        }
        Ok(())
    }

    /// Swap-remove. Returns false when the id was absent.
    fn remove(&mut self, frame_id: u64) -> Result<bool>;

    fn search(&mut self, query: &[f32], top_k: usize) -> Result<Vec<(u64, f32)>> {
        self.search_filtered(query, top_k, None)
    }

    /// Top-K by the configured metric; exact ties order by ascending frame
    /// id. The optional allowlist is applied during the scan.
    fn search_filtered(
        &mut self,
        query: &[f32],
        top_k: usize,
        allow: Option<&BTreeSet<u64>>,
    ) -> Result<Vec<(u64, f32)>>;

    fn serialize(&self) -> Result<Vec<u8>>;
}

/// Contiguous host-side state shared by both engines: the `[count x dims]`
/// matrix, the parallel frame-id array, and the id-to-row map.
#[derive(Debug, Clone, Default)]
pub struct HostMatrix {
    dims: usize,
    data: Vec<f32>,
    frame_ids: Vec<u64>,
    rows: HashMap<u64, usize>,
}

/// Rows touched by a mutation, for the GPU dirty range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TouchedRows {
    pub low: usize,
    pub high: usize,
    /// A row was truncated off the end without any row move.
    pub shrank: bool,
}

impl HostMatrix {
    #[must_use]
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn dims(&self) -> usize {
        self.dims
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.frame_ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frame_ids.is_empty()
    }

    #[must_use]
    pub fn contains(&self, frame_id: u64) -> bool {
        self.rows.contains_key(&frame_id)
    }

    #[must_use]
    pub fn frame_id_at(&self, row: usize) -> u64 {
        self.frame_ids[row]
    }

    #[must_use]
    pub fn row(&self, row: usize) -> &[f32] {
        &self.data[row * self.dims..(row + 1) * self.dims]
    }

    #[must_use]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    #[must_use]
    pub fn frame_ids(&self) -> &[u64] {
        &self.frame_ids
    }

    fn check_dims(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dims {
            return Err(ArchiveError::DimensionMismatch {
                expected: self.dims as u32,
                actual: vector.len() as u32,
            });
        }
        Ok(())
    }

    /// Overwrite-or-append; O(1) amortized. Returns the touched row.
    pub fn upsert(&mut self, frame_id: u64, vector: &[f32]) -> Result<TouchedRows> {
        self.check_dims(vector)?;
        if let Some(&row) = self.rows.get(&frame_id) {
            self.data[row * self.dims..(row + 1) * self.dims].copy_from_slice(vector);
            return Ok(TouchedRows {
                low: row,
                high: row,
                shrank: false,
            });
        }
        let row = self.frame_ids.len();
        self.frame_ids.push(frame_id);
        self.data.extend_from_slice(vector);
        self.rows.insert(frame_id, row);
        Ok(TouchedRows {
            low: row,
            high: row,
            shrank: false,
        })
    }

    /// Swap-remove: the last row moves into the vacated slot, so at most one
    /// surviving row changes.
    pub fn swap_remove(&mut self, frame_id: u64) -> Option<TouchedRows> {
        let row = self.rows.remove(&frame_id)?;
        let last = self.frame_ids.len() - 1;
        if row != last {
            let moved_id = self.frame_ids[last];
            let (head, tail) = self.data.split_at_mut(last * self.dims);
            head[row * self.dims..(row + 1) * self.dims].copy_from_slice(&tail[..self.dims]);
            self.frame_ids[row] = moved_id;
            self.rows.insert(moved_id, row);
        }
        self.frame_ids.pop();
        self.data.truncate(last * self.dims);
        Some(TouchedRows {
            low: row,
            high: row,
            shrank: row == last,
        })
    }
}

/// Decoded vector blob, the commit artifact exchanged with the store.
#[derive(Debug, Clone, PartialEq)]
pub struct VecArtifact {
    pub similarity: Similarity,
    pub dims: u32,
    pub frame_ids: Vec<u64>,
    /// Row-major `[count x dims]`.
    pub vectors: Vec<f32>,
}

impl VecArtifact {
    #[must_use]
    pub fn empty(dims: u32, similarity: Similarity) -> Self {
        Self {
            similarity,
            dims,
            frame_ids: Vec::new(),
            vectors: Vec::new(),
        }
    }

    #[must_use]
    pub fn vector_count(&self) -> u64 {
        self.frame_ids.len() as u64
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let count = self.frame_ids.len() as u64;
        let vector_bytes_len = self.vectors.len() as u64 * 4;
        let frame_ids_bytes_len = count * 8;
        let mut buf =
            Vec::with_capacity(44 + vector_bytes_len as usize + frame_ids_bytes_len as usize);
        buf.extend_from_slice(&VEC_BLOB_MAGIC.to_le_bytes());
        buf.extend_from_slice(&VEC_BLOB_VERSION.to_le_bytes());
        buf.push(VEC_BLOB_ENCODING_ROW_MAJOR_F32);
        buf.push(self.similarity as u8);
        buf.extend_from_slice(&self.dims.to_le_bytes());
        buf.extend_from_slice(&count.to_le_bytes());
        buf.extend_from_slice(&vector_bytes_len.to_le_bytes());
        buf.extend_from_slice(&[0u8; 8]);
        for value in &self.vectors {
            buf.extend_from_slice(&value.to_le_bytes());
        }
        buf.extend_from_slice(&frame_ids_bytes_len.to_le_bytes());
        for frame_id in &self.frame_ids {
            buf.extend_from_slice(&frame_id.to_le_bytes());
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let truncated = || ArchiveError::Encoding {
            reason: "vector blob truncated".into(),
        };
        let take_u32 = |pos: usize| -> Result<u32> {
            bytes
                .get(pos..pos + 4)
                .and_then(|s| s.try_into().ok())
                .map(u32::from_le_bytes)
                .ok_or_else(truncated)
        };
        let take_u64 = |pos: usize| -> Result<u64> {
            bytes
                .get(pos..pos + 8)
                .and_then(|s| s.try_into().ok())
                .map(u64::from_le_bytes)
                .ok_or_else(truncated)
        };

        let magic = take_u32(0)?;
        if magic != VEC_BLOB_MAGIC {
            return Err(ArchiveError::Encoding {
                reason: format!("bad vector blob magic 0x{magic:08x}"),
            });
        }
        let version = u16::from_le_bytes(bytes.get(4..6).and_then(|s| s.try_into().ok()).ok_or_else(truncated)?);
        if version != VEC_BLOB_VERSION {
            return Err(ArchiveError::Encoding {
                reason: format!("unsupported vector blob version {version}"),
            });
        }
        let encoding = *bytes.get(6).ok_or_else(truncated)?;
        if encoding != VEC_BLOB_ENCODING_ROW_MAJOR_F32 {
            return Err(ArchiveError::Encoding {
                reason: format!("unsupported vector encoding {encoding}"),
            });
        }
        let similarity = Similarity::try_from(*bytes.get(7).ok_or_else(truncated)?)?;
        let dims = take_u32(8)?;
        let count = take_u64(12)?;
        let vector_bytes_len = take_u64(20)?;
        if vector_bytes_len != count * u64::from(dims) * 4 {
            return Err(ArchiveError::Encoding {
                reason: format!(
                    "vector byte length {vector_bytes_len} inconsistent with {count} x {dims}"
                ),
            });
        }

        let vectors_start = 44usize;
        let vectors_end = vectors_start + vector_bytes_len as usize;
        let vector_bytes = bytes.get(vectors_start..vectors_end).ok_or_else(truncated)?;
        let mut vectors = Vec::with_capacity((count * u64::from(dims)) as usize);
        for chunk in vector_bytes.chunks_exact(4) {
            vectors.push(f32::from_le_bytes(chunk.try_into().unwrap_or([0; 4])));
        }

        let frame_ids_bytes_len = take_u64(vectors_end)?;
        if frame_ids_bytes_len != count * 8 {
            return Err(ArchiveError::Encoding {
                reason: format!("frame id byte length {frame_ids_bytes_len} inconsistent"),
            });
        }
        let ids_start = vectors_end + 8;
        let ids_bytes = bytes
            .get(ids_start..ids_start + frame_ids_bytes_len as usize)
            .ok_or_else(truncated)?;
        let mut frame_ids = Vec::with_capacity(count as usize);
        for chunk in ids_bytes.chunks_exact(8) {
            frame_ids.push(u64::from_le_bytes(chunk.try_into().unwrap_or([0; 8])));
        }

        Ok(Self {
            similarity,
            dims,
            frame_ids,
            vectors,
        })
    }
}

#[must_use]
pub fn validate_top_k(top_k: usize) -> usize {
    top_k.min(MAX_TOP_K)
}

/// Engine try-order for a workload. Construction failures fall through to the
/// next kind in the list.
#[must_use]
pub fn engine_order(
    preference: VecEnginePreference,
    vector_count: usize,
    top_k: usize,
) -> Vec<VecEngineKind> {
    match preference {
        VecEnginePreference::CpuOnly => vec![VecEngineKind::Cpu],
        VecEnginePreference::GpuPreferred => vec![VecEngineKind::Gpu, VecEngineKind::Cpu],
        VecEnginePreference::Auto => {
            if top_k > GPU_AUTO_MAX_TOP_K || vector_count > GPU_AUTO_MAX_VECTORS {
                vec![VecEngineKind::Cpu, VecEngineKind::Gpu]
            } else {
                vec![VecEngineKind::Gpu, VecEngineKind::Cpu]
            }
        }
    }
}

fn build_kind(kind: VecEngineKind, artifact: &VecArtifact) -> Result<Box<dyn VecEngine>> {
    match kind {
        VecEngineKind::Cpu => Ok(Box::new(CpuVecEngine::from_artifact(artifact)?)),
        #[cfg(feature = "gpu")]
        VecEngineKind::Gpu => Ok(Box::new(GpuVecEngine::from_artifact(artifact)?)),
        #[cfg(not(feature = "gpu"))]
        VecEngineKind::Gpu => Err(ArchiveError::Encoding {
            reason: "gpu engine not compiled in".into(),
        }),
    }
}

/// Materialize an engine for `artifact`, trying kinds in workload order and
/// falling back on construction failure.
pub fn build_engine(
    artifact: &VecArtifact,
    preference: VecEnginePreference,
    top_k: usize,
) -> Result<Box<dyn VecEngine>> {
    let order = engine_order(preference, artifact.frame_ids.len(), top_k);
    let mut last_err = None;
    for kind in order {
        match build_kind(kind, artifact) {
            Ok(engine) => return Ok(engine),
            Err(err) => {
                tracing::debug!(kind = ?kind, error = %err, "vector engine construction failed");
                last_err = Some(err);
            }
        }
    }
    Err(last_err.unwrap_or(ArchiveError::Encoding {
        reason: "no vector engine available".into(),
    }))
}

/// Whether a GPU device can actually be constructed in this process.
/// Probed once; drives engine-kind selection in the cache key.
#[cfg(feature = "gpu")]
#[must_use]
pub fn gpu_available() -> bool {
    use once_cell::sync::Lazy;
    static AVAILABLE: Lazy<bool> = Lazy::new(|| {
        candle_core::Device::new_metal(0)
            .or_else(|_| candle_core::Device::new_cuda(0))
            .is_ok()
    });
    *AVAILABLE
}

#[cfg(not(feature = "gpu"))]
#[must_use]
pub fn gpu_available() -> bool {
    false
}

pub(crate) fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_roundtrip() {
        let artifact = VecArtifact {
            similarity: Similarity::Cosine,
            dims: 3,
            frame_ids: vec![4, 9, 11],
            vectors: vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.5, 0.5, 0.0],
        };
        let decoded = VecArtifact::decode(&artifact.encode()).expect("decode");
        assert_eq!(decoded, artifact);
    }

    #[test]
    fn artifact_rejects_shape_lies() {
        let artifact = VecArtifact {
            similarity: Similarity::Cosine,
            dims: 3,
            frame_ids: vec![1],
            vectors: vec![1.0, 0.0, 0.0],
        };
        let mut bytes = artifact.encode();
        // Claim two vectors while carrying one.
        bytes[12..20].copy_from_slice(&2u64.to_le_bytes());
        assert!(VecArtifact::decode(&bytes).is_err());
    }

    #[test]
    fn swap_remove_moves_last_row() {
        let mut matrix = HostMatrix::new(2);
        matrix.upsert(10, &[1.0, 0.0]).expect("a");
        matrix.upsert(20, &[0.0, 1.0]).expect("b");
        matrix.upsert(30, &[0.5, 0.5]).expect("c");

        let touched = matrix.swap_remove(10).expect("remove");
        assert_eq!(touched.low, 0);
        assert!(!touched.shrank);
        assert_eq!(matrix.len(), 2);
        assert_eq!(matrix.frame_id_at(0), 30);
        assert_eq!(matrix.row(0), &[0.5, 0.5]);
        assert!(matrix.contains(20));
        assert!(!matrix.contains(10));
    }

    #[test]
    fn swap_remove_last_row_shrinks() {
        let mut matrix = HostMatrix::new(2);
        matrix.upsert(10, &[1.0, 0.0]).expect("a");
        matrix.upsert(20, &[0.0, 1.0]).expect("b");
        let touched = matrix.swap_remove(20).expect("remove");
        assert!(touched.shrank);
        assert_eq!(matrix.len(), 1);
    }

    #[test]
    fn auto_order_follows_workload() {
        use VecEngineKind::{Cpu, Gpu};
        assert_eq!(
            engine_order(VecEnginePreference::Auto, 100, 10),
            vec![Gpu, Cpu]
        );
        assert_eq!(
            engine_order(VecEnginePreference::Auto, 100, 65),
            vec![Cpu, Gpu]
        );
        assert_eq!(
            engine_order(VecEnginePreference::Auto, 30_000, 10),
            vec![Cpu, Gpu]
        );
        assert_eq!(
            engine_order(VecEnginePreference::CpuOnly, 100, 10),
            vec![Cpu]
        );
        assert_eq!(
            engine_order(VecEnginePreference::GpuPreferred, 30_000, 100),
            vec![Gpu, Cpu]
        );
    }

    #[test]
    fn build_engine_falls_back_to_cpu() {
        let artifact = VecArtifact::empty(4, Similarity::Cosine);
        let engine =
            build_engine(&artifact, VecEnginePreference::GpuPreferred, 8).expect("fallback");
        // Without a device the GPU constructor fails and the CPU engine wins.
        #[cfg(not(feature = "gpu"))]
        assert_eq!(engine.kind(), VecEngineKind::Cpu);
        let _ = engine;
    }
}
