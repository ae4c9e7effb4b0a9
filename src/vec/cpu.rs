//! CPU vector engine: straight dot product per row, heap-selected top-K.

use std::collections::BTreeSet;

use super::topk::TopK;
use super::{HostMatrix, Similarity, VecArtifact, VecEngine, l2_normalize, validate_top_k};
use crate::error::Result;
use crate::types::search::VecEngineKind;

#[derive(Debug)]
pub struct CpuVecEngine {
    matrix: HostMatrix,
    similarity: Similarity,
}

impl CpuVecEngine {
    #[must_use]
    pub fn new(dims: u32, similarity: Similarity) -> Self {
        Self {
            matrix: HostMatrix::new(dims as usize),
            similarity,
        }
    }

    pub fn from_artifact(artifact: &VecArtifact) -> Result<Self> {
        let mut engine = Self::new(artifact.dims, artifact.similarity);
        for (row, frame_id) in artifact.frame_ids.iter().enumerate() {
            let dims = artifact.dims as usize;
            engine.add(*frame_id, &artifact.vectors[row * dims..(row + 1) * dims])?;
        }
        Ok(engine)
    }

    #[must_use]
    pub fn similarity(&self) -> Similarity {
        self.similarity
    }

    fn prepared(&self, vector: &[f32]) -> Vec<f32> {
        let mut owned = vector.to_vec();
        if self.similarity == Similarity::Cosine {
            l2_normalize(&mut owned);
        }
        owned
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

impl VecEngine for CpuVecEngine {
    fn kind(&self) -> VecEngineKind {
        VecEngineKind::Cpu
    }

    fn dims(&self) -> u32 {
        self.matrix.dims() as u32
    }

    fn len(&self) -> usize {
        self.matrix.len()
    }

    fn contains(&self, frame_id: u64) -> bool {
        self.matrix.contains(frame_id)
    }

    fn add(&mut self, frame_id: u64, vector: &[f32]) -> Result<()> {
        let prepared = self.prepared(vector);
        self.matrix.upsert(frame_id, &prepared)?;
        Ok(())
    }

    fn remove(&mut self, frame_id: u64) -> Result<bool> {
        Ok(self.matrix.swap_remove(frame_id).is_some())
    }

    fn search_filtered(
        &mut self,
        query: &[f32],
        top_k: usize,
        allow: Option<&BTreeSet<u64>>,
    ) -> Result<Vec<(u64, f32)>> {
        let query = self.prepared(query);
        if query.len() != self.matrix.dims() {
            return Err(crate::error::ArchiveError::DimensionMismatch {
                expected: self.matrix.dims() as u32,
                actual: query.len() as u32,
            });
        }
        let mut topk = TopK::new(validate_top_k(top_k));
        for row in 0..self.matrix.len() {
            let frame_id = self.matrix.frame_id_at(row);
            if let Some(allow) = allow {
                if !allow.contains(&frame_id) {
                    continue;
                }
            }
            topk.push(frame_id, dot(&query, self.matrix.row(row)));
        }
        Ok(topk.into_sorted())
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let artifact = VecArtifact {
            similarity: self.similarity,
            dims: self.matrix.dims() as u32,
            frame_ids: self.matrix.frame_ids().to_vec(),
            vectors: self.matrix.data().to_vec(),
        };
        Ok(artifact.encode())
    }
}
