//! GPU vector engine over a candle device tensor.
//!
//! The authoritative matrix lives host-side; a device-resident copy is kept
//! lazily in sync. Mutations only mark a dirty row range, and `search` uploads
//! just those rows before running one batched matmul (one distance per lane;
//! candle vectorizes the inner product, including the packed 4-wide path when
//! `dims % 4 == 0`). Read-heavy workloads therefore copy zero bytes per
//! search.

use std::collections::BTreeSet;

use candle_core::{Device, Tensor};

use super::topk::TopK;
use super::{HostMatrix, Similarity, VecArtifact, VecEngine, l2_normalize, validate_top_k};
use crate::constants::GPU_INITIAL_CAPACITY;
use crate::error::{ArchiveError, Result};
use crate::types::search::VecEngineKind;

fn device_err(err: candle_core::Error) -> ArchiveError {
    ArchiveError::Encoding {
        reason: format!("gpu engine: {err}"),
    }
}

#[derive(Debug)]
pub struct GpuVecEngine {
    matrix: HostMatrix,
    similarity: Similarity,
    device: Device,
    dev_matrix: Option<Tensor>,
    dirty: Option<(usize, usize)>,
    needs_full_refresh: bool,
    /// Structural mutations since the last sync; more than one shape change
    /// forces a full refresh.
    appended_since_sync: usize,
    removed_since_sync: usize,
    capacity: usize,
    sync_count: u64,
    last_copied_rows: usize,
}

impl GpuVecEngine {
    /// Pick the best available device: Metal, then CUDA. Construction fails
    /// when neither exists, letting the selector fall back to the CPU engine.
    pub fn new(dims: u32, similarity: Similarity) -> Result<Self> {
        let device = Device::new_metal(0)
            .or_else(|_| Device::new_cuda(0))
            .map_err(device_err)?;
        Ok(Self::with_device(dims, similarity, device))
    }

    /// Build on an explicit device. Used by tests to exercise the lazy-sync
    /// machinery without GPU hardware.
    #[must_use]
    pub fn with_device(dims: u32, similarity: Similarity, device: Device) -> Self {
        Self {
            matrix: HostMatrix::new(dims as usize),
            similarity,
            device,
            dev_matrix: None,
            dirty: None,
            needs_full_refresh: false,
            appended_since_sync: 0,
            removed_since_sync: 0,
            capacity: GPU_INITIAL_CAPACITY,
            sync_count: 0,
            last_copied_rows: 0,
        }
    }

    pub fn from_artifact(artifact: &VecArtifact) -> Result<Self> {
        let mut engine = Self::new(artifact.dims, artifact.similarity)?;
        engine.load_artifact(artifact)?;
        Ok(engine)
    }

    pub fn from_artifact_on(artifact: &VecArtifact, device: Device) -> Result<Self> {
        let mut engine = Self::with_device(artifact.dims, artifact.similarity, device);
        engine.load_artifact(artifact)?;
        Ok(engine)
    }

    fn load_artifact(&mut self, artifact: &VecArtifact) -> Result<()> {
        let dims = artifact.dims as usize;
        for (row, frame_id) in artifact.frame_ids.iter().enumerate() {
            self.add(*frame_id, &artifact.vectors[row * dims..(row + 1) * dims])?;
        }
        Ok(())
    }

    /// Host-to-device copies performed so far; test observability.
    #[must_use]
    pub fn sync_count(&self) -> u64 {
        self.sync_count
    }

    /// Rows uploaded by the most recent sync.
    #[must_use]
    pub fn last_copied_rows(&self) -> usize {
        self.last_copied_rows
    }

    fn prepared(&self, vector: &[f32]) -> Vec<f32> {
        let mut owned = vector.to_vec();
        if self.similarity == Similarity::Cosine {
            l2_normalize(&mut owned);
        }
        owned
    }

    fn mark_dirty(&mut self, low: usize, high: usize) {
        self.dirty = Some(match self.dirty {
            Some((lo, hi)) => (lo.min(low), hi.max(high)),
            None => (low, high),
        });
    }

    fn rows_tensor(&self, low: usize, high: usize) -> Result<Tensor> {
        let dims = self.matrix.dims();
        let count = high - low + 1;
        let data = self.matrix.data()[low * dims..(high + 1) * dims].to_vec();
        Tensor::from_vec(data, (count, dims), &self.device).map_err(device_err)
    }

    /// Bring the device tensor up to date. Copies only the dirty rows unless
    /// the shape diverged too far since the last sync.
    fn sync_device(&mut self) -> Result<()> {
        let n = self.matrix.len();
        let dims = self.matrix.dims();

        let dev_rows = self
            .dev_matrix
            .as_ref()
            .and_then(|t| t.dims2().ok())
            .map_or(0, |(rows, _)| rows);

        let dirty_path_ok = !self.needs_full_refresh
            && self.dev_matrix.is_some()
            && (self.removed_since_sync == 0
                || (self.removed_since_sync == 1 && self.appended_since_sync == 0));

        if !dirty_path_ok {
            let full = Tensor::from_vec(self.matrix.data().to_vec(), (n, dims), &self.device)
                .map_err(device_err)?;
            self.dev_matrix = Some(full);
            self.sync_count += 1;
            self.last_copied_rows = n;
        } else if let Some((lo, hi)) = self.dirty {
            let hi = hi.min(n.saturating_sub(1));
            if lo <= hi {
                let dev = self.dev_matrix.as_ref().ok_or_else(|| ArchiveError::Encoding {
                    reason: "gpu engine: device tensor missing".into(),
                })?;
                let mut parts: Vec<Tensor> = Vec::with_capacity(3);
                if lo > 0 {
                    parts.push(dev.narrow(0, 0, lo).map_err(device_err)?);
                }
                parts.push(self.rows_tensor(lo, hi)?);
                let tail = n - (hi + 1);
                if tail > 0 {
                    // Untouched rows past the dirty range are still valid on
                    // the device, shifted only by a trailing truncation.
                    parts.push(dev.narrow(0, hi + 1, tail).map_err(device_err)?);
                }
                let refs: Vec<&Tensor> = parts.iter().collect();
                self.dev_matrix = Some(Tensor::cat(&refs, 0).map_err(device_err)?);
                self.sync_count += 1;
                self.last_copied_rows = hi - lo + 1;
            }
        } else if dev_rows != n {
            // Pure trailing shrink: no host bytes to copy.
            let dev = self.dev_matrix.as_ref().ok_or_else(|| ArchiveError::Encoding {
                reason: "gpu engine: device tensor missing".into(),
            })?;
            self.dev_matrix = Some(dev.narrow(0, 0, n).map_err(device_err)?);
        }

        self.dirty = None;
        self.needs_full_refresh = false;
        self.appended_since_sync = 0;
        self.removed_since_sync = 0;
        Ok(())
    }
}

impl VecEngine for GpuVecEngine {
    fn kind(&self) -> VecEngineKind {
        VecEngineKind::Gpu
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
        let before = self.matrix.len();
        let touched = self.matrix.upsert(frame_id, &prepared)?;
        let appended = self.matrix.len() > before;
        if appended {
            self.appended_since_sync += 1;
            if self.matrix.len() > self.capacity {
                // Reservation overflow: double and drop the dirty range; the
                // next search does one full refresh.
                while self.capacity < self.matrix.len() {
                    self.capacity *= 2;
                }
                self.dirty = None;
                self.needs_full_refresh = true;
                tracing::debug!(
                    capacity = self.capacity,
                    rows = self.matrix.len(),
                    "gpu reservation grown"
                );
                return Ok(());
            }
        }
        if !self.needs_full_refresh {
            self.mark_dirty(touched.low, touched.high);
        }
        Ok(())
    }

    fn remove(&mut self, frame_id: u64) -> Result<bool> {
        let Some(touched) = self.matrix.swap_remove(frame_id) else {
            return Ok(false);
        };
        self.removed_since_sync += 1;
        if !self.needs_full_refresh && !touched.shrank {
            self.mark_dirty(touched.low, touched.high);
        }
        Ok(true)
    }

    fn search_filtered(
        &mut self,
        query: &[f32],
        top_k: usize,
        allow: Option<&BTreeSet<u64>>,
    ) -> Result<Vec<(u64, f32)>> {
        if query.len() != self.matrix.dims() {
            return Err(ArchiveError::DimensionMismatch {
                expected: self.matrix.dims() as u32,
                actual: query.len() as u32,
            });
        }
        if self.matrix.is_empty() {
            return Ok(Vec::new());
        }
        self.sync_device()?;

        let query = self.prepared(query);
        let dims = self.matrix.dims();
        let q = Tensor::from_vec(query, (dims, 1), &self.device).map_err(device_err)?;
        let dev = self.dev_matrix.as_ref().ok_or_else(|| ArchiveError::Encoding {
            reason: "gpu engine: device tensor missing".into(),
        })?;
        let scores = dev
            .matmul(&q)
            .and_then(|t| t.squeeze(1))
            .and_then(|t| t.to_vec1::<f32>())
            .map_err(device_err)?;

        let mut topk = TopK::new(validate_top_k(top_k));
        for (row, score) in scores.into_iter().enumerate() {
            let frame_id = self.matrix.frame_id_at(row);
            if let Some(allow) = allow {
                if !allow.contains(&frame_id) {
                    continue;
                }
            }
            topk.push(frame_id, score);
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
