//! Staged mutations and the two-phase commit coordinator.
//!
//! All writes funnel through the ring WAL first, then into the in-memory
//! pending view. Commit stages payloads and rebuilt index blobs into the data
//! region (phase one), then publishes by writing the inactive TOC slot and
//! flipping the live selector (phase two). Any failure before the flip leaves
//! the previous committed state untouched.

use crate::constants::{MAX_FRAME_BYTES, MAX_SUPERSEDE_DEPTH, NORMALIZED_EPSILON};
use crate::error::{ArchiveError, Result};
use crate::io::header::HeaderCodec;
use crate::io::wal::WalRecordKind;
use crate::lex::{LexBacking, LexIndex};
use crate::toc::{ManifestEntry, TocSlot, checksum64, write_slot};
use crate::types::embedding::{Embedding, EmbeddingIdentity, PendingEmbeddingDiff};
use crate::types::frame::{CanonicalEncoding, Frame, FrameId, FrameStatus};
use crate::types::options::PutOptions;
use crate::vec::{CpuVecEngine, Similarity, VecArtifact, VecEngine};

use super::lifecycle::{
    Archive, build_frame_rows, encode_frame_table, now_ms, read_manifest_blob, wal_codec_config,
    write_blob_at,
};
use super::{
    CheckpointSnapshot, DeleteRecord, EmbedRecord, PendingOp, PutRecord, StagedBlob,
    StagedVecBlob, SupersedeRecord,
};

const ZSTD_LEVEL: i32 = 3;

impl Archive {
    // -- Staged mutations ---------------------------------------------------

    /// Stage a new frame. Assigns the next monotone id and appends a WAL
    /// record; payload bytes reach the data region only at commit.
    pub fn put(&mut self, payload: &[u8], options: PutOptions) -> Result<FrameId> {
        self.ensure_writable()?;
        let (frame, encoded) = self.build_frame(payload, options)?;
        let record = PutRecord {
            frame: frame.clone(),
            payload: encoded.clone(),
        };
        let bytes = bincode::serde::encode_to_vec(&record, wal_codec_config())?;
        let sequence = self.append_wal(WalRecordKind::Put, &bytes)?;
        let frame_id = frame.id;
        self.apply_pending_put(frame, encoded, sequence);
        self.dirty = true;
        self.maybe_auto_commit()?;
        Ok(frame_id)
    }

    /// Stage a batch of frames through a single coalesced WAL write.
    pub fn put_batch(&mut self, items: Vec<(Vec<u8>, PutOptions)>) -> Result<Vec<FrameId>> {
        self.ensure_writable()?;
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let mut staged = Vec::with_capacity(items.len());
        for (payload, options) in items {
            let (frame, encoded) = self.build_frame(&payload, options)?;
            // Reserve the id now so the batch stays contiguous.
            self.next_frame_id = frame.id + 1;
            let record = PutRecord {
                frame: frame.clone(),
                payload: encoded.clone(),
            };
            let bytes = bincode::serde::encode_to_vec(&record, wal_codec_config())?;
            staged.push((frame, encoded, bytes));
        }

        let payloads: Vec<(WalRecordKind, &[u8])> = staged
            .iter()
            .map(|(_, _, bytes)| (WalRecordKind::Put, bytes.as_slice()))
            .collect();
        let sequences = self.append_wal_batch(&payloads)?;

        let mut ids = Vec::with_capacity(staged.len());
        for ((frame, encoded, _), sequence) in staged.into_iter().zip(sequences) {
            ids.push(frame.id);
            self.apply_pending_put(frame, encoded, sequence);
        }
        self.dirty = true;
        self.maybe_auto_commit()?;
        Ok(ids)
    }

    /// Stage a logical replacement: `old_id` stays addressable but hidden
    /// from search once `new_id` supersedes it.
    pub fn supersede(&mut self, old_id: FrameId, new_id: FrameId) -> Result<()> {
        self.ensure_writable()?;
        if old_id == new_id {
            return Err(ArchiveError::Encoding {
                reason: "a frame cannot supersede itself".into(),
            });
        }
        let old = self.frame_meta(old_id)?;
        self.frame_meta(new_id)?;
        if old.superseded_by.is_some() || self.pending.superseded.contains_key(&old_id) {
            return Err(ArchiveError::Encoding {
                reason: format!("frame {old_id} is already superseded"),
            });
        }
        let record = SupersedeRecord { old_id, new_id };
        let bytes = bincode::serde::encode_to_vec(&record, wal_codec_config())?;
        let sequence = self.append_wal(WalRecordKind::Supersede, &bytes)?;
        self.apply_pending_supersede(old_id, new_id, sequence);
        self.dirty = true;
        self.maybe_auto_commit()?;
        Ok(())
    }

    /// Stage a status flip to `deleted`; bytes are retained until compaction.
    pub fn delete(&mut self, frame_id: FrameId) -> Result<()> {
        self.ensure_writable()?;
        self.frame_meta(frame_id)?;
        let record = DeleteRecord { frame_id };
        let bytes = bincode::serde::encode_to_vec(&record, wal_codec_config())?;
        let sequence = self.append_wal(WalRecordKind::Delete, &bytes)?;
        self.apply_pending_delete(frame_id, sequence);
        self.dirty = true;
        self.maybe_auto_commit()?;
        Ok(())
    }

    /// Stage an embedding for a frame. The vector joins the pending list with
    /// a fresh sequence and reaches the vector blob at commit.
    pub fn stage_embedding(
        &mut self,
        frame_id: FrameId,
        vector: Vec<f32>,
        identity: &EmbeddingIdentity,
    ) -> Result<u64> {
        self.ensure_writable()?;
        self.frame_meta(frame_id)?;

        let expected = self.store_dimension();
        if expected != 0 && vector.len() as u32 != expected {
            return Err(ArchiveError::DimensionMismatch {
                expected,
                actual: vector.len() as u32,
            });
        }
        if identity.dimension != vector.len() as u32 {
            return Err(ArchiveError::DimensionMismatch {
                expected: identity.dimension,
                actual: vector.len() as u32,
            });
        }
        if identity.normalized {
            let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
            if (norm - 1.0).abs() > NORMALIZED_EPSILON {
                return Err(ArchiveError::Encoding {
                    reason: format!("vector declared normalized but |v| = {norm}"),
                });
            }
        }

        let record = EmbedRecord {
            frame_id,
            vector: vector.clone(),
            identity: identity.clone(),
        };
        let bytes = bincode::serde::encode_to_vec(&record, wal_codec_config())?;
        let sequence = self.append_wal(WalRecordKind::StageEmbedding, &bytes)?;
        self.apply_pending_embedding(frame_id, vector, identity.normalized, sequence);
        self.dirty = true;
        self.maybe_auto_commit()?;
        Ok(sequence)
    }

    /// Stage a pre-built lexical blob to publish at the next commit instead
    /// of the incrementally maintained one.
    pub fn stage_lex_index_for_next_commit(
        &mut self,
        bytes: Vec<u8>,
        doc_count: u64,
        version: u32,
    ) -> Result<u64> {
        self.ensure_writable()?;
        let stamp = self.slot.logical_stamp + 1;
        tracing::debug!(doc_count, version, stamp, "staged lexical blob for next commit");
        self.staged_lex = Some(StagedBlob {
            bytes,
            stamp,
            doc_count,
            version,
        });
        self.dirty = true;
        Ok(stamp)
    }

    /// Stage a pre-built vector blob for the next commit.
    pub fn stage_vec_index_for_next_commit(
        &mut self,
        bytes: Vec<u8>,
        vector_count: u64,
        dimension: u32,
        similarity: Similarity,
    ) -> Result<u64> {
        self.ensure_writable()?;
        // Validate the shape before accepting the stage.
        let artifact = VecArtifact::decode(&bytes)?;
        if artifact.vector_count() != vector_count || artifact.dims != dimension {
            return Err(ArchiveError::Encoding {
                reason: "staged vector blob does not match declared shape".into(),
            });
        }
        let stamp = self.slot.logical_stamp + 1;
        tracing::debug!(vector_count, dimension, stamp, "staged vector blob for next commit");
        self.staged_vec = Some(StagedVecBlob {
            bytes,
            stamp,
            vector_count,
            dimension,
            similarity,
        });
        self.dirty = true;
        Ok(stamp)
    }

    /// Incremental diff of staged embeddings for cache refresh.
    #[must_use]
    pub fn pending_embedding_mutations(&self, since: Option<u64>) -> PendingEmbeddingDiff {
        let since = since.unwrap_or(0);
        PendingEmbeddingDiff {
            embeddings: self
                .pending
                .embeddings
                .iter()
                .filter(|e| e.sequence > since)
                .cloned()
                .collect(),
            latest_sequence: self.pending.latest_embedding_sequence(),
        }
    }

    // -- Internal staging helpers -------------------------------------------

    fn build_frame(&mut self, payload: &[u8], options: PutOptions) -> Result<(Frame, Vec<u8>)> {
        if payload.len() as u64 > MAX_FRAME_BYTES {
            return Err(ArchiveError::CapacityExceeded {
                reason: format!("payload of {} bytes exceeds frame limit", payload.len()),
            });
        }
        if let Some(parent_id) = options.parent_id {
            let parent = self.frame_meta(parent_id)?;
            if self.effective_status(&parent) != FrameStatus::Active {
                return Err(ArchiveError::FrameNotFound { frame_id: parent_id });
            }
        }
        let encoded = match options.encoding {
            CanonicalEncoding::Plain => payload.to_vec(),
            CanonicalEncoding::Zstd => {
                zstd::encode_all(payload, ZSTD_LEVEL).map_err(|err| ArchiveError::Encoding {
                    reason: format!("zstd compression failed: {err}"),
                })?
            }
        };
        let frame = Frame {
            id: self.next_frame_id,
            timestamp_ms: options.timestamp_ms.unwrap_or_else(now_ms),
            status: FrameStatus::Active,
            kind: options.kind.unwrap_or_else(|| "text.chunk".to_string()),
            role: options.role,
            parent_id: options.parent_id,
            supersedes: None,
            superseded_by: None,
            search_text: options.search_text,
            encoding: options.encoding,
            payload_offset: 0,
            payload_length: encoded.len() as u64,
            uri: options.uri,
            title: options.title,
            metadata: options.metadata,
            payload_checksum: crc32fast::hash(&encoded),
        };
        Ok((frame, encoded))
    }

    /// Append to the WAL; on `wal_full`, commit once to reclaim the ring and
    /// retry. This is the only implicitly retried error kind.
    fn append_wal(&mut self, kind: WalRecordKind, bytes: &[u8]) -> Result<u64> {
        match self.wal.append(kind, bytes) {
            Ok(sequence) => Ok(sequence),
            Err(ArchiveError::WalFull { .. }) => {
                tracing::info!("wal full; committing to reclaim the ring");
                self.wal.note_auto_commit();
                self.commit()?;
                self.wal.append(kind, bytes)
            }
            Err(err) => Err(err),
        }
    }

    fn append_wal_batch(&mut self, items: &[(WalRecordKind, &[u8])]) -> Result<Vec<u64>> {
        match self.wal.append_batch(items) {
            Ok(sequences) => Ok(sequences),
            Err(ArchiveError::WalFull { .. }) => {
                tracing::info!("wal full; committing to reclaim the ring");
                self.wal.note_auto_commit();
                self.commit()?;
                self.wal.append_batch(items)
            }
            Err(err) => Err(err),
        }
    }

    pub(crate) fn apply_pending_put(&mut self, frame: Frame, payload: Vec<u8>, sequence: u64) {
        self.next_frame_id = self.next_frame_id.max(frame.id + 1);
        self.pending.payloads.insert(frame.id, payload);
        self.pending
            .ops
            .push((sequence, PendingOp::Put { frame_id: frame.id }));
        self.pending.frames.push(frame);
    }

    pub(crate) fn apply_pending_supersede(
        &mut self,
        old_id: FrameId,
        new_id: FrameId,
        sequence: u64,
    ) {
        self.pending.superseded.insert(old_id, new_id);
        self.pending.supersedes.insert(new_id, old_id);
        self.pending
            .ops
            .push((sequence, PendingOp::Supersede { old_id, new_id }));
    }

    pub(crate) fn apply_pending_delete(&mut self, frame_id: FrameId, sequence: u64) {
        self.pending
            .status_overrides
            .insert(frame_id, FrameStatus::Deleted);
        self.pending
            .ops
            .push((sequence, PendingOp::Delete { frame_id }));
    }

    pub(crate) fn apply_pending_embedding(
        &mut self,
        frame_id: FrameId,
        vector: Vec<f32>,
        normalized: bool,
        sequence: u64,
    ) {
        self.pending.embeddings.push(Embedding {
            frame_id,
            vector,
            normalized,
            sequence,
        });
        self.pending
            .ops
            .push((sequence, PendingOp::Embed));
    }

    /// Dimension the store is committed to: the committed blob wins, then
    /// staged embeddings, then the creation hint.
    pub(crate) fn store_dimension(&self) -> u32 {
        if let Some(staged) = &self.staged_vec {
            return staged.dimension;
        }
        if self.slot.vec.is_present() {
            if let Ok((_, dims)) = self.committed_vec_shape() {
                return dims;
            }
        }
        if let Some(embedding) = self.pending.embeddings.first() {
            return embedding.vector.len() as u32;
        }
        self.header.dimension_hint
    }

    /// Similarity and dimension straight out of the committed blob header.
    pub(crate) fn committed_vec_shape(&self) -> Result<(Similarity, u32)> {
        use std::io::{Read, Seek, SeekFrom};
        let mut file = self.file.try_clone()?;
        let mut buf = [0u8; 12];
        file.seek(SeekFrom::Start(self.slot.vec.offset))?;
        file.read_exact(&mut buf)?;
        let similarity = Similarity::try_from(buf[7])?;
        let dims = u32::from_le_bytes(buf[8..12].try_into().unwrap_or([0; 4]));
        Ok((similarity, dims))
    }

    /// Proactive auto-commit under WAL pressure.
    fn maybe_auto_commit(&mut self) -> Result<()> {
        let policy = self.options.wal_proactive_commit;
        let Some(threshold) = policy.threshold_percent else {
            return Ok(());
        };
        if let Some(max_size) = policy.max_wal_size_bytes {
            if self.wal.region_size() > max_size {
                return Ok(());
            }
        }
        let pending = self.wal.pending_bytes();
        if pending < policy.min_pending_bytes {
            return Ok(());
        }
        if pending * 100 >= u64::from(threshold) * self.wal.region_size() {
            tracing::info!(
                pending_bytes = pending,
                wal_size = self.wal.region_size(),
                "wal pressure auto-commit"
            );
            self.wal.note_auto_commit();
            self.commit()?;
        }
        Ok(())
    }

    // -- Commit coordinator -------------------------------------------------

    /// Two-phase commit across the frame log, lexical blob, and vector blob.
    /// A no-op when nothing is staged.
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_writable()?;
        if self.pending.is_empty() && self.staged_lex.is_none() && self.staged_vec.is_none() {
            return Ok(());
        }

        // Staged records must be durable before their effects are published.
        self.wal.flush()?;

        // Phase 1 — stage: payloads, new frame table, and index blobs are
        // written past the committed data end. A failure here leaves the live
        // TOC untouched and the writes are reclaimed by the next commit.
        let mut cursor = self.data_end;
        let next_stamp = self.slot.logical_stamp + 1;

        let mut frames = self.frames.clone();
        for pending_frame in &self.pending.frames {
            let mut frame = pending_frame.clone();
            let payload = self
                .pending
                .payloads
                .get(&frame.id)
                .cloned()
                .unwrap_or_default();
            frame.payload_offset = cursor;
            write_blob_at(&mut self.file, cursor, &payload)?;
            cursor += payload.len() as u64;
            frames.push(frame);
        }
        frames.sort_by_key(|f| f.id);

        let rows = build_frame_rows(&frames);
        for (&frame_id, &status) in &self.pending.status_overrides {
            if let Some(&row) = rows.get(&frame_id) {
                frames[row].status = status;
            }
        }
        for (&old_id, &new_id) in &self.pending.superseded {
            if let Some(&row) = rows.get(&old_id) {
                frames[row].superseded_by = Some(new_id);
            }
            if let Some(&row) = rows.get(&new_id) {
                frames[row].supersedes = Some(old_id);
            }
        }
        check_supersede_acyclic(&frames, &rows)?;

        let lex_manifest = self.stage_lex_blob(&frames, &mut cursor, next_stamp)?;
        let vec_manifest = self.stage_vec_blob(&frames, &rows, &mut cursor, next_stamp)?;

        let table_bytes = encode_frame_table(&frames)?;
        let frame_log = ManifestEntry {
            offset: cursor,
            length: table_bytes.len() as u64,
            checksum: checksum64(&table_bytes),
            stamp: next_stamp,
        };
        write_blob_at(&mut self.file, cursor, &table_bytes)?;
        cursor += table_bytes.len() as u64;

        // Phase 2 — publish: write the inactive slot, fsync, flip the live
        // selector, fsync, then checkpoint the WAL. Not cancellable past the
        // flip; a crash in between is resolved by the replay snapshot.
        let new_slot = TocSlot {
            logical_stamp: next_stamp,
            frame_log,
            lex: lex_manifest,
            vec: vec_manifest,
            wal_offset: self.slot.wal_offset,
            wal_size: self.slot.wal_size,
            wal_checkpoint_pos: self.wal.write_head_position(),
            committed_seq: self.wal.last_sequence(),
        };

        let target_slot = self.header.inactive_toc();
        write_slot(&mut self.file, target_slot, &new_slot)?;
        self.file.sync_all()?;

        HeaderCodec::flip_live_toc(&mut self.file, target_slot)?;
        self.file.sync_all()?;

        let snapshot_bytes = if self.options.wal_replay_state_snapshot_enabled {
            let hash = state_hash_for(&new_slot);
            Some(bincode::serde::encode_to_vec(
                &CheckpointSnapshot { state_hash: hash },
                wal_codec_config(),
            )?)
        } else {
            None
        };
        let mark = match self.wal.record_checkpoint(snapshot_bytes.as_deref()) {
            Ok(mark) => mark,
            Err(ArchiveError::WalFull { .. }) => {
                // No room for the optional snapshot record; the slot already
                // carries the watermark, so checkpoint without it.
                self.wal.record_checkpoint(None)?
            }
            Err(err) => return Err(err),
        };
        debug_assert_eq!(mark.position, new_slot.wal_checkpoint_pos);
        debug_assert_eq!(mark.sequence, new_slot.committed_seq);

        // Adopt the published state.
        self.header.live_toc = target_slot;
        self.live_slot_index = target_slot;
        self.slot = new_slot;
        self.frame_rows = build_frame_rows(&frames);
        self.frames = frames;
        self.data_end = cursor;
        self.pending.clear();
        self.staged_lex = None;
        self.staged_vec = None;
        self.snapshot_verified = false;
        self.dirty = false;

        tracing::info!(
            stamp = self.slot.logical_stamp,
            frames = self.frames.len(),
            committed_seq = self.slot.committed_seq,
            "commit published"
        );
        Ok(())
    }

    /// Build and write the lexical blob for this commit. Prefers an
    /// out-of-band staged blob; otherwise applies pending mutations to a
    /// mutable copy of the committed index.
    fn stage_lex_blob(
        &mut self,
        frames: &[Frame],
        cursor: &mut u64,
        stamp: u64,
    ) -> Result<ManifestEntry> {
        if let Some(staged) = &self.staged_lex {
            tracing::debug!(
                doc_count = staged.doc_count,
                version = staged.version,
                "publishing staged lexical blob"
            );
        }
        let staged_bytes = self.staged_lex.as_ref().map(|s| s.bytes.clone());
        let bytes = if let Some(bytes) = staged_bytes {
            bytes
        } else {
            let mut index = self.materialize_committed_lex()?.unwrap_or_default();
            for (_, op) in &self.pending.ops {
                match op {
                    PendingOp::Put { frame_id } => {
                        if let Some(frame) = frames.iter().find(|f| f.id == *frame_id) {
                            if let Some(text) = frame.search_text.as_deref() {
                                if frame.is_searchable() {
                                    index.index(*frame_id, text)?;
                                }
                            }
                        }
                    }
                    PendingOp::Delete { frame_id } => index.remove(*frame_id)?,
                    PendingOp::Supersede { old_id, .. } => index.remove(*old_id)?,
                    PendingOp::Embed => {}
                }
            }
            if index.is_empty() && !self.slot.lex.is_present() {
                return Ok(ManifestEntry::default());
            }
            index.serialize()?
        };

        let manifest = ManifestEntry {
            offset: *cursor,
            length: bytes.len() as u64,
            checksum: checksum64(&bytes),
            stamp,
        };
        write_blob_at(&mut self.file, *cursor, &bytes)?;
        *cursor += bytes.len() as u64;
        Ok(manifest)
    }

    /// Mutable copy of the committed lexical index, or `None` when absent.
    pub(crate) fn materialize_committed_lex(&mut self) -> Result<Option<LexIndex>> {
        if !self.slot.lex.is_present() {
            return Ok(None);
        }
        let skip = self.snapshot_verified;
        let bytes = read_manifest_blob(&mut self.file, &self.slot.lex, "lexical blob", skip)?;
        Ok(Some(LexIndex::deserialize(&bytes)?))
    }

    /// Read-only committed lexical engine over an mmap of the archive file.
    pub(crate) fn open_committed_lex_read_only(&mut self) -> Result<Option<LexIndex>> {
        if !self.slot.lex.is_present() {
            return Ok(None);
        }
        let map = unsafe { memmap2::Mmap::map(&self.file)? };
        let offset = self.slot.lex.offset as usize;
        let len = self.slot.lex.length as usize;
        if map.len() < offset + len {
            return Err(ArchiveError::InvalidToc {
                reason: "lexical manifest points past end of file".into(),
            });
        }
        if !self.snapshot_verified
            && checksum64(&map[offset..offset + len]) != self.slot.lex.checksum
        {
            return Err(ArchiveError::ChecksumMismatch {
                context: "lexical blob".into(),
            });
        }
        let backing = LexBacking::Mapped {
            map: std::sync::Arc::new(map),
            offset,
            len,
        };
        Ok(Some(LexIndex::deserialize_read_only(backing)?))
    }

    /// Committed vector artifact, or `None` when the store has no vectors.
    pub(crate) fn committed_vec_artifact(&mut self) -> Result<Option<VecArtifact>> {
        if !self.slot.vec.is_present() {
            return Ok(None);
        }
        let skip = self.snapshot_verified;
        let bytes = read_manifest_blob(&mut self.file, &self.slot.vec, "vector blob", skip)?;
        Ok(Some(VecArtifact::decode(&bytes)?))
    }

    fn stage_vec_blob(
        &mut self,
        frames: &[Frame],
        rows: &std::collections::HashMap<FrameId, usize>,
        cursor: &mut u64,
        stamp: u64,
    ) -> Result<ManifestEntry> {
        if let Some(staged) = &self.staged_vec {
            tracing::debug!(
                vector_count = staged.vector_count,
                dimension = staged.dimension,
                "publishing staged vector blob"
            );
        }
        let staged_bytes = self.staged_vec.as_ref().map(|s| s.bytes.clone());
        let bytes = if let Some(bytes) = staged_bytes {
            bytes
        } else {
            let committed = self.committed_vec_artifact()?;
            if committed.is_none() && self.pending.embeddings.is_empty() {
                return Ok(ManifestEntry::default());
            }
            let artifact = committed.unwrap_or_else(|| {
                let dims = self
                    .pending
                    .embeddings
                    .first()
                    .map_or(self.header.dimension_hint, |e| e.vector.len() as u32);
                VecArtifact::empty(dims, Similarity::Cosine)
            });
            let mut engine = CpuVecEngine::from_artifact(&artifact)?;
            for embedding in &self.pending.embeddings {
                engine.add(embedding.frame_id, &embedding.vector)?;
            }
            // Frames hidden by this commit leave the index with their rows.
            for frame in frames {
                if !frame.is_searchable()
                    && rows.contains_key(&frame.id)
                    && engine.contains(frame.id)
                {
                    engine.remove(frame.id)?;
                }
            }
            engine.serialize()?
        };

        let manifest = ManifestEntry {
            offset: *cursor,
            length: bytes.len() as u64,
            checksum: checksum64(&bytes),
            stamp,
        };
        write_blob_at(&mut self.file, *cursor, &bytes)?;
        *cursor += bytes.len() as u64;
        Ok(manifest)
    }
}

/// Hash attesting a slot's committed artifacts, mirrored by
/// `Archive::committed_state_hash`.
fn state_hash_for(slot: &TocSlot) -> u64 {
    let mut buf = [0u8; 32];
    buf[0..8].copy_from_slice(&slot.frame_log.checksum.to_le_bytes());
    buf[8..16].copy_from_slice(&slot.lex.checksum.to_le_bytes());
    buf[16..24].copy_from_slice(&slot.vec.checksum.to_le_bytes());
    buf[24..32].copy_from_slice(&slot.logical_stamp.to_le_bytes());
    checksum64(&buf)
}

/// Reject supersede chains that loop; the walk is depth-capped to guard
/// against malformed input.
fn check_supersede_acyclic(
    frames: &[Frame],
    rows: &std::collections::HashMap<FrameId, usize>,
) -> Result<()> {
    for frame in frames {
        if frame.supersedes.is_none() {
            continue;
        }
        let mut current = frame.supersedes;
        let mut depth = 0usize;
        while let Some(id) = current {
            if id == frame.id {
                return Err(ArchiveError::Encoding {
                    reason: format!("supersede cycle through frame {id}"),
                });
            }
            depth += 1;
            if depth > MAX_SUPERSEDE_DEPTH {
                return Err(ArchiveError::Encoding {
                    reason: format!("supersede chain from frame {} exceeds depth cap", frame.id),
                });
            }
            current = rows.get(&id).and_then(|&row| frames[row].supersedes);
        }
    }
    Ok(())
}
