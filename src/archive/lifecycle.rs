//! Lifecycle management for creating and opening `.wv2` archives.
//!
//! Responsibilities:
//! - Enforce the single-file invariant and take the OS lock.
//! - Bootstrap the super-header, TOC slots, and ring WAL on create.
//! - Select the live TOC on open, falling back to the alternate slot when a
//!   checksum fails, then replay the WAL into the pending view.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::constants::{
    FRAME_TABLE_MAGIC, FRAME_TABLE_VERSION, MAX_INDEX_BYTES, MIN_WAL_SIZE, SUPER_HEADER_SIZE,
    TIMELINE_PREVIEW_CHARS,
};
use crate::error::{ArchiveError, Result};
use crate::io::header::{HeaderCodec, SuperHeader};
use crate::io::wal::{RingWal, WalRecord, WalRecordKind, WalStats};
use crate::lock::{FileLock, LockMode};
use crate::toc::{TocSlot, checksum64, select_live_slot, write_slot};
use crate::types::frame::{Frame, FrameId, FrameStatus, Stats, TimelineEntry, TimelineQuery};
use crate::types::options::ArchiveOptions;

use super::{
    CheckpointSnapshot, DeleteRecord, EmbedRecord, PendingState, PutRecord, StagedBlob,
    StagedVecBlob, SupersedeRecord,
};

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}

/// Primary handle for interacting with a `.wv2` archive.
///
/// Holds the file descriptor, lock, super-header, live TOC slot, ring WAL,
/// the committed frame table, and the pending view. Mutations append to the
/// WAL and are materialized at commit time.
pub struct Archive {
    pub(crate) file: File,
    pub(crate) path: PathBuf,
    pub(crate) lock: FileLock,
    pub(crate) read_only: bool,
    pub(crate) header: SuperHeader,
    pub(crate) live_slot_index: u8,
    pub(crate) slot: TocSlot,
    pub(crate) wal: RingWal,
    pub(crate) options: ArchiveOptions,
    /// Committed frame table, ascending by id.
    pub(crate) frames: Vec<Frame>,
    pub(crate) frame_rows: HashMap<FrameId, usize>,
    pub(crate) pending: PendingState,
    pub(crate) staged_lex: Option<StagedBlob>,
    pub(crate) staged_vec: Option<StagedVecBlob>,
    pub(crate) data_end: u64,
    pub(crate) next_frame_id: FrameId,
    /// Committed-state attestation matched by a replayed checkpoint record;
    /// lets engine materialization skip blob checksum verification.
    pub(crate) snapshot_verified: bool,
    pub(crate) dirty: bool,
}

impl Archive {
    /// Create a new, empty archive with an embedded WAL and one valid TOC
    /// slot. The file is locked exclusively for the lifetime of the handle.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::create_with_options(path, ArchiveOptions::default())
    }

    pub fn create_with_options<P: AsRef<Path>>(path: P, options: ArchiveOptions) -> Result<Self> {
        let path_ref = path.as_ref();
        if options.wal_size_bytes < MIN_WAL_SIZE {
            return Err(ArchiveError::CapacityExceeded {
                reason: format!(
                    "wal_size_bytes {} below minimum {MIN_WAL_SIZE}",
                    options.wal_size_bytes
                ),
            });
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path_ref)?;
        let lock = FileLock::acquire(&file, LockMode::Exclusive)?;

        let wal_offset = SUPER_HEADER_SIZE;
        let wal_size = options.wal_size_bytes;
        file.set_len(wal_offset + wal_size)?;

        let header = SuperHeader::new(now_ms() as u64, options.dimension_hint);
        HeaderCodec::init(&mut file, &header)?;

        let slot = TocSlot {
            logical_stamp: 1,
            wal_offset,
            wal_size,
            ..TocSlot::default()
        };
        write_slot(&mut file, 0, &slot)?;
        file.sync_all()?;

        let (wal, records, damage) = RingWal::open(
            &file,
            wal_offset,
            wal_size,
            0,
            0,
            options.wal_fsync_policy,
            false,
        )?;
        debug_assert!(records.is_empty() && damage.is_none());

        let data_end = wal_offset + wal_size;
        tracing::info!(path = %path_ref.display(), wal_size, "created archive");
        Ok(Self {
            file,
            path: path_ref.to_path_buf(),
            lock,
            read_only: false,
            header,
            live_slot_index: 0,
            slot,
            wal,
            options,
            frames: Vec::new(),
            frame_rows: HashMap::new(),
            pending: PendingState::default(),
            staged_lex: None,
            staged_vec: None,
            data_end,
            next_frame_id: 1,
            snapshot_verified: false,
            dirty: false,
        })
    }

    /// Open an existing archive with exclusive access, performing WAL replay.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_options(path, ArchiveOptions::default())
    }

    pub fn open_with_options<P: AsRef<Path>>(path: P, options: ArchiveOptions) -> Result<Self> {
        let path_ref = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path_ref)?;
        let lock = FileLock::acquire(&file, LockMode::Exclusive)?;
        Self::open_locked(file, lock, path_ref, options, false)
    }

    /// Shared-lock open: readers see the committed view plus any replayable
    /// WAL tail, and every mutation fails.
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let file = OpenOptions::new().read(true).open(path_ref)?;
        let lock = FileLock::acquire(&file, LockMode::Shared)?;
        Self::open_locked(file, lock, path_ref, ArchiveOptions::default(), true)
    }

    fn open_locked(
        mut file: File,
        lock: FileLock,
        path_ref: &Path,
        options: ArchiveOptions,
        read_only: bool,
    ) -> Result<Self> {
        let mut header = HeaderCodec::read(&mut file)?;
        let (live_slot_index, slot) = select_live_slot(&mut file, header.live_toc)?;

        // Try the selected slot's frame table; fall back to the alternate on
        // a blob-level checksum failure.
        let (live_slot_index, slot, frames) =
            match load_frame_table(&mut file, &slot) {
                Ok(frames) => (live_slot_index, slot, frames),
                Err(err) => {
                    tracing::warn!(error = %err, "frame table invalid under live slot; trying alternate");
                    let (alt_index, alt_slot) =
                        select_live_slot(&mut file, 1 - live_slot_index)?;
                    if alt_index == live_slot_index {
                        return Err(err);
                    }
                    let frames = load_frame_table(&mut file, &alt_slot)?;
                    (alt_index, alt_slot, frames)
                }
            };

        if live_slot_index != header.live_toc && !read_only {
            header.live_toc = live_slot_index;
            HeaderCodec::flip_live_toc(&mut file, live_slot_index)?;
            file.sync_all()?;
        }

        let (wal, records, damage) = RingWal::open(
            &file,
            slot.wal_offset,
            slot.wal_size,
            slot.wal_checkpoint_pos,
            slot.committed_seq,
            options.wal_fsync_policy,
            read_only,
        )?;
        if let Some(damage) = damage {
            // Truncate-or-abort decision: a torn tail past the last valid
            // record is expected after a crash, so truncate and continue.
            tracing::warn!(
                offset = damage.offset,
                reason = %damage.reason,
                "wal tail damaged; truncating replay at last valid record"
            );
        }

        let frame_rows = build_frame_rows(&frames);
        let next_frame_id = frames.last().map_or(1, |f| f.id + 1);
        let data_end = slot.data_end();

        let mut archive = Self {
            file,
            path: path_ref.to_path_buf(),
            lock,
            read_only,
            header,
            live_slot_index,
            slot,
            wal,
            options,
            frames,
            frame_rows,
            pending: PendingState::default(),
            staged_lex: None,
            staged_vec: None,
            data_end,
            next_frame_id,
            snapshot_verified: false,
            dirty: false,
        };
        archive.replay_records(records)?;
        tracing::info!(
            path = %path_ref.display(),
            frames = archive.frames.len(),
            pending = archive.pending.frames.len(),
            stamp = archive.slot.logical_stamp,
            "opened archive"
        );
        Ok(archive)
    }

    /// Re-apply staged records into the pending view.
    fn replay_records(&mut self, records: Vec<WalRecord>) -> Result<()> {
        let expected_hash = self.committed_state_hash();
        for record in records {
            match record.kind {
                WalRecordKind::Put => {
                    let (decoded, _): (PutRecord, usize) =
                        bincode::serde::decode_from_slice(&record.payload, wal_codec_config())?;
                    self.apply_pending_put(decoded.frame, decoded.payload, record.sequence);
                }
                WalRecordKind::Supersede => {
                    let (decoded, _): (SupersedeRecord, usize) =
                        bincode::serde::decode_from_slice(&record.payload, wal_codec_config())?;
                    self.apply_pending_supersede(decoded.old_id, decoded.new_id, record.sequence);
                }
                WalRecordKind::Delete => {
                    let (decoded, _): (DeleteRecord, usize) =
                        bincode::serde::decode_from_slice(&record.payload, wal_codec_config())?;
                    self.apply_pending_delete(decoded.frame_id, record.sequence);
                }
                WalRecordKind::StageEmbedding => {
                    let (decoded, _): (EmbedRecord, usize) =
                        bincode::serde::decode_from_slice(&record.payload, wal_codec_config())?;
                    self.apply_pending_embedding(
                        decoded.frame_id,
                        decoded.vector,
                        decoded.identity.normalized,
                        record.sequence,
                    );
                }
                WalRecordKind::Checkpoint => {
                    let (snapshot, _): (CheckpointSnapshot, usize) =
                        bincode::serde::decode_from_slice(&record.payload, wal_codec_config())?;
                    if snapshot.state_hash == expected_hash {
                        self.snapshot_verified = true;
                        self.wal.note_snapshot_hit();
                    }
                }
            }
        }
        if !self.pending.is_empty() {
            self.dirty = true;
        }
        Ok(())
    }

    /// Hash attesting the committed artifacts; carried by checkpoint records
    /// when replay snapshots are enabled.
    pub(crate) fn committed_state_hash(&self) -> u64 {
        let mut buf = [0u8; 32];
        buf[0..8].copy_from_slice(&self.slot.frame_log.checksum.to_le_bytes());
        buf[8..16].copy_from_slice(&self.slot.lex.checksum.to_le_bytes());
        buf[16..24].copy_from_slice(&self.slot.vec.checksum.to_le_bytes());
        buf[24..32].copy_from_slice(&self.slot.logical_stamp.to_le_bytes());
        checksum64(&buf)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Identity of the on-disk archive, stable across commits. Keys the
    /// process-wide engine cache.
    #[must_use]
    pub fn identity(&self) -> (PathBuf, u64) {
        let canonical = self.path.canonicalize().unwrap_or_else(|_| self.path.clone());
        (canonical, self.header.created_ms)
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(ArchiveError::ReadOnly {
                reason: "opened with a shared reader lease".into(),
            });
        }
        Ok(())
    }

    /// Next id a `put` would assign; strictly monotone for the lifetime of
    /// the store.
    #[must_use]
    pub fn next_frame_id(&self) -> FrameId {
        self.next_frame_id
    }

    #[must_use]
    pub fn wal_stats(&self) -> WalStats {
        self.wal.recover_stats()
    }

    #[must_use]
    pub fn stats(&self) -> Stats {
        let active_count = self
            .frames
            .iter()
            .filter(|f| self.effective_status(f) == FrameStatus::Active)
            .count() as u64
            + self
                .pending
                .frames
                .iter()
                .filter(|f| self.effective_status(f) == FrameStatus::Active)
                .count() as u64;
        Stats {
            frame_count: self.frames.len() as u64 + self.pending.frames.len() as u64,
            active_count,
            pending_frame_count: self.pending.frames.len() as u64,
            pending_embedding_count: self.pending.embeddings.len() as u64,
            has_lex_index: self.slot.lex.is_present() || self.staged_lex.is_some(),
            has_vec_index: self.slot.vec.is_present() || self.staged_vec.is_some(),
            committed_seq: self.slot.committed_seq,
            logical_stamp: self.slot.logical_stamp,
        }
    }

    /// Chronological listing over the union view, ordered by capture time
    /// then id.
    pub fn timeline(&mut self, query: TimelineQuery) -> Result<Vec<TimelineEntry>> {
        let mut entries: Vec<TimelineEntry> = self
            .union_frames()
            .into_iter()
            .filter(|frame| {
                query.since_ms.map_or(true, |since| frame.timestamp_ms >= since)
                    && query.until_ms.map_or(true, |until| frame.timestamp_ms < until)
            })
            .map(|frame| {
                let preview = frame
                    .search_text
                    .as_deref()
                    .map(|text| text.chars().take(TIMELINE_PREVIEW_CHARS).collect())
                    .unwrap_or_default();
                TimelineEntry {
                    frame_id: frame.id,
                    timestamp_ms: frame.timestamp_ms,
                    kind: frame.kind,
                    preview,
                }
            })
            .collect();
        entries.sort_by(|a, b| {
            a.timestamp_ms
                .cmp(&b.timestamp_ms)
                .then_with(|| a.frame_id.cmp(&b.frame_id))
        });
        if query.reverse {
            entries.reverse();
        }
        if let Some(limit) = query.limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }
}

impl Drop for Archive {
    fn drop(&mut self) {
        if self.dirty && !self.read_only {
            if let Err(err) = self.commit() {
                tracing::warn!(error = %err, "commit on drop failed; staged records remain in wal");
            }
        }
        crate::search::cache::evict(&self.identity());
    }
}

pub(crate) fn wal_codec_config() -> bincode::config::Configuration<
    bincode::config::LittleEndian,
    bincode::config::Fixint,
> {
    bincode::config::standard()
        .with_fixed_int_encoding()
        .with_little_endian()
}

pub(crate) fn build_frame_rows(frames: &[Frame]) -> HashMap<FrameId, usize> {
    frames
        .iter()
        .enumerate()
        .map(|(row, frame)| (frame.id, row))
        .collect()
}

/// Frame table blob: magic, version, then the bincode frame list.
pub(crate) fn encode_frame_table(frames: &[Frame]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&FRAME_TABLE_MAGIC.to_le_bytes());
    buf.extend_from_slice(&FRAME_TABLE_VERSION.to_le_bytes());
    let body = bincode::serde::encode_to_vec(frames, wal_codec_config())?;
    buf.extend_from_slice(&body);
    Ok(buf)
}

pub(crate) fn decode_frame_table(bytes: &[u8]) -> Result<Vec<Frame>> {
    if bytes.len() < 6 {
        return Err(ArchiveError::Encoding {
            reason: "frame table truncated".into(),
        });
    }
    let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap_or([0; 4]));
    if magic != FRAME_TABLE_MAGIC {
        return Err(ArchiveError::Encoding {
            reason: format!("bad frame table magic 0x{magic:08x}"),
        });
    }
    let version = u16::from_le_bytes(bytes[4..6].try_into().unwrap_or([0; 2]));
    if version != FRAME_TABLE_VERSION {
        return Err(ArchiveError::Encoding {
            reason: format!("unsupported frame table version {version}"),
        });
    }
    let (frames, _): (Vec<Frame>, usize) =
        bincode::serde::decode_from_slice(&bytes[6..], wal_codec_config())?;
    Ok(frames)
}

fn load_frame_table(file: &mut File, slot: &TocSlot) -> Result<Vec<Frame>> {
    if !slot.frame_log.is_present() {
        return Ok(Vec::new());
    }
    if slot.frame_log.length > MAX_INDEX_BYTES {
        return Err(ArchiveError::InvalidToc {
            reason: "frame table exceeds safety limit".into(),
        });
    }
    let mut bytes = vec![0u8; slot.frame_log.length as usize];
    file.seek(SeekFrom::Start(slot.frame_log.offset))?;
    file.read_exact(&mut bytes)?;
    if checksum64(&bytes) != slot.frame_log.checksum {
        return Err(ArchiveError::ChecksumMismatch {
            context: "frame table blob".into(),
        });
    }
    decode_frame_table(&bytes)
}

/// Read a committed blob region and verify it against its manifest.
pub(crate) fn read_manifest_blob(
    file: &mut File,
    manifest: &crate::toc::ManifestEntry,
    context: &str,
    skip_checksum: bool,
) -> Result<Vec<u8>> {
    if manifest.length > MAX_INDEX_BYTES {
        return Err(ArchiveError::InvalidToc {
            reason: format!("{context} exceeds safety limit"),
        });
    }
    let mut bytes = vec![0u8; manifest.length as usize];
    file.seek(SeekFrom::Start(manifest.offset))?;
    file.read_exact(&mut bytes)?;
    if !skip_checksum && checksum64(&bytes) != manifest.checksum {
        return Err(ArchiveError::ChecksumMismatch {
            context: context.to_string(),
        });
    }
    Ok(bytes)
}

pub(crate) fn write_blob_at(file: &mut File, offset: u64, bytes: &[u8]) -> Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(bytes)?;
    Ok(())
}
