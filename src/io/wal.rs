//! Bounded circular write-ahead log embedded in the archive file.
//!
//! Record framing (little-endian):
//!
//! ```text
//! length u32 | kind u8 | reserved u8[3] | sequence u64 | payload[length] | checksum u32
//! ```
//!
//! Every append *group* (one record, or a coalesced batch) is terminated by a
//! single sentinel word. The checksum is crc32 over `kind..payload`. A length
//! word of `0xFFFF_FFFF` is a wrap marker telling the scanner to continue at
//! ring offset zero; a length of zero means the scan has reached the open end
//! of the log.
//!
//! Replay starts at the checkpoint position recorded in the committed TOC
//! slot and follows a strict sequence chain, so stale bytes from reclaimed
//! records can never be mistaken for live ones.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::constants::{
    WAL_RECORD_HEADER_SIZE, WAL_RECORD_TRAILER_SIZE, WAL_SENTINEL, WAL_SENTINEL_SIZE,
    WAL_WRAP_MARKER,
};
use crate::error::{ArchiveError, Result};
use crate::types::options::WalFsyncPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalRecordKind {
    Put = 1,
    Supersede = 2,
    Delete = 3,
    StageEmbedding = 4,
    Checkpoint = 5,
}

impl TryFrom<u8> for WalRecordKind {
    type Error = ArchiveError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Put),
            2 => Ok(Self::Supersede),
            3 => Ok(Self::Delete),
            4 => Ok(Self::StageEmbedding),
            5 => Ok(Self::Checkpoint),
            other => Err(ArchiveError::Encoding {
                reason: format!("unknown wal record kind {other}"),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    pub sequence: u64,
    pub kind: WalRecordKind,
    pub payload: Vec<u8>,
}

/// Counters surfaced by `recover_stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalStats {
    pub wrap_count: u64,
    pub checkpoint_count: u64,
    pub auto_commit_count: u64,
    pub pending_bytes: u64,
    pub wal_size: u64,
    pub last_seq: u64,
    pub committed_seq: u64,
    pub replay_snapshot_hit_count: u64,
}

/// Watermark handed to the commit coordinator for the TOC slot.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointMark {
    pub position: u64,
    pub sequence: u64,
}

/// Scan damage reported to the caller, which decides truncate-or-abort.
#[derive(Debug, Clone)]
pub struct WalScanDamage {
    pub offset: u64,
    pub reason: String,
}

#[derive(Debug)]
pub struct RingWal {
    file: File,
    region_offset: u64,
    region_size: u64,
    write_head: u64,
    checkpoint_head: u64,
    /// True once the head has wrapped behind the checkpoint since the last
    /// checkpoint was recorded.
    wrapped: bool,
    pending_bytes: u64,
    sequence: u64,
    committed_sequence: u64,
    fsync_policy: WalFsyncPolicy,
    dirty_bytes: u64,
    read_only: bool,
    wrap_count: u64,
    checkpoint_count: u64,
    auto_commit_count: u64,
    replay_snapshot_hits: u64,
}

impl RingWal {
    /// Open the ring over `[region_offset, region_offset + region_size)` and
    /// scan forward from the committed checkpoint. Returns the live handle,
    /// the records appended after the checkpoint, and any damage found.
    pub fn open(
        file: &File,
        region_offset: u64,
        region_size: u64,
        checkpoint_pos: u64,
        committed_seq: u64,
        fsync_policy: WalFsyncPolicy,
        read_only: bool,
    ) -> Result<(Self, Vec<WalRecord>, Option<WalScanDamage>)> {
        if region_size == 0 {
            return Err(ArchiveError::InvalidHeader {
                reason: "wal region size must be non-zero".into(),
            });
        }
        let mut clone = file.try_clone()?;
        let scan = scan_records(
            &mut clone,
            region_offset,
            region_size,
            checkpoint_pos % region_size,
            committed_seq,
        )?;

        let checkpoint_head = checkpoint_pos % region_size;
        let wal = Self {
            file: clone,
            region_offset,
            region_size,
            write_head: scan.next_head,
            checkpoint_head,
            wrapped: scan.wrapped,
            pending_bytes: scan.pending_bytes,
            sequence: scan.last_seq.max(committed_seq),
            committed_sequence: committed_seq,
            fsync_policy,
            dirty_bytes: 0,
            read_only,
            wrap_count: 0,
            checkpoint_count: 0,
            auto_commit_count: 0,
            replay_snapshot_hits: 0,
        };
        Ok((wal, scan.records, scan.damage))
    }

    fn assert_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(ArchiveError::ReadOnly {
                reason: "wal opened through a shared-lock handle".into(),
            });
        }
        Ok(())
    }

    /// Append one record; may defer fsync per policy.
    pub fn append(&mut self, kind: WalRecordKind, payload: &[u8]) -> Result<u64> {
        let sequences = self.append_group(&[(kind, payload)])?;
        Ok(sequences[0])
    }

    /// Append a batch as a single gathered write terminated by one sentinel.
    /// Sequences are contiguous.
    pub fn append_batch(&mut self, items: &[(WalRecordKind, &[u8])]) -> Result<Vec<u64>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        self.append_group(items)
    }

    fn append_group(&mut self, items: &[(WalRecordKind, &[u8])]) -> Result<Vec<u64>> {
        self.assert_writable()?;

        let mut group_size = WAL_SENTINEL_SIZE;
        for (_, payload) in items {
            if payload.len() as u64 > u64::from(u32::MAX) - 1 {
                return Err(ArchiveError::CapacityExceeded {
                    reason: "wal payload exceeds u32 length field".into(),
                });
            }
            group_size +=
                WAL_RECORD_HEADER_SIZE + payload.len() as u64 + WAL_RECORD_TRAILER_SIZE;
        }

        if self.pending_bytes + group_size > self.region_size {
            return Err(ArchiveError::WalFull {
                pending_bytes: self.pending_bytes,
                wal_size: self.region_size,
            });
        }

        if self.write_head + group_size > self.region_size {
            // Crossing the ring end: wrap only when the front of the ring up
            // to the checkpoint has been reclaimed.
            if self.wrapped || group_size > self.checkpoint_head {
                return Err(ArchiveError::WalFull {
                    pending_bytes: self.pending_bytes,
                    wal_size: self.region_size,
                });
            }
            if self.region_size - self.write_head >= 4 {
                self.write_at(self.write_head, &WAL_WRAP_MARKER.to_le_bytes())?;
            }
            self.write_head = 0;
            self.wrapped = true;
            self.wrap_count += 1;
            tracing::debug!(wal.wrap_count = self.wrap_count, "wal wrapped to ring start");
        }
        if self.wrapped && self.write_head + group_size > self.checkpoint_head {
            return Err(ArchiveError::WalFull {
                pending_bytes: self.pending_bytes,
                wal_size: self.region_size,
            });
        }

        let mut buf = Vec::with_capacity(group_size as usize);
        let mut sequences = Vec::with_capacity(items.len());
        for (kind, payload) in items {
            self.sequence += 1;
            sequences.push(self.sequence);
            encode_record(&mut buf, *kind, self.sequence, payload);
        }
        buf.extend_from_slice(&WAL_SENTINEL.to_le_bytes());

        self.write_at(self.write_head, &buf)?;
        self.write_head += group_size;
        self.pending_bytes += group_size;

        // Keep an open zero word at the head so scans stop cleanly. Once
        // wrapped, the bytes at and past the checkpoint are still live.
        let zero_fits = if self.wrapped {
            self.write_head + 4 <= self.checkpoint_head
        } else {
            self.write_head + 4 <= self.region_size
        };
        if zero_fits {
            self.write_at(self.write_head, &0u32.to_le_bytes())?;
        }

        self.dirty_bytes += group_size;
        match self.fsync_policy {
            WalFsyncPolicy::EveryRecord => self.flush()?,
            WalFsyncPolicy::EveryNBytes(n) => {
                if self.dirty_bytes >= n {
                    self.flush()?;
                }
            }
            WalFsyncPolicy::OnCommit => {}
        }

        tracing::debug!(
            wal.head = self.write_head,
            wal.last_seq = self.sequence,
            wal.pending_bytes = self.pending_bytes,
            records = items.len(),
            "wal append group"
        );
        Ok(sequences)
    }

    /// Mark every prior record as durably applied. The returned mark points at
    /// the first byte *after* the applied records; when `snapshot` is given, a
    /// checkpoint record carrying it is appended at exactly that position so
    /// the next replay can verify committed state cheaply.
    pub fn record_checkpoint(&mut self, snapshot: Option<&[u8]>) -> Result<CheckpointMark> {
        self.assert_writable()?;
        let mark = CheckpointMark {
            position: self.write_head,
            sequence: self.sequence,
        };
        if let Some(payload) = snapshot {
            self.append(WalRecordKind::Checkpoint, payload)?;
        }
        self.checkpoint_head = mark.position;
        self.wrapped = self.write_head < self.checkpoint_head;
        self.committed_sequence = mark.sequence;
        // Only the optional checkpoint record itself remains unreclaimed.
        self.pending_bytes = if snapshot.is_some() {
            ring_distance(self.checkpoint_head, self.write_head, self.region_size)
        } else {
            0
        };
        self.checkpoint_count += 1;
        self.flush()?;
        Ok(mark)
    }

    /// Force an fsync of everything appended so far.
    pub fn flush(&mut self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.file.sync_all()?;
        self.dirty_bytes = 0;
        Ok(())
    }

    pub fn note_auto_commit(&mut self) {
        self.auto_commit_count += 1;
    }

    pub fn note_snapshot_hit(&mut self) {
        self.replay_snapshot_hits += 1;
    }

    #[must_use]
    pub fn pending_bytes(&self) -> u64 {
        self.pending_bytes
    }

    /// Current ring position of the open head, i.e. where the next record or
    /// checkpoint will land.
    #[must_use]
    pub fn write_head_position(&self) -> u64 {
        self.write_head
    }

    #[must_use]
    pub fn region_size(&self) -> u64 {
        self.region_size
    }

    #[must_use]
    pub fn last_sequence(&self) -> u64 {
        self.sequence
    }

    #[must_use]
    pub fn committed_sequence(&self) -> u64 {
        self.committed_sequence
    }

    #[must_use]
    pub fn recover_stats(&self) -> WalStats {
        WalStats {
            wrap_count: self.wrap_count,
            checkpoint_count: self.checkpoint_count,
            auto_commit_count: self.auto_commit_count,
            pending_bytes: self.pending_bytes,
            wal_size: self.region_size,
            last_seq: self.sequence,
            committed_seq: self.committed_sequence,
            replay_snapshot_hit_count: self.replay_snapshot_hits,
        }
    }

    fn write_at(&mut self, ring_pos: u64, bytes: &[u8]) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(self.region_offset + ring_pos))?;
        self.file.write_all(bytes)?;
        Ok(())
    }
}

fn ring_distance(from: u64, to: u64, size: u64) -> u64 {
    if to >= from { to - from } else { size - from + to }
}

fn encode_record(buf: &mut Vec<u8>, kind: WalRecordKind, sequence: u64, payload: &[u8]) {
    let start = buf.len();
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.push(kind as u8);
    buf.extend_from_slice(&[0u8; 3]);
    buf.extend_from_slice(&sequence.to_le_bytes());
    buf.extend_from_slice(payload);
    let crc = crc32fast::hash(&buf[start + 4..]);
    buf.extend_from_slice(&crc.to_le_bytes());
}

struct ScanOutcome {
    records: Vec<WalRecord>,
    next_head: u64,
    pending_bytes: u64,
    last_seq: u64,
    wrapped: bool,
    damage: Option<WalScanDamage>,
}

fn scan_records(
    file: &mut File,
    region_offset: u64,
    region_size: u64,
    start_pos: u64,
    committed_seq: u64,
) -> Result<ScanOutcome> {
    let mut pos = start_pos;
    let mut wrapped = false;
    let mut expected_seq = committed_seq + 1;
    let mut records = Vec::new();
    let mut pending_bytes = 0u64;
    let mut last_seq = committed_seq;
    let mut damage = None;

    loop {
        if pos + 4 > region_size {
            if wrapped {
                break;
            }
            wrapped = true;
            pos = 0;
            continue;
        }
        let mut word = [0u8; 4];
        file.seek(SeekFrom::Start(region_offset + pos))?;
        file.read_exact(&mut word)?;
        let length = u32::from_le_bytes(word);

        if length == 0 {
            break;
        }
        if length == WAL_WRAP_MARKER {
            if wrapped {
                break;
            }
            wrapped = true;
            pos = 0;
            continue;
        }
        if length == WAL_SENTINEL {
            // Group terminator between records.
            pos += 4;
            pending_bytes += 4;
            continue;
        }

        let record_size = WAL_RECORD_HEADER_SIZE + u64::from(length) + WAL_RECORD_TRAILER_SIZE;
        if pos + record_size > region_size {
            damage = Some(WalScanDamage {
                offset: pos,
                reason: format!("record length {length} exceeds ring bounds"),
            });
            break;
        }

        let mut frame = vec![0u8; record_size as usize];
        file.seek(SeekFrom::Start(region_offset + pos))?;
        file.read_exact(&mut frame)?;

        let kind_byte = frame[4];
        let sequence = u64::from_le_bytes(frame[8..16].try_into().unwrap_or([0; 8]));
        if sequence != expected_seq {
            // Stale bytes from a reclaimed record; the live chain ends here.
            break;
        }
        let payload_end = 16 + length as usize;
        let stored_crc = u32::from_le_bytes(
            frame[payload_end..payload_end + 4]
                .try_into()
                .unwrap_or([0; 4]),
        );
        let computed_crc = crc32fast::hash(&frame[4..payload_end]);
        if stored_crc != computed_crc {
            damage = Some(WalScanDamage {
                offset: pos,
                reason: format!("record checksum mismatch at sequence {sequence}"),
            });
            break;
        }
        let Ok(kind) = WalRecordKind::try_from(kind_byte) else {
            damage = Some(WalScanDamage {
                offset: pos,
                reason: format!("unknown record kind {kind_byte}"),
            });
            break;
        };

        records.push(WalRecord {
            sequence,
            kind,
            payload: frame[16..payload_end].to_vec(),
        });
        last_seq = sequence;
        expected_seq += 1;
        pos += record_size;
        pending_bytes += record_size;
    }

    Ok(ScanOutcome {
        records,
        next_head: pos,
        pending_bytes,
        last_seq,
        wrapped,
        damage,
    })
}
