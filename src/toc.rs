//! TOC slots: the per-commit manifest block written into the super-header.
//!
//! Two 256-byte slots live at fixed offsets; commit always writes the slot
//! that is not live and then flips the selector byte. A slot carries the
//! manifests for the frame table, the lexical blob and the vector blob, plus
//! the WAL region bounds and checkpoint watermark.
//!
//! Slot layout (little-endian):
//!
//! ```text
//! 0x00  u64  logical_stamp
//! 0x08  manifest frame_log   (offset u64, length u64, checksum u64, aux u64)
//! 0x28  manifest lex
//! 0x48  manifest vec
//! 0x68  u64  wal_offset
//! 0x70  u64  wal_size
//! 0x78  u64  wal_checkpoint_pos
//! 0x80  u64  committed_seq
//! 0x88  zero padding
//! 0xF8  u64  checksum (blake3-64 of bytes 0x00..0xF8)
//! ```

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::constants::{TOC_SLOT_A_OFFSET, TOC_SLOT_B_OFFSET, TOC_SLOT_SIZE};
use crate::error::{ArchiveError, Result};

const SLOT_CHECKSUM_OFFSET: usize = 0xF8;

/// Truncated blake3: the first eight bytes of the hash, little-endian.
#[must_use]
pub fn checksum64(bytes: &[u8]) -> u64 {
    let digest = blake3::hash(bytes);
    u64::from_le_bytes(digest.as_bytes()[..8].try_into().unwrap_or([0; 8]))
}

/// One committed artifact: where it lives, how to validate it, and the
/// logical stamp of the commit that produced it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManifestEntry {
    pub offset: u64,
    pub length: u64,
    pub checksum: u64,
    pub stamp: u64,
}

impl ManifestEntry {
    #[must_use]
    pub fn is_present(&self) -> bool {
        self.length != 0
    }

    fn encode_into(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.offset.to_le_bytes());
        buf[8..16].copy_from_slice(&self.length.to_le_bytes());
        buf[16..24].copy_from_slice(&self.checksum.to_le_bytes());
        buf[24..32].copy_from_slice(&self.stamp.to_le_bytes());
    }

    fn decode_from(buf: &[u8]) -> Self {
        Self {
            offset: u64::from_le_bytes(buf[0..8].try_into().unwrap_or([0; 8])),
            length: u64::from_le_bytes(buf[8..16].try_into().unwrap_or([0; 8])),
            checksum: u64::from_le_bytes(buf[16..24].try_into().unwrap_or([0; 8])),
            stamp: u64::from_le_bytes(buf[24..32].try_into().unwrap_or([0; 8])),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TocSlot {
    pub logical_stamp: u64,
    pub frame_log: ManifestEntry,
    pub lex: ManifestEntry,
    pub vec: ManifestEntry,
    pub wal_offset: u64,
    pub wal_size: u64,
    pub wal_checkpoint_pos: u64,
    pub committed_seq: u64,
}

impl TocSlot {
    #[must_use]
    pub fn encode(&self) -> [u8; TOC_SLOT_SIZE as usize] {
        let mut buf = [0u8; TOC_SLOT_SIZE as usize];
        buf[0x00..0x08].copy_from_slice(&self.logical_stamp.to_le_bytes());
        self.frame_log.encode_into(&mut buf[0x08..0x28]);
        self.lex.encode_into(&mut buf[0x28..0x48]);
        self.vec.encode_into(&mut buf[0x48..0x68]);
        buf[0x68..0x70].copy_from_slice(&self.wal_offset.to_le_bytes());
        buf[0x70..0x78].copy_from_slice(&self.wal_size.to_le_bytes());
        buf[0x78..0x80].copy_from_slice(&self.wal_checkpoint_pos.to_le_bytes());
        buf[0x80..0x88].copy_from_slice(&self.committed_seq.to_le_bytes());
        let checksum = checksum64(&buf[..SLOT_CHECKSUM_OFFSET]);
        buf[SLOT_CHECKSUM_OFFSET..].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != TOC_SLOT_SIZE as usize {
            return Err(ArchiveError::InvalidToc {
                reason: format!("slot must be {TOC_SLOT_SIZE} bytes, got {}", buf.len()),
            });
        }
        let stored =
            u64::from_le_bytes(buf[SLOT_CHECKSUM_OFFSET..].try_into().unwrap_or([0; 8]));
        let computed = checksum64(&buf[..SLOT_CHECKSUM_OFFSET]);
        if stored != computed {
            return Err(ArchiveError::ChecksumMismatch {
                context: "toc slot".into(),
            });
        }
        Ok(Self {
            logical_stamp: u64::from_le_bytes(buf[0x00..0x08].try_into().unwrap_or([0; 8])),
            frame_log: ManifestEntry::decode_from(&buf[0x08..0x28]),
            lex: ManifestEntry::decode_from(&buf[0x28..0x48]),
            vec: ManifestEntry::decode_from(&buf[0x48..0x68]),
            wal_offset: u64::from_le_bytes(buf[0x68..0x70].try_into().unwrap_or([0; 8])),
            wal_size: u64::from_le_bytes(buf[0x70..0x78].try_into().unwrap_or([0; 8])),
            wal_checkpoint_pos: u64::from_le_bytes(buf[0x78..0x80].try_into().unwrap_or([0; 8])),
            committed_seq: u64::from_le_bytes(buf[0x80..0x88].try_into().unwrap_or([0; 8])),
        })
    }

    /// Highest byte offset referenced by any manifest; the data region ends
    /// at least here.
    #[must_use]
    pub fn data_end(&self) -> u64 {
        let mut end = self.wal_offset + self.wal_size;
        for manifest in [&self.frame_log, &self.lex, &self.vec] {
            if manifest.is_present() {
                end = end.max(manifest.offset + manifest.length);
            }
        }
        end
    }
}

#[must_use]
pub fn slot_offset(index: u8) -> u64 {
    if index == 0 { TOC_SLOT_A_OFFSET } else { TOC_SLOT_B_OFFSET }
}

pub fn write_slot(file: &mut File, index: u8, slot: &TocSlot) -> Result<()> {
    file.seek(SeekFrom::Start(slot_offset(index)))?;
    file.write_all(&slot.encode())?;
    Ok(())
}

fn read_slot(file: &mut File, index: u8) -> Result<TocSlot> {
    let mut buf = [0u8; TOC_SLOT_SIZE as usize];
    file.seek(SeekFrom::Start(slot_offset(index)))?;
    file.read_exact(&mut buf)?;
    TocSlot::decode(&buf)
}

/// Open-time slot selection: prefer the selector byte, fall back to the
/// alternate slot when the preferred one fails its checksum, and when both
/// decode pick the greater logical stamp.
pub fn select_live_slot(file: &mut File, preferred: u8) -> Result<(u8, TocSlot)> {
    let first = read_slot(file, preferred);
    let second = read_slot(file, 1 - preferred);

    match (first, second) {
        (Ok(a), Ok(b)) => {
            if b.logical_stamp > a.logical_stamp {
                tracing::warn!(
                    preferred = preferred,
                    preferred_stamp = a.logical_stamp,
                    alternate_stamp = b.logical_stamp,
                    "alternate toc slot is newer than the live selector; using it"
                );
                Ok((1 - preferred, b))
            } else {
                Ok((preferred, a))
            }
        }
        (Ok(a), Err(_)) => Ok((preferred, a)),
        (Err(err), Ok(b)) => {
            tracing::warn!(error = %err, "live toc slot invalid; falling back to alternate");
            Ok((1 - preferred, b))
        }
        (Err(a), Err(_)) => Err(ArchiveError::InvalidToc {
            reason: format!("both toc slots invalid (live: {a})"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::SUPER_HEADER_SIZE;
    use tempfile::tempfile;

    fn sample_slot(stamp: u64) -> TocSlot {
        TocSlot {
            logical_stamp: stamp,
            frame_log: ManifestEntry {
                offset: 8192,
                length: 100,
                checksum: 7,
                stamp,
            },
            wal_offset: 4096,
            wal_size: 1024,
            committed_seq: stamp,
            ..TocSlot::default()
        }
    }

    #[test]
    fn slot_roundtrip() {
        let slot = sample_slot(3);
        let decoded = TocSlot::decode(&slot.encode()).expect("decode");
        assert_eq!(decoded, slot);
    }

    #[test]
    fn corrupt_slot_fails_checksum() {
        let mut bytes = sample_slot(3).encode();
        bytes[0x10] ^= 0xFF;
        let err = TocSlot::decode(&bytes).expect_err("decode");
        assert!(matches!(err, ArchiveError::ChecksumMismatch { .. }));
    }

    #[test]
    fn selection_falls_back_and_prefers_newer_stamp() {
        let mut file = tempfile().expect("tmp");
        file.set_len(SUPER_HEADER_SIZE).expect("set_len");

        write_slot(&mut file, 0, &sample_slot(1)).expect("slot a");
        write_slot(&mut file, 1, &sample_slot(2)).expect("slot b");
        let (index, slot) = select_live_slot(&mut file, 0).expect("select");
        assert_eq!(index, 1);
        assert_eq!(slot.logical_stamp, 2);

        // Corrupt the newer slot: selection must fall back to the older one.
        file.seek(SeekFrom::Start(slot_offset(1) + 4)).expect("seek");
        file.write_all(&[0xAB; 8]).expect("corrupt");
        let (index, slot) = select_live_slot(&mut file, 1).expect("select after corruption");
        assert_eq!(index, 0);
        assert_eq!(slot.logical_stamp, 1);
    }
}
