//! Offline compaction: rewrite the committed live set into a fresh archive.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::constants::SUPER_HEADER_SIZE;
use crate::error::{ArchiveError, Result};
use crate::io::header::{HeaderCodec, SuperHeader};
use crate::toc::{ManifestEntry, TocSlot, checksum64, write_slot};
use crate::types::frame::FrameStatus;
use crate::types::options::CompactionOptions;

use super::lifecycle::{Archive, encode_frame_table, read_manifest_blob, write_blob_at};

impl Archive {
    /// Write the committed live set into a fresh archive at `dest`.
    ///
    /// Live payloads are copied; payloads of deleted or superseded frames are
    /// optionally zeroed while their metadata and ids are preserved. The
    /// committed lexical and vector blobs carry over verbatim. The
    /// destination's WAL starts empty with `committed_seq` initialized to the
    /// source's final sequence. The source file is left untouched; the caller
    /// decides when to swap.
    ///
    /// Cancellable between frames; a canceled or failed run removes the
    /// partial destination, so a partial archive is never observable.
    pub fn rewrite_live_set<P: AsRef<Path>>(
        &mut self,
        dest: P,
        options: CompactionOptions,
        cancel: Option<&AtomicBool>,
    ) -> Result<()> {
        let dest = dest.as_ref();
        let result = self.rewrite_live_set_inner(dest, options, cancel);
        if result.is_err() {
            let _ = std::fs::remove_file(dest);
        }
        result
    }

    fn rewrite_live_set_inner(
        &mut self,
        dest: &Path,
        options: CompactionOptions,
        cancel: Option<&AtomicBool>,
    ) -> Result<()> {
        let mut out = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(dest)?;

        let header = SuperHeader {
            major_version: self.header.major_version,
            minor_version: self.header.minor_version,
            created_ms: self.header.created_ms,
            dimension_hint: self.header.dimension_hint,
            live_toc: 0,
        };
        let wal_offset = SUPER_HEADER_SIZE;
        let wal_size = self.slot.wal_size;
        out.set_len(wal_offset + wal_size)?;
        HeaderCodec::init(&mut out, &header)?;

        let mut cursor = wal_offset + wal_size;
        let mut frames = self.frames.clone();
        let next_stamp = self.slot.logical_stamp;

        for frame in &mut frames {
            if let Some(cancel) = cancel {
                if cancel.load(Ordering::Relaxed) {
                    return Err(ArchiveError::Canceled);
                }
            }
            let mut encoded = vec![0u8; frame.payload_length as usize];
            self.file.seek(SeekFrom::Start(frame.payload_offset))?;
            self.file.read_exact(&mut encoded)?;
            if crc32fast::hash(&encoded) != frame.payload_checksum {
                return Err(ArchiveError::ChecksumMismatch {
                    context: format!("payload of frame {} during compaction", frame.id),
                });
            }

            let dead = frame.status == FrameStatus::Deleted || frame.superseded_by.is_some();
            if dead && options.zero_dead_payloads {
                encoded.fill(0);
                frame.payload_checksum = crc32fast::hash(&encoded);
            }

            frame.payload_offset = cursor;
            write_blob_at(&mut out, cursor, &encoded)?;
            cursor += encoded.len() as u64;
        }

        let lex = self.carry_blob(&mut out, &self.slot.lex.clone(), "lexical blob", &mut cursor)?;
        let vec = self.carry_blob(&mut out, &self.slot.vec.clone(), "vector blob", &mut cursor)?;

        let table_bytes = encode_frame_table(&frames)?;
        let frame_log = ManifestEntry {
            offset: cursor,
            length: table_bytes.len() as u64,
            checksum: checksum64(&table_bytes),
            stamp: next_stamp,
        };
        write_blob_at(&mut out, cursor, &table_bytes)?;

        let slot = TocSlot {
            logical_stamp: next_stamp,
            frame_log,
            lex,
            vec,
            wal_offset,
            wal_size,
            wal_checkpoint_pos: 0,
            committed_seq: self.slot.committed_seq,
        };
        write_slot(&mut out, 0, &slot)?;
        out.sync_all()?;
        drop(out);

        // Verify the destination before handing it back.
        let verified = Archive::open_read_only(dest)?;
        if verified.frames.len() != frames.len() {
            return Err(ArchiveError::InvalidToc {
                reason: "compacted archive frame count mismatch".into(),
            });
        }
        tracing::info!(
            dest = %dest.display(),
            frames = frames.len(),
            zeroed = options.zero_dead_payloads,
            "live set rewritten"
        );
        Ok(())
    }

    /// Copy a committed blob verbatim into the destination.
    fn carry_blob(
        &mut self,
        out: &mut std::fs::File,
        manifest: &ManifestEntry,
        context: &str,
        cursor: &mut u64,
    ) -> Result<ManifestEntry> {
        if !manifest.is_present() {
            return Ok(ManifestEntry::default());
        }
        let bytes = read_manifest_blob(&mut self.file, manifest, context, false)?;
        let carried = ManifestEntry {
            offset: *cursor,
            length: bytes.len() as u64,
            checksum: manifest.checksum,
            stamp: manifest.stamp,
        };
        write_blob_at(out, *cursor, &bytes)?;
        *cursor += bytes.len() as u64;
        Ok(carried)
    }
}
