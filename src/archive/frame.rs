//! Frame readers over the union of committed and pending state.

use std::io::{Read, Seek, SeekFrom};

use crate::error::{ArchiveError, Result};
use crate::types::frame::{CanonicalEncoding, Frame, FrameId, FrameStatus};

use super::lifecycle::Archive;
use super::{PendingOp, PendingOpView};

impl Archive {
    /// Status of a frame with staged overrides applied.
    pub(crate) fn effective_status(&self, frame: &Frame) -> FrameStatus {
        self.pending
            .status_overrides
            .get(&frame.id)
            .copied()
            .unwrap_or(frame.status)
    }

    /// Frame metadata with all staged mutations folded in.
    pub(crate) fn overlay(&self, frame: &Frame) -> Frame {
        let mut out = frame.clone();
        out.status = self.effective_status(frame);
        if let Some(&new_id) = self.pending.superseded.get(&frame.id) {
            out.superseded_by = Some(new_id);
        }
        if let Some(&old_id) = self.pending.supersedes.get(&frame.id) {
            out.supersedes = Some(old_id);
        }
        out
    }

    /// Union view: committed frames (ascending id, overlays applied) followed
    /// by pending frames in replay order.
    #[must_use]
    pub fn union_frames(&self) -> Vec<Frame> {
        let mut out: Vec<Frame> = self.frames.iter().map(|f| self.overlay(f)).collect();
        out.extend(self.pending.frames.iter().map(|f| self.overlay(f)));
        out
    }

    /// All frame metadata. `committed_only` skips staged state entirely.
    #[must_use]
    pub fn frame_metas(&self, committed_only: bool) -> Vec<Frame> {
        if committed_only {
            self.frames.clone()
        } else {
            self.union_frames()
        }
    }

    /// Metadata for one frame from the union view.
    pub fn frame_meta(&self, frame_id: FrameId) -> Result<Frame> {
        if let Some(&row) = self.frame_rows.get(&frame_id) {
            return Ok(self.overlay(&self.frames[row]));
        }
        self.pending
            .frames
            .iter()
            .find(|f| f.id == frame_id)
            .map(|f| self.overlay(f))
            .ok_or(ArchiveError::FrameNotFound { frame_id })
    }

    /// Decoded payload bytes. Committed payloads are verified against their
    /// stored checksum before decompression.
    pub fn frame_content(&mut self, frame_id: FrameId) -> Result<Vec<u8>> {
        if let Some(payload) = self.pending.payloads.get(&frame_id) {
            let frame = self.frame_meta(frame_id)?;
            return decode_payload(payload, frame.encoding, frame_id);
        }

        let frame = self.frame_meta(frame_id)?;
        let mut encoded = vec![0u8; frame.payload_length as usize];
        self.file.seek(SeekFrom::Start(frame.payload_offset))?;
        self.file.read_exact(&mut encoded)?;
        if crc32fast::hash(&encoded) != frame.payload_checksum {
            return Err(ArchiveError::ChecksumMismatch {
                context: format!("payload of frame {frame_id}"),
            });
        }
        decode_payload(&encoded, frame.encoding, frame_id)
    }

    /// Text preview for a frame: search text when present, else the payload
    /// when it decodes as UTF-8.
    pub fn frame_preview(&mut self, frame_id: FrameId, max_chars: usize) -> Result<Option<String>> {
        let frame = self.frame_meta(frame_id)?;
        if let Some(text) = frame.search_text.as_deref() {
            return Ok(Some(text.chars().take(max_chars).collect()));
        }
        let bytes = self.frame_content(frame_id)?;
        Ok(String::from_utf8(bytes)
            .ok()
            .map(|text| text.chars().take(max_chars).collect()))
    }

    /// Text-index effects of staged ops past a sequence watermark, in replay
    /// order. Puts of frames that are no longer searchable are dropped.
    pub(crate) fn pending_text_ops(&self, after_seq: u64) -> Vec<(u64, PendingOpView)> {
        self.pending
            .ops
            .iter()
            .filter(|(seq, _)| *seq > after_seq)
            .filter_map(|(seq, op)| match op {
                PendingOp::Put { frame_id } => {
                    let frame = self.pending.frames.iter().find(|f| f.id == *frame_id)?;
                    let frame = self.overlay(frame);
                    let text = frame.search_text.clone()?;
                    frame.is_searchable().then_some((
                        *seq,
                        PendingOpView::Index {
                            frame_id: frame.id,
                            text,
                        },
                    ))
                }
                PendingOp::Delete { frame_id } => Some((
                    *seq,
                    PendingOpView::Remove {
                        frame_id: *frame_id,
                    },
                )),
                PendingOp::Supersede { old_id, .. } => {
                    Some((*seq, PendingOpView::Remove { frame_id: *old_id }))
                }
                PendingOp::Embed => None,
            })
            .collect()
    }

    /// Previews for a batch of frames; unknown ids yield `None`.
    pub fn frame_previews(
        &mut self,
        frame_ids: &[FrameId],
        max_chars: usize,
    ) -> Vec<(FrameId, Option<String>)> {
        frame_ids
            .iter()
            .map(|&frame_id| {
                let preview = self.frame_preview(frame_id, max_chars).ok().flatten();
                (frame_id, preview)
            })
            .collect()
    }
}

fn decode_payload(
    encoded: &[u8],
    encoding: CanonicalEncoding,
    frame_id: FrameId,
) -> Result<Vec<u8>> {
    match encoding {
        CanonicalEncoding::Plain => Ok(encoded.to_vec()),
        CanonicalEncoding::Zstd => {
            zstd::decode_all(std::io::Cursor::new(encoded)).map_err(|err| {
                ArchiveError::Encoding {
                    reason: format!("failed to decode payload of frame {frame_id}: {err}"),
                }
            })
        }
    }
}
