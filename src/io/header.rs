//! Codec for the fixed 4 KiB super-header at the start of every archive.
//!
//! Layout (little-endian):
//!
//! ```text
//! 0x00  u32   magic          = "WV2S"
//! 0x04  u16   major_version
//! 0x06  u16   minor_version
//! 0x08  u64   created_ms
//! 0x10  u32   dimension_hint
//! 0x14  u8    live_toc        (0 or 1)
//! 0x15  u8[7] reserved
//! 0x20  toc slot A            (256 bytes)
//! 0x120 toc slot B            (256 bytes)
//! 0x220 zero padding to 4096
//! ```
//!
//! The slots themselves are encoded by [`crate::toc`]; this codec only owns
//! the fixed head and the live-slot selector byte.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::constants::{
    ARCHIVE_MAGIC, FORMAT_MAJOR_VERSION, FORMAT_MINOR_VERSION, LIVE_TOC_OFFSET, SUPER_HEADER_SIZE,
};
use crate::error::{ArchiveError, Result};

const HEAD_SIZE: usize = 0x20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuperHeader {
    pub major_version: u16,
    pub minor_version: u16,
    pub created_ms: u64,
    pub dimension_hint: u32,
    pub live_toc: u8,
}

impl SuperHeader {
    #[must_use]
    pub fn new(created_ms: u64, dimension_hint: u32) -> Self {
        Self {
            major_version: FORMAT_MAJOR_VERSION,
            minor_version: FORMAT_MINOR_VERSION,
            created_ms,
            dimension_hint,
            live_toc: 0,
        }
    }

    /// Index of the slot that is *not* live, i.e. the commit target.
    #[must_use]
    pub fn inactive_toc(&self) -> u8 {
        1 - self.live_toc
    }
}

pub struct HeaderCodec;

impl HeaderCodec {
    /// Zero the whole super-header region and write the fixed head.
    /// Used once at archive creation, before any slot is written.
    pub fn init(file: &mut File, header: &SuperHeader) -> Result<()> {
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&vec![0u8; SUPER_HEADER_SIZE as usize])?;
        Self::write_head(file, header)
    }

    /// Rewrite only the fixed head (bytes 0..0x20), leaving both slots alone.
    pub fn write_head(file: &mut File, header: &SuperHeader) -> Result<()> {
        let mut buf = [0u8; HEAD_SIZE];
        buf[0x00..0x04].copy_from_slice(&ARCHIVE_MAGIC.to_le_bytes());
        buf[0x04..0x06].copy_from_slice(&header.major_version.to_le_bytes());
        buf[0x06..0x08].copy_from_slice(&header.minor_version.to_le_bytes());
        buf[0x08..0x10].copy_from_slice(&header.created_ms.to_le_bytes());
        buf[0x10..0x14].copy_from_slice(&header.dimension_hint.to_le_bytes());
        buf[0x14] = header.live_toc;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&buf)?;
        Ok(())
    }

    pub fn read(file: &mut File) -> Result<SuperHeader> {
        let mut buf = [0u8; HEAD_SIZE];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut buf).map_err(|_| ArchiveError::InvalidHeader {
            reason: "file too short for super-header".into(),
        })?;

        let magic = u32::from_le_bytes(buf[0x00..0x04].try_into().unwrap_or([0; 4]));
        if magic != ARCHIVE_MAGIC {
            return Err(ArchiveError::InvalidHeader {
                reason: format!("bad magic 0x{magic:08x}"),
            });
        }
        let major_version = u16::from_le_bytes(buf[0x04..0x06].try_into().unwrap_or([0; 2]));
        if major_version != FORMAT_MAJOR_VERSION {
            return Err(ArchiveError::InvalidHeader {
                reason: format!("unsupported major version {major_version}"),
            });
        }
        let live_toc = buf[0x14];
        if live_toc > 1 {
            return Err(ArchiveError::InvalidHeader {
                reason: format!("live toc selector out of range: {live_toc}"),
            });
        }

        Ok(SuperHeader {
            major_version,
            minor_version: u16::from_le_bytes(buf[0x06..0x08].try_into().unwrap_or([0; 2])),
            created_ms: u64::from_le_bytes(buf[0x08..0x10].try_into().unwrap_or([0; 8])),
            dimension_hint: u32::from_le_bytes(buf[0x10..0x14].try_into().unwrap_or([0; 4])),
            live_toc,
        })
    }

    /// Atomically flip the live-TOC selector. A single-byte write well inside
    /// the first sector, so it cannot tear.
    pub fn flip_live_toc(file: &mut File, live: u8) -> Result<()> {
        file.seek(SeekFrom::Start(LIVE_TOC_OFFSET))?;
        file.write_all(&[live])?;
        Ok(())
    }
}
