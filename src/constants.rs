//! On-disk layout constants for the `.wv2` archive format.
//!
//! All multi-byte integers in the format are little-endian. The magic values
//! spell out ASCII tags when read as raw bytes ("WV2S", "WV2V", ...).

/// Archive super-header magic ("WV2S").
pub const ARCHIVE_MAGIC: u32 = 0x5332_5657;

/// Vector blob magic ("WV2V").
pub const VEC_BLOB_MAGIC: u32 = 0x5632_5657;

/// Lexical blob magic ("WV2L").
pub const LEX_BLOB_MAGIC: u32 = 0x4C32_5657;

/// Frame table blob magic ("WV2F").
pub const FRAME_TABLE_MAGIC: u32 = 0x4632_5657;

/// WAL record sentinel ("NEAW" on disk; terminates every append group).
pub const WAL_SENTINEL: u32 = 0x5741_454E;

/// Length marker telling the WAL scanner to jump back to ring offset zero.
pub const WAL_WRAP_MARKER: u32 = 0xFFFF_FFFF;

pub const FORMAT_MAJOR_VERSION: u16 = 2;
pub const FORMAT_MINOR_VERSION: u16 = 1;

pub const VEC_BLOB_VERSION: u16 = 1;
pub const LEX_BLOB_VERSION: u16 = 1;
pub const FRAME_TABLE_VERSION: u16 = 1;

/// Row-major f32, directly uploadable to a GPU buffer.
pub const VEC_BLOB_ENCODING_ROW_MAJOR_F32: u8 = 2;

/// Size of the fixed super-header region at the start of the file.
pub const SUPER_HEADER_SIZE: u64 = 4096;

/// Byte offset of the live-TOC selector inside the super-header.
pub const LIVE_TOC_OFFSET: u64 = 0x14;

/// Byte offsets of the two TOC slots inside the super-header.
pub const TOC_SLOT_A_OFFSET: u64 = 0x20;
pub const TOC_SLOT_B_OFFSET: u64 = 0x120;

/// Size of one TOC slot.
pub const TOC_SLOT_SIZE: u64 = 256;

/// Fixed per-record WAL header: `len u32 | kind u8 | reserved u8[3] | seq u64`.
pub const WAL_RECORD_HEADER_SIZE: u64 = 16;

/// Per-record trailer: `checksum u32`.
pub const WAL_RECORD_TRAILER_SIZE: u64 = 4;

/// The sentinel written once per append group.
pub const WAL_SENTINEL_SIZE: u64 = 4;

/// Default ring size for new archives.
pub const DEFAULT_WAL_SIZE: u64 = 1024 * 1024;

/// Smallest ring the writer will accept.
pub const MIN_WAL_SIZE: u64 = 256;

/// Upper bound on `top_k` accepted by the vector engines.
pub const MAX_TOP_K: usize = 10_000;

/// Above this many vectors the auto engine order prefers the CPU path.
pub const GPU_AUTO_MAX_VECTORS: usize = 20_000;

/// Above this `top_k` the auto engine order prefers the CPU path.
pub const GPU_AUTO_MAX_TOP_K: usize = 64;

/// Initial GPU-side row reservation; doubles on overflow.
pub const GPU_INITIAL_CAPACITY: usize = 64;

/// Safety cap for index blobs loaded back from the file.
pub const MAX_INDEX_BYTES: u64 = 512 * 1024 * 1024;

/// Safety cap for a single frame payload.
pub const MAX_FRAME_BYTES: u64 = 256 * 1024 * 1024;

/// Depth cap when walking supersede chains at commit time.
pub const MAX_SUPERSEDE_DEPTH: usize = 4096;

/// Tolerance for the L2 norm of vectors declared normalized.
pub const NORMALIZED_EPSILON: f32 = 1e-4;

/// Standard reciprocal-rank-fusion constant.
pub const RRF_K: f32 = 60.0;

/// Characters kept for timeline previews.
pub const TIMELINE_PREVIEW_CHARS: usize = 120;

/// Metadata keys under which surrogate frames carry their reduced tiers.
pub const SURROGATE_GIST_KEY: &str = "surrogate.gist";
pub const SURROGATE_MICRO_KEY: &str = "surrogate.micro";

/// Metadata key holding an access-frequency counter for tier selection.
pub const ACCESS_COUNT_KEY: &str = "access.count";

/// Frame kind reserved for surrogate frames.
pub const SURROGATE_KIND: &str = "surrogate";
