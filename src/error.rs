//! Error taxonomy for the `wv2-core` crate.
//!
//! Every public operation returns [`Result`]. Errors carry a structured kind
//! plus a human-readable message; the archive is left in its last-committed
//! state whenever an operation fails.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ArchiveError>;

#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Disk or filesystem failure at the syscall boundary.
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// Super-header is unreadable or carries the wrong magic/version.
    #[error("invalid archive header: {reason}")]
    InvalidHeader { reason: String },

    /// TOC slot checksum or manifest validation failed on both slots.
    #[error("invalid toc: {reason}")]
    InvalidToc { reason: String },

    /// Serialization constraint violated (bad magic, dimension mismatch, ...).
    #[error("encoding error: {reason}")]
    Encoding { reason: String },

    /// Beyond a configured limit (payload size, vector count, top-k, ...).
    #[error("capacity exceeded: {reason}")]
    CapacityExceeded { reason: String },

    /// The ring has no reclaimable checkpoint to wrap over.
    #[error("wal full: {pending_bytes} pending bytes in a {wal_size} byte ring")]
    WalFull { pending_bytes: u64, wal_size: u64 },

    /// A WAL record failed validation during replay.
    #[error("wal corruption at ring offset {offset}: {reason}")]
    WalCorruption { offset: u64, reason: String },

    /// Reference to a frame id that does not exist in any visible view.
    #[error("frame {frame_id} not found")]
    FrameNotFound { frame_id: u64 },

    /// Failed to acquire the writer lease; caller retries with backoff.
    #[error("writer contention: {reason}")]
    WriterContention { reason: String },

    /// Payload or blob bytes did not match their recorded checksum.
    #[error("checksum mismatch in {context}")]
    ChecksumMismatch { context: String },

    /// The embedding provider violates the archive's on-device policy.
    #[error("provider rejected: {reason}")]
    ProviderRejected { reason: String },

    /// Vector dimension differs from the store's fixed dimension.
    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: u32, actual: u32 },

    /// Query could not be interpreted (empty text, missing embedding, ...).
    #[error("invalid query: {reason}")]
    InvalidQuery { reason: String },

    /// Mutation attempted through a read-only handle.
    #[error("archive is read-only: {reason}")]
    ReadOnly { reason: String },

    /// Cancellation observed at a suspension point.
    #[error("operation canceled")]
    Canceled,
}

impl From<bincode::error::EncodeError> for ArchiveError {
    fn from(err: bincode::error::EncodeError) -> Self {
        ArchiveError::Encoding {
            reason: err.to_string(),
        }
    }
}

impl From<bincode::error::DecodeError> for ArchiveError {
    fn from(err: bincode::error::DecodeError) -> Self {
        ArchiveError::Encoding {
            reason: err.to_string(),
        }
    }
}
