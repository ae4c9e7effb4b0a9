//! Public types exposed by the `wv2-core` crate.

pub mod embedding;
pub mod frame;
pub mod options;
pub mod search;

pub use embedding::{Embedding, EmbeddingIdentity, PendingEmbeddingDiff};
pub use frame::{
    CanonicalEncoding, Frame, FrameId, FrameRole, FrameStatus, Stats, Tier, TimelineEntry,
    TimelineQuery,
};
pub use options::{
    ArchiveOptions, CompactionOptions, IoQueueQos, ProactiveCommitPolicy, PutOptions,
    PutOptionsBuilder, WalFsyncPolicy,
};
pub use search::{
    FrameFilter, ResultSource, SearchHit, SearchMode, SearchRequest, SearchResponse,
    VecEngineKind, VecEnginePreference,
};
