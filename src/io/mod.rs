//! Low-level file plumbing: super-header codec and the ring WAL.

pub mod header;
pub mod wal;
