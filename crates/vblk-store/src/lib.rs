//! Backing device implementations for the vblk userspace block device server.
//!
//! Four devices implement the [`vblk_core::Device`] contract:
//!
//! - [`mem::MemDevice`] — heap backed, for testing and throwaway volumes.
//! - [`file::FileDevice`] — one flat backing file.
//! - [`dedup::DedupDevice`] — content-addressed deduplicating store over
//!   three backing files (block map, hash index, block data).
//! - [`object::ObjStoreDevice`] — a remote object store fronted by a local
//!   segment cache, with optional transparent compression and encryption.

pub mod dedup;
pub mod file;
pub mod mem;
pub mod object;

use vblk_proto::VbdError;

/// Map a background-task join failure onto the workspace error type.
pub(crate) fn join_err(err: tokio::task::JoinError) -> VbdError {
    VbdError::Io(std::io::Error::new(std::io::ErrorKind::Other, err))
}
