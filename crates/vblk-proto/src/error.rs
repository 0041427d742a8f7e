//! The workspace-wide error type.
//!
//! One enum covers every failure the system reports, from protocol framing
//! up through device I/O. Components that need to react to a specific
//! condition (the object-store device retries `CapacityExhausted`, the
//! request engine treats `BadMagic` as fatal) match on the variant; the
//! request engine maps everything else onto an NBD wire error code via
//! [`VbdError::nbd_code`].

use std::io;

use thiserror::Error;

/// Result alias used throughout the workspace.
pub type VbdResult<T> = Result<T, VbdError>;

/// Unified error type for all vblk operations.
#[derive(Debug, Error)]
pub enum VbdError {
    /// Underlying I/O failure from a local file, socket, or store.
    #[error("I/O failure")]
    Io(#[from] io::Error),

    /// Read extends past the end of the device or segment.
    #[error("read past end of device")]
    Eof,

    /// Write extends past the end of the device.
    #[error("write past end of device")]
    UnexpectedEof,

    /// Operation arrived after the component was closed.
    #[error("device is shut down")]
    Shutdown,

    /// Request header did not carry the NBD request magic.
    #[error("request header had bad magic {0:#010x}")]
    BadMagic(u32),

    /// Malformed or unsupported protocol traffic other than a bad magic.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Offset or length not aligned to the device block size.
    #[error("request not block aligned (pos={pos}, len={len})")]
    Unaligned { pos: u64, len: u64 },

    /// The local segment cache quota is fully claimed. Internal signal:
    /// the object-store device evicts and retries, it never reaches the wire.
    #[error("local segment cache is at capacity")]
    CapacityExhausted,

    /// Remote object store failure (enumeration, download, or upload).
    #[error("remote store failure: {0}")]
    Remote(String),

    /// Invalid configuration detected at construction time.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl VbdError {
    /// Map this error onto the NBD reply error code reported to the kernel.
    pub fn nbd_code(&self) -> u32 {
        match self {
            Self::Unaligned { .. } | Self::Config(_) => crate::NBD_EINVAL,
            Self::BadMagic(_) | Self::Protocol(_) => crate::NBD_EINVAL,
            // Out-of-bounds, store failures, and post-shutdown ops all
            // surface as EIO; the kernel retries or fails the bio.
            Self::Io(_)
            | Self::Eof
            | Self::UnexpectedEof
            | Self::Shutdown
            | Self::CapacityExhausted
            | Self::Remote(_) => crate::NBD_EIO,
        }
    }

    /// Whether this error should tear down the NBD session rather than be
    /// answered with an error reply.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(self, Self::BadMagic(_) | Self::Protocol(_))
    }
}
