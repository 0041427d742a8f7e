//! NBD wire protocol types shared by the vblk workspace.
//!
//! The Linux NBD driver forwards block I/O over a socket as framed request
//! messages and expects framed simple replies back. This crate owns that
//! framing plus the workspace-wide error type, and nothing else: no device
//! logic, no kernel plumbing.
//!
//! Wire format reference:
//! <https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md>

pub mod error;
pub mod request;
pub mod response;

pub use error::{VbdError, VbdResult};
pub use request::{Request, RequestKind};
pub use response::Response;

/// Transmission request magic (big-endian on the wire).
pub const NBD_REQUEST_MAGIC: u32 = 0x2560_9513;
/// Simple reply magic (big-endian on the wire).
pub const NBD_REPLY_MAGIC: u32 = 0x6744_6698;

/// Size of a request header on the wire: magic(4) + type(4) + handle(8) +
/// offset(8) + length(4).
pub const REQUEST_HEADER_LEN: usize = 28;
/// Size of a simple reply on the wire: magic(4) + error(4) + handle(8).
pub const REPLY_HEADER_LEN: usize = 16;
/// Length of the opaque request handle echoed in every reply.
pub const HANDLE_LEN: usize = 8;

// Command types (32-bit on the kernel transmission socket).
pub const NBD_CMD_READ: u32 = 0;
pub const NBD_CMD_WRITE: u32 = 1;
pub const NBD_CMD_DISC: u32 = 2;
pub const NBD_CMD_FLUSH: u32 = 3;
pub const NBD_CMD_TRIM: u32 = 4;

// Reply error codes (32-bit, errno values fixed by the protocol).
pub const NBD_OK: u32 = 0;
pub const NBD_EPERM: u32 = 1;
pub const NBD_EIO: u32 = 5;
pub const NBD_ENOMEM: u32 = 12;
pub const NBD_EINVAL: u32 = 22;
pub const NBD_ENOSPC: u32 = 28;
pub const NBD_EFBIG: u32 = 75;
pub const NBD_ENOTSUP: u32 = 95;
pub const NBD_ESHUTDOWN: u32 = 108;
