//! Core of the vblk userspace block device server.
//!
//! This crate owns the pieces every backing store plugs into:
//!
//! 1. The [`Device`] contract — the abstract block device the request engine
//!    drives.
//! 2. The request engine ([`engine::serve`]) — one reader decoding framed NBD
//!    requests, a pool of I/O workers, and one writer framing replies, with
//!    the write/flush ordering barrier between them.
//! 3. The Linux kernel glue ([`nbdkern`]) — the socketpair + ioctl sequence
//!    that binds the engine's socket to a `/dev/nbdN` node.
//!
//! Device implementations live in `vblk-store`; the daemon wiring lives in
//! `vblkd`.

pub mod device;
pub mod engine;
#[cfg(target_os = "linux")]
pub mod nbdkern;
pub mod zeros;

pub use device::{Device, DEFAULT_BLOCK_SIZE};
