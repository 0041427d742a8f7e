//! The abstract block device contract consumed by the request engine.

use async_trait::async_trait;
use vblk_proto::VbdResult;

/// Default block size advertised to the kernel, in bytes.
pub const DEFAULT_BLOCK_SIZE: u64 = 4096;

/// A virtual block device the request engine services requests against.
///
/// Positional semantics are POSIX-like: `read_at`/`write_at` return the byte
/// count transferred. The engine guarantees requests it dispatches are block
/// aligned and in bounds, but implementations must still defensively
/// bounds-check — a read past the end returns [`VbdError::Eof`], a write past
/// the end [`VbdError::UnexpectedEof`].
///
/// `flush` is a durability barrier: once it returns, every previously
/// completed write must survive a process crash. `close` is idempotent, and
/// any operation issued after it must fail with [`VbdError::Shutdown`].
///
/// [`VbdError::Eof`]: vblk_proto::VbdError::Eof
/// [`VbdError::UnexpectedEof`]: vblk_proto::VbdError::UnexpectedEof
/// [`VbdError::Shutdown`]: vblk_proto::VbdError::Shutdown
#[async_trait]
pub trait Device: Send + Sync + 'static {
    /// Total capacity in bytes.
    fn size(&self) -> u64;

    /// Block size in bytes; offsets and lengths on the wire are multiples of
    /// this.
    fn block_size(&self) -> u64 {
        DEFAULT_BLOCK_SIZE
    }

    /// Read `buf.len()` bytes starting at byte `pos`.
    async fn read_at(&self, buf: &mut [u8], pos: u64) -> VbdResult<usize>;

    /// Write `buf` starting at byte `pos`.
    async fn write_at(&self, buf: &[u8], pos: u64) -> VbdResult<usize>;

    /// Discard a byte range. Advisory; acknowledging without effect is
    /// conforming.
    async fn trim(&self, pos: u64, len: u64) -> VbdResult<()>;

    /// Durability barrier over all previously completed writes.
    async fn flush(&self) -> VbdResult<()>;

    /// Release resources. Idempotent.
    async fn close(&self) -> VbdResult<()>;
}
