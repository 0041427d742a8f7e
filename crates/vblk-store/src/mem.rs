//! Memory-backed device.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use vblk_core::Device;
use vblk_proto::{VbdError, VbdResult};

/// A heap-backed block device. Useful for testing and for volumes whose
/// contents may vanish with the process.
pub struct MemDevice {
    disk: RwLock<Vec<u8>>,
    size: u64,
    online: AtomicBool,
}

impl MemDevice {
    pub fn new(size: u64) -> Self {
        Self {
            disk: RwLock::new(vec![0u8; size as usize]),
            size,
            online: AtomicBool::new(true),
        }
    }

    fn check_online(&self) -> VbdResult<()> {
        if !self.online.load(Ordering::Acquire) {
            return Err(VbdError::Shutdown);
        }
        Ok(())
    }
}

#[async_trait]
impl Device for MemDevice {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read_at(&self, buf: &mut [u8], pos: u64) -> VbdResult<usize> {
        self.check_online()?;
        if pos.saturating_add(buf.len() as u64) > self.size {
            return Err(VbdError::Eof);
        }
        let disk = self.disk.read().expect("mem device lock");
        let at = pos as usize;
        buf.copy_from_slice(&disk[at..at + buf.len()]);
        Ok(buf.len())
    }

    async fn write_at(&self, buf: &[u8], pos: u64) -> VbdResult<usize> {
        self.check_online()?;
        if pos.saturating_add(buf.len() as u64) > self.size {
            return Err(VbdError::UnexpectedEof);
        }
        let mut disk = self.disk.write().expect("mem device lock");
        let at = pos as usize;
        disk[at..at + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }

    async fn trim(&self, _pos: u64, _len: u64) -> VbdResult<()> {
        self.check_online()
    }

    async fn flush(&self) -> VbdResult<()> {
        self.check_online()
    }

    async fn close(&self) -> VbdResult<()> {
        self.online.store(false, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use vblk_core::zeros::is_zeros;

    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[tokio::test]
    async fn pattern_write_then_read_and_untouched_is_zero() {
        let dev = MemDevice::new(128 * MIB);

        let pattern = vec![0xaau8; 4096];
        assert_eq!(dev.write_at(&pattern, 0).await.unwrap(), 4096);

        let mut buf = vec![0u8; 4096];
        dev.read_at(&mut buf, 0).await.unwrap();
        assert_eq!(buf, pattern);

        // Everything past the written block reads back as zeros.
        let mut chunk = vec![0u8; 1024 * 1024];
        let mut pos = 4096u64;
        while pos < dev.size() {
            let len = chunk.len().min((dev.size() - pos) as usize);
            dev.read_at(&mut chunk[..len], pos).await.unwrap();
            assert!(is_zeros(&chunk[..len]), "nonzero data at {pos}");
            pos += len as u64;
        }
    }

    #[tokio::test]
    async fn bounds_are_checked() {
        let dev = MemDevice::new(8192);
        let mut buf = vec![0u8; 4096];

        assert!(matches!(
            dev.read_at(&mut buf, 8192).await,
            Err(VbdError::Eof)
        ));
        assert!(matches!(
            dev.write_at(&buf, 4097).await,
            Err(VbdError::UnexpectedEof)
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fails_later_ops() {
        let dev = MemDevice::new(4096);
        dev.close().await.unwrap();
        dev.close().await.unwrap();

        let mut buf = [0u8; 1];
        assert!(matches!(
            dev.read_at(&mut buf, 0).await,
            Err(VbdError::Shutdown)
        ));
        assert!(matches!(
            dev.write_at(&buf, 0).await,
            Err(VbdError::Shutdown)
        ));
        assert!(matches!(dev.flush().await, Err(VbdError::Shutdown)));
    }
}
