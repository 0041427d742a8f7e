//! Flat-file backed device.

use std::fs;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;
use vblk_core::Device;
use vblk_proto::{VbdError, VbdResult};

use crate::join_err;

/// A block device backed by a single flat file.
pub struct FileDevice {
    file: Arc<fs::File>,
    size: u64,
    online: AtomicBool,
}

impl FileDevice {
    /// Open `path`, creating it at `if_create_size` bytes when absent or
    /// empty. An existing file's length wins over `if_create_size`.
    pub fn open(path: &Path, if_create_size: u64) -> VbdResult<Self> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let len = file.metadata()?.len();
        let size = if len == 0 {
            file.set_len(if_create_size)?;
            file.sync_all()?;
            info!(
                "filedev: created {} with {} bytes",
                path.display(),
                if_create_size
            );
            if_create_size
        } else {
            len
        };

        Ok(Self {
            file: Arc::new(file),
            size,
            online: AtomicBool::new(true),
        })
    }

    fn check_online(&self) -> VbdResult<()> {
        if !self.online.load(Ordering::Acquire) {
            return Err(VbdError::Shutdown);
        }
        Ok(())
    }
}

#[async_trait]
impl Device for FileDevice {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read_at(&self, buf: &mut [u8], pos: u64) -> VbdResult<usize> {
        self.check_online()?;
        if pos.saturating_add(buf.len() as u64) > self.size {
            return Err(VbdError::Eof);
        }

        let file = Arc::clone(&self.file);
        let len = buf.len();
        let data = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
            let mut tmp = vec![0u8; len];
            file.read_exact_at(&mut tmp, pos)?;
            Ok(tmp)
        })
        .await
        .map_err(join_err)??;

        buf.copy_from_slice(&data);
        Ok(len)
    }

    async fn write_at(&self, buf: &[u8], pos: u64) -> VbdResult<usize> {
        self.check_online()?;
        if pos.saturating_add(buf.len() as u64) > self.size {
            return Err(VbdError::UnexpectedEof);
        }

        let file = Arc::clone(&self.file);
        let data = buf.to_vec();
        tokio::task::spawn_blocking(move || file.write_all_at(&data, pos))
            .await
            .map_err(join_err)??;
        Ok(buf.len())
    }

    async fn trim(&self, _pos: u64, _len: u64) -> VbdResult<()> {
        self.check_online()
    }

    async fn flush(&self) -> VbdResult<()> {
        self.check_online()?;
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || file.sync_all())
            .await
            .map_err(join_err)??;
        Ok(())
    }

    async fn close(&self) -> VbdResult<()> {
        if !self.online.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || file.sync_all())
            .await
            .map_err(join_err)??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_write_flush_reopen_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.img");

        let dev = FileDevice::open(&path, 1024 * 1024).unwrap();
        assert_eq!(dev.size(), 1024 * 1024);

        let pattern = vec![0x42u8; 8192];
        dev.write_at(&pattern, 4096).await.unwrap();
        dev.flush().await.unwrap();
        dev.close().await.unwrap();

        // Reopen: existing length wins, data survives.
        let dev = FileDevice::open(&path, 1).unwrap();
        assert_eq!(dev.size(), 1024 * 1024);
        let mut buf = vec![0u8; 8192];
        dev.read_at(&mut buf, 4096).await.unwrap();
        assert_eq!(buf, pattern);

        let mut head = vec![0u8; 4096];
        dev.read_at(&mut head, 0).await.unwrap();
        assert!(vblk_core::zeros::is_zeros(&head));
    }

    #[tokio::test]
    async fn post_close_ops_fail() {
        let dir = tempfile::tempdir().unwrap();
        let dev = FileDevice::open(&dir.path().join("x.img"), 4096).unwrap();
        dev.close().await.unwrap();
        dev.close().await.unwrap();
        assert!(matches!(dev.flush().await, Err(VbdError::Shutdown)));
    }
}
