//! One object-store segment: a fixed-size slice of the device, stored as one
//! remote item and optionally resident as a local cache file.
//!
//! State transitions:
//!
//! ```text
//!        (cold: no local file, no remote item)
//!           │ first write
//!           ▼
//!      (local zero-provisioned, dirty)
//!           │ flush              │ write
//!           ▼                    ▼
//!      (local + remote)     (local, dirty)
//!           │ evict
//!           ▼
//!      (remote only)
//!           │ read
//!           ▼
//!      (local downloaded, clean)
//! ```
//!
//! Two locks, always acquired file-before-item: the local-file slot and the
//! remote-item slot. Dirty/backed flags and the last-access stamps are
//! atomics so the evictor can scan without locking.

use std::fs;
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::debug;
use vblk_core::zeros::{is_zeros, zero_fill};
use vblk_proto::{VbdError, VbdResult};

use super::container::{Item, Metadata};
use super::params::StoreParams;
use crate::join_err;

pub(super) struct Segment {
    pub id: usize,
    params: Arc<StoreParams>,
    /// Local cache file, present iff `backed`.
    file: RwLock<Option<Arc<fs::File>>>,
    /// Remote item handle, present once synced or discovered at startup.
    item: RwLock<Option<Item>>,
    dirty: AtomicBool,
    backed: AtomicBool,
    last_read: AtomicU64,
    last_write: AtomicU64,
}

impl Segment {
    pub fn new(id: usize, params: Arc<StoreParams>, remote: Option<Item>) -> Self {
        Self {
            id,
            params,
            file: RwLock::new(None),
            item: RwLock::new(remote),
            dirty: AtomicBool::new(false),
            backed: AtomicBool::new(false),
            last_read: AtomicU64::new(0),
            last_write: AtomicU64::new(0),
        }
    }

    pub fn dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn backed(&self) -> bool {
        self.backed.load(Ordering::Acquire)
    }

    /// Clock stamp of the least recent of (last read, last write); 0 means
    /// that kind of access never happened, which sorts oldest.
    pub fn last_op(&self) -> u64 {
        self.last_read
            .load(Ordering::Relaxed)
            .min(self.last_write.load(Ordering::Relaxed))
    }

    /// Read within this segment. `pos` is segment relative; the caller clips
    /// `buf` to the segment boundary.
    pub async fn read_at(&self, buf: &mut [u8], pos: u64) -> VbdResult<usize> {
        self.last_read.store(self.params.tick(), Ordering::Relaxed);

        {
            let guard = self.file.read().await;
            if let Some(file) = guard.as_ref() {
                let file = Arc::clone(file);
                return self.read_file(&file, buf, pos).await;
            }
        }

        let mut guard = self.file.write().await;
        if guard.is_none() {
            let item_guard = self.item.read().await;
            if let Some(item) = item_guard.as_ref() {
                if let Some(file) = self.params.download_file(self.id, item).await? {
                    *guard = Some(file);
                    self.backed.store(true, Ordering::Release);
                }
            }
        }

        match guard.as_ref() {
            Some(file) => {
                let file = Arc::clone(file);
                self.read_file(&file, buf, pos).await
            }
            None => {
                // Logically empty segment: zeros up to the boundary.
                if pos >= self.params.segment_bytes {
                    return Err(VbdError::Eof);
                }
                let len = buf.len().min((self.params.segment_bytes - pos) as usize);
                zero_fill(&mut buf[..len]);
                if len < buf.len() {
                    return Err(VbdError::Eof);
                }
                Ok(len)
            }
        }
    }

    /// Write within this segment. All-zero writes to a segment with no local
    /// file are dropped; everything else materializes a cache file first.
    pub async fn write_at(&self, buf: &[u8], pos: u64) -> VbdResult<usize> {
        self.last_write.store(self.params.tick(), Ordering::Relaxed);

        if is_zeros(buf) && self.file.read().await.is_none() {
            return Ok(buf.len());
        }

        {
            let guard = self.file.read().await;
            if let Some(file) = guard.as_ref() {
                let file = Arc::clone(file);
                return self.write_file(&file, buf, pos).await;
            }
        }

        let mut guard = self.file.write().await;
        if guard.is_none() {
            let item_guard = self.item.read().await;
            let file = match item_guard.as_ref() {
                Some(item) => match self.params.download_file(self.id, item).await? {
                    Some(file) => file,
                    // Zero-length remote item: nothing to download.
                    None => self.params.create_file(self.id).await?,
                },
                None => self.params.create_file(self.id).await?,
            };
            *guard = Some(file);
            self.backed.store(true, Ordering::Release);
        }

        let file = Arc::clone(guard.as_ref().expect("file just ensured"));
        self.write_file(&file, buf, pos).await
    }

    async fn read_file(&self, file: &Arc<fs::File>, buf: &mut [u8], pos: u64) -> VbdResult<usize> {
        let len = buf.len();
        let file = Arc::clone(file);
        let data = tokio::task::spawn_blocking(move || -> io::Result<Vec<u8>> {
            let mut tmp = vec![0u8; len];
            file.read_exact_at(&mut tmp, pos)?;
            Ok(tmp)
        })
        .await
        .map_err(join_err)??;
        buf.copy_from_slice(&data);
        Ok(len)
    }

    async fn write_file(&self, file: &Arc<fs::File>, buf: &[u8], pos: u64) -> VbdResult<usize> {
        let file = Arc::clone(file);
        let data = buf.to_vec();
        let (count, err) = tokio::task::spawn_blocking(move || write_full_at(&file, &data, pos))
            .await
            .map_err(join_err)?;

        // Any byte that reached the file is observable; the segment must
        // upload again even when the write failed partway.
        if count > 0 {
            self.dirty.store(true, Ordering::Release);
        }
        match err {
            Some(err) => Err(err.into()),
            None => Ok(count),
        }
    }

    /// Upload this segment if dirty. `opt_buf` (capacity ≥ segment size)
    /// lets the upload run from a snapshot so writers unblock early; it is
    /// handed back for pooling.
    pub async fn flush(&self, opt_buf: Option<Vec<u8>>) -> (Option<Vec<u8>>, VbdResult<()>) {
        if !self.dirty() {
            return (opt_buf, Ok(()));
        }

        let guard = self.file.read().await;
        let Some(file) = guard.as_ref().map(Arc::clone) else {
            return (
                opt_buf,
                Err(VbdError::Io(io::Error::new(
                    io::ErrorKind::Other,
                    "segment is dirty but has no backing cache file",
                ))),
            );
        };
        self.upload(file, Some(guard), opt_buf).await
    }

    /// Sync, snapshot, and upload the cache file, then swap in the new
    /// remote item. The caller's file guard (when provided) is released as
    /// soon as the snapshot is taken.
    async fn upload<'a>(
        &self,
        file: Arc<fs::File>,
        file_guard: Option<RwLockReadGuard<'a, Option<Arc<fs::File>>>>,
        opt_buf: Option<Vec<u8>>,
    ) -> (Option<Vec<u8>>, VbdResult<()>) {
        let mut item_guard = self.item.write().await;

        // Mark clean before snapshotting: a write landing during the upload
        // re-dirties the segment and triggers the next flush.
        self.dirty.store(false, Ordering::Release);

        let sync_file = Arc::clone(&file);
        let synced = tokio::task::spawn_blocking(move || sync_file.sync_all())
            .await
            .map_err(join_err)
            .and_then(|res| res.map_err(VbdError::from));
        if let Err(err) = synced {
            return (opt_buf, Err(err));
        }

        let seg_bytes = self.params.segment_bytes as usize;
        let mut buf = match opt_buf {
            Some(buf) if buf.capacity() >= seg_bytes => buf,
            _ => Vec::with_capacity(seg_bytes),
        };
        buf.resize(seg_bytes, 0);
        let read_file = Arc::clone(&file);
        let buf = match tokio::task::spawn_blocking(move || -> io::Result<Vec<u8>> {
            read_file.read_exact_at(&mut buf, 0)?;
            Ok(buf)
        })
        .await
        .map_err(join_err)
        .and_then(|res| res.map_err(VbdError::from))
        {
            Ok(buf) => buf,
            Err(err) => return (None, Err(err)),
        };

        // Snapshot taken; writers may proceed while the upload runs.
        drop(file_guard);

        let name = self.params.item_name(self.id);
        match self.params.container.put(&name, &buf, Metadata::new()).await {
            Ok(new_item) => {
                let persisted = self.params.persist_etag(self.id, &new_item.etag).await;
                *item_guard = Some(new_item);
                debug!("segment {}: flushed to remote", self.id);
                (Some(buf), persisted)
            }
            Err(err) => (Some(buf), Err(err)),
        }
    }

    /// Drop this segment's local cache file, flushing first when dirty, and
    /// return its quota permit.
    pub async fn delete_file(&self) -> VbdResult<()> {
        let mut guard = self.file.write().await;
        if !self.backed() {
            return Ok(());
        }

        if self.dirty() {
            let Some(file) = guard.as_ref().map(Arc::clone) else {
                return Err(VbdError::Io(io::Error::new(
                    io::ErrorKind::Other,
                    "segment is dirty but has no backing cache file",
                )));
            };
            let (_, flushed) = self.upload(file, None, None).await;
            flushed?;
        }

        self.params.remove_cache_file(self.id).await?;
        *guard = None;
        self.backed.store(false, Ordering::Release);
        self.params.release_capacity();
        debug!("segment {}: local cache file evicted", self.id);
        Ok(())
    }
}

fn write_full_at(file: &fs::File, data: &[u8], pos: u64) -> (usize, Option<io::Error>) {
    let mut written = 0;
    while written < data.len() {
        match file.write_at(&data[written..], pos + written as u64) {
            Ok(0) => {
                return (
                    written,
                    Some(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "cache file accepted no bytes",
                    )),
                )
            }
            Ok(n) => written += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return (written, Some(err)),
        }
    }
    (written, None)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use tokio::sync::Semaphore;

    use crate::object::dir::DirContainer;

    use super::*;

    const SEG: u64 = 64 * 1024;

    fn make_params(dir: &Path, persist: bool, quota: Option<usize>) -> Arc<StoreParams> {
        let container = Arc::new(DirContainer::open(&dir.join("remote")).unwrap());
        std::fs::create_dir_all(dir.join("cache")).unwrap();
        Arc::new(StoreParams::new(
            container,
            dir.join("cache"),
            SEG,
            false,
            persist,
            quota.map(Semaphore::new),
        ))
    }

    #[tokio::test]
    async fn cold_segment_reads_zeros_without_side_effects() {
        let tmp = tempfile::tempdir().unwrap();
        let seg = Segment::new(0, make_params(tmp.path(), false, None), None);

        let mut buf = vec![0xffu8; 4096];
        assert_eq!(seg.read_at(&mut buf, 0).await.unwrap(), 4096);
        assert!(is_zeros(&buf));
        assert!(!seg.backed());
        assert!(!seg.dirty());
    }

    #[tokio::test]
    async fn all_zero_write_to_cold_segment_is_a_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let seg = Segment::new(0, make_params(tmp.path(), false, None), None);

        assert_eq!(seg.write_at(&[0u8; 4096], 0).await.unwrap(), 4096);
        assert!(!seg.backed());
        assert!(!seg.dirty());
    }

    #[tokio::test]
    async fn write_provisions_and_flush_uploads() {
        let tmp = tempfile::tempdir().unwrap();
        let params = make_params(tmp.path(), false, None);
        let seg = Segment::new(0, Arc::clone(&params), None);

        let data = vec![7u8; 4096];
        seg.write_at(&data, 8192).await.unwrap();
        assert!(seg.backed());
        assert!(seg.dirty());

        let (_, res) = seg.flush(None).await;
        res.unwrap();
        assert!(!seg.dirty());

        // Remote now holds the full segment with the write in place.
        let item = params
            .container
            .item(&params.item_name(0))
            .await
            .unwrap()
            .unwrap();
        let remote = params.container.get(&item).await.unwrap();
        assert_eq!(remote.len() as u64, SEG);
        assert_eq!(&remote[8192..8192 + 4096], &data[..]);
        assert!(is_zeros(&remote[..8192]));
    }

    #[tokio::test]
    async fn evict_then_read_downloads_back() {
        let tmp = tempfile::tempdir().unwrap();
        let params = make_params(tmp.path(), false, Some(4));
        let seg = Segment::new(0, Arc::clone(&params), None);

        let data = vec![0xabu8; 4096];
        seg.write_at(&data, 0).await.unwrap();
        // Dirty eviction flushes first.
        seg.delete_file().await.unwrap();
        assert!(!seg.backed());
        assert!(!params.cache_path(0).exists());

        let mut buf = vec![0u8; 4096];
        seg.read_at(&mut buf, 0).await.unwrap();
        assert_eq!(buf, data);
        assert!(seg.backed());
    }

    #[tokio::test]
    async fn flush_is_a_noop_when_clean() {
        let tmp = tempfile::tempdir().unwrap();
        let params = make_params(tmp.path(), false, None);
        let seg = Segment::new(0, Arc::clone(&params), None);

        let (_, res) = seg.flush(None).await;
        res.unwrap();
        assert!(params
            .container
            .item(&params.item_name(0))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn last_op_tracks_oldest_access_kind() {
        let tmp = tempfile::tempdir().unwrap();
        let seg = Segment::new(0, make_params(tmp.path(), false, None), None);
        assert_eq!(seg.last_op(), 0);

        seg.write_at(&[1u8; 16], 0).await.unwrap();
        // Never read, so the combined stamp still reports "never".
        assert_eq!(seg.last_op(), 0);

        let mut buf = [0u8; 16];
        seg.read_at(&mut buf, 0).await.unwrap();
        assert!(seg.last_op() > 0);
    }
}
