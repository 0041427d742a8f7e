//! Shared state and cache-file plumbing for object-store segments.
//!
//! One `StoreParams` value is built per device and referenced read-only by
//! every segment: the (wrapped) container handle, geometry, cache directory,
//! provisioning flags, the quota permit counter, and the logical clock that
//! orders segment accesses for eviction.

use std::fs;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, warn};
use vblk_core::zeros::is_zeros;
use vblk_proto::{VbdError, VbdResult};

use super::container::{Container, Item};
use crate::join_err;

/// Zero-run granularity when materializing sparse cache files.
const SPARSE_RUN: usize = 4096;
/// Chunk size for thick-provisioning zero writes.
const ZERO_CHUNK: usize = 2 * 1024 * 1024;

pub(super) struct StoreParams {
    pub container: Arc<dyn Container>,
    pub segment_bytes: u64,
    pub cache_dir: PathBuf,
    pub thick_provision: bool,
    pub persist_cache: bool,
    /// One permit per cacheable segment; `None` means uncapped.
    pub quota: Option<Semaphore>,
    /// Logical clock stamping segment reads and writes; drives LRU.
    op_clock: AtomicU64,
    item_prefix: String,
}

impl StoreParams {
    pub fn new(
        container: Arc<dyn Container>,
        cache_dir: PathBuf,
        segment_bytes: u64,
        thick_provision: bool,
        persist_cache: bool,
        quota: Option<Semaphore>,
    ) -> Self {
        let item_prefix = format!("osbd-dev_{}-blk_", container.name());
        Self {
            container,
            segment_bytes,
            cache_dir,
            thick_provision,
            persist_cache,
            quota,
            op_clock: AtomicU64::new(0),
            item_prefix,
        }
    }

    /// Remote item name for segment `seg_id`.
    pub fn item_name(&self, seg_id: usize) -> String {
        format!("{}{seg_id}", self.item_prefix)
    }

    /// Prefix shared by every item of this device.
    pub fn prefix(&self) -> &str {
        &self.item_prefix
    }

    /// Local cache file path for segment `seg_id`.
    pub fn cache_path(&self, seg_id: usize) -> PathBuf {
        self.cache_dir.join(self.item_name(seg_id))
    }

    /// Next tick of the access clock; never returns 0 (0 means "never").
    pub fn tick(&self) -> u64 {
        self.op_clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Take one cache permit or fail with `CapacityExhausted`.
    pub fn claim_capacity(&self) -> VbdResult<()> {
        if let Some(quota) = &self.quota {
            match quota.try_acquire() {
                Ok(permit) => permit.forget(),
                Err(_) => return Err(VbdError::CapacityExhausted),
            }
        }
        Ok(())
    }

    /// Return one cache permit.
    pub fn release_capacity(&self) {
        if let Some(quota) = &self.quota {
            quota.add_permits(1);
        }
    }

    /// Create a fresh zero-valued cache file for `seg_id`, claiming a quota
    /// permit. Thick provisioning writes the zeros out; thin leaves a sparse
    /// file with one byte at the end.
    pub async fn create_file(&self, seg_id: usize) -> VbdResult<Arc<fs::File>> {
        self.claim_capacity()?;

        let path = self.cache_path(seg_id);
        let segment_bytes = self.segment_bytes;
        let thick = self.thick_provision;
        let created = tokio::task::spawn_blocking(move || -> io::Result<fs::File> {
            let file = fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?;
            if thick {
                let zeros = vec![0u8; ZERO_CHUNK.min(segment_bytes as usize)];
                let mut pos = 0u64;
                while pos < segment_bytes {
                    let n = zeros.len().min((segment_bytes - pos) as usize);
                    file.write_all_at(&zeros[..n], pos)?;
                    pos += n as u64;
                }
            } else {
                file.write_all_at(&[0], segment_bytes - 1)?;
            }
            Ok(file)
        })
        .await
        .map_err(join_err)
        .and_then(|res| res.map_err(VbdError::from));

        match created {
            Ok(file) => Ok(Arc::new(file)),
            Err(err) => {
                let _ = fs::remove_file(self.cache_path(seg_id));
                self.release_capacity();
                Err(err)
            }
        }
    }

    /// Materialize `item` as a local cache file, claiming a quota permit.
    ///
    /// Returns `None` for a zero-length remote item (nothing to download).
    /// When cache persistence is on, a leftover local file with a matching
    /// ETag sidecar is reused instead of downloading.
    pub async fn download_file(
        &self,
        seg_id: usize,
        item: &Item,
    ) -> VbdResult<Option<Arc<fs::File>>> {
        self.claim_capacity()?;

        match self.download_inner(seg_id, item).await {
            Ok(Some(file)) => Ok(Some(file)),
            Ok(None) => {
                self.release_capacity();
                Ok(None)
            }
            Err(err) => {
                let _ = fs::remove_file(self.cache_path(seg_id));
                self.release_capacity();
                Err(err)
            }
        }
    }

    async fn download_inner(&self, seg_id: usize, item: &Item) -> VbdResult<Option<Arc<fs::File>>> {
        if item.size == 0 {
            return Ok(None);
        }
        if item.size != self.segment_bytes {
            return Err(VbdError::Remote(format!(
                "remote item {} has {} bytes, expected {}",
                item.name, item.size, self.segment_bytes
            )));
        }

        let path = self.cache_path(seg_id);
        if let Some(file) = self.reuse_cached(item, &path).await? {
            debug!("segment {seg_id}: reusing persisted cache file");
            return Ok(Some(file));
        }

        let data = self.container.get(item).await?;
        if data.len() as u64 != self.segment_bytes {
            return Err(VbdError::Remote(format!(
                "download of {} yielded {} bytes, expected {}",
                item.name,
                data.len(),
                self.segment_bytes
            )));
        }

        let thick = self.thick_provision;
        let file = tokio::task::spawn_blocking(move || -> io::Result<fs::File> {
            let file = fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?;
            write_segment_file(&file, &data, thick)?;
            Ok(file)
        })
        .await
        .map_err(join_err)??;

        Ok(Some(Arc::new(file)))
    }

    /// Decide whether a leftover cache file may stand in for a download.
    async fn reuse_cached(&self, item: &Item, path: &Path) -> VbdResult<Option<Arc<fs::File>>> {
        let path = path.to_path_buf();
        let etag_path = etag_path(&path);
        let persist = self.persist_cache;
        let segment_bytes = self.segment_bytes;
        let remote_etag = item.etag.clone();

        tokio::task::spawn_blocking(move || -> VbdResult<Option<Arc<fs::File>>> {
            let data_meta = fs::metadata(&path).ok();
            let etag_exists = etag_path.exists();

            match (data_meta, etag_exists) {
                (None, false) => Ok(None),
                (Some(_), false) => {
                    fs::remove_file(&path)?;
                    Ok(None)
                }
                (None, true) => {
                    fs::remove_file(&etag_path)?;
                    Ok(None)
                }
                (Some(meta), true) => {
                    if !persist {
                        return Err(VbdError::Config(format!(
                            "local cache file {} exists but cache persistence is off; \
                             enable persistence or remove it",
                            path.display()
                        )));
                    }

                    let cached_etag = fs::read_to_string(&etag_path)?;
                    let usable = !cached_etag.is_empty()
                        && cached_etag == remote_etag
                        && meta.is_file()
                        && meta.len() == segment_bytes;
                    if usable {
                        let file = fs::OpenOptions::new().read(true).write(true).open(&path)?;
                        return Ok(Some(Arc::new(file)));
                    }

                    // Stale; clear both halves and fall back to a download.
                    fs::remove_file(&path)?;
                    fs::remove_file(&etag_path)?;
                    Ok(None)
                }
            }
        })
        .await
        .map_err(join_err)?
    }

    /// Record the remote ETag next to the cache file after a successful
    /// upload, enabling reuse on the next open.
    pub async fn persist_etag(&self, seg_id: usize, etag: &str) -> VbdResult<()> {
        if !self.persist_cache || etag.is_empty() {
            return Ok(());
        }
        let path = etag_path(&self.cache_path(seg_id));
        let etag = etag.to_owned();
        tokio::task::spawn_blocking(move || fs::write(&path, etag))
            .await
            .map_err(join_err)??;
        Ok(())
    }

    /// Remove a segment's cache file (the ETag sidecar stays; a stale one is
    /// cleaned up by the reuse check).
    pub async fn remove_cache_file(&self, seg_id: usize) -> VbdResult<()> {
        let path = self.cache_path(seg_id);
        tokio::task::spawn_blocking(move || fs::remove_file(&path))
            .await
            .map_err(join_err)?
            .map_err(|err| {
                warn!("segment {seg_id}: cache file removal failed: {err}");
                VbdError::from(err)
            })
    }
}

/// `<cache-file>.etag` sidecar path.
fn etag_path(path: &Path) -> PathBuf {
    let mut raw = path.as_os_str().to_owned();
    raw.push(".etag");
    PathBuf::from(raw)
}

/// Fill a cache file from downloaded segment data. Thin provisioning skips
/// all-zero runs, leaving holes.
fn write_segment_file(file: &fs::File, data: &[u8], thick: bool) -> io::Result<()> {
    if thick {
        return file.write_all_at(data, 0);
    }

    file.set_len(data.len() as u64)?;
    let mut pos = 0u64;
    for chunk in data.chunks(SPARSE_RUN) {
        if !is_zeros(chunk) {
            file.write_all_at(chunk, pos)?;
        }
        pos += chunk.len() as u64;
    }
    Ok(())
}
