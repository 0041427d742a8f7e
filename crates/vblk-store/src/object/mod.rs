//! Object-store backed device.
//!
//! The logical address space is carved into fixed-size segments, each stored
//! as one remote item named `osbd-dev_<container>-blk_<index>` and cached as
//! a local file while hot. Reads miss to a download, writes dirty the local
//! copy, flushes upload dirty segments concurrently, and a byte quota evicts
//! the least recently used cache files. Compression and encryption are
//! transparent wrappers over the container; see [`compress`] and
//! [`encrypt`].

pub mod compress;
pub mod container;
pub mod dir;
pub mod encrypt;
mod options;
mod params;
mod segment;

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, RwLock, Semaphore};
use tracing::{debug, info, warn};
use vblk_core::Device;
use vblk_proto::{VbdError, VbdResult};

pub use compress::CompressMode;
pub use container::{Container, Item, Metadata};
pub use encrypt::EncryptMode;
pub use options::Options;

use compress::CompressedContainer;
use encrypt::EncryptedContainer;
use params::StoreParams;
use segment::Segment;

use crate::join_err;

/// Bounded retries when an op trips the cache quota and must evict.
const MAX_CAPACITY_RETRIES: usize = 10;
/// Eviction re-samples a candidate until its access stamp is stable, at most
/// this many times.
const MAX_EVICT_SAMPLES: usize = 16;
/// Cap on buffer memory the concurrent flush may hold at once.
const MAX_FLUSH_ALLOC: u64 = 512 * 1024 * 1024;

/// Block device backed by a remote object container with a local segment
/// cache.
pub struct ObjStoreDevice {
    params: Arc<StoreParams>,
    segments: Vec<Arc<Segment>>,
    total_bytes: u64,
    concur_flush: usize,
    persist_cache: bool,
    /// Ops hold the read side; close takes the write side.
    gate: RwLock<()>,
    online: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl ObjStoreDevice {
    /// Build the device over `container`, caching segments under
    /// `cache_dir`. Existing remote items with this device's name prefix are
    /// adopted; nothing is downloaded until first access.
    pub async fn new(
        container: Arc<dyn Container>,
        cache_dir: &Path,
        total_bytes: u64,
        segment_bytes: u64,
        opts: Options,
    ) -> VbdResult<Arc<Self>> {
        if segment_bytes == 0 {
            return Err(VbdError::Config("segment size must be nonzero".into()));
        }
        if segment_bytes > total_bytes {
            return Err(VbdError::Config(format!(
                "segment size ({segment_bytes}) exceeds device size ({total_bytes})"
            )));
        }
        if total_bytes % segment_bytes != 0 {
            return Err(VbdError::Config(format!(
                "device size ({total_bytes}) is not a multiple of the segment size ({segment_bytes})"
            )));
        }

        std::fs::create_dir_all(cache_dir)?;
        let container = Self::wrap_container(container, &opts)?;

        let quota = if opts.quota_bytes > 0 {
            if opts.quota_bytes < segment_bytes {
                return Err(VbdError::Config(format!(
                    "quota ({} bytes) is smaller than a single segment ({segment_bytes} bytes)",
                    opts.quota_bytes
                )));
            }
            (opts.quota_bytes < total_bytes)
                .then(|| Semaphore::new((opts.quota_bytes / segment_bytes) as usize))
        } else {
            None
        };

        let count = (total_bytes / segment_bytes) as usize;
        let params = Arc::new(StoreParams::new(
            container,
            cache_dir.to_path_buf(),
            segment_bytes,
            opts.thick_provision,
            opts.persist_cache,
            quota,
        ));

        let remote = Self::discover_remote(&params, count).await?;
        let segments = remote
            .into_iter()
            .enumerate()
            .map(|(id, item)| Arc::new(Segment::new(id, Arc::clone(&params), item)))
            .collect();

        let (shutdown, shutdown_rx) = watch::channel(false);
        let dev = Arc::new(Self {
            params,
            segments,
            total_bytes,
            concur_flush: opts.concur_flush.max(1),
            persist_cache: opts.persist_cache,
            gate: RwLock::new(()),
            online: AtomicBool::new(true),
            shutdown,
        });

        if let Some(every) = opts.autoflush_interval {
            tokio::spawn(auto_flush_loop(Arc::clone(&dev), shutdown_rx, every));
        }

        info!(
            "objstore: device over container {:?}: {count} segments of {segment_bytes} bytes",
            dev.params.container.name()
        );
        Ok(dev)
    }

    fn wrap_container(
        container: Arc<dyn Container>,
        opts: &Options,
    ) -> VbdResult<Arc<dyn Container>> {
        if opts.no_metadata_support {
            if opts.compress != CompressMode::Identity {
                return Err(VbdError::Config(format!(
                    "container does not support metadata, but {} compression is enabled",
                    opts.compress
                )));
            }
            if opts.encrypt != EncryptMode::Identity {
                return Err(VbdError::Config(format!(
                    "container does not support metadata, but {} encryption is enabled",
                    opts.encrypt
                )));
            }
            return Ok(container);
        }

        let mut container = container;
        if opts.encrypt != EncryptMode::Identity {
            if opts.encrypt_key.is_empty() {
                return Err(VbdError::Config(format!(
                    "{} encryption is enabled but no key was provided",
                    opts.encrypt
                )));
            }
            encrypt::validate_key(&opts.encrypt_key)?;
            container = Arc::new(EncryptedContainer::new(
                container,
                opts.encrypt,
                opts.encrypt_key.clone(),
            ));
        }
        // The compression layer is metadata-driven on reads, so it is always
        // present; identity mode only affects writes.
        Ok(Arc::new(CompressedContainer::new(container, opts.compress)))
    }

    /// Enumerate existing remote items and slot them by segment index.
    async fn discover_remote(
        params: &Arc<StoreParams>,
        count: usize,
    ) -> VbdResult<Vec<Option<Item>>> {
        let existing = params.container.items(params.prefix(), count + 1).await?;
        if existing.len() > count {
            return Err(VbdError::Config(format!(
                "container holds more than the expected {count} items for this device"
            )));
        }

        let mut remote: Vec<Option<Item>> = vec![None; count];
        for item in existing {
            let suffix = item
                .name
                .strip_prefix(params.prefix())
                .unwrap_or(&item.name);
            // Tolerate a file extension on the index.
            let digits = suffix.split('.').next().unwrap_or(suffix);
            let idx: usize = digits.parse().map_err(|e| {
                VbdError::Config(format!(
                    "could not parse segment index from remote item {:?}: {e}",
                    item.name
                ))
            })?;
            if idx >= count {
                return Err(VbdError::Config(format!(
                    "remote item {:?} indexes segment {idx}, device has {count}",
                    item.name
                )));
            }
            remote[idx] = Some(item);
        }
        let found = remote.iter().filter(|r| r.is_some()).count();
        if found > 0 {
            debug!("objstore: adopted {found} existing remote segments");
        }
        Ok(remote)
    }

    fn check_online(&self) -> VbdResult<()> {
        if !self.online.load(Ordering::Acquire) {
            return Err(VbdError::Shutdown);
        }
        Ok(())
    }

    /// Evict the least recently used resident segment other than
    /// `requester`. Clean segments are preferred; dirty ones are flushed by
    /// their own deletion path. A candidate whose eviction fails is skipped
    /// and another is chosen.
    async fn evict_lru(&self, requester: usize) -> VbdResult<usize> {
        let mut skip: HashSet<usize> = HashSet::new();
        let mut samples = 0usize;

        loop {
            samples += 1;

            let mut clean: Option<(usize, u64)> = None;
            let mut dirty: Option<(usize, u64)> = None;
            for (idx, seg) in self.segments.iter().enumerate() {
                if idx == requester || skip.contains(&idx) || !seg.backed() {
                    continue;
                }
                let stamp = seg.last_op();
                let slot = if seg.dirty() { &mut dirty } else { &mut clean };
                if slot.map_or(true, |(_, oldest)| stamp < oldest) {
                    *slot = Some((idx, stamp));
                }
            }

            let Some((idx, sampled)) = clean.or(dirty) else {
                return Err(VbdError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "no segment is evictable from the local cache",
                )));
            };

            let seg = &self.segments[idx];
            // Only evict once the candidate's stamp is stable, so a segment
            // racing new I/O gets re-evaluated.
            if seg.backed() && (seg.last_op() == sampled || samples >= MAX_EVICT_SAMPLES) {
                match seg.delete_file().await {
                    Ok(()) => {
                        debug!("objstore: evicted segment {idx}");
                        return Ok(idx);
                    }
                    Err(err) => {
                        warn!("objstore: eviction of segment {idx} failed: {err}");
                        skip.insert(idx);
                    }
                }
            }
        }
    }

    /// Upload every dirty segment, bounded by the flush concurrency, reusing
    /// a capped pool of segment-sized snapshot buffers.
    async fn flush_dirty(&self) -> VbdResult<()> {
        let dirty: Vec<Arc<Segment>> = self
            .segments
            .iter()
            .filter(|seg| seg.dirty())
            .cloned()
            .collect();
        if dirty.is_empty() {
            return Ok(());
        }
        debug!("objstore: flushing {} dirty segments", dirty.len());

        let seg_bytes = self.params.segment_bytes;
        let pool: Arc<std::sync::Mutex<Vec<Vec<u8>>>> = Arc::default();
        let allocated = Arc::new(AtomicU64::new(0));
        let sema = Arc::new(Semaphore::new(self.concur_flush));

        let mut tasks = tokio::task::JoinSet::new();
        for seg in dirty {
            if !seg.dirty() {
                continue;
            }
            let permit = Arc::clone(&sema)
                .acquire_owned()
                .await
                .expect("flush semaphore never closes");
            let pool = Arc::clone(&pool);
            let allocated = Arc::clone(&allocated);

            tasks.spawn(async move {
                let _permit = permit;
                let buf = pool.lock().expect("flush pool lock").pop().or_else(|| {
                    if allocated.fetch_add(seg_bytes, Ordering::Relaxed) + seg_bytes
                        <= MAX_FLUSH_ALLOC
                    {
                        Some(Vec::with_capacity(seg_bytes as usize))
                    } else {
                        allocated.fetch_sub(seg_bytes, Ordering::Relaxed);
                        None
                    }
                });

                let (returned, result) = seg.flush(buf).await;
                if let Some(mut buf) = returned {
                    buf.clear();
                    pool.lock().expect("flush pool lock").push(buf);
                }
                result
            });
        }

        let mut first_err = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.unwrap_or_else(|err| Err(join_err(err)));
            if let Err(err) = result {
                warn!("objstore: segment flush failed: {err}");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Device for ObjStoreDevice {
    fn size(&self) -> u64 {
        self.total_bytes
    }

    async fn read_at(&self, buf: &mut [u8], pos: u64) -> VbdResult<usize> {
        let _gate = self.gate.read().await;
        self.check_online()?;
        if pos > self.total_bytes {
            return Err(VbdError::Eof);
        }

        let seg_bytes = self.params.segment_bytes;
        let mut seg_idx = (pos / seg_bytes) as usize;
        let mut off = pos % seg_bytes;
        let mut done = 0usize;

        while done < buf.len() {
            if seg_idx >= self.segments.len() {
                return Err(VbdError::Eof);
            }
            let end = buf.len().min(done + (seg_bytes - off) as usize);
            let chunk = &mut buf[done..end];

            let mut evictions = 0usize;
            loop {
                match self.segments[seg_idx].read_at(chunk, off).await {
                    Ok(n) => {
                        done += n;
                        break;
                    }
                    Err(VbdError::CapacityExhausted) if evictions < MAX_CAPACITY_RETRIES => {
                        self.evict_lru(seg_idx).await?;
                        evictions += 1;
                    }
                    Err(err) => return Err(err),
                }
            }

            seg_idx += 1;
            off = 0;
        }
        Ok(done)
    }

    async fn write_at(&self, buf: &[u8], pos: u64) -> VbdResult<usize> {
        let _gate = self.gate.read().await;
        self.check_online()?;
        if pos > self.total_bytes {
            return Err(VbdError::UnexpectedEof);
        }

        let seg_bytes = self.params.segment_bytes;
        let mut seg_idx = (pos / seg_bytes) as usize;
        let mut off = pos % seg_bytes;
        let mut done = 0usize;

        while done < buf.len() {
            if seg_idx >= self.segments.len() {
                return Err(VbdError::UnexpectedEof);
            }
            let end = buf.len().min(done + (seg_bytes - off) as usize);
            let chunk = &buf[done..end];

            let mut evictions = 0usize;
            loop {
                match self.segments[seg_idx].write_at(chunk, off).await {
                    Ok(n) => {
                        done += n;
                        break;
                    }
                    Err(VbdError::CapacityExhausted) if evictions < MAX_CAPACITY_RETRIES => {
                        self.evict_lru(seg_idx).await?;
                        evictions += 1;
                    }
                    Err(err) => return Err(err),
                }
            }

            seg_idx += 1;
            off = 0;
        }
        Ok(done)
    }

    async fn trim(&self, _pos: u64, _len: u64) -> VbdResult<()> {
        let _gate = self.gate.read().await;
        self.check_online()
    }

    async fn flush(&self) -> VbdResult<()> {
        let _gate = self.gate.read().await;
        self.check_online()?;
        self.flush_dirty().await
    }

    async fn close(&self) -> VbdResult<()> {
        let _gate = self.gate.write().await;
        if !self.online.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let _ = self.shutdown.send(true);

        // A failed final flush keeps the local cache so the next boot can
        // retry the upload.
        self.flush_dirty().await.map_err(|err| {
            warn!("objstore: final flush failed, local cache preserved: {err}");
            err
        })?;

        if !self.persist_cache {
            let mut first_err = None;
            for seg in &self.segments {
                if let Err(err) = seg.delete_file().await {
                    warn!("objstore: cache cleanup of segment {} failed: {err}", seg.id);
                    first_err.get_or_insert(err);
                }
            }
            if let Some(err) = first_err {
                return Err(err);
            }
        }
        info!("objstore: device closed");
        Ok(())
    }
}

async fn auto_flush_loop(
    dev: Arc<ObjStoreDevice>,
    mut shutdown: watch::Receiver<bool>,
    every: Duration,
) {
    let start = tokio::time::Instant::now() + every;
    let mut ticker = tokio::time::interval_at(start, every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                debug!("objstore: auto-flush worker exiting");
                return;
            }
            _ = ticker.tick() => {
                // Errors stay observable through the next explicit flush.
                if let Err(err) = dev.flush_dirty().await {
                    warn!("objstore: background flush failed: {err}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::object::dir::DirContainer;

    use super::*;

    async fn dir_container(root: &Path) -> Arc<dyn Container> {
        Arc::new(DirContainer::open(root).unwrap())
    }

    #[tokio::test]
    async fn rejects_bad_geometry() {
        let tmp = tempfile::tempdir().unwrap();
        let cont = dir_container(&tmp.path().join("c")).await;

        for (total, seg) in [(1024, 0u64), (1024, 4096), (10_000, 4096)] {
            let res = ObjStoreDevice::new(
                Arc::clone(&cont),
                &tmp.path().join("cache"),
                total,
                seg,
                Options::default(),
            )
            .await;
            assert!(
                matches!(res, Err(VbdError::Config(_))),
                "total={total} seg={seg}"
            );
        }
    }

    #[tokio::test]
    async fn rejects_codecs_without_metadata_support() {
        let tmp = tempfile::tempdir().unwrap();
        let cont = dir_container(&tmp.path().join("c")).await;

        let res = ObjStoreDevice::new(
            Arc::clone(&cont),
            &tmp.path().join("cache"),
            1 << 20,
            1 << 20,
            Options::default()
                .no_metadata_support(true)
                .compress(CompressMode::S2),
        )
        .await;
        assert!(matches!(res, Err(VbdError::Config(_))));

        let res = ObjStoreDevice::new(
            cont,
            &tmp.path().join("cache"),
            1 << 20,
            1 << 20,
            Options::default()
                .no_metadata_support(true)
                .encrypt(EncryptMode::AesCtr, encrypt::random_key()),
        )
        .await;
        assert!(matches!(res, Err(VbdError::Config(_))));
    }

    #[tokio::test]
    async fn rejects_encryption_without_a_key() {
        let tmp = tempfile::tempdir().unwrap();
        let cont = dir_container(&tmp.path().join("c")).await;

        let res = ObjStoreDevice::new(
            cont,
            &tmp.path().join("cache"),
            1 << 20,
            1 << 20,
            Options::default().encrypt(EncryptMode::AesCtr, Vec::new()),
        )
        .await;
        assert!(matches!(res, Err(VbdError::Config(_))));
    }

    #[tokio::test]
    async fn rejects_quota_smaller_than_a_segment() {
        let tmp = tempfile::tempdir().unwrap();
        let cont = dir_container(&tmp.path().join("c")).await;

        let res = ObjStoreDevice::new(
            cont,
            &tmp.path().join("cache"),
            4 << 20,
            1 << 20,
            Options::default().quota_bytes(1),
        )
        .await;
        assert!(matches!(res, Err(VbdError::Config(_))));
    }

    #[tokio::test]
    async fn rejects_foreign_remote_items_in_range() {
        let tmp = tempfile::tempdir().unwrap();
        let cont = dir_container(&tmp.path().join("c")).await;

        // An item indexing past the segment count fails construction.
        cont.put("osbd-dev_c-blk_9", &[0u8; 8], Metadata::new())
            .await
            .unwrap();
        let res = ObjStoreDevice::new(
            cont,
            &tmp.path().join("cache"),
            2 << 20,
            1 << 20,
            Options::default(),
        )
        .await;
        assert!(matches!(res, Err(VbdError::Config(_))));
    }
}
