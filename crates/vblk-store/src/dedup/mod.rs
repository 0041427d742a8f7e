//! Content-addressed deduplicating device.
//!
//! Three backing stores compose into a [`Device`]:
//!
//! - [`LunMap`] — logical block number → dedup ID (`<name>.map`),
//! - [`IdStore`] — SHA-1 of contents → dedup ID (`<name>.ids`),
//! - [`BlockStore`] — dedup ID → block contents (`<name>.blks`).
//!
//! A write hashes its block: known content just repoints the LUN map entry,
//! unseen content is appended to the block store first, and all-zero blocks
//! never touch storage at all — their map entry becomes the
//! [`ZERO_DEDUP_ID`] sentinel. I/O must be block aligned.

mod blockstore;
mod idstore;
mod lunmap;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;
use vblk_core::{Device, DEFAULT_BLOCK_SIZE};
use vblk_proto::{VbdError, VbdResult};

pub use blockstore::BlockStore;
pub use idstore::{IdLookup, IdStore, HASH_BYTES};
pub use lunmap::LunMap;

use crate::join_err;

/// Reserved dedup ID meaning "the all-zeros block; nothing stored".
pub const ZERO_DEDUP_ID: u64 = u64::MAX;

/// Deduplicating block device.
pub struct DedupDevice {
    lun_map: Arc<LunMap>,
    id_store: Arc<IdStore>,
    block_store: Arc<BlockStore>,
    block_size: u64,
    size: u64,
    /// Ops hold the read side; close takes the write side.
    gate: RwLock<()>,
    online: AtomicBool,
}

impl DedupDevice {
    pub fn new(lun_map: LunMap, id_store: IdStore, block_store: BlockStore) -> Self {
        let size = lun_map.size();
        Self {
            lun_map: Arc::new(lun_map),
            id_store: Arc::new(id_store),
            block_store: Arc::new(block_store),
            block_size: DEFAULT_BLOCK_SIZE,
            size,
            gate: RwLock::new(()),
            online: AtomicBool::new(true),
        }
    }

    /// Open or create the `<name>.map` / `<name>.ids` / `<name>.blks`
    /// triple under `dir` for a device of `if_create_size` bytes.
    pub fn open(
        dir: &Path,
        name: &str,
        if_create_size: u64,
        id_cache_bytes: u64,
    ) -> VbdResult<Self> {
        let lun_map = LunMap::open(
            &dir.join(format!("{name}.map")),
            DEFAULT_BLOCK_SIZE,
            if_create_size,
        )?;
        let id_store = IdStore::open(&dir.join(format!("{name}.ids")), id_cache_bytes)?;
        let block_store = BlockStore::open(&dir.join(format!("{name}.blks")), DEFAULT_BLOCK_SIZE)?;
        Ok(Self::new(lun_map, id_store, block_store))
    }

    fn check_online(&self) -> VbdResult<()> {
        if !self.online.load(Ordering::Acquire) {
            return Err(VbdError::Shutdown);
        }
        Ok(())
    }

    fn check_aligned(&self, pos: u64, len: u64) -> VbdResult<()> {
        if pos % self.block_size != 0 || len % self.block_size != 0 {
            return Err(VbdError::Unaligned { pos, len });
        }
        Ok(())
    }

    /// Write a single already-aligned block; the dedup pivot.
    fn write_block(
        lun_map: &LunMap,
        id_store: &IdStore,
        block_store: &BlockStore,
        block: u64,
        data: &[u8],
    ) -> VbdResult<()> {
        let dedup_id = match id_store.get_id(data)? {
            IdLookup::Zero => ZERO_DEDUP_ID,
            IdLookup::Found(id) => id,
            IdLookup::Missing(hash) => {
                let id = block_store.put_block(data)?;
                id_store.put_id(&hash, id)?;
                id
            }
        };
        lun_map.put_id(block, dedup_id)
    }

    /// Fetch `ids.len()` blocks in parallel into `dst`, one thread per
    /// contiguous batch. First error wins.
    fn read_blocks(
        block_store: &BlockStore,
        ids: &[u64],
        dst: &mut [u8],
        block_size: usize,
    ) -> VbdResult<()> {
        let workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(ids.len());
        let per_worker = ids.len().div_ceil(workers);

        let results: Vec<VbdResult<()>> = thread::scope(|scope| {
            let handles: Vec<_> = dst
                .chunks_mut(per_worker * block_size)
                .zip(ids.chunks(per_worker))
                .map(|(chunk, ids)| {
                    scope.spawn(move || {
                        for (buf, &id) in chunk.chunks_mut(block_size).zip(ids) {
                            block_store.get_block(id, buf)?;
                        }
                        Ok(())
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("block fetch thread panicked"))
                .collect()
        });
        results.into_iter().collect()
    }
}

#[async_trait]
impl Device for DedupDevice {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read_at(&self, buf: &mut [u8], pos: u64) -> VbdResult<usize> {
        let _gate = self.gate.read().await;
        self.check_online()?;
        self.check_aligned(pos, buf.len() as u64)?;
        if pos.saturating_add(buf.len() as u64) > self.size {
            return Err(VbdError::Eof);
        }

        let len = buf.len();
        let block_size = self.block_size as usize;
        let start_block = pos / self.block_size;
        let lun_map = Arc::clone(&self.lun_map);
        let block_store = Arc::clone(&self.block_store);

        let data = tokio::task::spawn_blocking(move || -> VbdResult<Vec<u8>> {
            let blocks = len / block_size;
            let mut tmp = vec![0u8; len];
            if blocks == 1 {
                let id = lun_map.get_id(start_block)?;
                block_store.get_block(id, &mut tmp)?;
            } else {
                let mut ids = vec![0u64; blocks];
                lun_map.get_ids(start_block, &mut ids)?;
                Self::read_blocks(&block_store, &ids, &mut tmp, block_size)?;
            }
            Ok(tmp)
        })
        .await
        .map_err(join_err)??;

        buf.copy_from_slice(&data);
        Ok(len)
    }

    async fn write_at(&self, buf: &[u8], pos: u64) -> VbdResult<usize> {
        let _gate = self.gate.read().await;
        self.check_online()?;
        self.check_aligned(pos, buf.len() as u64)?;
        if pos.saturating_add(buf.len() as u64) > self.size {
            return Err(VbdError::UnexpectedEof);
        }

        let len = buf.len();
        let block_size = self.block_size as usize;
        let start_block = pos / self.block_size;
        let data = buf.to_vec();
        let lun_map = Arc::clone(&self.lun_map);
        let id_store = Arc::clone(&self.id_store);
        let block_store = Arc::clone(&self.block_store);

        tokio::task::spawn_blocking(move || -> VbdResult<()> {
            for (i, chunk) in data.chunks(block_size).enumerate() {
                Self::write_block(
                    &lun_map,
                    &id_store,
                    &block_store,
                    start_block + i as u64,
                    chunk,
                )?;
            }
            Ok(())
        })
        .await
        .map_err(join_err)??;

        Ok(len)
    }

    async fn trim(&self, _pos: u64, _len: u64) -> VbdResult<()> {
        let _gate = self.gate.read().await;
        self.check_online()
    }

    async fn flush(&self) -> VbdResult<()> {
        let _gate = self.gate.read().await;
        self.check_online()?;

        let lun_map = Arc::clone(&self.lun_map);
        let id_store = Arc::clone(&self.id_store);
        let block_store = Arc::clone(&self.block_store);
        tokio::task::spawn_blocking(move || -> VbdResult<()> {
            let results: Vec<VbdResult<()>> = thread::scope(|scope| {
                let map = scope.spawn(|| lun_map.flush());
                let ids = scope.spawn(|| id_store.flush());
                let blocks = scope.spawn(|| block_store.flush());
                [map, ids, blocks]
                    .into_iter()
                    .map(|h| h.join().expect("flush thread panicked"))
                    .collect()
            });
            results.into_iter().collect()
        })
        .await
        .map_err(join_err)??;
        Ok(())
    }

    async fn close(&self) -> VbdResult<()> {
        let _gate = self.gate.write().await;
        if !self.online.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        debug!("dedup: closing stores");

        let lun_map = Arc::clone(&self.lun_map);
        let id_store = Arc::clone(&self.id_store);
        let block_store = Arc::clone(&self.block_store);
        tokio::task::spawn_blocking(move || -> VbdResult<()> {
            let results: Vec<VbdResult<()>> = thread::scope(|scope| {
                let map = scope.spawn(|| lun_map.close());
                let ids = scope.spawn(|| id_store.close());
                let blocks = scope.spawn(|| block_store.close());
                [map, ids, blocks]
                    .into_iter()
                    .map(|h| h.join().expect("close thread panicked"))
                    .collect()
            });
            results.into_iter().collect()
        })
        .await
        .map_err(join_err)??;
        Ok(())
    }
}
