//! The ID store: content hash → dedup ID.
//!
//! Backed by an embedded ordered key/value store (sled) with a configurable
//! memory cache. Keys are SHA-1 digests of block contents, values are
//! little-endian u64 dedup IDs. All-zero blocks never reach the store; they
//! short-circuit to the zero sentinel before hashing.

use std::io;
use std::path::Path;

use sha1::{Digest, Sha1};
use vblk_core::zeros::is_zeros;
use vblk_proto::{VbdError, VbdResult};

/// SHA-1 digest length.
pub const HASH_BYTES: usize = 20;

/// Outcome of a content lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdLookup {
    /// The block is all zeros; nothing is stored for it.
    Zero,
    /// The content is already stored under this dedup ID.
    Found(u64),
    /// Unseen content; the computed hash is returned so the caller can
    /// register it after storing the block.
    Missing([u8; HASH_BYTES]),
}

/// Content-hash → dedup-ID index.
pub struct IdStore {
    db: sled::Db,
}

impl IdStore {
    /// Open or create the index at `path` with `cache_bytes` of block cache.
    pub fn open(path: &Path, cache_bytes: u64) -> VbdResult<Self> {
        let db = sled::Config::new()
            .path(path)
            .cache_capacity(cache_bytes)
            .open()
            .map_err(sled_err)?;
        Ok(Self { db })
    }

    /// Look up the dedup ID for a block's contents.
    pub fn get_id(&self, block: &[u8]) -> VbdResult<IdLookup> {
        if is_zeros(block) {
            return Ok(IdLookup::Zero);
        }

        let hash: [u8; HASH_BYTES] = Sha1::digest(block).into();
        match self.db.get(hash).map_err(sled_err)? {
            Some(raw) => {
                let bytes: [u8; 8] = raw.as_ref().try_into().map_err(|_| {
                    VbdError::Io(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("corrupt id entry for {}", hex_of(&hash)),
                    ))
                })?;
                Ok(IdLookup::Found(u64::from_le_bytes(bytes)))
            }
            None => Ok(IdLookup::Missing(hash)),
        }
    }

    pub fn put_id(&self, hash: &[u8; HASH_BYTES], dedup_id: u64) -> VbdResult<()> {
        self.db
            .insert(hash, dedup_id.to_le_bytes().to_vec())
            .map_err(sled_err)?;
        Ok(())
    }

    pub fn flush(&self) -> VbdResult<()> {
        self.db.flush().map_err(sled_err)?;
        Ok(())
    }

    pub fn close(&self) -> VbdResult<()> {
        self.flush()
    }
}

fn sled_err(err: sled::Error) -> VbdError {
    VbdError::Io(io::Error::new(io::ErrorKind::Other, err))
}

fn hex_of(hash: &[u8]) -> String {
    hash.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store(dir: &tempfile::TempDir) -> IdStore {
        IdStore::open(&dir.path().join("t.ids"), 1024 * 1024).unwrap()
    }

    #[test]
    fn zero_blocks_short_circuit() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        assert_eq!(store.get_id(&[0u8; 4096]).unwrap(), IdLookup::Zero);
    }

    #[test]
    fn miss_then_hit() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let block = vec![0x42u8; 4096];
        let hash = match store.get_id(&block).unwrap() {
            IdLookup::Missing(hash) => hash,
            other => panic!("expected miss, got {other:?}"),
        };

        store.put_id(&hash, 3).unwrap();
        assert_eq!(store.get_id(&block).unwrap(), IdLookup::Found(3));

        // Different content misses independently.
        assert!(matches!(
            store.get_id(&vec![0x43u8; 4096]).unwrap(),
            IdLookup::Missing(_)
        ));
    }

    #[test]
    fn mapping_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let block = vec![7u8; 4096];
        {
            let store = open_store(&dir);
            let IdLookup::Missing(hash) = store.get_id(&block).unwrap() else {
                panic!("expected miss");
            };
            store.put_id(&hash, 11).unwrap();
            store.close().unwrap();
        }
        let store = open_store(&dir);
        assert_eq!(store.get_id(&block).unwrap(), IdLookup::Found(11));
    }
}
