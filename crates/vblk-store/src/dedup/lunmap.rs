//! The LUN map: a memory-mapped flat file of dedup IDs.
//!
//! One little-endian u64 slot per logical block. A fresh map is filled with
//! [`ZERO_DEDUP_ID`](super::ZERO_DEDUP_ID), meaning "all zeros, nothing
//! stored". Slot writes are followed by an asynchronous msync; `flush` is the
//! synchronous durability point, so a crash loses at most post-flush updates.

use std::fs;
use std::path::Path;
use std::sync::RwLock;

use memmap2::MmapMut;
use tracing::info;
use vblk_proto::{VbdError, VbdResult};

use super::ZERO_DEDUP_ID;

const SLOT_BYTES: usize = 8;

/// Memory-mapped logical-block → dedup-ID table.
pub struct LunMap {
    map: RwLock<MmapMut>,
    slots: usize,
    size_bytes: u64,
}

impl LunMap {
    /// Open `path`, creating a map for `if_create_size / block_size` slots
    /// when the file does not exist yet. An existing file's slot count wins.
    pub fn open(path: &Path, block_size: u64, if_create_size: u64) -> VbdResult<Self> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let len = file.metadata()?.len();
        let (slots, created) = if len == 0 {
            ((if_create_size / block_size) as usize, true)
        } else {
            (len as usize / SLOT_BYTES, false)
        };
        if slots == 0 {
            return Err(VbdError::Config(format!(
                "LUN map {} would have zero slots",
                path.display()
            )));
        }

        if created {
            file.set_len((slots * SLOT_BYTES) as u64)?;
        }
        // SAFETY: the map is private to this process; all access goes through
        // the RwLock below.
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        if created {
            // ZERO_DEDUP_ID is all ones, so a byte fill initializes every slot.
            map.fill(0xff);
            map.flush()?;
            info!("lunmap: initialized {} with {slots} slots", path.display());
        }

        Ok(Self {
            map: RwLock::new(map),
            slots,
            size_bytes: slots as u64 * block_size,
        })
    }

    /// Logical capacity covered by this map, in bytes.
    pub fn size(&self) -> u64 {
        self.size_bytes
    }

    pub fn get_id(&self, block: u64) -> VbdResult<u64> {
        if block >= self.slots as u64 {
            return Err(VbdError::Eof);
        }
        let map = self.map.read().expect("lunmap lock");
        let at = block as usize * SLOT_BYTES;
        Ok(u64::from_le_bytes(map[at..at + SLOT_BYTES].try_into().unwrap()))
    }

    /// Copy `dst.len()` consecutive slots starting at `start` into `dst`.
    pub fn get_ids(&self, start: u64, dst: &mut [u64]) -> VbdResult<()> {
        let end = start + dst.len() as u64;
        if end > self.slots as u64 {
            return Err(VbdError::Eof);
        }
        let map = self.map.read().expect("lunmap lock");
        for (i, slot) in dst.iter_mut().enumerate() {
            let at = (start as usize + i) * SLOT_BYTES;
            *slot = u64::from_le_bytes(map[at..at + SLOT_BYTES].try_into().unwrap());
        }
        Ok(())
    }

    pub fn put_id(&self, block: u64, dedup_id: u64) -> VbdResult<()> {
        if block >= self.slots as u64 {
            return Err(VbdError::UnexpectedEof);
        }
        let mut map = self.map.write().expect("lunmap lock");
        let at = block as usize * SLOT_BYTES;
        map[at..at + SLOT_BYTES].copy_from_slice(&dedup_id.to_le_bytes());
        map.flush_async_range(at, SLOT_BYTES)?;
        Ok(())
    }

    /// Synchronous msync of the whole map.
    pub fn flush(&self) -> VbdResult<()> {
        self.map.read().expect("lunmap lock").flush()?;
        Ok(())
    }

    /// Flush and release. The mapping itself is reclaimed on drop.
    pub fn close(&self) -> VbdResult<()> {
        self.flush()
    }
}
