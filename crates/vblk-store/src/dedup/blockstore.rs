//! The block store: dedup ID → block contents.
//!
//! An append-only flat file of fixed-size blocks indexed by dedup ID. IDs are
//! assigned densely in write order; once a block's write completes it is
//! immutable, so reads need no locking — they only wait out an in-flight
//! write of the same ID via the pending-write set and its condvar.
//!
//! Durability is debounced: each put signals a background thread that sleeps
//! five seconds, drains further signals, and fsyncs once.

use std::collections::HashSet;
use std::fs;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::mpsc::{sync_channel, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use tracing::warn;
use vblk_core::zeros::zero_fill;
use vblk_proto::{VbdError, VbdResult};

use super::ZERO_DEDUP_ID;

const SYNC_DELAY: Duration = Duration::from_secs(5);

struct WriteState {
    next_id: u64,
    next_pos: u64,
    pending: HashSet<u64>,
}

/// Append-only store of deduplicated block contents.
pub struct BlockStore {
    file: Arc<fs::File>,
    state: Mutex<WriteState>,
    written: Condvar,
    sync_tx: Mutex<Option<SyncSender<()>>>,
    block_size: u64,
}

impl BlockStore {
    /// Open or create the store at `path` for `block_size`-byte blocks.
    pub fn open(path: &Path, block_size: u64) -> VbdResult<Self> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let file = Arc::new(file);

        let next_id = file.metadata()?.len() / block_size;
        let (sync_tx, sync_rx) = sync_channel::<()>(1);
        {
            let file = Arc::clone(&file);
            thread::spawn(move || {
                while sync_rx.recv().is_ok() {
                    thread::sleep(SYNC_DELAY);
                    while sync_rx.try_recv().is_ok() {}
                    if let Err(err) = file.sync_all() {
                        warn!("blockstore: debounced fsync failed: {err}");
                    }
                }
            });
        }

        Ok(Self {
            file,
            state: Mutex::new(WriteState {
                next_id,
                next_pos: next_id * block_size,
                pending: HashSet::new(),
            }),
            written: Condvar::new(),
            sync_tx: Mutex::new(Some(sync_tx)),
            block_size,
        })
    }

    /// Fetch the contents of `dedup_id` into `buf` (one block).
    pub fn get_block(&self, dedup_id: u64, buf: &mut [u8]) -> VbdResult<()> {
        if dedup_id == ZERO_DEDUP_ID {
            zero_fill(buf);
            return Ok(());
        }

        // Wait out any in-flight write of this ID.
        let mut state = self.state.lock().expect("blockstore lock");
        while state.pending.contains(&dedup_id) {
            state = self.written.wait(state).expect("blockstore lock");
        }
        drop(state);

        // Written blocks are immutable; no lock needed for the read itself.
        self.file.read_exact_at(buf, dedup_id * self.block_size)?;
        Ok(())
    }

    /// Append one block and return its freshly assigned dedup ID.
    pub fn put_block(&self, buf: &[u8]) -> VbdResult<u64> {
        let (dedup_id, pos) = {
            let mut state = self.state.lock().expect("blockstore lock");
            let id = state.next_id;
            let pos = state.next_pos;
            state.next_id += 1;
            state.next_pos += self.block_size;
            state.pending.insert(id);
            (id, pos)
        };

        let result = self.file.write_all_at(buf, pos);

        self.state
            .lock()
            .expect("blockstore lock")
            .pending
            .remove(&dedup_id);
        self.written.notify_all();
        result?;

        // Nudge the debounced fsync worker; a full signal slot means a sync
        // is already queued.
        if let Some(tx) = self.sync_tx.lock().expect("blockstore lock").as_ref() {
            match tx.try_send(()) {
                Ok(()) | Err(TrySendError::Full(())) => {}
                Err(TrySendError::Disconnected(())) => {
                    warn!("blockstore: fsync worker is gone");
                }
            }
        }
        Ok(dedup_id)
    }

    pub fn flush(&self) -> VbdResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Flush and stop the fsync worker.
    pub fn close(&self) -> VbdResult<()> {
        // Dropping the sender ends the worker thread after its current cycle.
        self.sync_tx.lock().expect("blockstore lock").take();
        self.flush()
    }
}
