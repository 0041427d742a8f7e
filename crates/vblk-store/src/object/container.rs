//! The remote object store abstraction.
//!
//! A [`Container`] is a flat namespace of named items with per-item string
//! metadata and an opaque version tag (ETag). Cloud drivers (S3, Azure, …)
//! live outside this crate and plug in through this trait; the bundled
//! [`DirContainer`](super::dir::DirContainer) maps it onto a local directory.
//!
//! The transparent compression and encryption layers wrap a container and
//! rewrite payloads and reported sizes; see
//! [`compress`](super::compress) and [`encrypt`](super::encrypt).

use std::collections::HashMap;

use async_trait::async_trait;
use vblk_proto::{VbdError, VbdResult};

/// Per-item string metadata persisted alongside the object.
pub type Metadata = HashMap<String, String>;

/// Handle to one remote object.
#[derive(Debug, Clone)]
pub struct Item {
    /// Item name within its container.
    pub name: String,
    /// Logical size in bytes. Codec wrappers report the plaintext size here,
    /// not the stored size.
    pub size: u64,
    /// Opaque version tag assigned by the store; changes on every put.
    pub etag: String,
    /// Item metadata as stored.
    pub metadata: Metadata,
}

/// A remote object container.
#[async_trait]
pub trait Container: Send + Sync + 'static {
    /// Container name; part of the item naming scheme.
    fn name(&self) -> &str;

    /// Fetch a single item handle, or `None` when absent.
    async fn item(&self, name: &str) -> VbdResult<Option<Item>>;

    /// List up to `limit` items whose names start with `prefix`, in name
    /// order. Callers detect truncation by asking for one more than they
    /// expect.
    async fn items(&self, prefix: &str, limit: usize) -> VbdResult<Vec<Item>>;

    /// Download an item's full contents.
    async fn get(&self, item: &Item) -> VbdResult<Vec<u8>>;

    /// Upload `data` under `name`, replacing any existing item, and return
    /// the new handle.
    async fn put(&self, name: &str, data: &[u8], metadata: Metadata) -> VbdResult<Item>;
}

/// Format `v` in base 36 (lowercase), the radix used for size metadata.
pub(crate) fn to_base36(mut v: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if v == 0 {
        return "0".into();
    }
    let mut out = [0u8; 13];
    let mut at = out.len();
    while v > 0 {
        at -= 1;
        out[at] = DIGITS[(v % 36) as usize];
        v /= 36;
    }
    String::from_utf8_lossy(&out[at..]).into_owned()
}

/// Parse a base-36 size recorded by [`to_base36`].
pub(crate) fn from_base36(s: &str) -> VbdResult<u64> {
    u64::from_str_radix(s, 36)
        .map_err(|e| VbdError::Remote(format!("unparsable base36 size {s:?}: {e}")))
}
