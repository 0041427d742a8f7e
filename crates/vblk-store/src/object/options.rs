//! Construction options for the object-store device.

use std::time::Duration;

use super::compress::CompressMode;
use super::encrypt::EncryptMode;

/// Options accepted by [`ObjStoreDevice::new`](super::ObjStoreDevice::new).
///
/// Built with chained setters:
///
/// ```ignore
/// let opts = Options::default()
///     .compress(CompressMode::S2)
///     .encrypt(EncryptMode::AesCtr, key)
///     .quota_bytes(2 << 30);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Background flush period; `None` disables the auto-flush worker.
    pub(super) autoflush_interval: Option<Duration>,
    /// Max simultaneous segment uploads during a flush; 0 means 1.
    pub(super) concur_flush: usize,
    /// Transparent compression of remote objects.
    pub(super) compress: CompressMode,
    /// Transparent encryption of remote objects.
    pub(super) encrypt: EncryptMode,
    pub(super) encrypt_key: Vec<u8>,
    /// Declare that the container cannot store per-item metadata. Enabling
    /// compression or encryption alongside this is a configuration error.
    pub(super) no_metadata_support: bool,
    /// Pre-write zeros over new cache files instead of creating them sparse.
    pub(super) thick_provision: bool,
    /// Cap on resident local cache bytes; 0 means uncapped.
    pub(super) quota_bytes: u64,
    /// Keep local cache files across close/reopen, validated by ETag.
    pub(super) persist_cache: bool,
}

impl Options {
    pub fn autoflush_interval(mut self, interval: Duration) -> Self {
        self.autoflush_interval = (interval > Duration::ZERO).then_some(interval);
        self
    }

    pub fn concur_flush_count(mut self, count: usize) -> Self {
        self.concur_flush = count;
        self
    }

    pub fn compress(mut self, mode: CompressMode) -> Self {
        self.compress = mode;
        self
    }

    pub fn encrypt(mut self, mode: EncryptMode, key: Vec<u8>) -> Self {
        self.encrypt = mode;
        self.encrypt_key = key;
        self
    }

    pub fn no_metadata_support(mut self, no_metadata: bool) -> Self {
        self.no_metadata_support = no_metadata;
        self
    }

    pub fn thick_provision_local_files(mut self, thick: bool) -> Self {
        self.thick_provision = thick;
        self
    }

    pub fn quota_bytes(mut self, bytes: u64) -> Self {
        self.quota_bytes = bytes;
        self
    }

    pub fn persist_cache(mut self, persist: bool) -> Self {
        self.persist_cache = persist;
        self
    }
}
