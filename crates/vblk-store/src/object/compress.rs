//! Transparent compression for remote objects.
//!
//! [`CompressMode`] is the buffer codec; [`CompressedContainer`] applies it
//! around an inner container, recording the algorithm and the plaintext size
//! (base 36) as item metadata:
//!
//! ```text
//! x-osbd-cmp-alg  = "s2" | "gzip"
//! x-osbd-cmp-size = <plaintext bytes, base36>
//! ```
//!
//! Reads are metadata-driven: an item without compression metadata passes
//! through untouched regardless of the configured mode, so a device opened
//! with a different compression setting still reads existing objects.

use std::io::{Read, Write};
use std::sync::Arc;

use async_trait::async_trait;
use vblk_proto::{VbdError, VbdResult};

use super::container::{from_base36, to_base36, Container, Item, Metadata};

/// Metadata key naming the compression algorithm.
pub const META_COMPRESS_ALGO: &str = "x-osbd-cmp-alg";
/// Metadata key carrying the plaintext size, base 36.
pub const META_COMPRESS_SIZE: &str = "x-osbd-cmp-size";

/// Remote-object compression algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressMode {
    #[default]
    Identity,
    S2,
    Gzip,
}

impl CompressMode {
    /// Parse a textual mode name; the empty string means identity.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "" | "identity" => Some(Self::Identity),
            "s2" => Some(Self::S2),
            "gzip" => Some(Self::Gzip),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::S2 => "s2",
            Self::Gzip => "gzip",
        }
    }

    /// Compress `data`.
    pub fn encode(self, data: &[u8]) -> VbdResult<Vec<u8>> {
        match self {
            Self::Identity => Ok(data.to_vec()),
            Self::S2 => {
                let mut enc = snap::write::FrameEncoder::new(Vec::new());
                enc.write_all(data)?;
                enc.into_inner()
                    .map_err(|e| VbdError::Remote(format!("compression finish failed: {e}")))
            }
            Self::Gzip => {
                let mut enc =
                    flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
                enc.write_all(data)?;
                Ok(enc.finish()?)
            }
        }
    }

    /// Decompress `data`.
    pub fn decode(self, data: &[u8]) -> VbdResult<Vec<u8>> {
        match self {
            Self::Identity => Ok(data.to_vec()),
            Self::S2 => {
                let mut out = Vec::new();
                snap::read::FrameDecoder::new(data).read_to_end(&mut out)?;
                Ok(out)
            }
            Self::Gzip => {
                let mut out = Vec::new();
                flate2::read::GzDecoder::new(data).read_to_end(&mut out)?;
                Ok(out)
            }
        }
    }
}

impl std::fmt::Display for CompressMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Container wrapper applying transparent compression.
pub struct CompressedContainer {
    inner: Arc<dyn Container>,
    mode: CompressMode,
}

impl CompressedContainer {
    pub fn new(inner: Arc<dyn Container>, mode: CompressMode) -> Self {
        Self { inner, mode }
    }

    /// Rewrite the reported size to the recorded plaintext size.
    fn logical_size(item: &mut Item) -> VbdResult<()> {
        if item.metadata.contains_key(META_COMPRESS_ALGO) {
            let recorded = item.metadata.get(META_COMPRESS_SIZE).ok_or_else(|| {
                VbdError::Remote(format!(
                    "item {} is compressed but records no plaintext size",
                    item.name
                ))
            })?;
            item.size = from_base36(recorded)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Container for CompressedContainer {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn item(&self, name: &str) -> VbdResult<Option<Item>> {
        let mut item = self.inner.item(name).await?;
        if let Some(item) = item.as_mut() {
            Self::logical_size(item)?;
        }
        Ok(item)
    }

    async fn items(&self, prefix: &str, limit: usize) -> VbdResult<Vec<Item>> {
        let mut items = self.inner.items(prefix, limit).await?;
        for item in items.iter_mut() {
            Self::logical_size(item)?;
        }
        Ok(items)
    }

    async fn get(&self, item: &Item) -> VbdResult<Vec<u8>> {
        let raw = self.inner.get(item).await?;

        let Some(algo) = item.metadata.get(META_COMPRESS_ALGO) else {
            return Ok(raw);
        };
        let mode = CompressMode::from_name(algo).ok_or_else(|| {
            VbdError::Remote(format!("item {} uses unsupported compression {algo:?}", item.name))
        })?;

        let plain = mode.decode(&raw)?;
        if plain.len() as u64 != item.size {
            return Err(VbdError::Remote(format!(
                "item {} inflated to {} bytes, expected {}",
                item.name,
                plain.len(),
                item.size
            )));
        }
        Ok(plain)
    }

    async fn put(&self, name: &str, data: &[u8], mut metadata: Metadata) -> VbdResult<Item> {
        if self.mode == CompressMode::Identity {
            return self.inner.put(name, data, metadata).await;
        }

        let encoded = self.mode.encode(data)?;
        metadata.insert(META_COMPRESS_ALGO.into(), self.mode.name().into());
        metadata.insert(META_COMPRESS_SIZE.into(), to_base36(data.len() as u64));

        let mut item = self.inner.put(name, &encoded, metadata).await?;
        item.size = data.len() as u64;
        Ok(item)
    }
}
