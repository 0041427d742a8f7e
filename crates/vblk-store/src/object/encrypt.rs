//! Transparent encryption for remote objects.
//!
//! AES stream-cipher modes applied to whole object payloads, keyed once per
//! device. Every put draws a fresh random 16-byte IV and records it with the
//! algorithm and plaintext size as item metadata:
//!
//! ```text
//! x-osbd-crypt-alg  = "aes-ctr" | "aes-cfb" | "aes-ofb"
//! x-osbd-crypt-iv   = <16 bytes, lowercase hex>
//! x-osbd-crypt-size = <plaintext bytes, base36>
//! ```
//!
//! Key length selects the AES variant: 16 → AES-128, 24 → AES-192,
//! 32 → AES-256. Note these modes authenticate nothing: a store that cannot
//! be trusted not to rewrite ciphertext needs an AEAD layer on top.

use std::sync::Arc;

use aes::{Aes128, Aes192, Aes256};
use async_trait::async_trait;
use cipher::{AsyncStreamCipher, KeyIvInit, StreamCipher};
use rand::RngCore;
use vblk_proto::{VbdError, VbdResult};

use super::container::{from_base36, to_base36, Container, Item, Metadata};

/// Metadata key naming the encryption mode.
pub const META_ENCRYPT_ALGO: &str = "x-osbd-crypt-alg";
/// Metadata key carrying the IV, lowercase hex.
pub const META_ENCRYPT_IV: &str = "x-osbd-crypt-iv";
/// Metadata key carrying the plaintext size, base 36.
pub const META_ENCRYPT_SIZE: &str = "x-osbd-crypt-size";

/// AES block / IV size in bytes.
pub const IV_BYTES: usize = 16;

/// Remote-object encryption mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncryptMode {
    #[default]
    Identity,
    AesCtr,
    AesCfb,
    AesOfb,
}

impl EncryptMode {
    /// Parse a textual mode name. `"aes-rec"` resolves to the recommended
    /// mode (CTR); the empty string means identity.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "" | "identity" => Some(Self::Identity),
            "aes-ctr" | "aes-rec" => Some(Self::AesCtr),
            "aes-cfb" => Some(Self::AesCfb),
            "aes-ofb" => Some(Self::AesOfb),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::AesCtr => "aes-ctr",
            Self::AesCfb => "aes-cfb",
            Self::AesOfb => "aes-ofb",
        }
    }

    /// Encrypt `data` in place under a fresh random IV, which is returned.
    pub fn seal(self, key: &[u8], data: &mut [u8]) -> VbdResult<[u8; IV_BYTES]> {
        let mut iv = [0u8; IV_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut iv);
        self.apply(key, &iv, data, true)?;
        Ok(iv)
    }

    /// Decrypt `data` in place under the recorded IV.
    pub fn open(self, key: &[u8], iv: &[u8; IV_BYTES], data: &mut [u8]) -> VbdResult<()> {
        self.apply(key, iv, data, false)
    }

    fn apply(self, key: &[u8], iv: &[u8; IV_BYTES], data: &mut [u8], seal: bool) -> VbdResult<()> {
        fn bad_key(err: cipher::InvalidLength) -> VbdError {
            VbdError::Config(format!("bad AES key/IV length: {err}"))
        }

        match (self, key.len()) {
            (Self::Identity, _) => {}

            (Self::AesCtr, 16) => ctr::Ctr128BE::<Aes128>::new_from_slices(key, iv)
                .map_err(bad_key)?
                .apply_keystream(data),
            (Self::AesCtr, 24) => ctr::Ctr128BE::<Aes192>::new_from_slices(key, iv)
                .map_err(bad_key)?
                .apply_keystream(data),
            (Self::AesCtr, 32) => ctr::Ctr128BE::<Aes256>::new_from_slices(key, iv)
                .map_err(bad_key)?
                .apply_keystream(data),

            (Self::AesOfb, 16) => ofb::Ofb::<Aes128>::new_from_slices(key, iv)
                .map_err(bad_key)?
                .apply_keystream(data),
            (Self::AesOfb, 24) => ofb::Ofb::<Aes192>::new_from_slices(key, iv)
                .map_err(bad_key)?
                .apply_keystream(data),
            (Self::AesOfb, 32) => ofb::Ofb::<Aes256>::new_from_slices(key, iv)
                .map_err(bad_key)?
                .apply_keystream(data),

            (Self::AesCfb, 16) if seal => cfb_mode::Encryptor::<Aes128>::new_from_slices(key, iv)
                .map_err(bad_key)?
                .encrypt(data),
            (Self::AesCfb, 24) if seal => cfb_mode::Encryptor::<Aes192>::new_from_slices(key, iv)
                .map_err(bad_key)?
                .encrypt(data),
            (Self::AesCfb, 32) if seal => cfb_mode::Encryptor::<Aes256>::new_from_slices(key, iv)
                .map_err(bad_key)?
                .encrypt(data),
            (Self::AesCfb, 16) => cfb_mode::Decryptor::<Aes128>::new_from_slices(key, iv)
                .map_err(bad_key)?
                .decrypt(data),
            (Self::AesCfb, 24) => cfb_mode::Decryptor::<Aes192>::new_from_slices(key, iv)
                .map_err(bad_key)?
                .decrypt(data),
            (Self::AesCfb, 32) => cfb_mode::Decryptor::<Aes256>::new_from_slices(key, iv)
                .map_err(bad_key)?
                .decrypt(data),

            (_, n) => {
                return Err(VbdError::Config(format!(
                    "AES key has {n} bytes; use 16, 24, or 32"
                )))
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for EncryptMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Generate a random AES-256 key from the OS entropy source.
pub fn random_key() -> Vec<u8> {
    let mut key = vec![0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

/// Check a key is a legal AES length and not all zeros.
pub fn validate_key(key: &[u8]) -> VbdResult<()> {
    match key.len() {
        16 | 24 | 32 => {}
        0 => return Err(VbdError::Config("AES key is empty".into())),
        n => {
            return Err(VbdError::Config(format!(
                "AES key has {n} bytes; use 16 for AES-128, 24 for AES-192, or 32 for AES-256"
            )))
        }
    }
    if vblk_core::zeros::is_zeros(key) {
        return Err(VbdError::Config(
            "AES key is all zeros (likely a mistake)".into(),
        ));
    }
    Ok(())
}

/// Container wrapper applying transparent encryption.
pub struct EncryptedContainer {
    inner: Arc<dyn Container>,
    mode: EncryptMode,
    key: Vec<u8>,
}

impl EncryptedContainer {
    pub fn new(inner: Arc<dyn Container>, mode: EncryptMode, key: Vec<u8>) -> Self {
        Self { inner, mode, key }
    }

    fn logical_size(item: &mut Item) -> VbdResult<()> {
        if item.metadata.contains_key(META_ENCRYPT_ALGO) {
            let recorded = item.metadata.get(META_ENCRYPT_SIZE).ok_or_else(|| {
                VbdError::Remote(format!(
                    "item {} is encrypted but records no plaintext size",
                    item.name
                ))
            })?;
            item.size = from_base36(recorded)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Container for EncryptedContainer {
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
        let mut raw = self.inner.get(item).await?;

        let Some(algo) = item.metadata.get(META_ENCRYPT_ALGO) else {
            return Ok(raw);
        };
        let mode = EncryptMode::from_name(algo).ok_or_else(|| {
            VbdError::Remote(format!("item {} uses unsupported cipher {algo:?}", item.name))
        })?;
        let iv_hex = item.metadata.get(META_ENCRYPT_IV).ok_or_else(|| {
            VbdError::Remote(format!("item {} is encrypted but records no IV", item.name))
        })?;
        let iv: [u8; IV_BYTES] = hex::decode(iv_hex)
            .map_err(|e| VbdError::Remote(format!("item {} IV is not hex: {e}", item.name)))?
            .try_into()
            .map_err(|_| VbdError::Remote(format!("item {} IV is not 16 bytes", item.name)))?;

        mode.open(&self.key, &iv, &mut raw)?;
        if raw.len() as u64 != item.size {
            return Err(VbdError::Remote(format!(
                "item {} decrypted to {} bytes, expected {}",
                item.name,
                raw.len(),
                item.size
            )));
        }
        Ok(raw)
    }

    async fn put(&self, name: &str, data: &[u8], mut metadata: Metadata) -> VbdResult<Item> {
        if self.mode == EncryptMode::Identity {
            return self.inner.put(name, data, metadata).await;
        }

        let mut sealed = data.to_vec();
        let iv = self.mode.seal(&self.key, &mut sealed)?;
        metadata.insert(META_ENCRYPT_ALGO.into(), self.mode.name().into());
        metadata.insert(META_ENCRYPT_IV.into(), hex::encode(iv));
        metadata.insert(META_ENCRYPT_SIZE.into(), to_base36(data.len() as u64));

        let mut item = self.inner.put(name, &sealed, metadata).await?;
        item.size = data.len() as u64;
        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use crate::object::dir::DirContainer;

    use super::*;

    const MODES: [EncryptMode; 3] = [
        EncryptMode::AesCtr,
        EncryptMode::AesCfb,
        EncryptMode::AesOfb,
    ];

    #[test]
    fn seal_open_round_trips_for_every_mode_and_key_size() {
        let plain: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        for mode in MODES {
            for key_len in [16, 24, 32] {
                let mut key = vec![0u8; key_len];
                rand::rngs::OsRng.fill_bytes(&mut key);

                let mut data = plain.clone();
                let iv = mode.seal(&key, &mut data).unwrap();
                assert_ne!(data, plain, "{mode}/{key_len} produced plaintext output");

                mode.open(&key, &iv, &mut data).unwrap();
                assert_eq!(data, plain, "{mode}/{key_len}");
            }
        }
    }

    #[test]
    fn wrong_key_output_is_uncorrelated_with_plaintext() {
        let plain = vec![0x5au8; 64 * 1024];
        for mode in MODES {
            let key = random_key();
            let mut data = plain.clone();
            let iv = mode.seal(&key, &mut data).unwrap();

            let other = random_key();
            mode.open(&other, &iv, &mut data).unwrap();
            assert_ne!(data, plain, "{mode}");

            // A constant plaintext decrypted under the wrong key should look
            // like noise, not mostly match.
            let matching = data.iter().filter(|&&b| b == 0x5a).count();
            assert!(matching < plain.len() / 16, "{mode}: {matching} bytes matched");
        }
    }

    #[test]
    fn key_validation() {
        assert!(validate_key(&random_key()).is_ok());
        assert!(validate_key(&[]).is_err());
        assert!(validate_key(&[1u8; 15]).is_err());
        assert!(validate_key(&[0u8; 32]).is_err());
    }

    #[test]
    fn mode_names_round_trip_and_rec_is_ctr() {
        for mode in MODES {
            assert_eq!(EncryptMode::from_name(mode.name()), Some(mode));
        }
        assert_eq!(EncryptMode::from_name("aes-rec"), Some(EncryptMode::AesCtr));
        assert_eq!(EncryptMode::from_name("rot13"), None);
    }

    #[tokio::test]
    async fn wrapped_container_round_trips_and_stores_ciphertext() {
        let dir = tempfile::tempdir().unwrap();
        let inner = Arc::new(DirContainer::open(&dir.path().join("c")).unwrap());
        let key = random_key();
        let cont = EncryptedContainer::new(inner.clone(), EncryptMode::AesCtr, key);

        let plain = vec![3u8; 32 * 1024];
        let item = cont.put("seg", &plain, Metadata::new()).await.unwrap();
        assert_eq!(item.size, plain.len() as u64);

        let stored = inner.item("seg").await.unwrap().unwrap();
        assert_ne!(inner.get(&stored).await.unwrap(), plain);

        let listed = cont.items("seg", 10).await.unwrap();
        assert_eq!(cont.get(&listed[0]).await.unwrap(), plain);
    }

    #[tokio::test]
    async fn wrong_key_container_does_not_return_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let inner = Arc::new(DirContainer::open(&dir.path().join("c")).unwrap());

        let plain = vec![9u8; 16 * 1024];
        {
            let cont = EncryptedContainer::new(inner.clone(), EncryptMode::AesCtr, random_key());
            cont.put("seg", &plain, Metadata::new()).await.unwrap();
        }

        let wrong = EncryptedContainer::new(inner, EncryptMode::AesCtr, random_key());
        let item = wrong.item("seg").await.unwrap().unwrap();
        let out = wrong.get(&item).await.unwrap();
        assert_ne!(out, plain);
    }
}
