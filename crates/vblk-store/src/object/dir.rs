//! Local-directory container driver.
//!
//! Each item is a file under the container's root directory, accompanied by
//! a hidden sidecar `.<name>.meta` holding the metadata map and the ETag
//! (hex SHA-1 of the stored bytes, fixed at put time) as JSON. Writes go
//! through a write-to-temp-then-rename so a crash never leaves a torn item.
//!
//! This is the one driver bundled with the workspace; it backs local
//! operation and the test suites.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tracing::debug;
use vblk_proto::{VbdError, VbdResult};

use super::container::{Container, Item, Metadata};
use crate::join_err;

#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    etag: String,
    metadata: Metadata,
}

/// Container over a local directory.
pub struct DirContainer {
    root: PathBuf,
    name: String,
}

impl DirContainer {
    /// Open (creating if needed) the container rooted at `root`. The
    /// directory's final path component becomes the container name.
    pub fn open(root: &Path) -> VbdResult<Self> {
        fs::create_dir_all(root)?;
        let name = root
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                VbdError::Config(format!("container root {} has no name", root.display()))
            })?
            .to_owned();
        Ok(Self {
            root: root.to_path_buf(),
            name,
        })
    }

    fn item_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn sidecar_path(&self, name: &str) -> PathBuf {
        self.root.join(format!(".{name}.meta"))
    }

    fn load_item(root: &Path, name: &str) -> VbdResult<Option<Item>> {
        let data_path = root.join(name);
        let meta = match fs::metadata(&data_path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let sidecar_path = root.join(format!(".{name}.meta"));
        let sidecar = match fs::read(&sidecar_path) {
            Ok(raw) => serde_json::from_slice::<Sidecar>(&raw).map_err(|e| {
                VbdError::Remote(format!("corrupt sidecar {}: {e}", sidecar_path.display()))
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Sidecar {
                etag: String::new(),
                metadata: Metadata::new(),
            },
            Err(err) => return Err(err.into()),
        };

        Ok(Some(Item {
            name: name.to_owned(),
            size: meta.len(),
            etag: sidecar.etag,
            metadata: sidecar.metadata,
        }))
    }

    /// Write-to-temp-then-rename; same-directory temp guarantees the rename
    /// stays on one filesystem.
    fn atomic_write(target: &Path, data: &[u8]) -> std::io::Result<()> {
        let dir = target.parent().expect("item path has a parent");
        let base = target.file_name().and_then(|n| n.to_str()).unwrap_or("item");
        let tmp = dir.join(format!(".tmp_{}_{base}", std::process::id()));
        fs::write(&tmp, data)?;
        let file = fs::File::open(&tmp)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, target)
    }
}

#[async_trait]
impl Container for DirContainer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn item(&self, name: &str) -> VbdResult<Option<Item>> {
        let root = self.root.clone();
        let name = name.to_owned();
        tokio::task::spawn_blocking(move || Self::load_item(&root, &name))
            .await
            .map_err(join_err)?
    }

    async fn items(&self, prefix: &str, limit: usize) -> VbdResult<Vec<Item>> {
        let root = self.root.clone();
        let prefix = prefix.to_owned();
        tokio::task::spawn_blocking(move || -> VbdResult<Vec<Item>> {
            let mut names: Vec<String> = fs::read_dir(&root)?
                .filter_map(|ent| ent.ok())
                .filter_map(|ent| ent.file_name().into_string().ok())
                .filter(|name| !name.starts_with('.') && name.starts_with(&prefix))
                .collect();
            names.sort();
            names.truncate(limit);

            let mut items = Vec::with_capacity(names.len());
            for name in names {
                if let Some(item) = Self::load_item(&root, &name)? {
                    items.push(item);
                }
            }
            Ok(items)
        })
        .await
        .map_err(join_err)?
    }

    async fn get(&self, item: &Item) -> VbdResult<Vec<u8>> {
        let path = self.item_path(&item.name);
        tokio::task::spawn_blocking(move || -> VbdResult<Vec<u8>> {
            fs::read(&path).map_err(|e| VbdError::Remote(format!("{}: {e}", path.display())))
        })
        .await
        .map_err(join_err)?
    }

    async fn put(&self, name: &str, data: &[u8], metadata: Metadata) -> VbdResult<Item> {
        let data_path = self.item_path(name);
        let sidecar_path = self.sidecar_path(name);
        let name = name.to_owned();
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || -> VbdResult<Item> {
            let etag = hex::encode(Sha1::digest(&data));
            let size = data.len() as u64;

            Self::atomic_write(&data_path, &data)?;
            let sidecar = Sidecar {
                etag: etag.clone(),
                metadata: metadata.clone(),
            };
            let raw = serde_json::to_vec(&sidecar)
                .map_err(|e| VbdError::Remote(format!("sidecar encode: {e}")))?;
            Self::atomic_write(&sidecar_path, &raw)?;

            debug!("dir: put {name} ({size} bytes)");
            Ok(Item {
                name,
                size,
                etag,
                metadata,
            })
        })
        .await
        .map_err(join_err)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_temp() -> (tempfile::TempDir, DirContainer) {
        let dir = tempfile::tempdir().unwrap();
        let cont = DirContainer::open(&dir.path().join("cont-a")).unwrap();
        (dir, cont)
    }

    #[tokio::test]
    async fn put_get_round_trip_with_metadata() {
        let (_tmp, cont) = open_temp().await;

        let mut meta = Metadata::new();
        meta.insert("x-test".into(), "yes".into());
        let item = cont.put("blob-1", b"hello world", meta).await.unwrap();
        assert_eq!(item.size, 11);
        assert!(!item.etag.is_empty());

        let fetched = cont.item("blob-1").await.unwrap().unwrap();
        assert_eq!(fetched.etag, item.etag);
        assert_eq!(fetched.metadata.get("x-test").map(String::as_str), Some("yes"));

        assert_eq!(cont.get(&fetched).await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn missing_item_is_none() {
        let (_tmp, cont) = open_temp().await;
        assert!(cont.item("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn replace_changes_etag() {
        let (_tmp, cont) = open_temp().await;
        let first = cont.put("b", b"one", Metadata::new()).await.unwrap();
        let second = cont.put("b", b"two", Metadata::new()).await.unwrap();
        assert_ne!(first.etag, second.etag);
        assert_eq!(cont.get(&second).await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn listing_filters_by_prefix_and_hides_sidecars() {
        let (_tmp, cont) = open_temp().await;
        for name in ["pfx-0", "pfx-1", "other"] {
            cont.put(name, b"x", Metadata::new()).await.unwrap();
        }

        let items = cont.items("pfx-", 10).await.unwrap();
        let names: Vec<_> = items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, ["pfx-0", "pfx-1"]);

        let capped = cont.items("pfx-", 1).await.unwrap();
        assert_eq!(capped.len(), 1);
    }
}
