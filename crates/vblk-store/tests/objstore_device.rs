//! End-to-end behavior of the object-store device over the local-directory
//! container: codec round trips across reopen, quota-driven eviction, and
//! cache persistence.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use vblk_core::Device;
use vblk_store::object::{
    encrypt, CompressMode, Container, EncryptMode, ObjStoreDevice, Options,
};
use vblk_store::object::dir::DirContainer;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;

fn open_container(root: &Path) -> Arc<dyn Container> {
    Arc::new(DirContainer::open(root).unwrap())
}

/// Alternating 4 KiB runs of patterned bytes and zeros.
fn pattern_byte(i: u64) -> u8 {
    if (i / 4096) % 2 == 0 {
        (i + 16) as u8
    } else {
        0
    }
}

async fn write_pattern(dev: &ObjStoreDevice) {
    const CHUNK: usize = 256 * 1024;
    let mut pos = 0u64;
    while pos < dev.size() {
        let len = CHUNK.min((dev.size() - pos) as usize);
        let chunk: Vec<u8> = (pos..pos + len as u64).map(pattern_byte).collect();
        assert_eq!(dev.write_at(&chunk, pos).await.unwrap(), len);
        pos += len as u64;
    }
}

async fn device_sha256(dev: &ObjStoreDevice) -> Vec<u8> {
    const CHUNK: usize = 256 * 1024;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK];
    let mut pos = 0u64;
    while pos < dev.size() {
        let len = CHUNK.min((dev.size() - pos) as usize);
        assert_eq!(dev.read_at(&mut buf[..len], pos).await.unwrap(), len);
        hasher.update(&buf[..len]);
        pos += len as u64;
    }
    hasher.finalize().to_vec()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn compressed_encrypted_device_survives_reopen() {
    let tmp = tempfile::tempdir().unwrap();
    let remote_root = tmp.path().join("remote");
    let key = encrypt::random_key();
    let opts = || {
        Options::default()
            .compress(CompressMode::S2)
            .encrypt(EncryptMode::AesCtr, key.clone())
            .concur_flush_count(4)
    };

    let expected = {
        let dev = ObjStoreDevice::new(
            open_container(&remote_root),
            &tmp.path().join("cache-a"),
            16 * MIB,
            512 * KIB,
            opts(),
        )
        .await
        .unwrap();

        write_pattern(&dev).await;
        let hash = device_sha256(&dev).await;
        dev.flush().await.unwrap();
        dev.close().await.unwrap();
        hash
    };

    // Every segment saw at least one nonzero byte, so every segment was
    // flushed to the remote container.
    let container = open_container(&remote_root);
    let items = container.items("osbd-dev_remote-blk_", 64).await.unwrap();
    assert_eq!(items.len(), 32);

    // A fresh cache directory forces everything back through download +
    // decrypt + inflate.
    let dev = ObjStoreDevice::new(
        open_container(&remote_root),
        &tmp.path().join("cache-b"),
        16 * MIB,
        512 * KIB,
        opts(),
    )
    .await
    .unwrap();
    assert_eq!(device_sha256(&dev).await, expected);
    dev.close().await.unwrap();
}

#[tokio::test]
async fn segment_spanning_io() {
    let tmp = tempfile::tempdir().unwrap();
    let dev = ObjStoreDevice::new(
        open_container(&tmp.path().join("remote")),
        &tmp.path().join("cache"),
        4 * MIB,
        MIB,
        Options::default(),
    )
    .await
    .unwrap();

    // A write centered on the segment 0 / segment 1 boundary.
    let data: Vec<u8> = (0..MIB as usize).map(|i| (i % 251) as u8).collect();
    let pos = MIB / 2;
    assert_eq!(dev.write_at(&data, pos).await.unwrap(), data.len());

    let mut back = vec![0u8; data.len()];
    assert_eq!(dev.read_at(&mut back, pos).await.unwrap(), data.len());
    assert_eq!(back, data);

    // Reads on either side see the split halves.
    let mut head = vec![0u8; (MIB / 2) as usize];
    dev.read_at(&mut head, MIB / 2).await.unwrap();
    assert_eq!(head, data[..(MIB / 2) as usize]);

    dev.close().await.unwrap();
}

#[tokio::test]
async fn flush_without_dirty_segments_makes_no_remote_calls() {
    let tmp = tempfile::tempdir().unwrap();
    let remote_root = tmp.path().join("remote");
    let dev = ObjStoreDevice::new(
        open_container(&remote_root),
        &tmp.path().join("cache"),
        2 * MIB,
        MIB,
        Options::default(),
    )
    .await
    .unwrap();

    // Reads alone never dirty a segment.
    let mut buf = vec![0u8; 4096];
    dev.read_at(&mut buf, 0).await.unwrap();
    dev.flush().await.unwrap();

    let container = open_container(&remote_root);
    assert!(container.items("osbd-dev_remote-blk_", 8).await.unwrap().is_empty());
    dev.close().await.unwrap();
}

fn cached_files(cache_dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(cache_dir)
        .unwrap()
        .filter_map(|ent| ent.ok())
        .filter_map(|ent| ent.file_name().into_string().ok())
        .filter(|name| !name.ends_with(".etag"))
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn single_segment_quota_evicts_least_recently_used() {
    let tmp = tempfile::tempdir().unwrap();
    let cache_dir = tmp.path().join("cache");
    let dev = ObjStoreDevice::new(
        open_container(&tmp.path().join("remote")),
        &cache_dir,
        4 * MIB,
        2 * MIB,
        // Exactly one resident segment at a time.
        Options::default().quota_bytes(2 * MIB),
    )
    .await
    .unwrap();

    let seg0 = vec![0xa0u8; 4096];
    let seg1 = vec![0xb1u8; 4096];

    // Touch segment 0: it becomes the sole resident.
    dev.write_at(&seg0, 0).await.unwrap();
    assert_eq!(cached_files(&cache_dir).len(), 1);
    assert!(cached_files(&cache_dir)[0].ends_with("-blk_0"));

    // Touching segment 1 evicts segment 0 (flushing it first: it is dirty).
    dev.write_at(&seg1, 2 * MIB).await.unwrap();
    assert_eq!(cached_files(&cache_dir).len(), 1);
    assert!(cached_files(&cache_dir)[0].ends_with("-blk_1"));

    // Reading segment 0 downloads it back and pushes segment 1 out.
    let mut buf = vec![0u8; 4096];
    dev.read_at(&mut buf, 0).await.unwrap();
    assert_eq!(buf, seg0);
    assert_eq!(cached_files(&cache_dir).len(), 1);
    assert!(cached_files(&cache_dir)[0].ends_with("-blk_0"));

    // And the data under continuous eviction stays intact.
    dev.read_at(&mut buf, 2 * MIB).await.unwrap();
    assert_eq!(buf, seg1);

    dev.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn persisted_cache_is_reused_without_downloads() {
    let tmp = tempfile::tempdir().unwrap();
    let remote_root = tmp.path().join("remote");
    let cache_dir = tmp.path().join("cache");
    let opts = || {
        Options::default()
            .compress(CompressMode::S2)
            .persist_cache(true)
    };

    let expected = {
        let dev = ObjStoreDevice::new(
            open_container(&remote_root),
            &cache_dir,
            8 * MIB,
            512 * KIB,
            opts(),
        )
        .await
        .unwrap();
        write_pattern(&dev).await;
        let hash = device_sha256(&dev).await;
        dev.close().await.unwrap();
        hash
    };

    // Close kept the cache files and their ETag sidecars.
    assert!(!cached_files(&cache_dir).is_empty());

    // Sabotage every remote data file (sidecar metadata stays intact, so the
    // advertised ETags do not change). If the reopened device downloaded
    // anything, it would read garbage and fail to inflate.
    for ent in fs::read_dir(&remote_root).unwrap() {
        let path = ent.unwrap().path();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        if !name.starts_with('.') {
            fs::write(&path, b"corrupted remote object").unwrap();
        }
    }

    let dev = ObjStoreDevice::new(
        open_container(&remote_root),
        &cache_dir,
        8 * MIB,
        512 * KIB,
        opts(),
    )
    .await
    .unwrap();
    assert_eq!(device_sha256(&dev).await, expected);
    dev.close().await.unwrap();
}

#[tokio::test]
async fn autoflush_uploads_in_the_background() {
    let tmp = tempfile::tempdir().unwrap();
    let remote_root = tmp.path().join("remote");
    let dev = ObjStoreDevice::new(
        open_container(&remote_root),
        &tmp.path().join("cache"),
        2 * MIB,
        MIB,
        Options::default().autoflush_interval(std::time::Duration::from_millis(50)),
    )
    .await
    .unwrap();

    dev.write_at(&[0x33u8; 4096], 0).await.unwrap();

    let container = open_container(&remote_root);
    let mut uploaded = false;
    for _ in 0..100 {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        if !container.items("osbd-dev_remote-blk_", 4).await.unwrap().is_empty() {
            uploaded = true;
            break;
        }
    }
    assert!(uploaded, "auto-flush never uploaded the dirty segment");
    dev.close().await.unwrap();
}
