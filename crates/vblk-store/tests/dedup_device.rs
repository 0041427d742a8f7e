//! End-to-end behavior of the deduplicating device against its on-disk
//! layout: `<name>.map`, `<name>.ids`, `<name>.blks`.

use std::fs;
use std::path::Path;

use vblk_core::Device;
use vblk_store::dedup::{DedupDevice, ZERO_DEDUP_ID};

const BS: u64 = 4096;
const DEV_SIZE: u64 = 128 * 1024 * 1024;

fn map_slot(dir: &Path, slot: usize) -> u64 {
    let raw = fs::read(dir.join("test-lun.map")).unwrap();
    u64::from_le_bytes(raw[slot * 8..slot * 8 + 8].try_into().unwrap())
}

#[tokio::test]
async fn duplicate_blocks_share_one_physical_block() {
    let tmp = tempfile::tempdir().unwrap();
    let dev = DedupDevice::open(tmp.path(), "test-lun", DEV_SIZE, 8 * 1024 * 1024).unwrap();

    // The same content at two offsets stores one physical block.
    let block = vec![0x42u8; BS as usize];
    dev.write_at(&block, 0).await.unwrap();
    dev.write_at(&block, 2 * BS).await.unwrap();

    let blks = tmp.path().join("test-lun.blks");
    assert_eq!(fs::metadata(&blks).unwrap().len(), BS);

    // All-zero writes store nothing at all.
    dev.write_at(&vec![0u8; BS as usize], 4 * BS).await.unwrap();
    assert_eq!(fs::metadata(&blks).unwrap().len(), BS);

    dev.flush().await.unwrap();
    assert_eq!(map_slot(tmp.path(), 0), map_slot(tmp.path(), 2));
    assert_eq!(map_slot(tmp.path(), 4), ZERO_DEDUP_ID);

    // Distinct content gets a second physical block.
    dev.write_at(&vec![0x43u8; BS as usize], 6 * BS).await.unwrap();
    assert_eq!(fs::metadata(&blks).unwrap().len(), 2 * BS);

    dev.close().await.unwrap();
}

#[tokio::test]
async fn flush_then_reopen_preserves_data() {
    let tmp = tempfile::tempdir().unwrap();

    let mut pattern = vec![0u8; 8 * BS as usize];
    for (i, byte) in pattern.iter_mut().enumerate() {
        *byte = (i / 97) as u8;
    }

    {
        let dev = DedupDevice::open(tmp.path(), "test-lun", DEV_SIZE, 1024 * 1024).unwrap();
        dev.write_at(&pattern, 16 * BS).await.unwrap();
        dev.flush().await.unwrap();
        dev.close().await.unwrap();
    }

    let dev = DedupDevice::open(tmp.path(), "test-lun", DEV_SIZE, 1024 * 1024).unwrap();
    assert_eq!(dev.size(), DEV_SIZE);

    let mut back = vec![0u8; pattern.len()];
    dev.read_at(&mut back, 16 * BS).await.unwrap();
    assert_eq!(back, pattern);

    // Untouched regions still read as zeros.
    let mut zeros = vec![0xffu8; 4 * BS as usize];
    dev.read_at(&mut zeros, 64 * BS).await.unwrap();
    assert!(vblk_core::zeros::is_zeros(&zeros));

    dev.close().await.unwrap();
}

#[tokio::test]
async fn rewriting_known_content_appends_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let dev = DedupDevice::open(tmp.path(), "test-lun", DEV_SIZE, 1024 * 1024).unwrap();

    let block = vec![0x11u8; BS as usize];
    for i in 0..32u64 {
        dev.write_at(&block, i * BS).await.unwrap();
    }
    assert_eq!(
        fs::metadata(tmp.path().join("test-lun.blks")).unwrap().len(),
        BS
    );

    // Overwriting a block with zeros repoints its map entry without
    // reclaiming the physical block (blocks are immutable once written).
    dev.write_at(&vec![0u8; BS as usize], 0).await.unwrap();
    dev.flush().await.unwrap();
    assert_eq!(map_slot(tmp.path(), 0), ZERO_DEDUP_ID);
    assert_eq!(
        fs::metadata(tmp.path().join("test-lun.blks")).unwrap().len(),
        BS
    );

    dev.close().await.unwrap();
}
