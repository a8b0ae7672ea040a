//! Copy-on-write read/write behaviour through a mounted session

use std::sync::Arc;
use tempfile::TempDir;
use virtimg::{
    CacheStore, FormatKind, MemImage, MorphedImage, MountConfig, MountSession, VirtImgError,
};

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31) % 253) as u8).collect()
}

fn mount(
    dir: &TempDir,
    format: FormatKind,
    data: Vec<u8>,
    block_size: u64,
) -> (MountSession, Arc<MemImage>) {
    let source = Arc::new(MemImage::new(data));
    let mut config = MountConfig::default();
    config.format = format;
    config.block_size = block_size;
    config.cache_path = Some(dir.path().join("image.cache"));
    let session = MountSession::mount(&config, source.clone()).unwrap();
    (session, source)
}

#[test]
fn test_round_trip_any_alignment() {
    let dir = TempDir::new().unwrap();
    let (session, _) = mount(&dir, FormatKind::Raw, pattern(64 * 1024), 4096);

    let cases: [(u64, usize); 5] = [(0, 1), (4095, 2), (100, 9000), (8192, 4096), (65535, 1)];
    for (i, (offset, len)) in cases.iter().enumerate() {
        let data = vec![0xA0 + i as u8; *len];
        assert_eq!(session.write(*offset, &data).unwrap(), *len);
        assert_eq!(session.read(*offset, *len).unwrap(), data);
    }
}

#[test]
fn test_unwritten_bytes_match_source() {
    let dir = TempDir::new().unwrap();
    let data = pattern(32 * 1024);
    let (session, source) = mount(&dir, FormatKind::Raw, data.clone(), 4096);

    session.write(5000, &[0u8; 10]).unwrap();
    session.write(20_000, &[1u8; 5000]).unwrap();

    let image = session.read(0, data.len()).unwrap();
    let mut expected = data.clone();
    expected[5000..5010].fill(0);
    expected[20_000..25_000].fill(1);
    assert_eq!(image, expected);
    assert_eq!(source.read(5000, 10).unwrap(), data[5000..5010].to_vec());
}

#[test]
fn test_partial_block_fill() {
    let dir = TempDir::new().unwrap();
    let data = pattern(16 * 1024);
    let (session, _) = mount(&dir, FormatKind::Raw, data.clone(), 4096);

    session.write(4096 + 2000, &[0xEE]).unwrap();
    let block = session.read(4096, 4096).unwrap();
    for (i, byte) in block.iter().enumerate() {
        if i == 2000 {
            assert_eq!(*byte, 0xEE);
        } else {
            assert_eq!(*byte, data[4096 + i], "byte {} of block 1 differs", i);
        }
    }
}

#[test]
fn test_idempotent_rewrite() {
    let dir = TempDir::new().unwrap();
    let (session, _) = mount(&dir, FormatKind::Raw, pattern(16 * 1024), 4096);

    session.write(3000, &[7u8; 3000]).unwrap();
    let first = session.cache_stats().unwrap();
    let read_first = session.read(0, 16 * 1024).unwrap();

    session.write(3000, &[7u8; 3000]).unwrap();
    let second = session.cache_stats().unwrap();

    assert_eq!(first.assigned_blocks, 2);
    assert_eq!(first, second);
    assert_eq!(session.read(0, 16 * 1024).unwrap(), read_first);
}

#[test]
fn test_overlapping_writes() {
    let dir = TempDir::new().unwrap();
    let (session, _) = mount(&dir, FormatKind::Raw, pattern(8192), 4096);

    let first: Vec<u8> = (1..=10).collect();
    let second: Vec<u8> = (101..=110).collect();
    session.write(0, &first).unwrap();
    session.write(5, &second).unwrap();

    let mut expected = first[..5].to_vec();
    expected.extend_from_slice(&second);
    assert_eq!(session.read(0, 15).unwrap(), expected);
}

#[test]
fn test_boundary_reads() {
    let dir = TempDir::new().unwrap();
    let data = pattern(10_000);
    let (session, _) = mount(&dir, FormatKind::Vhd, data, 4096);
    let size = session.virtual_size();
    assert_eq!(size, 10_000 + 512);

    assert!(session.read(size, 10).unwrap().is_empty());
    assert!(session.read(size + 1000, 10).unwrap().is_empty());
    assert_eq!(session.read(size - 1, 11).unwrap().len(), 1);

    assert!(matches!(
        session.write(size, b"x"),
        Err(VirtImgError::OutOfBounds { .. })
    ));
    assert_eq!(session.write(size - 2, b"xyz").unwrap(), 2);
    assert_eq!(session.read(size - 2, 10).unwrap(), b"xy".to_vec());
    assert_eq!(session.write(0, &[]).unwrap(), 0);
}

#[test]
fn test_vdi_ten_megabyte_scenario() {
    let dir = TempDir::new().unwrap();
    let (session, _) = mount(&dir, FormatKind::Vdi, vec![0x11; 10_000_000], 1024 * 1024);

    let header_size = 512 + 40;
    assert_eq!(session.virtual_size(), header_size + 10_000_000);

    session.write(header_size + 500_000, b"EVID").unwrap();
    drop(session);

    let cache = CacheStore::open_or_create(dir.path().join("image.cache"), 10_000_000, 1024 * 1024)
        .unwrap();
    assert_eq!(cache.block_count(), 10);
    assert!(cache.is_block_assigned(0));
    for block in 1..10 {
        assert!(!cache.is_block_assigned(block), "block {} assigned", block);
    }
    assert_eq!(cache.assigned_blocks(), vec![0]);
}

#[test]
fn test_header_write_persists_across_mounts() {
    let dir = TempDir::new().unwrap();
    let data = pattern(4 * 1024 * 1024);
    // Preamble plus four block map entries
    let body = 512 + 4 * 4;
    {
        let (session, _) = mount(&dir, FormatKind::Vdi, data.clone(), 1024 * 1024);
        // Patch the VDI comment field
        session.write(84, b"examined").unwrap();
        session.write(body + 1024 * 1024, b"payload").unwrap();
    }

    let (session, _) = mount(&dir, FormatKind::Vdi, data.clone(), 1024 * 1024);
    assert_eq!(session.read(84, 8).unwrap(), b"examined".to_vec());
    assert_eq!(session.read(body + 1024 * 1024, 7).unwrap(), b"payload".to_vec());
    assert_eq!(session.read(body, 100).unwrap(), data[..100].to_vec());

    let stats = session.cache_stats().unwrap();
    assert!(stats.header_cached);
    assert!(!stats.footer_cached);
    assert_eq!(stats.assigned_blocks, 1);
}

#[test]
fn test_write_spanning_body_and_footer() {
    let dir = TempDir::new().unwrap();
    let data = pattern(4096);
    let (session, _) = mount(&dir, FormatKind::Vhd, data.clone(), 1024);
    let footer = session.read(4096, 512).unwrap();

    let buf = vec![0x5A; 1024];
    assert_eq!(session.write(4096 - 512, &buf).unwrap(), 1024);

    let image = session.read(0, 4096 + 512).unwrap();
    assert_eq!(&image[..4096 - 512], &data[..4096 - 512]);
    assert!(image[4096 - 512..].iter().all(|&b| b == 0x5A));
    assert_ne!(session.read(4096, 512).unwrap(), footer);
}

#[test]
fn test_overwrite_cache_discards_writes() {
    let dir = TempDir::new().unwrap();
    let data = pattern(8192);
    {
        let (session, _) = mount(&dir, FormatKind::Raw, data.clone(), 4096);
        session.write(0, b"changed").unwrap();
    }

    let mut config = MountConfig::default();
    config.block_size = 4096;
    config.cache_path = Some(dir.path().join("image.cache"));
    config.overwrite_cache = true;
    let session = MountSession::mount(&config, Arc::new(MemImage::new(data.clone()))).unwrap();

    assert_eq!(session.read(0, 7).unwrap(), data[..7].to_vec());
    assert_eq!(session.cache_stats().unwrap().assigned_blocks, 0);
}
