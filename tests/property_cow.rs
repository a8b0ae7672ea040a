//! Property-based tests for the copy-on-write overlay
//!
//! Random write sequences are applied to a mounted image and to a plain byte
//! vector; every read must agree with the vector.

use proptest::prelude::*;
use std::sync::Arc;
use tempfile::TempDir;
use virtimg::{FormatKind, MemImage, MountConfig, MountSession, VirtualLayout};

const BODY: usize = 24 * 1024;

fn format_strategy() -> impl Strategy<Value = FormatKind> {
    prop_oneof![
        Just(FormatKind::Raw),
        Just(FormatKind::Vdi),
        Just(FormatKind::Vhd),
    ]
}

fn mount(dir: &TempDir, format: FormatKind, data: &[u8], block_size: u64) -> MountSession {
    let mut config = MountConfig::default();
    config.format = format;
    config.block_size = block_size;
    config.cache_path = Some(dir.path().join("prop.cache"));
    config.sync_writes = false;
    MountSession::mount(&config, Arc::new(MemImage::new(data.to_vec()))).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_reads_match_shadow_model(
        format in format_strategy(),
        block_shift in 9u32..13,
        writes in prop::collection::vec((any::<u16>(), 1usize..3000, any::<u8>()), 1..20)
    ) {
        let dir = TempDir::new().unwrap();
        let source: Vec<u8> = (0..BODY).map(|i| (i % 241) as u8).collect();
        let session = mount(&dir, format, &source, 1u64 << block_shift);

        let mut shadow = session.read(0, usize::MAX).unwrap();
        prop_assert_eq!(shadow.len() as u64, session.virtual_size());

        for (offset, len, byte) in &writes {
            let offset = *offset as u64 % session.virtual_size();
            let data = vec![*byte; *len];
            let written = session.write(offset, &data).unwrap();

            let expected = (*len).min((session.virtual_size() - offset) as usize);
            prop_assert_eq!(written, expected);
            shadow[offset as usize..offset as usize + written].copy_from_slice(&data[..written]);
        }

        prop_assert_eq!(session.read(0, usize::MAX).unwrap(), shadow);
    }

    #[test]
    fn prop_writes_survive_remount(
        writes in prop::collection::vec((0usize..BODY, 1usize..600), 1..10)
    ) {
        let dir = TempDir::new().unwrap();
        let source = vec![0xC3u8; BODY];
        let mut shadow = source.clone();

        {
            let session = mount(&dir, FormatKind::Raw, &source, 1024);
            for (i, (offset, len)) in writes.iter().enumerate() {
                let data = vec![i as u8; *len];
                let written = session.write(*offset as u64, &data).unwrap();
                shadow[*offset..*offset + written].copy_from_slice(&data[..written]);
            }
        }

        let session = mount(&dir, FormatKind::Raw, &source, 1024);
        prop_assert_eq!(session.read(0, BODY).unwrap(), shadow);
    }

    #[test]
    fn prop_virtual_size_is_sum_of_regions(
        format in format_strategy(),
        size in 0u64..(64 * 1024 * 1024 * 1024)
    ) {
        let identity = virtimg::ImageIdentity::derive(&MemImage::new(vec![1, 2, 3])).unwrap();
        let layout = VirtualLayout::synthesize(format, size, &identity).unwrap();
        prop_assert_eq!(
            layout.virtual_size(),
            layout.header_size() + size + layout.footer_size()
        );

        let spans = layout.spans(0, usize::MAX);
        let total: u64 = spans.iter().map(|s| s.len as u64).sum();
        prop_assert_eq!(total, layout.virtual_size().min(usize::MAX as u64));
    }
}
