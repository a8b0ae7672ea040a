#![no_main]
use libfuzzer_sys::{fuzz_target, arbitrary::{Arbitrary, Unstructured}};
use std::sync::Arc;
use virtimg::{FormatKind, MemImage, MountConfig, MountSession};

#[derive(Debug, Arbitrary)]
enum ImageOp {
    Read { offset: u32, len: u16 },
    Write { offset: u32, data: Vec<u8> },
}

// Random reads/writes against a small image must never panic, and every
// write must read back
fuzz_target!(|input: &[u8]| {
    let mut u = Unstructured::new(input);

    let format = match u.int_in_range(0..=2u8) {
        Ok(0) => FormatKind::Raw,
        Ok(1) => FormatKind::Vdi,
        Ok(_) => FormatKind::Vhd,
        Err(_) => return,
    };
    let ops: Vec<ImageOp> = match u.arbitrary() {
        Ok(ops) => ops,
        Err(_) => return,
    };

    let dir = match tempfile::TempDir::new() {
        Ok(d) => d,
        Err(_) => return,
    };
    let mut config = MountConfig::default();
    config.format = format;
    config.block_size = 512;
    config.cache_path = Some(dir.path().join("fuzz.cache"));
    config.sync_writes = false;

    let source = Arc::new(MemImage::new(vec![0xF0; 20_000]));
    let session = match MountSession::mount(&config, source) {
        Ok(s) => s,
        Err(_) => return,
    };
    let size = session.virtual_size();

    for op in ops.iter().take(32) {
        match op {
            ImageOp::Read { offset, len } => {
                let data = session.read(*offset as u64, *len as usize).unwrap();
                assert!(data.len() <= *len as usize);
            }
            ImageOp::Write { offset, data } => {
                let offset = *offset as u64;
                match session.write(offset, data) {
                    Ok(written) => {
                        assert_eq!(session.read(offset, written).unwrap(), data[..written].to_vec());
                    }
                    Err(_) => assert!(offset >= size && !data.is_empty()),
                }
            }
        }
    }
});
