#![no_main]
use libfuzzer_sys::fuzz_target;
use virtimg::CacheStore;

// Opening arbitrary bytes as a cache must fail cleanly or yield a usable store
fuzz_target!(|input: &[u8]| {
    let dir = match tempfile::TempDir::new() {
        Ok(d) => d,
        Err(_) => return,
    };
    let path = dir.path().join("fuzz.cache");
    if std::fs::write(&path, input).is_err() {
        return;
    }

    if let Ok(mut store) = CacheStore::open_or_create(&path, 8192, 512) {
        for block in store.assigned_blocks() {
            let _ = store.read_block(block, 0, 512);
        }
    }
});
