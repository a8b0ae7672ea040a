//! Mounted virtual image
//!
//! A [`MountSession`] owns everything one mount needs and is handed to the
//! filesystem layer by reference (typically `Arc<MountSession>`). All image
//! reads and writes go through a single lock, so requests from concurrent
//! filesystem threads are applied one at a time. The info file has its own
//! lock.

use crate::cache::{CacheStats, CacheStore, RegionSizes};
use crate::config::MountConfig;
use crate::error::{Result, VirtImgError};
use crate::format::{FormatKind, ImageIdentity, VirtualLayout};
use crate::image_io::VirtualImageIo;
use crate::info::InfoFile;
use crate::registry::SourceRegistry;
use crate::source::MorphedImage;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};

pub struct MountSession {
    image: Mutex<VirtualImageIo>,
    info: InfoFile,
    identity: ImageIdentity,
    kind: FormatKind,
    virtual_size: u64,
}

impl MountSession {
    /// Mount `source` as configured by `config`
    ///
    /// `config.source` is ignored; see [`open`](Self::open) to open the inputs too.
    pub fn mount(config: &MountConfig, source: Arc<dyn MorphedImage>) -> Result<Self> {
        config.check()?;

        let morphed_size = source.size();
        let identity = ImageIdentity::derive(source.as_ref())?;
        let layout = VirtualLayout::synthesize(config.format, morphed_size, &identity)?;

        let cache = match &config.cache_path {
            Some(path) => {
                let mut store = CacheStore::open_with(
                    path,
                    morphed_size,
                    config.block_size,
                    RegionSizes::of(&layout),
                    config.cache_open_mode(),
                )?;
                store.set_sync_writes(config.sync_writes);
                Some(store)
            }
            None => None,
        };

        info!(
            "Mounted {} bytes as {} image of {} bytes ({})",
            morphed_size,
            config.format,
            layout.virtual_size(),
            if cache.is_some() { "read-write" } else { "read-only" }
        );

        Ok(Self::from_parts(VirtualImageIo::new(layout, source, cache), identity))
    }

    /// Open the configured inputs with the built-in backends and mount them
    pub fn open(config: &MountConfig) -> Result<Self> {
        config.check()?;
        config.source.check()?;
        let source = SourceRegistry::with_defaults().open_config(&config.source)?;
        Self::mount(config, source)
    }

    /// Wrap an already assembled image
    pub fn from_parts(io: VirtualImageIo, identity: ImageIdentity) -> Self {
        let stats = io.cache().map(|c| c.stats());
        let info = InfoFile::compose(io.source().as_ref(), io.layout(), &identity, stats.as_ref());

        MountSession {
            kind: io.layout().kind(),
            virtual_size: io.virtual_size(),
            image: Mutex::new(io),
            info,
            identity,
        }
    }

    pub fn virtual_size(&self) -> u64 {
        self.virtual_size
    }

    pub fn format(&self) -> FormatKind {
        self.kind
    }

    pub fn identity(&self) -> &ImageIdentity {
        &self.identity
    }

    pub fn is_read_only(&self) -> bool {
        self.image.lock().is_read_only()
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.image.lock().cache().map(|c| c.stats())
    }

    /// Read up to `len` bytes of the virtual image at `offset`
    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.image.lock().read(offset, len)
    }

    /// Write `buf` to the virtual image at `offset`
    pub fn write(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        self.image.lock().write(offset, buf)
    }

    pub fn info_size(&self) -> u64 {
        self.info.size()
    }

    pub fn read_info(&self, offset: u64, len: usize) -> Vec<u8> {
        self.info.read(offset, len)
    }

    /// Filesystem read: fills `buf`, returns bytes read or a negative errno
    pub fn fs_read(&self, offset: u64, buf: &mut [u8]) -> i32 {
        match self.read(offset, buf.len()) {
            Ok(data) => {
                buf[..data.len()].copy_from_slice(&data);
                clamp_count(data.len())
            }
            Err(e) => errno_of("read", offset, e),
        }
    }

    /// Filesystem write: returns bytes written or a negative errno
    pub fn fs_write(&self, offset: u64, buf: &[u8]) -> i32 {
        match self.write(offset, buf) {
            Ok(written) => clamp_count(written),
            Err(e) => errno_of("write", offset, e),
        }
    }
}

fn clamp_count(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

fn errno_of(op: &str, offset: u64, e: VirtImgError) -> i32 {
    warn!("Virtual image {} at {} failed: {}", op, offset, e);
    e.errno()
}
