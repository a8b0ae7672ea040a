//! # virtimg - Writable virtual views of forensic disk images
//!
//! `virtimg` presents a read-only disk image as a virtual Raw, VDI or VHD image
//! without copying it. The virtual image can be written to: every write lands in
//! an append-only cache file, and the evidence itself is never modified.
//!
//! - **Format emulation**: a fixed VDI header or VHD footer is synthesized around
//!   the source data
//! - **Copy-on-write cache** with a fixed block index, persistent across mounts
//! - **Thread-safe sessions** serializing all image I/O behind one lock
//! - **POSIX bridge** returning byte counts or negative errno values
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use virtimg::{FormatKind, Result, VirtualImageBuilder};
//!
//! # fn main() -> Result<()> {
//! let image = VirtualImageBuilder::new()
//!     .input("/evidence/disk.dd")
//!     .format(FormatKind::Vdi)
//!     .cache("/tmp/disk.cache")
//!     .build()?;
//!
//! // The first 512 bytes are the synthesized VDI preamble
//! let header = image.read(0, 512)?;
//!
//! // Writes go to the cache, never to disk.dd
//! image.write(1024 * 1024, b"patched")?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │ MountSession (image lock, info lock)       │
//! ├────────────────────────────────────────────┤
//! │ VirtualImageIo                             │
//! │   header/footer spans ─► region slots      │
//! │   body spans ─► cache blocks or source     │
//! ├──────────────────────┬─────────────────────┤
//! │ CacheStore           │ MorphedImage        │
//! │ (append-only file)   │ (read-only source)  │
//! └──────────────────────┴─────────────────────┘
//! ```

pub mod core;

// Re-export core modules internally so crate:: paths in core resolve
#[allow(unused_imports)]
pub(crate) use self::core::{
    cache, config, error, format, image_io, info, registry, session, source,
};

pub use crate::core::{
    cache::{CacheOpenMode, CacheStats, CacheStore, RegionSizes},
    config::{MountConfig, SourceConfig, DEFAULT_BLOCK_SIZE},
    error::{Result, VirtImgError},
    format::{FormatKind, ImageIdentity, VirtualImageFormat, VirtualLayout},
    image_io::VirtualImageIo,
    registry::{RawBackend, SourceBackend, SourceRegistry},
    session::MountSession,
    source::{CombinedImage, FileImage, MemImage, MorphedImage, OffsetImage},
};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Crate version, stamped into synthesized metadata
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// High-level handle on a mounted virtual image
///
/// A thin, cloneable wrapper around an `Arc<MountSession>`; clones share the
/// same image and cache.
///
/// # Examples
///
/// ```rust,no_run
/// use virtimg::{MountConfig, VirtualImage};
///
/// # fn main() -> virtimg::Result<()> {
/// let config = MountConfig::from_file("mount.toml")?;
/// let image = VirtualImage::open(&config)?;
/// println!("{} bytes", image.size());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct VirtualImage {
    session: Arc<MountSession>,
}

impl VirtualImage {
    /// Open the inputs named in `config` and mount them
    pub fn open(config: &MountConfig) -> Result<Self> {
        info!("Opening virtual image from {} input(s)", config.source.paths.len());
        let session = MountSession::open(config)?;
        Ok(VirtualImage {
            session: Arc::new(session),
        })
    }

    /// Mount an already opened source image
    pub fn mount(config: &MountConfig, source: Arc<dyn MorphedImage>) -> Result<Self> {
        let session = MountSession::mount(config, source)?;
        Ok(VirtualImage {
            session: Arc::new(session),
        })
    }

    /// Virtual image size in bytes
    pub fn size(&self) -> u64 {
        self.session.virtual_size()
    }

    pub fn format(&self) -> FormatKind {
        self.session.format()
    }

    pub fn is_read_only(&self) -> bool {
        self.session.is_read_only()
    }

    /// Read up to `len` bytes at `offset`
    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        debug!("Reading {} bytes at {}", len, offset);
        self.session.read(offset, len)
    }

    /// Write `data` at `offset`, returning the number of bytes written
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<usize> {
        debug!("Writing {} bytes at {}", data.len(), offset);
        self.session.write(offset, data)
    }

    /// Mount info text
    pub fn info_text(&self) -> String {
        String::from_utf8_lossy(&self.session.read_info(0, usize::MAX)).into_owned()
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.session.cache_stats()
    }

    /// Shared session, for handing to a filesystem layer
    pub fn session(&self) -> &Arc<MountSession> {
        &self.session
    }
}

/// Builder for [`VirtualImage`]
///
/// # Examples
///
/// ```rust,no_run
/// use virtimg::{FormatKind, VirtualImageBuilder};
///
/// # fn main() -> virtimg::Result<()> {
/// let image = VirtualImageBuilder::new()
///     .input("/evidence/disk.001")
///     .input("/evidence/disk.002")
///     .format(FormatKind::Vhd)
///     .cache("/tmp/disk.cache")
///     .block_size(64 * 1024)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct VirtualImageBuilder {
    config: MountConfig,
    source: Option<Arc<dyn MorphedImage>>,
}

impl VirtualImageBuilder {
    pub fn new() -> Self {
        VirtualImageBuilder {
            config: MountConfig::default(),
            source: None,
        }
    }

    /// Start from an existing configuration
    pub fn from_config(config: MountConfig) -> Self {
        VirtualImageBuilder {
            config,
            source: None,
        }
    }

    /// Append an input file
    pub fn input<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config.source.paths.push(path.into());
        self
    }

    /// Input type of the files added with [`input`](Self::input)
    pub fn input_type<S: Into<String>>(mut self, input_type: S) -> Self {
        self.config.source.input_type = input_type.into();
        self
    }

    /// Skip `offset` leading bytes of the input
    pub fn input_offset(mut self, offset: u64) -> Self {
        self.config.source.offset = offset;
        self
    }

    /// Use an already opened image instead of input files
    pub fn source(mut self, source: Arc<dyn MorphedImage>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn format(mut self, format: FormatKind) -> Self {
        self.config.format = format;
        self
    }

    /// Enable writes, cached in `path`
    pub fn cache<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.cache_path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn block_size(mut self, block_size: u64) -> Self {
        self.config.block_size = block_size;
        self
    }

    /// Discard any existing cache content at mount
    pub fn overwrite_cache(mut self) -> Self {
        self.config.overwrite_cache = true;
        self
    }

    /// Skip forcing cache writes to stable storage
    pub fn without_sync(mut self) -> Self {
        self.config.sync_writes = false;
        self
    }

    pub fn build(self) -> Result<VirtualImage> {
        info!("Building {} virtual image", self.config.format);
        match self.source {
            Some(source) => VirtualImage::mount(&self.config, source),
            None => VirtualImage::open(&self.config),
        }
    }
}

impl Default for VirtualImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}
