//! Mount configuration
//!
//! A [`MountConfig`] describes one mount: which source files to open, how to
//! present them and where (if anywhere) writes are cached. It can be built in
//! code or loaded from TOML:
//!
//! ```toml
//! format = "vdi"
//! cache_path = "/var/cache/evidence.cache"
//! block_size = 1048576
//!
//! [source]
//! input_type = "raw"
//! paths = ["/evidence/disk.dd"]
//! ```

use crate::cache::CacheOpenMode;
use crate::error::{Result, VirtImgError};
use crate::format::FormatKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use validator::Validate;

pub const DEFAULT_BLOCK_SIZE: u64 = 1024 * 1024;
pub const MIN_BLOCK_SIZE: u64 = 512;
pub const MAX_BLOCK_SIZE: u64 = 256 * 1024 * 1024;

/// Where the morphed image comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SourceConfig {
    /// Name of the source backend ("raw", "dd")
    #[validate(length(min = 1))]
    pub input_type: String,

    /// Input files, concatenated in order
    #[validate(length(min = 1, message = "at least one input path is required"))]
    pub paths: Vec<PathBuf>,

    /// Leading bytes of the input to skip
    pub offset: u64,
}

impl SourceConfig {
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| VirtImgError::Config(e.to_string()))
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig {
            input_type: "raw".to_string(),
            paths: Vec::new(),
            offset: 0,
        }
    }
}

/// Settings of one mount
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MountConfig {
    /// Emulated container format
    pub format: FormatKind,

    /// Cache file receiving writes; `None` mounts read-only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_path: Option<PathBuf>,

    /// Cache block size, a power of two
    #[validate(range(min = 512, max = 268435456))]
    pub block_size: u64,

    /// Discard an existing cache instead of reusing it
    pub overwrite_cache: bool,

    /// Force every cache mutation to stable storage before returning
    pub sync_writes: bool,

    /// Inputs; checked separately by [`SourceConfig::check`]
    pub source: SourceConfig,
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            format: FormatKind::Raw,
            cache_path: None,
            block_size: DEFAULT_BLOCK_SIZE,
            overwrite_cache: false,
            sync_writes: true,
            source: SourceConfig::default(),
        }
    }
}

impl MountConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: MountConfig =
            toml::from_str(text).map_err(|e| VirtImgError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(&path).map_err(|e| {
            VirtImgError::Config(format!("{}: {}", path.as_ref().display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| VirtImgError::Config(e.to_string()))
    }

    /// Validate the mount settings (the inputs are checked when opened)
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| VirtImgError::Config(e.to_string()))?;

        if !self.block_size.is_power_of_two() {
            return Err(VirtImgError::Config(format!(
                "block size {} is not a power of two",
                self.block_size
            )));
        }
        Ok(())
    }

    pub fn is_read_only(&self) -> bool {
        self.cache_path.is_none()
    }

    pub fn cache_open_mode(&self) -> CacheOpenMode {
        if self.overwrite_cache {
            CacheOpenMode::Overwrite
        } else {
            CacheOpenMode::OpenOrCreate
        }
    }
}
