//! Source backends
//!
//! Backends turn input files into a [`MorphedImage`]. The set of backends is
//! fixed at compile time and looked up by input type name.

use crate::config::SourceConfig;
use crate::error::{Result, VirtImgError};
use crate::source::{CombinedImage, FileImage, MorphedImage, OffsetImage};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Opens input files of one family of formats
pub trait SourceBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Input type names this backend answers to
    fn supported_types(&self) -> &'static [&'static str];

    /// Open `paths` as one image (the files are concatenated in order)
    fn open(&self, paths: &[PathBuf]) -> Result<Arc<dyn MorphedImage>>;
}

/// Raw (dd) image files, optionally split into several segments
#[derive(Debug, Default, Clone, Copy)]
pub struct RawBackend;

impl SourceBackend for RawBackend {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn supported_types(&self) -> &'static [&'static str] {
        &["raw", "dd"]
    }

    fn open(&self, paths: &[PathBuf]) -> Result<Arc<dyn MorphedImage>> {
        let mut parts: Vec<Arc<dyn MorphedImage>> = Vec::with_capacity(paths.len());
        for path in paths {
            parts.push(Arc::new(FileImage::open(path)?));
        }

        match parts.len() {
            0 => Err(VirtImgError::Config("no input files given".to_string())),
            1 => Ok(parts.remove(0)),
            _ => Ok(Arc::new(CombinedImage::new(parts))),
        }
    }
}

/// Lookup table of source backends
pub struct SourceRegistry {
    backends: Vec<Box<dyn SourceBackend>>,
}

impl SourceRegistry {
    /// Empty registry
    pub fn new() -> Self {
        SourceRegistry {
            backends: Vec::new(),
        }
    }

    /// Registry with every built-in backend
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(RawBackend));
        registry
    }

    pub fn register(&mut self, backend: Box<dyn SourceBackend>) {
        debug!("Registered source backend '{}'", backend.name());
        self.backends.push(backend);
    }

    /// Backend handling `input_type` (case-insensitive)
    pub fn backend_for(&self, input_type: &str) -> Option<&dyn SourceBackend> {
        let wanted = input_type.to_ascii_lowercase();
        self.backends
            .iter()
            .find(|b| b.supported_types().iter().any(|t| *t == wanted))
            .map(|b| b.as_ref())
    }

    /// Every input type name any backend accepts
    pub fn supported_types(&self) -> Vec<&'static str> {
        self.backends
            .iter()
            .flat_map(|b| b.supported_types().iter().copied())
            .collect()
    }

    /// Open `paths` with the backend for `input_type`, skipping `offset` leading bytes
    pub fn open(
        &self,
        input_type: &str,
        paths: &[PathBuf],
        offset: u64,
    ) -> Result<Arc<dyn MorphedImage>> {
        let backend = self
            .backend_for(input_type)
            .ok_or_else(|| VirtImgError::UnknownSource(input_type.to_string()))?;

        let image = backend.open(paths)?;
        info!(
            "Opened {} input file(s) with backend '{}' ({} bytes)",
            paths.len(),
            backend.name(),
            image.size()
        );

        if offset == 0 {
            return Ok(image);
        }
        Ok(Arc::new(OffsetImage::new(image, offset)?))
    }

    pub fn open_config(&self, config: &SourceConfig) -> Result<Arc<dyn MorphedImage>> {
        self.open(&config.input_type, &config.paths, config.offset)
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
