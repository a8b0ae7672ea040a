//! Virtual image formats
//!
//! The virtual image is the morphed image wrapped in whatever metadata the
//! emulated container needs:
//!
//! ```text
//! Raw: [ body                         ]
//! VDI: [ header ][ body               ]
//! VHD: [ body               ][ footer ]
//! ```
//!
//! Header and footer bytes are synthesized once at mount time. [`VirtualLayout`]
//! maps virtual offsets onto those regions and the body.

pub mod vdi;
pub mod vhd;

use crate::error::{Result, VirtImgError};
use crate::source::{content_hash, MorphedImage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub use vdi::VdiHeader;
pub use vhd::{ChsGeometry, VhdFooter};

/// Emulated container type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatKind {
    #[serde(alias = "dd")]
    Raw,
    Vdi,
    Vhd,
}

impl FormatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FormatKind::Raw => "raw",
            FormatKind::Vdi => "vdi",
            FormatKind::Vhd => "vhd",
        }
    }

    /// File extension conventionally used for the virtual image
    pub fn extension(&self) -> &'static str {
        match self {
            FormatKind::Raw => "dd",
            FormatKind::Vdi => "vdi",
            FormatKind::Vhd => "vhd",
        }
    }
}

impl fmt::Display for FormatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FormatKind {
    type Err = VirtImgError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "raw" | "dd" => Ok(FormatKind::Raw),
            "vdi" => Ok(FormatKind::Vdi),
            "vhd" => Ok(FormatKind::Vhd),
            other => Err(VirtImgError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// Identifiers stamped into synthesized metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageIdentity {
    /// Derived from source content, stable across mounts
    pub creation_id: Uuid,
    /// Random per mount
    pub modification_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl ImageIdentity {
    /// Derive the identity of a mount of `image`
    pub fn derive(image: &dyn MorphedImage) -> Result<Self> {
        Ok(ImageIdentity {
            creation_id: Uuid::from_bytes(content_hash(image)?),
            modification_id: Uuid::from_bytes(rand::random()),
            created_at: Utc::now(),
        })
    }
}

/// Container-specific metadata record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VirtualImageFormat {
    Raw,
    Vdi(VdiHeader),
    Vhd(VhdFooter),
}

impl VirtualImageFormat {
    /// Synthesize the metadata record for `kind` over `morphed_size` bytes
    pub fn synthesize(kind: FormatKind, morphed_size: u64, identity: &ImageIdentity) -> Result<Self> {
        Ok(match kind {
            FormatKind::Raw => VirtualImageFormat::Raw,
            FormatKind::Vdi => VirtualImageFormat::Vdi(VdiHeader::fixed(
                morphed_size,
                identity.creation_id,
                identity.modification_id,
            )?),
            FormatKind::Vhd => VirtualImageFormat::Vhd(VhdFooter::fixed(
                morphed_size,
                identity.creation_id,
                identity.created_at,
            )),
        })
    }

    pub fn kind(&self) -> FormatKind {
        match self {
            VirtualImageFormat::Raw => FormatKind::Raw,
            VirtualImageFormat::Vdi(_) => FormatKind::Vdi,
            VirtualImageFormat::Vhd(_) => FormatKind::Vhd,
        }
    }
}

/// Region of the virtual image that has its own cache slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecialRegion {
    Header,
    Footer,
}

/// Classification of a single virtual offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    /// Offset within the synthesized header
    Header(u64),
    /// Offset within the morphed image
    Body(u64),
    /// Offset within the synthesized footer
    Footer(u64),
}

/// Contiguous piece of a request that falls into one region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    /// Region and local offset of the span start
    pub region: Region,
    /// Offset of the span within the caller's buffer
    pub buf_offset: usize,
    pub len: usize,
}

/// Format metadata bound to a morphed image size
#[derive(Debug, Clone)]
pub struct VirtualLayout {
    format: VirtualImageFormat,
    morphed_size: u64,
    header: Vec<u8>,
    footer: Vec<u8>,
}

impl VirtualLayout {
    pub fn new(format: VirtualImageFormat, morphed_size: u64) -> Self {
        let (header, footer) = match &format {
            VirtualImageFormat::Raw => (Vec::new(), Vec::new()),
            VirtualImageFormat::Vdi(h) => (h.to_header_bytes(), Vec::new()),
            VirtualImageFormat::Vhd(f) => (Vec::new(), f.to_bytes()),
        };

        VirtualLayout {
            format,
            morphed_size,
            header,
            footer,
        }
    }

    /// Synthesize the layout of a `kind` image over `morphed_size` bytes
    pub fn synthesize(kind: FormatKind, morphed_size: u64, identity: &ImageIdentity) -> Result<Self> {
        let format = VirtualImageFormat::synthesize(kind, morphed_size, identity)?;
        Ok(Self::new(format, morphed_size))
    }

    pub fn format(&self) -> &VirtualImageFormat {
        &self.format
    }

    pub fn kind(&self) -> FormatKind {
        self.format.kind()
    }

    pub fn morphed_size(&self) -> u64 {
        self.morphed_size
    }

    pub fn header_size(&self) -> u64 {
        self.header.len() as u64
    }

    pub fn footer_size(&self) -> u64 {
        self.footer.len() as u64
    }

    pub fn virtual_size(&self) -> u64 {
        self.header_size() + self.morphed_size + self.footer_size()
    }

    pub fn header_bytes(&self) -> &[u8] {
        &self.header
    }

    pub fn footer_bytes(&self) -> &[u8] {
        &self.footer
    }

    /// Synthesized bytes of a special region
    pub fn region_bytes(&self, region: SpecialRegion) -> &[u8] {
        match region {
            SpecialRegion::Header => &self.header,
            SpecialRegion::Footer => &self.footer,
        }
    }

    /// Classify an absolute virtual offset; `None` past the end of the image
    pub fn classify(&self, offset: u64) -> Option<Region> {
        let body_start = self.header_size();
        let footer_start = body_start + self.morphed_size;

        if offset < body_start {
            Some(Region::Header(offset))
        } else if offset < footer_start {
            Some(Region::Body(offset - body_start))
        } else if offset < self.virtual_size() {
            Some(Region::Footer(offset - footer_start))
        } else {
            None
        }
    }

    /// Split `[offset, offset + len)` into per-region spans in offset order
    ///
    /// The range is clamped to the virtual size first.
    pub fn spans(&self, offset: u64, len: usize) -> Vec<Span> {
        let size = self.virtual_size();
        if offset >= size || len == 0 {
            return Vec::new();
        }
        let end = offset.saturating_add(len as u64).min(size);

        let body_start = self.header_size();
        let footer_start = body_start + self.morphed_size;
        let bounds = [
            (0, body_start),
            (body_start, footer_start),
            (footer_start, size),
        ];

        let mut spans = Vec::with_capacity(3);
        for (start, stop) in bounds {
            let lo = offset.max(start);
            let hi = end.min(stop);
            if lo >= hi {
                continue;
            }
            let region = match self.classify(lo) {
                Some(region) => region,
                None => continue,
            };
            spans.push(Span {
                region,
                buf_offset: (lo - offset) as usize,
                len: (hi - lo) as usize,
            });
        }
        spans
    }
}
