//! Virtual image read/write routing
//!
//! Requests against the virtual image are split into header, body and footer
//! spans. Header and footer bytes come from the cache slot once written, from
//! the synthesized record otherwise. Body bytes come from the cache block once
//! written, from the source image otherwise.

use crate::cache::CacheStore;
use crate::error::{Result, VirtImgError};
use crate::format::{Region, SpecialRegion, VirtualLayout};
use crate::source::MorphedImage;
use std::sync::Arc;
use tracing::debug;

/// Byte-addressable virtual image over a source and an optional cache
pub struct VirtualImageIo {
    layout: VirtualLayout,
    source: Arc<dyn MorphedImage>,
    cache: Option<CacheStore>,
}

impl VirtualImageIo {
    /// Bind `layout` to `source`; without a cache the image is read-only
    pub fn new(layout: VirtualLayout, source: Arc<dyn MorphedImage>, cache: Option<CacheStore>) -> Self {
        VirtualImageIo {
            layout,
            source,
            cache,
        }
    }

    pub fn layout(&self) -> &VirtualLayout {
        &self.layout
    }

    pub fn source(&self) -> &Arc<dyn MorphedImage> {
        &self.source
    }

    pub fn cache(&self) -> Option<&CacheStore> {
        self.cache.as_ref()
    }

    pub fn virtual_size(&self) -> u64 {
        self.layout.virtual_size()
    }

    pub fn is_read_only(&self) -> bool {
        self.cache.is_none()
    }

    /// Read up to `len` bytes at `offset`
    ///
    /// The request is clamped to the virtual size; reads at or past the end
    /// return nothing.
    pub fn read(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let spans = self.layout.spans(offset, len);
        let total: usize = spans.iter().map(|s| s.len).sum();
        let mut out = Vec::with_capacity(total);

        for span in spans {
            match span.region {
                Region::Header(local) => {
                    out.extend_from_slice(&self.read_region(SpecialRegion::Header, local, span.len)?)
                }
                Region::Footer(local) => {
                    out.extend_from_slice(&self.read_region(SpecialRegion::Footer, local, span.len)?)
                }
                Region::Body(body_offset) => {
                    out.extend_from_slice(&self.read_body(body_offset, span.len)?)
                }
            }
        }

        Ok(out)
    }

    /// Write `buf` at `offset`, returning the number of bytes written
    ///
    /// Writes that run past the end are truncated to the virtual size.
    pub fn write(&mut self, offset: u64, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let size = self.virtual_size();
        if offset >= size {
            return Err(VirtImgError::OutOfBounds { offset, size });
        }
        if self.cache.is_none() {
            return Err(VirtImgError::ReadOnly);
        }

        let spans = self.layout.spans(offset, buf.len());
        let mut written = 0;
        for span in spans {
            let data = &buf[span.buf_offset..span.buf_offset + span.len];
            match span.region {
                Region::Header(local) => self.write_region(SpecialRegion::Header, local, data)?,
                Region::Footer(local) => self.write_region(SpecialRegion::Footer, local, data)?,
                Region::Body(body_offset) => self.write_body(body_offset, data)?,
            }
            written += span.len;
        }

        Ok(written)
    }

    fn read_region(&mut self, region: SpecialRegion, local: u64, len: usize) -> Result<Vec<u8>> {
        if let Some(cache) = self.cache.as_mut() {
            if let Some(data) = cache.read_region(region, local, len)? {
                return Ok(data);
            }
        }
        let start = local as usize;
        Ok(self.layout.region_bytes(region)[start..start + len].to_vec())
    }

    fn write_region(&mut self, region: SpecialRegion, local: u64, data: &[u8]) -> Result<()> {
        let cache = self.cache.as_mut().ok_or(VirtImgError::ReadOnly)?;
        debug!("Writing {} bytes to {:?} at {}", data.len(), region, local);
        cache.write_region(region, local, data, self.layout.region_bytes(region))
    }

    fn read_body(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let cache = match self.cache.as_mut() {
            Some(cache) => cache,
            None => return self.source.read(offset, len),
        };

        let block_size = cache.block_size();
        let mut out = Vec::with_capacity(len);
        let mut pos = offset;
        let end = offset + len as u64;

        while pos < end {
            let block = pos / block_size;
            let local = pos % block_size;
            let chunk = (block_size - local).min(end - pos) as usize;

            match cache.read_block(block, local, chunk)? {
                Some(data) => out.extend_from_slice(&data),
                None => out.extend_from_slice(&self.source.read(pos, chunk)?),
            }
            pos += chunk as u64;
        }

        Ok(out)
    }

    fn write_body(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let cache = self.cache.as_mut().ok_or(VirtImgError::ReadOnly)?;
        let block_size = cache.block_size();

        let mut done = 0usize;
        while done < data.len() {
            let pos = offset + done as u64;
            let block = pos / block_size;
            let local = pos % block_size;
            let chunk = ((block_size - local) as usize).min(data.len() - done);

            debug!("Writing {} bytes to block {} at {}", chunk, block, local);
            cache.write_block(block, local, &data[done..done + chunk], &*self.source)?;
            done += chunk;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheOpenMode, RegionSizes};
    use crate::format::{FormatKind, ImageIdentity};
    use crate::source::MemImage;
    use chrono::Utc;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn identity() -> ImageIdentity {
        ImageIdentity {
            creation_id: Uuid::from_u128(11),
            modification_id: Uuid::from_u128(12),
            created_at: Utc::now(),
        }
    }

    fn image(kind: FormatKind, data: Vec<u8>, cache: Option<&TempDir>) -> VirtualImageIo {
        let size = data.len() as u64;
        let layout = VirtualLayout::synthesize(kind, size, &identity()).unwrap();
        let cache = cache.map(|dir| {
            let regions = RegionSizes::of(&layout);
            CacheStore::open_with(dir.path().join("c"), size, 512, regions, CacheOpenMode::OpenOrCreate)
                .unwrap()
        });
        VirtualImageIo::new(layout, Arc::new(MemImage::new(data)), cache)
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let mut io = image(FormatKind::Raw, vec![1; 1024], None);
        assert!(io.is_read_only());
        assert!(matches!(io.write(0, b"x"), Err(VirtImgError::ReadOnly)));
        assert_eq!(io.write(0, b"").unwrap(), 0);
        assert_eq!(io.read(1000, 100).unwrap(), vec![1; 24]);
    }

    #[test]
    fn test_write_past_end() {
        let dir = TempDir::new().unwrap();
        let mut io = image(FormatKind::Raw, vec![0; 1024], Some(&dir));
        assert!(matches!(
            io.write(1024, b"x"),
            Err(VirtImgError::OutOfBounds { .. })
        ));
        assert_eq!(io.write(1020, b"abcdefgh").unwrap(), 4);
        assert_eq!(io.read(1016, 100).unwrap(), b"\0\0\0\0abcd".to_vec());
    }

    #[test]
    fn test_vhd_footer_write_is_cached() {
        let dir = TempDir::new().unwrap();
        let mut io = image(FormatKind::Vhd, vec![0; 1024], Some(&dir));
        let original = io.layout().footer_bytes().to_vec();

        assert_eq!(io.write(1020, b"ABCDEFGH").unwrap(), 8);
        let footer = io.read(1024, 512).unwrap();
        assert_eq!(&footer[..4], b"EFGH");
        assert_eq!(&footer[4..], &original[4..]);
        assert!(io.cache().unwrap().stats().footer_cached);
        assert_eq!(io.read(1020, 4).unwrap(), b"ABCD".to_vec());
    }

    #[test]
    fn test_vdi_header_reads_synthesized_bytes() {
        let mut io = image(FormatKind::Vdi, vec![9; 4096], None);
        let header = io.layout().header_bytes().to_vec();
        assert_eq!(io.read(0, header.len()).unwrap(), header);
        assert_eq!(io.read(header.len() as u64, 4).unwrap(), vec![9; 4]);
    }
}
