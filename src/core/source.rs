//! Read-only source images
//!
//! A [`MorphedImage`] is the fixed-size logical byte array the virtual image is
//! built on top of. It is produced by opening one or more evidence files and
//! optionally combining them; the virtual image layer only ever reads from it.

use crate::error::{Result, VirtImgError};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Amount of leading source data hashed to derive a stable creation id (10 MiB)
pub const HASH_AMOUNT: u64 = 10 * 1024 * 1024;

/// Read-only, fixed-size logical image
pub trait MorphedImage: Send + Sync {
    /// Size of the image in bytes
    fn size(&self) -> u64;

    /// Read exactly `len` bytes at `offset`
    ///
    /// Fails with [`VirtImgError::SourceRead`] if the range exceeds [`size`](Self::size)
    /// or the underlying source cannot be read.
    fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>>;

    /// Human-readable description lines for the image info file
    fn info_text(&self) -> Option<String> {
        None
    }
}

pub(crate) fn check_range(offset: u64, len: usize, size: u64) -> Result<()> {
    match offset.checked_add(len as u64) {
        Some(end) if end <= size => Ok(()),
        _ => Err(VirtImgError::source_read(
            offset,
            len,
            format!("range exceeds image size {}", size),
        )),
    }
}

/// SHA-256 over the first [`HASH_AMOUNT`] bytes of `image`, truncated to 128 bits
pub fn content_hash(image: &dyn MorphedImage) -> Result<[u8; 16]> {
    let amount = image.size().min(HASH_AMOUNT) as usize;
    let data = image.read(0, amount)?;
    let digest = Sha256::digest(&data);

    let mut hash = [0u8; 16];
    hash.copy_from_slice(&digest[..16]);
    debug!("Hashed {} leading bytes of source image", amount);
    Ok(hash)
}

/// In-memory image
#[derive(Debug, Clone)]
pub struct MemImage {
    data: Arc<Vec<u8>>,
}

impl MemImage {
    pub fn new(data: Vec<u8>) -> Self {
        MemImage {
            data: Arc::new(data),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl MorphedImage for MemImage {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        check_range(offset, len, self.size())?;
        let start = offset as usize;
        Ok(self.data[start..start + len].to_vec())
    }

    fn info_text(&self) -> Option<String> {
        Some(format!("In-memory image: {} bytes\n", self.data.len()))
    }
}

/// Raw (dd) image file
pub struct FileImage {
    file: Mutex<File>,
    path: PathBuf,
    size: u64,
}

impl FileImage {
    /// Open a raw image file read-only
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let open_err =
            |e: std::io::Error| VirtImgError::source_read(0, 0, format!("{}: {}", path.display(), e));

        let file = File::open(&path).map_err(open_err)?;
        let size = file.metadata().map_err(open_err)?.len();
        debug!("Opened raw image {:?} ({} bytes)", path, size);

        Ok(FileImage {
            file: Mutex::new(file),
            path,
            size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MorphedImage for FileImage {
    fn size(&self) -> u64 {
        self.size
    }

    fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        check_range(offset, len, self.size)?;

        let mut buffer = vec![0u8; len];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.read_exact(&mut buffer))
            .map_err(|e| {
                VirtImgError::source_read(offset, len, format!("{}: {}", self.path.display(), e))
            })?;

        Ok(buffer)
    }

    fn info_text(&self) -> Option<String> {
        Some(format!(
            "Raw image file: {}\nSize: {} bytes\n",
            self.path.display(),
            self.size
        ))
    }
}

/// Concatenation of several images into one address space
pub struct CombinedImage {
    parts: Vec<Arc<dyn MorphedImage>>,
    /// Start offset of each part
    starts: Vec<u64>,
    size: u64,
}

impl CombinedImage {
    pub fn new(parts: Vec<Arc<dyn MorphedImage>>) -> Self {
        let mut starts = Vec::with_capacity(parts.len());
        let mut size = 0u64;
        for part in &parts {
            starts.push(size);
            size += part.size();
        }

        CombinedImage {
            parts,
            starts,
            size,
        }
    }

    pub fn part_count(&self) -> usize {
        self.parts.len()
    }
}

impl MorphedImage for CombinedImage {
    fn size(&self) -> u64 {
        self.size
    }

    fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        check_range(offset, len, self.size)?;

        let mut out = Vec::with_capacity(len);
        let mut pos = offset;
        let end = offset + len as u64;

        // Last part whose start is <= pos
        let mut idx = self.starts.partition_point(|&s| s <= pos).saturating_sub(1);
        while pos < end {
            let part = &self.parts[idx];
            let local = pos - self.starts[idx];
            let avail = part.size() - local;
            let chunk = avail.min(end - pos);
            if chunk > 0 {
                out.extend_from_slice(&part.read(local, chunk as usize)?);
                pos += chunk;
            }
            idx += 1;
        }

        Ok(out)
    }

    fn info_text(&self) -> Option<String> {
        let mut text = format!("Combined image of {} parts\n", self.parts.len());
        for part in &self.parts {
            if let Some(part_text) = part.info_text() {
                text.push_str(&part_text);
            }
        }
        Some(text)
    }
}

/// Inner image with a number of leading bytes skipped
pub struct OffsetImage {
    inner: Arc<dyn MorphedImage>,
    offset: u64,
}

impl OffsetImage {
    pub fn new(inner: Arc<dyn MorphedImage>, offset: u64) -> Result<Self> {
        if offset > inner.size() {
            return Err(VirtImgError::Config(format!(
                "input offset {} exceeds input size {}",
                offset,
                inner.size()
            )));
        }
        Ok(OffsetImage { inner, offset })
    }
}

impl MorphedImage for OffsetImage {
    fn size(&self) -> u64 {
        self.inner.size() - self.offset
    }

    fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        check_range(offset, len, self.size())?;
        self.inner.read(offset + self.offset, len)
    }

    fn info_text(&self) -> Option<String> {
        let mut text = self.inner.info_text().unwrap_or_default();
        text.push_str(&format!("Input offset: {} bytes\n", self.offset));
        Some(text)
    }
}
