//! Disk I/O for cache files

use super::header::{CacheHeader, CACHE_HEADER_SIZE};
use crate::error::Result;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Disk-backed cache file
pub struct CacheFile {
    file: File,
    path: PathBuf,
    len: u64,
    sync_writes: bool,
}

impl CacheFile {
    /// Open `path` read-write, creating it if missing
    ///
    /// With `truncate` any existing content is discarded.
    pub fn open<P: AsRef<Path>>(path: P, truncate: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(truncate)
            .open(&path)?;
        let len = file.metadata()?.len();

        Ok(CacheFile {
            file,
            path: path.as_ref().to_path_buf(),
            len,
            sync_writes: true,
        })
    }

    /// Toggle forcing data to stable storage after every mutation
    pub fn set_sync_writes(&mut self, sync: bool) {
        self.sync_writes = sync;
    }

    /// Current file length
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the header record without validating it beyond identification
    pub fn read_header(&mut self) -> Result<CacheHeader> {
        let buffer = self.read_at(0, CACHE_HEADER_SIZE)?;
        CacheHeader::from_bytes(&buffer)
    }

    /// Rewrite the header record
    pub fn write_header(&mut self, header: &CacheHeader) -> Result<()> {
        self.write_at(0, &header.to_bytes())
    }

    /// Read exactly `len` bytes at `offset`
    pub fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; len];
        self.file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// Write `data` at `offset`
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        self.file.flush()?;
        self.len = self.len.max(offset + data.len() as u64);
        Ok(())
    }

    /// Append `data` at the end of the file, returning where it landed
    pub fn append(&mut self, data: &[u8]) -> Result<u64> {
        let offset = self.len;
        self.write_at(offset, data)?;
        Ok(offset)
    }

    /// Force written data to stable storage, if enabled
    pub fn sync(&mut self) -> Result<()> {
        if self.sync_writes {
            self.file.sync_data()?;
        }
        Ok(())
    }
}
