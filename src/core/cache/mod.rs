//! Copy-on-write cache store
//!
//! Every byte written to the virtual image lands in the cache file; the source
//! image is never touched. Body writes are tracked per block through a fixed
//! index right after the header, header/footer writes through two region slots
//! inside the header. The file only ever grows: a block or region copy is
//! appended on its first write and overwritten in place afterwards.
//!
//! Ordering on first write of a block: data is appended and forced to stable
//! storage before its index entry is persisted, so a crash can leak an
//! unreferenced block but never leave an entry pointing at garbage.

pub mod header;
pub mod io;

use crate::error::{Result, VirtImgError};
use crate::format::{SpecialRegion, VirtualLayout};
use crate::source::MorphedImage;
use header::{BlockIndexEntry, CacheHeader, RegionSlot, CACHE_HEADER_SIZE, INDEX_ENTRY_SIZE};
use io::CacheFile;
use std::path::Path;
use tracing::{debug, info, warn};

/// How an existing cache file is treated at open time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheOpenMode {
    /// Reuse a valid cache, initialize an empty one
    #[default]
    OpenOrCreate,
    /// Discard any existing content first
    Overwrite,
}

/// Sizes of the header and footer regions a cache serves
///
/// A cached region copy must be exactly this long; a size of zero means the
/// image has no such region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegionSizes {
    pub header: u64,
    pub footer: u64,
}

impl RegionSizes {
    pub fn of(layout: &VirtualLayout) -> Self {
        RegionSizes {
            header: layout.header_size(),
            footer: layout.footer_size(),
        }
    }

    pub fn get(&self, region: SpecialRegion) -> u64 {
        match region {
            SpecialRegion::Header => self.header,
            SpecialRegion::Footer => self.footer,
        }
    }
}

/// Snapshot of cache usage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub block_size: u64,
    pub block_count: u64,
    pub assigned_blocks: u64,
    pub header_cached: bool,
    pub footer_cached: bool,
    pub file_size: u64,
}

/// Persistent overlay of modified blocks and regions
pub struct CacheStore {
    file: CacheFile,
    header: CacheHeader,
    index: Vec<BlockIndexEntry>,
    morphed_size: u64,
    regions: RegionSizes,
}

impl CacheStore {
    /// Open the cache of an image without header or footer, creating and
    /// initializing it if empty
    pub fn open_or_create<P: AsRef<Path>>(path: P, morphed_size: u64, block_size: u64) -> Result<Self> {
        Self::open_with(
            path,
            morphed_size,
            block_size,
            RegionSizes::default(),
            CacheOpenMode::OpenOrCreate,
        )
    }

    pub fn open_with<P: AsRef<Path>>(
        path: P,
        morphed_size: u64,
        block_size: u64,
        regions: RegionSizes,
        mode: CacheOpenMode,
    ) -> Result<Self> {
        if block_size == 0 {
            return Err(VirtImgError::Config("cache block size must be non-zero".to_string()));
        }
        let block_count = morphed_size.div_ceil(block_size);

        let mut file = CacheFile::open(&path, mode == CacheOpenMode::Overwrite)?;

        if file.is_empty() {
            let header = CacheHeader::new(block_size, block_count);
            let mut bytes = header.to_bytes();
            bytes.resize(header.data_start() as usize, 0);
            file.write_at(0, &bytes)?;
            file.sync()?;

            info!(
                "Created cache {:?}: {} blocks of {} bytes",
                path.as_ref(),
                block_count,
                block_size
            );

            return Ok(CacheStore {
                file,
                header,
                index: vec![BlockIndexEntry::default(); block_count as usize],
                morphed_size,
                regions,
            });
        }

        let (header, index) = Self::load(&mut file, block_size, block_count, regions)?;
        let assigned = index.iter().filter(|e| e.assigned).count();
        info!(
            "Opened cache {:?}: {} of {} blocks assigned",
            path.as_ref(),
            assigned,
            block_count
        );

        Ok(CacheStore {
            file,
            header,
            index,
            morphed_size,
            regions,
        })
    }

    /// Validate an existing cache file and load its index
    ///
    /// Only reads; a file that fails validation is left as it was.
    fn load(
        file: &mut CacheFile,
        block_size: u64,
        block_count: u64,
        regions: RegionSizes,
    ) -> Result<(CacheHeader, Vec<BlockIndexEntry>)> {
        let len = file.len();
        if len < CACHE_HEADER_SIZE as u64 {
            return Err(VirtImgError::CorruptCache(format!(
                "file is {} bytes, shorter than the header",
                len
            )));
        }

        let header = file.read_header()?;
        if header.block_size != block_size {
            return Err(VirtImgError::BlockSizeMismatch {
                expected: block_size,
                found: header.block_size,
            });
        }
        if header.block_count != block_count {
            return Err(VirtImgError::CorruptCache(format!(
                "cache covers {} blocks, image needs {}",
                header.block_count, block_count
            )));
        }

        let data_start = header.data_start();
        if len < data_start {
            return Err(VirtImgError::CorruptCache(format!(
                "file is {} bytes, block index ends at {}",
                len, data_start
            )));
        }

        let raw = file.read_at(header.index_offset, header.index_size() as usize)?;
        let index: Vec<BlockIndexEntry> = raw
            .chunks_exact(INDEX_ENTRY_SIZE)
            .map(BlockIndexEntry::from_bytes)
            .collect();

        for (i, entry) in index.iter().enumerate() {
            let in_file = entry
                .file_offset
                .checked_add(block_size)
                .is_some_and(|end| end <= len);
            if entry.assigned && (entry.file_offset < data_start || !in_file) {
                return Err(VirtImgError::CorruptCache(format!(
                    "block {} points at {} outside the data area",
                    i, entry.file_offset
                )));
            }
        }

        // Extents of everything stored past the index, as (start, end, what)
        let mut extents: Vec<(u64, u64, String)> = index
            .iter()
            .enumerate()
            .filter(|(_, e)| e.assigned)
            .map(|(i, e)| (e.file_offset, e.file_offset + block_size, format!("block {}", i)))
            .collect();

        for (region, slot) in [
            (SpecialRegion::Header, header.header_slot),
            (SpecialRegion::Footer, header.footer_slot),
        ] {
            if !slot.cached {
                continue;
            }
            let size = regions.get(region);
            if size == 0 {
                return Err(VirtImgError::CorruptCache(format!(
                    "cached {:?} copy, but the image has no such region",
                    region
                )));
            }
            let end = slot.file_offset.checked_add(size).filter(|&end| end <= len);
            match end {
                Some(end) if slot.file_offset >= data_start => {
                    extents.push((slot.file_offset, end, format!("{:?} copy", region)));
                }
                _ => {
                    return Err(VirtImgError::CorruptCache(format!(
                        "{:?} copy of {} bytes at {} lies outside the data area",
                        region, size, slot.file_offset
                    )));
                }
            }
        }

        // A region copy of the wrong size runs into the next stored item
        extents.sort_unstable_by_key(|&(start, _, _)| start);
        for pair in extents.windows(2) {
            let (first, second) = (&pair[0], &pair[1]);
            if first.1 > second.0 {
                return Err(VirtImgError::CorruptCache(format!(
                    "{} overlaps {} at file offset {}",
                    first.2, second.2, second.0
                )));
            }
        }

        Ok((header, index))
    }

    /// Toggle forcing each mutation to stable storage (on by default)
    pub fn set_sync_writes(&mut self, sync: bool) {
        self.file.set_sync_writes(sync);
    }

    pub fn block_size(&self) -> u64 {
        self.header.block_size
    }

    pub fn block_count(&self) -> u64 {
        self.header.block_count
    }

    pub fn morphed_size(&self) -> u64 {
        self.morphed_size
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn header(&self) -> &CacheHeader {
        &self.header
    }

    pub fn regions(&self) -> RegionSizes {
        self.regions
    }

    pub fn block_entry(&self, block: u64) -> Option<BlockIndexEntry> {
        self.index.get(block as usize).copied()
    }

    pub fn is_block_assigned(&self, block: u64) -> bool {
        self.block_entry(block).is_some_and(|e| e.assigned)
    }

    /// Indices of all assigned blocks, ascending
    pub fn assigned_blocks(&self) -> Vec<u64> {
        self.index
            .iter()
            .enumerate()
            .filter(|(_, e)| e.assigned)
            .map(|(i, _)| i as u64)
            .collect()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            block_size: self.header.block_size,
            block_count: self.header.block_count,
            assigned_blocks: self.index.iter().filter(|e| e.assigned).count() as u64,
            header_cached: self.header.header_slot.cached,
            footer_cached: self.header.footer_slot.cached,
            file_size: self.file.len(),
        }
    }

    fn check_block_range(&self, block: u64, local: u64, len: usize) -> Result<()> {
        let fits = local
            .checked_add(len as u64)
            .is_some_and(|end| end <= self.header.block_size);
        if block >= self.header.block_count || !fits {
            return Err(VirtImgError::OutOfBounds {
                offset: block
                    .saturating_mul(self.header.block_size)
                    .saturating_add(local),
                size: self.morphed_size,
            });
        }
        Ok(())
    }

    /// Read `len` bytes at `local` within block `block`; `None` if never written
    pub fn read_block(&mut self, block: u64, local: u64, len: usize) -> Result<Option<Vec<u8>>> {
        self.check_block_range(block, local, len)?;

        let entry = self.index[block as usize];
        if !entry.assigned {
            return Ok(None);
        }
        self.file.read_at(entry.file_offset + local, len).map(Some)
    }

    /// Write `data` at `local` within block `block`
    ///
    /// The first write to a block copies the untouched rest of it from `source`.
    pub fn write_block(
        &mut self,
        block: u64,
        local: u64,
        data: &[u8],
        source: &dyn MorphedImage,
    ) -> Result<()> {
        self.check_block_range(block, local, data.len())?;

        let entry = self.index[block as usize];
        if entry.assigned {
            debug!("Updating cached block {} at {}+{}", block, entry.file_offset, local);
            self.file.write_at(entry.file_offset + local, data)?;
            return self.file.sync();
        }

        self.allocate_block(block, local, data, source).map_err(|e| {
            warn!("Failed to allocate cache block {}: {}", block, e);
            e
        })
    }

    fn allocate_block(
        &mut self,
        block: u64,
        local: u64,
        data: &[u8],
        source: &dyn MorphedImage,
    ) -> Result<()> {
        let block_size = self.header.block_size;
        let block_start = block * block_size;
        // Bytes of this block backed by the source; the rest stays zero
        let valid = block_size.min(self.morphed_size - block_start);
        let write_end = local + data.len() as u64;

        let mut buffer = vec![0u8; block_size as usize];
        if local > 0 {
            let prefix_len = local.min(valid);
            let prefix = source.read(block_start, prefix_len as usize)?;
            buffer[..prefix_len as usize].copy_from_slice(&prefix);
        }
        if write_end < valid {
            let suffix = source.read(block_start + write_end, (valid - write_end) as usize)?;
            buffer[write_end as usize..valid as usize].copy_from_slice(&suffix);
        }
        buffer[local as usize..write_end as usize].copy_from_slice(data);

        let file_offset = self.file.append(&buffer)?;
        self.file.sync()?;

        let entry = BlockIndexEntry {
            assigned: true,
            file_offset,
        };
        self.file
            .write_at(self.header.entry_offset(block), &entry.to_bytes())?;
        self.file.sync()?;
        self.index[block as usize] = entry;

        debug!("Allocated cache block {} at file offset {}", block, file_offset);
        Ok(())
    }

    fn check_region_range(&self, region: SpecialRegion, local: u64, len: usize) -> Result<()> {
        let size = self.regions.get(region);
        let fits = local.checked_add(len as u64).is_some_and(|end| end <= size);
        if !fits {
            return Err(VirtImgError::OutOfBounds {
                offset: local,
                size,
            });
        }
        Ok(())
    }

    fn slot(&self, region: SpecialRegion) -> RegionSlot {
        match region {
            SpecialRegion::Header => self.header.header_slot,
            SpecialRegion::Footer => self.header.footer_slot,
        }
    }

    /// Read `len` bytes at `local` of a cached region; `None` if never written
    pub fn read_region(
        &mut self,
        region: SpecialRegion,
        local: u64,
        len: usize,
    ) -> Result<Option<Vec<u8>>> {
        self.check_region_range(region, local, len)?;
        let slot = self.slot(region);
        if !slot.cached {
            return Ok(None);
        }
        self.file.read_at(slot.file_offset + local, len).map(Some)
    }

    /// Write `data` at `local` within a region
    ///
    /// The first write stores all of `snapshot` with `data` spliced in; later
    /// writes ignore `snapshot` and update the stored copy. `snapshot` must be
    /// exactly as long as the region.
    pub fn write_region(
        &mut self,
        region: SpecialRegion,
        local: u64,
        data: &[u8],
        snapshot: &[u8],
    ) -> Result<()> {
        self.check_region_range(region, local, data.len())?;
        let end = local + data.len() as u64;

        let slot = self.slot(region);
        if slot.cached {
            debug!("Updating cached {:?} region at {}+{}", region, slot.file_offset, local);
            self.file.write_at(slot.file_offset + local, data)?;
            return self.file.sync();
        }

        if snapshot.len() as u64 != self.regions.get(region) {
            return Err(VirtImgError::invalid_record(
                "cache region",
                format!(
                    "{:?} snapshot is {} bytes, region is {}",
                    region,
                    snapshot.len(),
                    self.regions.get(region)
                ),
            ));
        }
        let mut buffer = snapshot.to_vec();
        buffer[local as usize..end as usize].copy_from_slice(data);
        let file_offset = self.file.append(&buffer)?;
        self.file.sync()?;

        let slot = RegionSlot {
            cached: true,
            file_offset,
        };
        match region {
            SpecialRegion::Header => self.header.header_slot = slot,
            SpecialRegion::Footer => self.header.footer_slot = slot,
        }
        self.file.write_header(&self.header)?;
        self.file.sync()?;

        debug!(
            "Cached {:?} region ({} bytes) at file offset {}",
            region,
            snapshot.len(),
            file_offset
        );
        Ok(())
    }
}
