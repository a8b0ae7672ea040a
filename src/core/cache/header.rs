//! On-disk records of the cache file
//!
//! ```text
//! ┌────────────────────────────────────────────┐ 0
//! │ CacheHeader (512 bytes)                    │
//! ├────────────────────────────────────────────┤ 512 = index offset
//! │ BlockIndexEntry × block_count (12 bytes)   │
//! ├────────────────────────────────────────────┤
//! │ Data blocks and region copies, append-only │
//! └────────────────────────────────────────────┘
//! ```
//!
//! All integers are little endian.

use crate::error::{Result, VirtImgError};

/// "xmount\xFF\xFF" read as a little-endian u64
pub const CACHE_SIGNATURE: u64 = 0xFFFF_746E_756F_6D78;
pub const CACHE_VERSION: u32 = 2;
pub const CACHE_HEADER_SIZE: usize = 512;
pub const INDEX_ENTRY_SIZE: usize = 12;

/// Byte offset of the format header slot within the cache header
pub const HEADER_SLOT_OFFSET: u64 = 36;
/// Byte offset of the unused descriptor slot (flag, size, offset)
const LEGACY_SLOT_OFFSET: usize = 48;
/// Byte offset of the format footer slot within the cache header
pub const FOOTER_SLOT_OFFSET: u64 = 68;

/// Cached copy of a synthesized header or footer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionSlot {
    pub cached: bool,
    /// Position of the copy in the cache file; meaningful only when cached
    pub file_offset: u64,
}

impl RegionSlot {
    pub const SIZE: usize = 12;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&(self.cached as u32).to_le_bytes());
        bytes[4..12].copy_from_slice(&self.file_offset.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        RegionSlot {
            cached: le_u32(&bytes[0..4]) != 0,
            file_offset: le_u64(&bytes[4..12]),
        }
    }
}

/// Location of one cached block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockIndexEntry {
    pub assigned: bool,
    /// Position of the block data in the cache file; meaningful only when assigned
    pub file_offset: u64,
}

impl BlockIndexEntry {
    pub fn to_bytes(&self) -> [u8; INDEX_ENTRY_SIZE] {
        let mut bytes = [0u8; INDEX_ENTRY_SIZE];
        bytes[0..4].copy_from_slice(&(self.assigned as u32).to_le_bytes());
        bytes[4..12].copy_from_slice(&self.file_offset.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        BlockIndexEntry {
            assigned: le_u32(&bytes[0..4]) != 0,
            file_offset: le_u64(&bytes[4..12]),
        }
    }
}

/// Cache file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheHeader {
    pub signature: u64,
    pub version: u32,
    pub block_size: u64,
    pub block_count: u64,
    pub index_offset: u64,
    pub header_slot: RegionSlot,
    pub footer_slot: RegionSlot,
}

impl CacheHeader {
    /// Fresh header for an image of `block_count` blocks of `block_size` bytes
    pub fn new(block_size: u64, block_count: u64) -> Self {
        CacheHeader {
            signature: CACHE_SIGNATURE,
            version: CACHE_VERSION,
            block_size,
            block_count,
            index_offset: CACHE_HEADER_SIZE as u64,
            header_slot: RegionSlot::default(),
            footer_slot: RegionSlot::default(),
        }
    }

    /// Size of the block index in bytes
    pub fn index_size(&self) -> u64 {
        self.block_count * INDEX_ENTRY_SIZE as u64
    }

    /// First byte past the block index
    pub fn data_start(&self) -> u64 {
        self.index_offset + self.index_size()
    }

    /// File position of index entry `block`
    pub fn entry_offset(&self, block: u64) -> u64 {
        self.index_offset + block * INDEX_ENTRY_SIZE as u64
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(CACHE_HEADER_SIZE);

        bytes.extend_from_slice(&self.signature.to_le_bytes());
        bytes.extend_from_slice(&self.version.to_le_bytes());
        bytes.extend_from_slice(&self.block_size.to_le_bytes());
        bytes.extend_from_slice(&self.block_count.to_le_bytes());
        bytes.extend_from_slice(&self.index_offset.to_le_bytes());
        bytes.extend_from_slice(&self.header_slot.to_bytes());
        // Descriptor slot of the old VMDK emulation, kept zeroed
        bytes.resize(LEGACY_SLOT_OFFSET + 20, 0);
        bytes.extend_from_slice(&self.footer_slot.to_bytes());

        bytes.resize(CACHE_HEADER_SIZE, 0);
        bytes
    }

    /// Decode a header, checking only what identifies the file as a cache
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < CACHE_HEADER_SIZE {
            return Err(VirtImgError::CorruptCache(format!(
                "header truncated: {} of {} bytes",
                bytes.len(),
                CACHE_HEADER_SIZE
            )));
        }

        let header = CacheHeader {
            signature: le_u64(&bytes[0..8]),
            version: le_u32(&bytes[8..12]),
            block_size: le_u64(&bytes[12..20]),
            block_count: le_u64(&bytes[20..28]),
            index_offset: le_u64(&bytes[28..36]),
            header_slot: RegionSlot::from_bytes(&bytes[36..48]),
            footer_slot: RegionSlot::from_bytes(&bytes[68..80]),
        };

        header.validate()?;
        Ok(header)
    }

    pub fn validate(&self) -> Result<()> {
        if self.signature != CACHE_SIGNATURE {
            return Err(VirtImgError::CorruptCache(format!(
                "bad signature {:#018x}",
                self.signature
            )));
        }
        if self.version != CACHE_VERSION {
            return Err(VirtImgError::CorruptCache(format!(
                "unsupported cache version {}",
                self.version
            )));
        }
        if self.index_offset != CACHE_HEADER_SIZE as u64 {
            return Err(VirtImgError::CorruptCache(format!(
                "index offset {} is not {}",
                self.index_offset, CACHE_HEADER_SIZE
            )));
        }
        if self.block_size == 0 {
            return Err(VirtImgError::CorruptCache("zero block size".to_string()));
        }
        Ok(())
    }
}

fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn le_u64(bytes: &[u8]) -> u64 {
    u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}
