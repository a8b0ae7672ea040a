//! Fixed-size VDI header emulation
//!
//! Only the "fixed, fully allocated" VDI variant is produced: a 512-byte preamble
//! followed by a block map that maps every virtual block to itself, followed by
//! the disk data (the morphed image).
//!
//! ```text
//! ┌──────────────────────────────┐ 0
//! │ Preamble (512 bytes)         │
//! ├──────────────────────────────┤ 512 = block map offset
//! │ Block map (4 bytes × blocks) │
//! ├──────────────────────────────┤ data offset = header size
//! │ Disk data                    │
//! └──────────────────────────────┘
//! ```

use crate::error::{Result, VirtImgError};
use crate::VERSION;
use uuid::Uuid;

pub const VDI_SIGNATURE: u32 = 0xBEDA_107F;
pub const VDI_VERSION: u32 = 0x0001_0001;
pub const VDI_TYPE_FIXED: u32 = 2;
pub const VDI_HEADER1_PLUS_SIZE: u32 = 0x180;
pub const VDI_PREAMBLE_SIZE: usize = 512;
/// Notional VDI block size (1 MiB), unrelated to the cache block size
pub const VDI_BLOCK_SIZE: u32 = 1024 * 1024;
pub const VDI_SECTOR_SIZE: u32 = 512;

const FILE_INFO_LEN: usize = 64;
const COMMENT_LEN: usize = 256;
const FILE_INFO: &str = "<<< This is a virtual VDI image >>>";

/// Number of VDI blocks needed to cover `disk_size` bytes
pub fn block_count(disk_size: u64) -> u64 {
    disk_size.div_ceil(VDI_BLOCK_SIZE as u64)
}

/// Total emulated header size (preamble plus block map) for `disk_size` bytes
pub fn header_size(disk_size: u64) -> u64 {
    VDI_PREAMBLE_SIZE as u64 + 4 * block_count(disk_size)
}

/// VDI preamble record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VdiHeader {
    pub file_info: String,
    pub signature: u32,
    pub version: u32,
    pub header1_size: u32,
    pub image_type: u32,
    pub flags: u32,
    pub comment: String,
    pub blocks_offset: u32,
    pub data_offset: u32,
    /// Legacy geometry (cylinders, heads, sectors); always zero
    pub legacy_chs: (u32, u32, u32),
    pub sector_size: u32,
    pub disk_size: u64,
    pub block_size: u32,
    pub block_extra: u32,
    pub blocks: u32,
    pub blocks_allocated: u32,
    pub creation_id: Uuid,
    pub modification_id: Uuid,
    pub linkage_id: Uuid,
    pub parent_modification_id: Uuid,
}

impl VdiHeader {
    /// Build the header of a fixed VDI image wrapping `disk_size` bytes
    pub fn fixed(disk_size: u64, creation_id: Uuid, modification_id: Uuid) -> Result<Self> {
        let blocks = u32::try_from(block_count(disk_size)).map_err(|_| {
            VirtImgError::UnsupportedFormat(format!(
                "VDI cannot describe {} bytes: block count exceeds 32 bits",
                disk_size
            ))
        })?;
        let data_offset = u32::try_from(header_size(disk_size)).map_err(|_| {
            VirtImgError::UnsupportedFormat(format!(
                "VDI cannot describe {} bytes: data offset exceeds 32 bits",
                disk_size
            ))
        })?;

        Ok(VdiHeader {
            file_info: FILE_INFO.to_string(),
            signature: VDI_SIGNATURE,
            version: VDI_VERSION,
            header1_size: VDI_HEADER1_PLUS_SIZE,
            image_type: VDI_TYPE_FIXED,
            flags: 0,
            comment: format!("This VDI was emulated using virtimg v{}", VERSION),
            blocks_offset: VDI_PREAMBLE_SIZE as u32,
            data_offset,
            legacy_chs: (0, 0, 0),
            sector_size: VDI_SECTOR_SIZE,
            disk_size,
            block_size: VDI_BLOCK_SIZE,
            block_extra: 0,
            blocks,
            blocks_allocated: blocks,
            creation_id,
            modification_id,
            linkage_id: Uuid::nil(),
            parent_modification_id: Uuid::nil(),
        })
    }

    /// Serialize the 512-byte preamble
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(VDI_PREAMBLE_SIZE);

        put_text(&mut bytes, &self.file_info, FILE_INFO_LEN);
        bytes.extend_from_slice(&self.signature.to_le_bytes());
        bytes.extend_from_slice(&self.version.to_le_bytes());
        bytes.extend_from_slice(&self.header1_size.to_le_bytes());
        bytes.extend_from_slice(&self.image_type.to_le_bytes());
        bytes.extend_from_slice(&self.flags.to_le_bytes());
        put_text(&mut bytes, &self.comment, COMMENT_LEN);
        bytes.extend_from_slice(&self.blocks_offset.to_le_bytes());
        bytes.extend_from_slice(&self.data_offset.to_le_bytes());
        bytes.extend_from_slice(&self.legacy_chs.0.to_le_bytes());
        bytes.extend_from_slice(&self.legacy_chs.1.to_le_bytes());
        bytes.extend_from_slice(&self.legacy_chs.2.to_le_bytes());
        bytes.extend_from_slice(&self.sector_size.to_le_bytes());
        // Unused (was BIOS translation mode)
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&self.disk_size.to_le_bytes());
        bytes.extend_from_slice(&self.block_size.to_le_bytes());
        bytes.extend_from_slice(&self.block_extra.to_le_bytes());
        bytes.extend_from_slice(&self.blocks.to_le_bytes());
        bytes.extend_from_slice(&self.blocks_allocated.to_le_bytes());
        bytes.extend_from_slice(self.creation_id.as_bytes());
        bytes.extend_from_slice(self.modification_id.as_bytes());
        bytes.extend_from_slice(self.linkage_id.as_bytes());
        bytes.extend_from_slice(self.parent_modification_id.as_bytes());

        bytes.resize(VDI_PREAMBLE_SIZE, 0);
        bytes
    }

    /// Full emulated header: preamble followed by the identity block map
    pub fn to_header_bytes(&self) -> Vec<u8> {
        let mut bytes = self.to_bytes();
        bytes.reserve(self.blocks as usize * 4);
        for i in 0..self.blocks {
            bytes.extend_from_slice(&i.to_le_bytes());
        }
        bytes
    }

    /// Parse and validate a preamble
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < VDI_PREAMBLE_SIZE {
            return Err(VirtImgError::invalid_record(
                "VDI header",
                format!("need {} bytes, got {}", VDI_PREAMBLE_SIZE, bytes.len()),
            ));
        }

        let header = VdiHeader {
            file_info: get_text(&bytes[0..64]),
            signature: le_u32(&bytes[64..68]),
            version: le_u32(&bytes[68..72]),
            header1_size: le_u32(&bytes[72..76]),
            image_type: le_u32(&bytes[76..80]),
            flags: le_u32(&bytes[80..84]),
            comment: get_text(&bytes[84..340]),
            blocks_offset: le_u32(&bytes[340..344]),
            data_offset: le_u32(&bytes[344..348]),
            legacy_chs: (
                le_u32(&bytes[348..352]),
                le_u32(&bytes[352..356]),
                le_u32(&bytes[356..360]),
            ),
            sector_size: le_u32(&bytes[360..364]),
            disk_size: le_u64(&bytes[368..376]),
            block_size: le_u32(&bytes[376..380]),
            block_extra: le_u32(&bytes[380..384]),
            blocks: le_u32(&bytes[384..388]),
            blocks_allocated: le_u32(&bytes[388..392]),
            creation_id: uuid_at(bytes, 392),
            modification_id: uuid_at(bytes, 408),
            linkage_id: uuid_at(bytes, 424),
            parent_modification_id: uuid_at(bytes, 440),
        };

        header.validate()?;
        Ok(header)
    }

    /// Check the fields hypervisors insist on
    pub fn validate(&self) -> Result<()> {
        let fail = |reason: String| Err(VirtImgError::invalid_record("VDI header", reason));

        if self.signature != VDI_SIGNATURE {
            return fail(format!("bad signature {:#010x}", self.signature));
        }
        if self.version != VDI_VERSION {
            return fail(format!("unsupported version {:#010x}", self.version));
        }
        if self.image_type != VDI_TYPE_FIXED {
            return fail(format!("image type {} is not fixed", self.image_type));
        }
        if self.creation_id.is_nil() || self.modification_id.is_nil() {
            return fail("creation and modification ids must be set".to_string());
        }
        if self.blocks as u64 != block_count(self.disk_size) {
            return fail(format!(
                "{} blocks cannot cover {} bytes",
                self.blocks, self.disk_size
            ));
        }
        if self.data_offset as u64 != self.blocks_offset as u64 + 4 * self.blocks as u64 {
            return fail(format!(
                "data offset {} does not follow block map at {}",
                self.data_offset, self.blocks_offset
            ));
        }

        Ok(())
    }
}

fn put_text(bytes: &mut Vec<u8>, text: &str, len: usize) {
    let raw = text.as_bytes();
    // Keep room for the terminating NUL
    let n = raw.len().min(len - 1);
    bytes.extend_from_slice(&raw[..n]);
    bytes.resize(bytes.len() + (len - n), 0);
}

fn get_text(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn le_u64(bytes: &[u8]) -> u64 {
    u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}

fn uuid_at(bytes: &[u8], offset: usize) -> Uuid {
    let mut raw = [0u8; 16];
    raw.copy_from_slice(&bytes[offset..offset + 16]);
    Uuid::from_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (Uuid, Uuid) {
        (Uuid::from_u128(0x1234), Uuid::from_u128(0xABCD))
    }

    #[test]
    fn test_header_size() {
        assert_eq!(header_size(0), 512);
        assert_eq!(header_size(1), 516);
        assert_eq!(header_size(1024 * 1024), 516);
        assert_eq!(header_size(10_000_000), 552);
    }

    #[test]
    fn test_fixed_header_field_offsets() {
        let (create, modify) = ids();
        let header = VdiHeader::fixed(10_000_000, create, modify).unwrap();
        let bytes = header.to_bytes();

        assert_eq!(bytes.len(), VDI_PREAMBLE_SIZE);
        assert!(bytes.starts_with(FILE_INFO.as_bytes()));
        assert_eq!(&bytes[64..68], &[0x7F, 0x10, 0xDA, 0xBE]);
        assert_eq!(le_u32(&bytes[68..72]), VDI_VERSION);
        assert_eq!(le_u32(&bytes[72..76]), 0x180);
        assert_eq!(le_u32(&bytes[76..80]), VDI_TYPE_FIXED);
        assert_eq!(le_u32(&bytes[340..344]), 512);
        assert_eq!(le_u32(&bytes[344..348]), 552);
        assert_eq!(le_u32(&bytes[360..364]), 512);
        assert_eq!(le_u64(&bytes[368..376]), 10_000_000);
        assert_eq!(le_u32(&bytes[376..380]), VDI_BLOCK_SIZE);
        assert_eq!(le_u32(&bytes[384..388]), 10);
        assert_eq!(le_u32(&bytes[388..392]), 10);
        assert_eq!(&bytes[392..408], create.as_bytes());
        assert_eq!(&bytes[408..424], modify.as_bytes());
        assert!(bytes[424..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_block_map_is_identity() {
        let (create, modify) = ids();
        let header = VdiHeader::fixed(3 * 1024 * 1024 + 1, create, modify).unwrap();
        let bytes = header.to_header_bytes();

        assert_eq!(bytes.len() as u64, header_size(3 * 1024 * 1024 + 1));
        for i in 0..4u32 {
            let at = VDI_PREAMBLE_SIZE + 4 * i as usize;
            assert_eq!(le_u32(&bytes[at..at + 4]), i);
        }
    }

    #[test]
    fn test_parse_back() {
        let (create, modify) = ids();
        let header = VdiHeader::fixed(123_456_789, create, modify).unwrap();
        let parsed = VdiHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_rejects_bad_signature() {
        let (create, modify) = ids();
        let mut bytes = VdiHeader::fixed(4096, create, modify).unwrap().to_bytes();
        bytes[64] ^= 0xFF;
        assert!(matches!(
            VdiHeader::from_bytes(&bytes),
            Err(VirtImgError::InvalidRecord { .. })
        ));
    }

    #[test]
    fn test_rejects_nil_ids() {
        let header = VdiHeader::fixed(4096, Uuid::nil(), Uuid::from_u128(1)).unwrap();
        assert!(header.validate().is_err());
    }

    #[test]
    fn test_long_comment_is_truncated() {
        let (create, modify) = ids();
        let mut header = VdiHeader::fixed(4096, create, modify).unwrap();
        header.comment = "x".repeat(1000);
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), VDI_PREAMBLE_SIZE);
        assert_eq!(bytes[339], 0);
        assert_eq!(VdiHeader::from_bytes(&bytes).unwrap().comment.len(), 255);
    }
}
