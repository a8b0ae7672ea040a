//! Fixed VHD footer emulation
//!
//! A fixed VHD is the raw disk data followed by a 512-byte footer. All fields are
//! big endian.

use crate::error::{Result, VirtImgError};
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub const VHD_FOOTER_SIZE: usize = 512;
pub const VHD_COOKIE: [u8; 8] = *b"conectix";
pub const VHD_FEATURES: u32 = 0x0000_0002;
pub const VHD_FORMAT_VERSION: u32 = 0x0001_0000;
/// No dynamic header follows: fixed disk
pub const VHD_DATA_OFFSET_NONE: u64 = u64::MAX;
pub const VHD_CREATOR_APP: [u8; 4] = *b"vimg";
pub const VHD_CREATOR_VERSION: u32 = 0x0005_0000;
pub const VHD_CREATOR_HOST_OS: [u8; 4] = *b"Wi2k";
pub const VHD_DISK_TYPE_FIXED: u32 = 2;
/// Seconds between the Unix epoch and 2000-01-01T00:00:00Z
pub const VHD_EPOCH_OFFSET: i64 = 946_684_800;

const CHECKSUM_RANGE: std::ops::Range<usize> = 64..68;

/// Largest addressable CHS sector count (C65535 × H16 × S255)
const MAX_CHS_SECTORS: u64 = 65535 * 16 * 255;
/// Threshold above which 255 sectors per track are used (C65535 × H16 × S63)
const LARGE_DISK_SECTORS: u64 = 65535 * 16 * 63;

/// Legacy cylinder/head/sector geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChsGeometry {
    pub cylinders: u16,
    pub heads: u8,
    pub sectors: u8,
}

impl ChsGeometry {
    /// Compute the CHS triple for a disk of `disk_size` bytes
    pub fn for_size(disk_size: u64) -> Self {
        let total = if disk_size > MAX_CHS_SECTORS * 512 {
            MAX_CHS_SECTORS
        } else {
            disk_size.div_ceil(512)
        };

        let (sectors, heads, cyl_x_heads) = if total >= LARGE_DISK_SECTORS {
            (255u64, 16u64, total / 255)
        } else {
            let mut sectors = 17u64;
            let mut cyl_x_heads = total / sectors;
            let mut heads = ((cyl_x_heads + 1023) / 1024).max(4);

            if cyl_x_heads >= heads * 1024 || heads > 16 {
                sectors = 31;
                heads = 16;
                cyl_x_heads = total / sectors;
            }
            if cyl_x_heads >= heads * 1024 {
                sectors = 63;
                heads = 16;
                cyl_x_heads = total / sectors;
            }
            (sectors, heads, cyl_x_heads)
        };

        ChsGeometry {
            cylinders: (cyl_x_heads / heads).min(u16::MAX as u64) as u16,
            heads: heads as u8,
            sectors: sectors as u8,
        }
    }
}

/// VHD timestamp: seconds since 2000-01-01 UTC, clamped to the u32 range
pub fn vhd_timestamp(at: DateTime<Utc>) -> u32 {
    (at.timestamp() - VHD_EPOCH_OFFSET).clamp(0, u32::MAX as i64) as u32
}

/// One's complement of the byte sum, skipping the checksum field
pub fn footer_checksum(raw: &[u8]) -> u32 {
    let mut sum: u32 = 0;
    for (i, b) in raw.iter().enumerate() {
        if CHECKSUM_RANGE.contains(&i) {
            continue;
        }
        sum = sum.wrapping_add(*b as u32);
    }
    !sum
}

/// VHD footer record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VhdFooter {
    pub features: u32,
    pub format_version: u32,
    pub data_offset: u64,
    pub timestamp: u32,
    pub creator_app: [u8; 4],
    pub creator_version: u32,
    pub creator_host_os: [u8; 4],
    pub original_size: u64,
    pub current_size: u64,
    pub geometry: ChsGeometry,
    pub disk_type: u32,
    pub unique_id: Uuid,
    pub saved_state: u8,
}

impl VhdFooter {
    /// Build the footer of a fixed VHD wrapping `disk_size` bytes
    pub fn fixed(disk_size: u64, unique_id: Uuid, created_at: DateTime<Utc>) -> Self {
        VhdFooter {
            features: VHD_FEATURES,
            format_version: VHD_FORMAT_VERSION,
            data_offset: VHD_DATA_OFFSET_NONE,
            timestamp: vhd_timestamp(created_at),
            creator_app: VHD_CREATOR_APP,
            creator_version: VHD_CREATOR_VERSION,
            creator_host_os: VHD_CREATOR_HOST_OS,
            original_size: disk_size,
            current_size: disk_size,
            geometry: ChsGeometry::for_size(disk_size),
            disk_type: VHD_DISK_TYPE_FIXED,
            unique_id,
            saved_state: 0,
        }
    }

    /// Serialize to the 512-byte on-disk footer, checksum included
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(VHD_FOOTER_SIZE);

        bytes.extend_from_slice(&VHD_COOKIE);
        bytes.extend_from_slice(&self.features.to_be_bytes());
        bytes.extend_from_slice(&self.format_version.to_be_bytes());
        bytes.extend_from_slice(&self.data_offset.to_be_bytes());
        bytes.extend_from_slice(&self.timestamp.to_be_bytes());
        bytes.extend_from_slice(&self.creator_app);
        bytes.extend_from_slice(&self.creator_version.to_be_bytes());
        bytes.extend_from_slice(&self.creator_host_os);
        bytes.extend_from_slice(&self.original_size.to_be_bytes());
        bytes.extend_from_slice(&self.current_size.to_be_bytes());
        bytes.extend_from_slice(&self.geometry.cylinders.to_be_bytes());
        bytes.push(self.geometry.heads);
        bytes.push(self.geometry.sectors);
        bytes.extend_from_slice(&self.disk_type.to_be_bytes());
        bytes.extend_from_slice(&[0u8; 4]);
        bytes.extend_from_slice(self.unique_id.as_bytes());
        bytes.push(self.saved_state);
        bytes.resize(VHD_FOOTER_SIZE, 0);

        let checksum = footer_checksum(&bytes);
        bytes[CHECKSUM_RANGE].copy_from_slice(&checksum.to_be_bytes());
        bytes
    }

    /// Parse a footer, verifying cookie and checksum
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < VHD_FOOTER_SIZE {
            return Err(VirtImgError::invalid_record(
                "VHD footer",
                format!("need {} bytes, got {}", VHD_FOOTER_SIZE, bytes.len()),
            ));
        }
        let raw = &bytes[..VHD_FOOTER_SIZE];

        if raw[..8] != VHD_COOKIE {
            return Err(VirtImgError::invalid_record("VHD footer", "cookie mismatch"));
        }
        let expected = be_u32(&raw[64..68]);
        let actual = footer_checksum(raw);
        if expected != actual {
            return Err(VirtImgError::invalid_record(
                "VHD footer",
                format!("checksum {:#010x} != computed {:#010x}", expected, actual),
            ));
        }

        let mut unique = [0u8; 16];
        unique.copy_from_slice(&raw[68..84]);

        Ok(VhdFooter {
            features: be_u32(&raw[8..12]),
            format_version: be_u32(&raw[12..16]),
            data_offset: be_u64(&raw[16..24]),
            timestamp: be_u32(&raw[24..28]),
            creator_app: [raw[28], raw[29], raw[30], raw[31]],
            creator_version: be_u32(&raw[32..36]),
            creator_host_os: [raw[36], raw[37], raw[38], raw[39]],
            original_size: be_u64(&raw[40..48]),
            current_size: be_u64(&raw[48..56]),
            geometry: ChsGeometry {
                cylinders: u16::from_be_bytes([raw[56], raw[57]]),
                heads: raw[58],
                sectors: raw[59],
            },
            disk_type: be_u32(&raw[60..64]),
            unique_id: Uuid::from_bytes(unique),
            saved_state: raw[84],
        })
    }
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn be_u64(bytes: &[u8]) -> u64 {
    u64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn footer(size: u64) -> VhdFooter {
        let at = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        VhdFooter::fixed(size, Uuid::from_u128(0xFEED), at)
    }

    #[test]
    fn test_footer_layout() {
        let bytes = footer(10 * 1024 * 1024).to_bytes();

        assert_eq!(bytes.len(), VHD_FOOTER_SIZE);
        assert_eq!(&bytes[0..8], b"conectix");
        assert_eq!(&bytes[8..12], &[0, 0, 0, 2]);
        assert_eq!(&bytes[12..16], &[0, 1, 0, 0]);
        assert_eq!(&bytes[16..24], &[0xFF; 8]);
        assert_eq!(&bytes[28..32], b"vimg");
        assert_eq!(&bytes[32..36], &[0, 5, 0, 0]);
        assert_eq!(&bytes[36..40], b"Wi2k");
        assert_eq!(be_u64(&bytes[40..48]), 10 * 1024 * 1024);
        assert_eq!(be_u64(&bytes[48..56]), 10 * 1024 * 1024);
        assert_eq!(&bytes[60..64], &[0, 0, 0, 2]);
        assert_eq!(bytes[84], 0);
        assert!(bytes[85..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_timestamp_epoch() {
        let at = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(vhd_timestamp(at), 0);
        let at = Utc.with_ymd_and_hms(2000, 1, 1, 0, 1, 40).unwrap();
        assert_eq!(vhd_timestamp(at), 100);
        let before = Utc.with_ymd_and_hms(1999, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(vhd_timestamp(before), 0);
    }

    #[test]
    fn test_checksum_matches_byte_sum() {
        let bytes = footer(4096).to_bytes();
        let sum: u32 = bytes
            .iter()
            .enumerate()
            .filter(|(i, _)| !(64..68).contains(i))
            .map(|(_, &b)| b as u32)
            .sum();
        assert_eq!(be_u32(&bytes[64..68]), !sum);
    }

    #[test]
    fn test_parse_back() {
        let original = footer(123_456_789);
        let parsed = VhdFooter::from_bytes(&original.to_bytes()).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_corrupted_footer_rejected() {
        let mut bytes = footer(4096).to_bytes();
        bytes[45] ^= 0x01;
        assert!(VhdFooter::from_bytes(&bytes).is_err());

        let mut bytes = footer(4096).to_bytes();
        bytes[0] = b'C';
        assert!(VhdFooter::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_geometry_small_disk() {
        // 10 MiB = 20480 sectors: 17 spt, 4 heads
        let g = ChsGeometry::for_size(10 * 1024 * 1024);
        assert_eq!(g.sectors, 17);
        assert_eq!(g.heads, 4);
        assert_eq!(g.cylinders, (20480 / 17 / 4) as u16);
    }

    #[test]
    fn test_geometry_falls_back_to_31_and_63() {
        // 17 spt would need more than 16 heads
        let g = ChsGeometry::for_size(200 * 1024 * 1024);
        assert_eq!((g.heads, g.sectors), (16, 31));
        assert_eq!(g.cylinders as u64, 409_600 / 31 / 16);

        // 31 spt runs out of cylinders
        let g = ChsGeometry::for_size(1024 * 1024 * 1024);
        assert_eq!((g.heads, g.sectors), (16, 63));
        assert_eq!(g.cylinders as u64, 2_097_152 / 63 / 16);
    }

    #[test]
    fn test_geometry_large_disks() {
        let g = ChsGeometry::for_size(LARGE_DISK_SECTORS * 512);
        assert_eq!((g.heads, g.sectors), (16, 255));

        let g = ChsGeometry::for_size(u64::MAX / 2);
        assert_eq!(
            g,
            ChsGeometry {
                cylinders: 65535,
                heads: 16,
                sectors: 255
            }
        );
    }
}
