use thiserror::Error;

#[derive(Error, Debug)]
pub enum VirtImgError {
    #[error("Source read failed at offset {offset} ({len} bytes): {reason}")]
    SourceRead {
        offset: u64,
        len: usize,
        reason: String,
    },

    #[error("Cache I/O error: {0}")]
    CacheIo(#[from] std::io::Error),

    #[error("Corrupt cache file: {0}")]
    CorruptCache(String),

    #[error("Cache block size mismatch: file uses {found}, configured {expected}")]
    BlockSizeMismatch { expected: u64, found: u64 },

    #[error("Unsupported virtual image format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid {record} record: {reason}")]
    InvalidRecord {
        record: &'static str,
        reason: String,
    },

    #[error("Access beyond end of virtual image: offset {offset}, size {size}")]
    OutOfBounds { offset: u64, size: u64 },

    #[error("Virtual image is mounted read-only")]
    ReadOnly,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("No source backend handles input type '{0}'")]
    UnknownSource(String),
}

impl VirtImgError {
    /// Negative POSIX error code used when the error crosses a filesystem call.
    pub fn errno(&self) -> i32 {
        match self {
            VirtImgError::SourceRead { .. }
            | VirtImgError::CacheIo(_)
            | VirtImgError::CorruptCache(_)
            | VirtImgError::BlockSizeMismatch { .. } => -libc::EIO,
            VirtImgError::ReadOnly => -libc::EROFS,
            VirtImgError::OutOfBounds { .. }
            | VirtImgError::UnsupportedFormat(_)
            | VirtImgError::InvalidRecord { .. }
            | VirtImgError::Config(_) => -libc::EINVAL,
            VirtImgError::UnknownSource(_) => -libc::ENOENT,
        }
    }

    pub(crate) fn source_read(offset: u64, len: usize, reason: impl Into<String>) -> Self {
        VirtImgError::SourceRead {
            offset,
            len,
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_record(record: &'static str, reason: impl Into<String>) -> Self {
        VirtImgError::InvalidRecord {
            record,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, VirtImgError>;
