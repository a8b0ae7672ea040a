//! Virtual image engine
//!
//! - [`error`] - Error type and POSIX error mapping
//! - [`source`] - Read-only source images ([`source::MorphedImage`])
//! - [`registry`] - Source backends by input type
//! - [`format`] - Raw/VDI/VHD layouts and metadata records:
//!   - [`format::vdi`] - Fixed VDI header
//!   - [`format::vhd`] - Fixed VHD footer
//! - [`cache`] - Copy-on-write cache file:
//!   - [`cache::header`] - On-disk header and index records
//!   - [`cache::io`] - File access
//! - [`image_io`] - Routing of virtual image reads and writes
//! - [`info`] - Mount info text
//! - [`session`] - One mounted image, safe to share between threads
//! - [`config`] - Mount configuration

pub mod cache;
pub mod config;
pub mod error;
pub mod format;
pub mod image_io;
pub mod info;
pub mod registry;
pub mod session;
pub mod source;
