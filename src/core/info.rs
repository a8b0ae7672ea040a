//! Human-readable description of a mount
//!
//! The text is built once at mount time and served as a read-only file next to
//! the virtual image. It is guarded by its own lock so reading it never waits
//! on image I/O.

use crate::cache::CacheStats;
use crate::format::{ImageIdentity, VirtualLayout};
use crate::source::MorphedImage;
use parking_lot::Mutex;

pub const INFO_PREAMBLE: &str =
    "The following values have been extracted from the mounted image file:\n\n";

pub struct InfoFile {
    text: Mutex<String>,
}

impl InfoFile {
    pub fn new(text: String) -> Self {
        InfoFile {
            text: Mutex::new(text),
        }
    }

    /// Compose the info text of a mount
    pub fn compose(
        source: &dyn MorphedImage,
        layout: &VirtualLayout,
        identity: &ImageIdentity,
        cache: Option<&CacheStats>,
    ) -> Self {
        let mut text = String::from(INFO_PREAMBLE);
        match source.info_text() {
            Some(source_text) => text.push_str(&source_text),
            None => text.push_str("None\n"),
        }

        text.push('\n');
        text.push_str(&format!("Virtual image format: {}\n", layout.kind()));
        text.push_str(&format!("Morphed image size: {} bytes\n", layout.morphed_size()));
        text.push_str(&format!("Virtual image size: {} bytes\n", layout.virtual_size()));
        text.push_str(&format!("Creation id: {}\n", identity.creation_id));
        text.push_str(&format!("Modification id: {}\n", identity.modification_id));
        match cache {
            Some(stats) => text.push_str(&format!(
                "Write cache: {} of {} blocks of {} bytes in use\n",
                stats.assigned_blocks, stats.block_count, stats.block_size
            )),
            None => text.push_str("Write cache: none (read-only)\n"),
        }

        Self::new(text)
    }

    pub fn size(&self) -> u64 {
        self.text.lock().len() as u64
    }

    pub fn text(&self) -> String {
        self.text.lock().clone()
    }

    /// Read up to `len` bytes at `offset`; empty past the end
    pub fn read(&self, offset: u64, len: usize) -> Vec<u8> {
        let text = self.text.lock();
        let bytes = text.as_bytes();
        let start = (offset.min(bytes.len() as u64)) as usize;
        let end = start.saturating_add(len).min(bytes.len());
        bytes[start..end].to_vec()
    }
}
