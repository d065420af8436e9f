//! Chunked file transfer
//!
//! Outbound files are cut into fixed-size chunks and streamed over each
//! peer's session queue; inbound chunk streams are reassembled by index and
//! verified against a whole-file checksum.

mod receiver;
mod sender;

use std::path::Path;

use sha2::{Digest, Sha256};

pub use receiver::{ReceivedFile, TransferError, TransferProgress, TransferTracker};
pub use sender::{send_file, FileBroadcast, OutgoingFile};

pub use crate::protocol::constants::CHUNK_SIZE;

/// File extensions delivered to the clipboard as images
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "bmp", "webp"];

/// Number of chunks needed for `len` bytes (ceiling division).
pub fn chunk_count(len: usize, chunk_size: usize) -> usize {
    if chunk_size == 0 {
        return 0;
    }
    len.div_ceil(chunk_size)
}

/// Iterate over `data` in ascending chunk order.
pub fn split(data: &[u8], chunk_size: usize) -> impl Iterator<Item = (usize, &[u8])> {
    data.chunks(chunk_size.max(1)).enumerate()
}

/// Whole-file checksum: lowercase hex SHA-256.
pub fn checksum(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// What a completed transfer should become on the clipboard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Image,
    File,
}

impl ContentKind {
    /// Infer from the file name's extension (case-insensitive).
    pub fn from_file_name(name: &str) -> Self {
        let ext = Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());

        match ext {
            Some(ext) if IMAGE_EXTENSIONS.contains(&ext.as_str()) => ContentKind::Image,
            _ => ContentKind::File,
        }
    }
}
