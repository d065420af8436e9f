//! Outbound chunk streaming

use std::net::IpAddr;
use std::sync::Arc;

use uuid::Uuid;

use super::{chunk_count, split, CHUNK_SIZE};
use crate::protocol::{FileChunkComplete, FileChunkData, FileChunkStart, Message};
use crate::sync::Session;
use crate::{Result, SessionConfig};

/// A file queued for broadcast to every live session
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub file_id: String,
    pub file_name: String,
    pub data: Arc<Vec<u8>>,
    pub checksum: String,
    pub from_ip: String,
    pub chunk_size: usize,
}

impl OutgoingFile {
    /// Wrap file bytes with a fresh random transfer id.
    pub fn new(file_name: String, data: Vec<u8>, checksum: String, from_ip: String) -> Self {
        Self {
            file_id: Uuid::new_v4().to_string(),
            file_name,
            data: Arc::new(data),
            checksum,
            from_ip,
            chunk_size: CHUNK_SIZE,
        }
    }

    pub fn total_chunks(&self) -> usize {
        chunk_count(self.data.len(), self.chunk_size)
    }
}

/// Outcome of broadcasting one file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileBroadcast {
    pub file_id: String,
    pub total_chunks: usize,
    /// Peers whose queue accepted every message of the transfer
    pub delivered: Vec<IpAddr>,
    /// Peers whose transfer was aborted
    pub failed: Vec<IpAddr>,
}

/// Stream one file onto a single session's outbound queue:
/// start, every chunk in ascending index order, then complete.
///
/// Each enqueue waits a bounded time; a stalled queue aborts this peer's
/// transfer without touching any other peer.
pub async fn send_file(session: &Session, file: &OutgoingFile, config: &SessionConfig) -> Result<()> {
    let total_chunks = file.total_chunks();
    let peer = session.ip();

    let start = Message::FileChunkStart(FileChunkStart {
        file_id: file.file_id.clone(),
        file_name: file.file_name.clone(),
        total_size: file.data.len() as u64,
        total_chunks,
        checksum: file.checksum.clone(),
        from_ip: file.from_ip.clone(),
    });
    session.enqueue(start, config.marker_enqueue_timeout).await.inspect_err(|e| {
        tracing::warn!("failed to send file start to {}: {}", peer, e);
    })?;

    tracing::info!("sending {} to {} in {} chunks", file.file_name, peer, total_chunks);

    for (index, bytes) in split(&file.data, file.chunk_size) {
        let chunk = Message::FileChunkData(FileChunkData {
            file_id: file.file_id.clone(),
            chunk_index: index,
            data: bytes.to_vec(),
        });
        session.enqueue(chunk, config.chunk_enqueue_timeout).await.inspect_err(|e| {
            tracing::warn!("failed to send chunk {}/{} to {}: {}", index + 1, total_chunks, peer, e);
        })?;

        if (index + 1) % 10 == 0 || index + 1 == total_chunks {
            tracing::debug!("sent chunk {}/{} to {}", index + 1, total_chunks, peer);
        }
    }

    let complete = Message::FileChunkComplete(FileChunkComplete {
        file_id: file.file_id.clone(),
        checksum: file.checksum.clone(),
    });
    session.enqueue(complete, config.marker_enqueue_timeout).await.inspect_err(|e| {
        tracing::warn!("failed to send file complete to {}: {}", peer, e);
    })?;

    tracing::info!("file {} queued for {}", file.file_name, peer);
    Ok(())
}
