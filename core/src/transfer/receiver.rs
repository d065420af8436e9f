//! Inbound chunk reassembly

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use super::{checksum, ContentKind, CHUNK_SIZE};
use crate::protocol::{FileChunkComplete, FileChunkData, FileChunkStart};

/// Why an inbound transfer was discarded
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("transfer incomplete: {file_name} ({received}/{expected} chunks)")]
    Incomplete {
        file_id: String,
        file_name: String,
        received: usize,
        expected: usize,
    },

    #[error("file corrupted: {file_name} (checksum mismatch)")]
    Corrupted {
        file_id: String,
        file_name: String,
        expected: String,
        actual: String,
    },
}

/// A fully received and verified file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub file_id: String,
    pub file_name: String,
    pub data: Vec<u8>,
    pub checksum: String,
    pub kind: ContentKind,
    pub source: IpAddr,
}

/// Progress snapshot after storing one chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    pub file_id: String,
    pub file_name: String,
    pub chunk_index: usize,
    pub received: usize,
    pub total: usize,
}

struct FileTransferState {
    file_name: String,
    total_size: u64,
    total_chunks: usize,
    checksum: String,
    source: IpAddr,
    chunks: HashMap<usize, Vec<u8>>,
}

/// Table of in-flight inbound transfers, keyed by file id.
///
/// The table lock is held only to look up or remove an entry. Chunk bytes
/// are stored under each transfer's own lock so concurrent transfers do not
/// serialize on each other.
#[derive(Default)]
pub struct TransferTracker {
    transfers: RwLock<HashMap<String, Arc<Mutex<FileTransferState>>>>,
}

impl TransferTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transfer announced by `FileChunkStart`.
    ///
    /// Returns `false` when the announced size cannot be carried by the
    /// announced number of chunks; such a start is not registered.
    pub async fn start(&self, start: FileChunkStart, source: IpAddr) -> bool {
        let capacity = (start.total_chunks as u64).checked_mul(CHUNK_SIZE as u64);
        if capacity.map_or(true, |capacity| start.total_size > capacity) {
            tracing::warn!(
                "rejecting transfer {} from {}: {} bytes do not fit {} chunks",
                start.file_id, source, start.total_size, start.total_chunks
            );
            return false;
        }

        tracing::info!(
            "receiving {} from {} ({} bytes, {} chunks)",
            start.file_name, source, start.total_size, start.total_chunks
        );

        let state = FileTransferState {
            file_name: start.file_name,
            total_size: start.total_size,
            total_chunks: start.total_chunks,
            checksum: start.checksum,
            source,
            chunks: HashMap::new(),
        };

        let previous = self.transfers.write().await
            .insert(start.file_id.clone(), Arc::new(Mutex::new(state)));
        if previous.is_some() {
            tracing::warn!("transfer {} restarted, dropping earlier chunks", start.file_id);
        }
        true
    }

    /// Store one chunk sent by `from`. Unknown file ids and chunks from a
    /// peer other than the one that started the transfer are ignored.
    pub async fn chunk(&self, chunk: FileChunkData, from: IpAddr) -> Option<TransferProgress> {
        let transfer = self.transfers.read().await.get(&chunk.file_id).cloned();
        let Some(transfer) = transfer else {
            tracing::warn!("chunk {} for unknown transfer {}", chunk.chunk_index, chunk.file_id);
            return None;
        };

        let mut state = transfer.lock().await;
        if state.source != from {
            tracing::warn!(
                "chunk {} for {} came from {}, transfer belongs to {}",
                chunk.chunk_index, state.file_name, from, state.source
            );
            return None;
        }
        if chunk.chunk_index >= state.total_chunks {
            tracing::warn!(
                "chunk index {} out of range for {} ({} chunks)",
                chunk.chunk_index, state.file_name, state.total_chunks
            );
            return None;
        }

        state.chunks.insert(chunk.chunk_index, chunk.data);
        let received = state.chunks.len();

        if (chunk.chunk_index + 1) % 10 == 0 || received == state.total_chunks {
            tracing::debug!("received chunk {}/{} for {}", received, state.total_chunks, state.file_name);
        }

        Some(TransferProgress {
            file_id: chunk.file_id,
            file_name: state.file_name.clone(),
            chunk_index: chunk.chunk_index,
            received,
            total: state.total_chunks,
        })
    }

    /// Finish a transfer: verify completeness and checksum, then hand back
    /// the assembled file. Returns `None` for unknown file ids.
    ///
    /// The entry is removed before verification, so late or duplicate
    /// chunks for this id are ignored afterwards whatever the outcome.
    pub async fn complete(&self, complete: FileChunkComplete) -> Option<Result<ReceivedFile, TransferError>> {
        let transfer = self.transfers.write().await.remove(&complete.file_id);
        let Some(transfer) = transfer else {
            tracing::warn!("completion for unknown transfer {}", complete.file_id);
            return None;
        };

        let state = transfer.lock().await;
        let file_id = complete.file_id;

        let incomplete = || TransferError::Incomplete {
            file_id: file_id.clone(),
            file_name: state.file_name.clone(),
            received: state.chunks.len(),
            expected: state.total_chunks,
        };

        if state.chunks.len() != state.total_chunks {
            tracing::warn!(
                "missing chunks for {}: got {}, expected {}",
                state.file_name, state.chunks.len(), state.total_chunks
            );
            return Some(Err(incomplete()));
        }

        let mut data = Vec::with_capacity(state.chunks.values().map(Vec::len).sum());
        for index in 0..state.total_chunks {
            match state.chunks.get(&index) {
                Some(chunk) => data.extend_from_slice(chunk),
                None => {
                    tracing::warn!("missing chunk {} for {}", index, state.file_name);
                    return Some(Err(incomplete()));
                }
            }
        }

        if data.len() as u64 != state.total_size {
            tracing::warn!(
                "{} is {} bytes, announced {}",
                state.file_name, data.len(), state.total_size
            );
        }

        let actual = checksum(&data);
        if actual != state.checksum {
            tracing::warn!("checksum mismatch for {}", state.file_name);
            return Some(Err(TransferError::Corrupted {
                file_id,
                file_name: state.file_name.clone(),
                expected: state.checksum.clone(),
                actual,
            }));
        }

        tracing::info!("file received: {} ({} bytes)", state.file_name, data.len());

        Some(Ok(ReceivedFile {
            file_id,
            file_name: state.file_name.clone(),
            kind: ContentKind::from_file_name(&state.file_name),
            checksum: actual,
            source: state.source,
            data,
        }))
    }

    /// Drop every transfer started by `source`, typically because its
    /// session ended before the completion message arrived.
    pub async fn abandon_from(&self, source: IpAddr) -> Vec<TransferError> {
        let abandoned: Vec<_> = {
            let mut transfers = self.transfers.write().await;
            let mut matching = Vec::new();
            for (file_id, transfer) in transfers.iter() {
                if transfer.lock().await.source == source {
                    matching.push(file_id.clone());
                }
            }
            matching
                .into_iter()
                .filter_map(|file_id| transfers.remove(&file_id).map(|t| (file_id, t)))
                .collect()
        };

        let mut errors = Vec::with_capacity(abandoned.len());
        for (file_id, transfer) in abandoned {
            let state = transfer.lock().await;
            tracing::warn!(
                "abandoning {} from {} after {}/{} chunks",
                state.file_name, source, state.chunks.len(), state.total_chunks
            );
            errors.push(TransferError::Incomplete {
                file_id,
                file_name: state.file_name.clone(),
                received: state.chunks.len(),
                expected: state.total_chunks,
            });
        }
        errors
    }

    /// Number of transfers still waiting for their completion message
    pub async fn active_count(&self) -> usize {
        self.transfers.read().await.len()
    }
}
