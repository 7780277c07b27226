//! Peer transfers.
//!
//! A transfer moves bytes between a local slot backend and a peer. The peer
//! is either another slot (reached through its worker's slots API) or an
//! object-storage location (reached directly through a [`BlobStore`]).
//!
//! ```text
//!   InputSlot ◄── InputTransfer ◄── { SlotsApi::read | BlobStore::get_range }
//!   OutputSlot ── OutputTransfer ──► BlobStore::put
//! ```
//!
//! Pushing to a slot peer is never done here: slot consumers pull.
//!
//! Errors distinguish the two sides so a slot can fail over when the peer
//! misbehaves but give up when its own backend breaks.

mod connections;
mod slot_peer;
mod storage_peer;

pub use connections::{ConnectionCache, ConnectionHandle, LocalNetwork, PeerConnector};
pub use slot_peer::SlotInputTransfer;
pub use storage_peer::{StorageInputTransfer, StorageOutputTransfer};

use std::io;
use std::sync::Arc;
use thiserror::Error;

use crate::api::BoxFuture;
use crate::backend::{BackendReader, BackendWriter, BlobStore};
use crate::model::PeerDescription;

#[derive(Debug, Error)]
pub enum TransferError {
    /// The peer failed or went away; another peer may succeed.
    #[error("peer failure: {0}")]
    Peer(String),

    /// The local backend failed; retrying elsewhere will not help.
    #[error("backend failure: {0}")]
    Backend(#[from] io::Error),
}

impl TransferError {
    pub fn is_peer_failure(&self) -> bool {
        matches!(self, TransferError::Peer(_))
    }
}

/// Pulls a peer's bytes into a local sink, one chunk per call.
pub trait InputTransfer: Send {
    /// Moves the next chunk into `sink`. `Ok(None)` marks the end of the data.
    fn transfer_chunk_to<'a>(
        &'a mut self,
        sink: &'a mut BackendWriter,
    ) -> BoxFuture<'a, Result<Option<usize>, TransferError>>;

    /// Bytes received so far, counted from offset zero.
    fn position(&self) -> u64;
}

/// Pushes local bytes to a peer.
pub trait OutputTransfer: Send {
    /// Sends everything `source` yields; returns the byte count.
    fn push_from(&mut self, source: BackendReader) -> BoxFuture<'_, Result<u64, TransferError>>;
}

/// Builds transfers for a peer description.
pub struct TransferFactory {
    connections: Arc<ConnectionCache>,
    blobs: Arc<dyn BlobStore>,
    chunk_size: usize,
}

impl TransferFactory {
    pub fn new(
        connections: Arc<ConnectionCache>,
        blobs: Arc<dyn BlobStore>,
        chunk_size: usize,
    ) -> Self {
        Self {
            connections,
            blobs,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn connections(&self) -> &Arc<ConnectionCache> {
        &self.connections
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Transfer pulling `peer`'s data starting at `offset`.
    pub fn input(
        &self,
        peer: &PeerDescription,
        offset: u64,
    ) -> Result<Box<dyn InputTransfer>, TransferError> {
        match peer {
            PeerDescription::Slot { peer_id, url } => {
                let connection = self
                    .connections
                    .connect(url)
                    .map_err(|status| TransferError::Peer(status.to_string()))?;
                Ok(Box::new(SlotInputTransfer::new(
                    peer_id.clone(),
                    connection,
                    offset,
                )))
            }
            PeerDescription::Storage { uri, .. } => Ok(Box::new(StorageInputTransfer::new(
                self.blobs.clone(),
                uri.clone(),
                offset,
                self.chunk_size,
            ))),
        }
    }

    /// Transfer pushing to `peer`, or `None` when the peer pulls by itself.
    pub fn output(&self, peer: &PeerDescription) -> Option<Box<dyn OutputTransfer>> {
        match peer {
            PeerDescription::Storage { uri, .. } => Some(Box::new(StorageOutputTransfer::new(
                self.blobs.clone(),
                uri.clone(),
            ))),
            PeerDescription::Slot { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBlobStore;

    fn factory() -> TransferFactory {
        TransferFactory::new(
            Arc::new(ConnectionCache::new(Arc::new(LocalNetwork::new()))),
            Arc::new(MemoryBlobStore::new()),
            4,
        )
    }

    #[test]
    fn test_slot_peers_have_no_output_transfer() {
        let factory = factory();
        assert!(factory
            .output(&PeerDescription::slot("w-1/out", "local://w"))
            .is_none());
        assert!(factory
            .output(&PeerDescription::storage("storage-consumer:c", "s3://b/k"))
            .is_some());
    }

    #[test]
    fn test_unreachable_slot_peer_is_peer_failure() {
        let err = factory()
            .input(&PeerDescription::slot("w-1/out", "local://gone"), 0)
            .err()
            .unwrap();
        assert!(err.is_peer_failure());
    }
}
