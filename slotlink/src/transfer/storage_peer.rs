//! Transfers with an object-storage peer.

use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use super::{InputTransfer, OutputTransfer, TransferError};
use crate::api::BoxFuture;
use crate::backend::{BackendReader, BackendWriter, BlobStore};

/// Reads an object in `chunk_size` ranges.
pub struct StorageInputTransfer {
    blobs: Arc<dyn BlobStore>,
    uri: String,
    position: u64,
    chunk_size: usize,
}

impl StorageInputTransfer {
    pub fn new(blobs: Arc<dyn BlobStore>, uri: String, offset: u64, chunk_size: usize) -> Self {
        Self {
            blobs,
            uri,
            position: offset,
            chunk_size,
        }
    }
}

impl InputTransfer for StorageInputTransfer {
    fn transfer_chunk_to<'a>(
        &'a mut self,
        sink: &'a mut BackendWriter,
    ) -> BoxFuture<'a, Result<Option<usize>, TransferError>> {
        Box::pin(async move {
            let bytes = self
                .blobs
                .get_range(&self.uri, self.position, self.chunk_size)
                .await
                .map_err(|e| TransferError::Peer(e.to_string()))?;
            if bytes.is_empty() {
                return Ok(None);
            }
            sink.write_all(&bytes).await?;
            self.position += bytes.len() as u64;
            Ok(Some(bytes.len()))
        })
    }

    fn position(&self) -> u64 {
        self.position
    }
}

/// Uploads the whole source as one object.
pub struct StorageOutputTransfer {
    blobs: Arc<dyn BlobStore>,
    uri: String,
}

impl StorageOutputTransfer {
    pub fn new(blobs: Arc<dyn BlobStore>, uri: String) -> Self {
        Self { blobs, uri }
    }
}

impl OutputTransfer for StorageOutputTransfer {
    fn push_from(&mut self, mut source: BackendReader) -> BoxFuture<'_, Result<u64, TransferError>> {
        Box::pin(async move {
            let mut data = Vec::new();
            source.read_to_end(&mut data).await?;
            let size = data.len() as u64;
            self.blobs
                .put(&self.uri, data.into())
                .await
                .map_err(|e| TransferError::Peer(e.to_string()))?;
            debug!(uri = %self.uri, size, "Uploaded slot data to storage");
            Ok(size)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBlobStore;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_input_reads_in_chunks_from_offset() {
        let store = Arc::new(MemoryBlobStore::new());
        store.insert("s3://b/k", &b"0123456789"[..]);
        let mut t = StorageInputTransfer::new(store, "s3://b/k".into(), 3, 4);

        let mut sink: BackendWriter = Box::new(Cursor::new(Vec::new()));
        let mut sizes = Vec::new();
        while let Some(n) = t.transfer_chunk_to(&mut sink).await.unwrap() {
            sizes.push(n);
        }
        assert_eq!(sizes, vec![4, 3]);
        assert_eq!(t.position(), 10);
    }

    #[tokio::test]
    async fn test_output_failure_is_peer_failure() {
        let store = Arc::new(MemoryBlobStore::new());
        store.fail_next_puts(1);
        let mut t = StorageOutputTransfer::new(store.clone(), "s3://b/out".into());

        let err = t
            .push_from(Box::new(Cursor::new(b"data".to_vec())))
            .await
            .unwrap_err();
        assert!(err.is_peer_failure());

        let sent = t
            .push_from(Box::new(Cursor::new(b"data".to_vec())))
            .await
            .unwrap();
        assert_eq!(sent, 4);
        assert_eq!(store.object("s3://b/out").unwrap(), &b"data"[..]);
    }
}
