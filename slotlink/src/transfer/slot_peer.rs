//! Pulling from another slot over its slots API.

use tokio::io::AsyncWriteExt;
use tracing::trace;

use super::{ConnectionHandle, InputTransfer, TransferError};
use crate::api::{BoxFuture, ChunkStream, ReadChunk};
use crate::backend::BackendWriter;

/// Reads a remote output slot. The stream is opened on the first chunk.
pub struct SlotInputTransfer {
    peer_id: String,
    connection: ConnectionHandle,
    position: u64,
    stream: Option<ChunkStream>,
}

impl SlotInputTransfer {
    pub fn new(peer_id: String, connection: ConnectionHandle, offset: u64) -> Self {
        Self {
            peer_id,
            connection,
            position: offset,
            stream: None,
        }
    }
}

impl InputTransfer for SlotInputTransfer {
    fn transfer_chunk_to<'a>(
        &'a mut self,
        sink: &'a mut BackendWriter,
    ) -> BoxFuture<'a, Result<Option<usize>, TransferError>> {
        Box::pin(async move {
            if self.stream.is_none() {
                let stream = self
                    .connection
                    .read(self.peer_id.clone(), self.position)
                    .await
                    .map_err(|status| TransferError::Peer(status.to_string()))?;
                self.stream = Some(stream);
            }
            let Some(stream) = self.stream.as_mut() else {
                return Err(TransferError::Peer("read stream not open".into()));
            };

            match stream.next().await {
                Some(Ok(ReadChunk::Data(bytes))) => {
                    sink.write_all(&bytes).await?;
                    self.position += bytes.len() as u64;
                    trace!(
                        peer = %self.peer_id,
                        url = self.connection.url(),
                        len = bytes.len(),
                        position = self.position,
                        "Received chunk"
                    );
                    Ok(Some(bytes.len()))
                }
                Some(Ok(ReadChunk::EndOfStream)) => Ok(None),
                Some(Err(status)) => Err(TransferError::Peer(status.to_string())),
                None => Err(TransferError::Peer(format!(
                    "stream from {} closed before end of data",
                    self.peer_id
                ))),
            }
        })
    }

    fn position(&self) -> u64 {
        self.position
    }
}
