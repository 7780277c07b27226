//! Chunk streams returned by `SlotsApi::read`.

use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use crate::status::Status;

/// One item of a read stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadChunk {
    Data(Bytes),
    /// Explicit end marker; a stream that closes without it was cut short.
    EndOfStream,
}

pub type ChunkSender = mpsc::Sender<Result<ReadChunk, Status>>;

/// Receiving half of a read. Dropping it cancels the producer side.
#[derive(Debug)]
pub struct ChunkStream {
    rx: mpsc::Receiver<Result<ReadChunk, Status>>,
}

/// Bounded chunk channel; `capacity` chunks may be in flight.
pub fn chunk_channel(capacity: usize) -> (ChunkSender, ChunkStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (tx, ChunkStream { rx })
}

impl ChunkStream {
    pub async fn next(&mut self) -> Option<Result<ReadChunk, Status>> {
        self.rx.recv().await
    }
}

impl Stream for ChunkStream {
    type Item = Result<ReadChunk, Status>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_stream_yields_in_order_then_ends() {
        let (tx, stream) = chunk_channel(4);
        tx.send(Ok(ReadChunk::Data(Bytes::from_static(b"ab"))))
            .await
            .unwrap();
        tx.send(Ok(ReadChunk::EndOfStream)).await.unwrap();
        drop(tx);

        let items: Vec<_> = stream.collect().await;
        assert_eq!(
            items,
            vec![
                Ok(ReadChunk::Data(Bytes::from_static(b"ab"))),
                Ok(ReadChunk::EndOfStream)
            ]
        );
    }

    #[tokio::test]
    async fn test_dropped_stream_closes_sender() {
        let (tx, stream) = chunk_channel(1);
        drop(stream);
        assert!(tx.is_closed());
    }
}
