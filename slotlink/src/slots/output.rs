//! Producer side of a channel.
//!
//! A prepare task waits for the backend to complete, registers the slot
//! and binds it. Reads are served by one short-lived task each; the data
//! is frozen by then, so readers never coordinate. A manager-side
//! disconnect stops every task and leaves the binding to the manager.

use bytes::Bytes;
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::context::SlotsContext;
use super::events::{SlotError, SlotEventKind};
use super::registry::Slot;
use crate::api::{chunk_channel, BindRequest, BoxFuture, ChunkSender, ChunkStream, ReadChunk, SlotInstance};
use crate::backend::OutputSlotBackend;
use crate::model::{Direction, PeerDescription, PriorityClass, Role, TransferId};
use crate::status::Status;

/// Chunks buffered per reader.
const READ_BUFFER: usize = 4;

pub struct OutputSlot {
    slot_id: String,
    channel_id: String,
    slot_uri: String,
    bind_key: String,
    priority: PriorityClass,
    ctx: SlotsContext,
    backend: Arc<dyn OutputSlotBackend>,
    prepared: watch::Sender<Option<Result<(), SlotError>>>,
    tasks: Mutex<JoinSet<()>>,
    cancel: CancellationToken,
    /// Child of `cancel`; fires on close or disconnect.
    disconnected: CancellationToken,
    bound: AtomicBool,
    detached: AtomicBool,
    closed: AtomicBool,
}

impl OutputSlot {
    /// Creates a PRIMARY producer slot and starts preparing it.
    pub fn spawn(
        backend: Arc<dyn OutputSlotBackend>,
        slot_id: impl Into<String>,
        channel_id: impl Into<String>,
        ctx: SlotsContext,
    ) -> Arc<Self> {
        Self::spawn_with_priority(backend, slot_id, channel_id, ctx, PriorityClass::Primary)
    }

    pub fn spawn_with_priority(
        backend: Arc<dyn OutputSlotBackend>,
        slot_id: impl Into<String>,
        channel_id: impl Into<String>,
        ctx: SlotsContext,
        priority: PriorityClass,
    ) -> Arc<Self> {
        let slot_id = slot_id.into();
        let (prepared, _) = watch::channel(None);
        let cancel = CancellationToken::new();
        let slot = Arc::new(Self {
            slot_uri: ctx.slot_uri(&slot_id),
            bind_key: format!("bind:{}:{}", slot_id, uuid::Uuid::new_v4()),
            slot_id,
            channel_id: channel_id.into(),
            priority,
            ctx,
            backend,
            prepared,
            tasks: Mutex::new(JoinSet::new()),
            disconnected: cancel.child_token(),
            cancel,
            bound: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        slot.ctx.slots.track(slot.clone());

        let preparing = slot.clone();
        slot.tasks.lock().spawn(async move {
            let outcome = tokio::select! {
                result = preparing.prepare() => result,
                _ = preparing.disconnected.cancelled() => Err(preparing.interruption()),
            };
            match &outcome {
                Ok(()) => {}
                Err(SlotError::Closed) => debug!(slot_id = %preparing.slot_id, "Output slot interrupted"),
                Err(SlotError::Disconnected) => {
                    info!(slot_id = %preparing.slot_id, "Output slot disconnected")
                }
                Err(e) => error!(
                    slot_id = %preparing.slot_id,
                    channel_id = %preparing.channel_id,
                    error = %e,
                    "Output slot failed"
                ),
            }
            preparing.prepared.send_replace(Some(outcome));
        });
        slot
    }

    pub fn id(&self) -> &str {
        &self.slot_id
    }

    pub fn slot_uri(&self) -> &str {
        &self.slot_uri
    }

    /// Resolves once the slot is bound and any push to storage is done.
    pub async fn prepared(&self) -> Result<(), SlotError> {
        let mut outcome = self.prepared.subscribe();
        let done = outcome
            .wait_for(Option::is_some)
            .await
            .map_err(|_| SlotError::Closed)?;
        done.clone().unwrap_or(Err(SlotError::Closed))
    }

    /// Cancels the slot's tasks, waits a grace window for them, aborts the
    /// rest, then releases the binding. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        self.ctx.registry.unregister(&self.slot_id);

        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        let grace = self.ctx.settings.read_join_grace();
        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                slot_id = %self.slot_id,
                remaining = tasks.len(),
                "Slot tasks outlived the grace window, aborting"
            );
            tasks.shutdown().await;
        }
        self.prepared.send_if_modified(|outcome| {
            if outcome.is_none() {
                *outcome = Some(Err(SlotError::Closed));
                true
            } else {
                false
            }
        });

        if let Err(e) = self.backend.close().await {
            warn!(slot_id = %self.slot_id, error = %e, "Closing output backend failed");
        }
        if self.bound.load(Ordering::SeqCst) && !self.detached.load(Ordering::SeqCst) {
            self.ctx.unbind_quietly(&self.slot_uri).await;
        }
        self.ctx.emit(&self.slot_id, SlotEventKind::Closed);
        info!(slot_id = %self.slot_id, "Output slot closed");
    }

    fn interruption(&self) -> SlotError {
        if self.detached.load(Ordering::SeqCst) {
            SlotError::Disconnected
        } else {
            SlotError::Closed
        }
    }

    // =========================================================================
    // Prepare
    // =========================================================================

    async fn prepare(self: &Arc<Self>) -> Result<(), SlotError> {
        self.backend.wait_completed().await?;
        self.ctx.registry.register(self.clone());

        let request = BindRequest::new(self.instance(), self.ctx.identity.owner, Role::Producer)
            .with_priority(self.priority)
            .with_idempotency_key(self.bind_key.clone());
        let response = self.ctx.bind(request, &self.cancel).await?;
        self.bound.store(true, Ordering::SeqCst);
        info!(
            slot_id = %self.slot_id,
            channel_id = %self.channel_id,
            priority = ?self.priority,
            "Output slot bound"
        );

        match (response.peer, response.transfer_id) {
            (Some(peer), Some(transfer_id)) => self.push(peer, transfer_id).await,
            _ => Ok(()),
        }
    }

    /// Sends the whole backend content to a peer that does not pull.
    async fn push(&self, peer: PeerDescription, transfer_id: TransferId) -> Result<(), SlotError> {
        let Some(mut transfer) = self.ctx.transfers.output(&peer) else {
            let reason = format!("Output transfer to slot peer {} is not supported", peer);
            self.report_failure(&transfer_id, &reason).await;
            return Err(SlotError::Transfer(reason));
        };
        self.ctx.emit(
            &self.slot_id,
            SlotEventKind::TransferStarted {
                transfer_id: transfer_id.clone(),
            },
        );

        let pushed = match self.backend.read_from(0).await {
            Ok(source) => transfer.push_from(source).await,
            Err(e) => Err(e.into()),
        };
        match pushed {
            Ok(bytes) => {
                self.ctx
                    .transfer_completed(&self.channel_id, &transfer_id, &self.cancel)
                    .await?;
                info!(slot_id = %self.slot_id, %transfer_id, %peer, bytes, "Pushed slot data");
                self.ctx.emit(
                    &self.slot_id,
                    SlotEventKind::TransferCompleted {
                        transfer_id,
                        bytes,
                    },
                );
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                self.report_failure(&transfer_id, &reason).await;
                Err(e.into())
            }
        }
    }

    async fn report_failure(&self, transfer_id: &TransferId, reason: &str) {
        self.ctx.emit(
            &self.slot_id,
            SlotEventKind::TransferFailed {
                transfer_id: transfer_id.clone(),
                reason: reason.to_string(),
            },
        );
        // Uploads have no replacement peer; the manager answers with an error
        if let Err(status) = self
            .ctx
            .transfer_failed(&self.channel_id, transfer_id, reason, &self.cancel)
            .await
        {
            warn!(slot_id = %self.slot_id, %transfer_id, error = %status, "Transfer failure reported");
        }
    }

    fn instance(&self) -> SlotInstance {
        SlotInstance {
            slot_id: self.slot_id.clone(),
            slot_uri: self.slot_uri.clone(),
            channel_id: self.channel_id.clone(),
            task_id: self.ctx.identity.task_id.clone(),
            direction: Direction::Output,
            peer_url: self.ctx.identity.api_url.clone(),
        }
    }
}

/// Streams `backend` from `offset` in chunks of at most `chunk_size`.
async fn stream_chunks(
    backend: Arc<dyn OutputSlotBackend>,
    offset: u64,
    chunk_size: usize,
    chunks: &ChunkSender,
) -> io::Result<u64> {
    let mut reader = backend.read_from(offset).await?;
    let mut sent = 0u64;
    loop {
        let mut buf = vec![0u8; chunk_size];
        let mut filled = 0;
        while filled < chunk_size {
            let n = reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled > 0 {
            buf.truncate(filled);
            if chunks.send(Ok(ReadChunk::Data(Bytes::from(buf)))).await.is_err() {
                // Reader went away
                return Ok(sent);
            }
            sent += filled as u64;
        }
        if filled < chunk_size {
            let _ = chunks.send(Ok(ReadChunk::EndOfStream)).await;
            return Ok(sent);
        }
    }
}

impl Slot for OutputSlot {
    fn id(&self) -> &str {
        &self.slot_id
    }

    fn start_transfer(&self, _peer: PeerDescription, _transfer_id: TransferId) -> Result<(), Status> {
        Err(Status::unimplemented("Output slots do not accept peers"))
    }

    fn read(&self, offset: u64) -> Result<ChunkStream, Status> {
        if self.disconnected.is_cancelled() {
            return Err(Status::not_found(format!("Slot {} is closed", self.slot_id)));
        }
        let (chunks, stream) = chunk_channel(READ_BUFFER);
        let backend = self.backend.clone();
        let chunk_size = self.ctx.transfers.chunk_size();
        let cancel = self.disconnected.clone();
        let slot_id = self.slot_id.clone();

        let mut tasks = self.tasks.lock();
        // Reap finished reads
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => debug!(slot_id = %slot_id, offset, "Read cancelled"),
                result = stream_chunks(backend, offset, chunk_size, &chunks) => match result {
                    Ok(bytes) => debug!(slot_id = %slot_id, offset, bytes, "Read served"),
                    Err(e) => {
                        warn!(slot_id = %slot_id, offset, error = %e, "Read failed");
                        let _ = chunks
                            .send(Err(Status::internal(format!("Reading slot data failed: {}", e))))
                            .await;
                    }
                },
            }
        });
        Ok(stream)
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(OutputSlot::close(self))
    }

    fn disconnect(&self) {
        self.detached.store(true, Ordering::SeqCst);
        self.disconnected.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBlobStore, OutputBlobBackend};

    fn blob_backend(data: &'static [u8]) -> Arc<dyn OutputSlotBackend> {
        let store = Arc::new(MemoryBlobStore::new());
        store.insert("s3://bucket/data", data);
        Arc::new(OutputBlobBackend::new(store, "s3://bucket/data"))
    }

    async fn collect(mut stream: ChunkStream) -> Vec<ReadChunk> {
        let mut items = Vec::new();
        while let Some(item) = stream.next().await {
            items.push(item.unwrap());
        }
        items
    }

    #[tokio::test]
    async fn test_stream_chunks_splits_and_ends() {
        let (tx, stream) = chunk_channel(16);
        let sent = stream_chunks(blob_backend(b"abcdefg"), 1, 3, &tx).await.unwrap();
        drop(tx);

        assert_eq!(sent, 6);
        assert_eq!(
            collect(stream).await,
            vec![
                ReadChunk::Data(Bytes::from_static(b"bcd")),
                ReadChunk::Data(Bytes::from_static(b"efg")),
                ReadChunk::EndOfStream,
            ]
        );
    }

    #[tokio::test]
    async fn test_stream_past_end_is_only_end_marker() {
        let (tx, stream) = chunk_channel(4);
        let sent = stream_chunks(blob_backend(b"abc"), 3, 2, &tx).await.unwrap();
        drop(tx);

        assert_eq!(sent, 0);
        assert_eq!(collect(stream).await, vec![ReadChunk::EndOfStream]);
    }

    #[tokio::test]
    async fn test_dropped_reader_stops_stream() {
        let (tx, stream) = chunk_channel(1);
        drop(stream);
        let sent = stream_chunks(blob_backend(b"abcdef"), 0, 2, &tx).await.unwrap();
        assert_eq!(sent, 0);
    }
}
