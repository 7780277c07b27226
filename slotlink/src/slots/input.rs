//! Consumer side of a channel.
//!
//! One lifecycle task drives the slot; the slots service delivers a pushed
//! peer through a one-shot mailbox and `close()` interrupts through a
//! cancellation token. A manager-side disconnect interrupts the same way
//! but leaves the binding to the manager.
//!
//! ```text
//!   register ─► bind ─┬─ peer in response ──────────────┐
//!                     └─ WAITING_FOR_PEER ─► pushed peer ┤
//!                                                        ▼
//!   DOWNLOADING ───────────────► pull chunks ─┬─ peer error ─► transfer_failed ─► new peer ─┐
//!                                  ▲          │                                            │
//!                                  └──────────┼─── reopen backend at position ◄────────────┘
//!                                             └─ end of stream ─► finish ─► transfer_completed
//!                                                                     ─► READY ─► companion output
//! ```

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::context::SlotsContext;
use super::events::{InputSlotState, SlotError, SlotEventKind};
use super::output::OutputSlot;
use super::registry::Slot;
use crate::api::{BindRequest, BoxFuture, ChunkStream, SlotInstance};
use crate::backend::InputSlotBackend;
use crate::model::{Direction, PeerDescription, PriorityClass, Role, TransferId};
use crate::status::Status;
use crate::transfer::TransferError;

type PeerAssignment = (PeerDescription, TransferId);

pub struct InputSlot {
    slot_id: String,
    channel_id: String,
    slot_uri: String,
    bind_key: String,
    ctx: SlotsContext,
    backend: Arc<dyn InputSlotBackend>,
    state: watch::Sender<InputSlotState>,
    failure: Mutex<Option<SlotError>>,
    mailbox: Mutex<Option<oneshot::Sender<PeerAssignment>>>,
    companion: Mutex<Option<Arc<OutputSlot>>>,
    lifecycle: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    disconnected: CancellationToken,
    bound: AtomicBool,
    detached: AtomicBool,
    released: AtomicBool,
    closed: AtomicBool,
}

/// Where a download attempt stopped.
struct Interrupted {
    position: u64,
    error: TransferError,
}

impl InputSlot {
    /// Creates the slot and starts binding it to `channel_id`.
    pub fn spawn(
        backend: Arc<dyn InputSlotBackend>,
        slot_id: impl Into<String>,
        channel_id: impl Into<String>,
        ctx: SlotsContext,
    ) -> Arc<Self> {
        let slot_id = slot_id.into();
        let (mailbox, assignment) = oneshot::channel();
        let (state, _) = watch::channel(InputSlotState::Binding);
        let slot = Arc::new(Self {
            slot_uri: ctx.slot_uri(&slot_id),
            bind_key: format!("bind:{}:{}", slot_id, uuid::Uuid::new_v4()),
            slot_id,
            channel_id: channel_id.into(),
            ctx,
            backend,
            state,
            failure: Mutex::new(None),
            mailbox: Mutex::new(Some(mailbox)),
            companion: Mutex::new(None),
            lifecycle: Mutex::new(None),
            cancel: CancellationToken::new(),
            disconnected: CancellationToken::new(),
            bound: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            released: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        slot.ctx.slots.track(slot.clone());
        let task = tokio::spawn(slot.clone().run(assignment));
        *slot.lifecycle.lock() = Some(task);
        slot
    }

    pub fn id(&self) -> &str {
        &self.slot_id
    }

    pub fn slot_uri(&self) -> &str {
        &self.slot_uri
    }

    pub fn state(&self) -> InputSlotState {
        *self.state.borrow()
    }

    /// Watch of the slot state.
    pub fn states(&self) -> watch::Receiver<InputSlotState> {
        self.state.subscribe()
    }

    /// The output slot re-serving the downloaded data, once READY.
    pub fn companion(&self) -> Option<Arc<OutputSlot>> {
        self.companion.lock().clone()
    }

    /// Resolves once the data is downloaded; fails if the slot closed or
    /// failed first.
    pub async fn ready(&self) -> Result<(), SlotError> {
        let mut states = self.state.subscribe();
        let reached = states
            .wait_for(|s| matches!(s, InputSlotState::Ready | InputSlotState::Closed))
            .await
            .map(|s| *s)
            .map_err(|_| SlotError::Closed)?;
        match reached {
            InputSlotState::Ready => Ok(()),
            _ => Err(self.failure.lock().clone().unwrap_or(SlotError::Closed)),
        }
    }

    /// Stops the slot and releases everything it holds. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let lifecycle = self.lifecycle.lock().take();
        if let Some(task) = lifecycle {
            if let Err(e) = task.await {
                error!(slot_id = %self.slot_id, error = %e, "Input slot task ended abnormally");
            }
        }
        self.release().await;
        let companion = self.companion.lock().take();
        if let Some(companion) = companion {
            companion.close().await;
        }
        self.set_state(InputSlotState::Closed);
        self.ctx.emit(&self.slot_id, SlotEventKind::Closed);
        info!(slot_id = %self.slot_id, "Input slot closed");
    }

    fn set_state(&self, next: InputSlotState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(slot_id = %self.slot_id, from = %previous, to = %next, "Input slot state");
            self.ctx.emit(&self.slot_id, SlotEventKind::StateChanged(next));
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    async fn run(self: Arc<Self>, assignment: oneshot::Receiver<PeerAssignment>) {
        let outcome = tokio::select! {
            result = self.drive(assignment) => result,
            _ = self.cancel.cancelled() => Err(self.interruption()),
            _ = self.disconnected.cancelled() => Err(self.interruption()),
        };
        match outcome {
            Ok(()) => {}
            Err(SlotError::Closed) => debug!(slot_id = %self.slot_id, "Input slot interrupted"),
            Err(e) => {
                if e == SlotError::Disconnected {
                    info!(slot_id = %self.slot_id, channel_id = %self.channel_id, "Input slot disconnected");
                } else {
                    error!(slot_id = %self.slot_id, channel_id = %self.channel_id, error = %e, "Input slot failed");
                }
                *self.failure.lock() = Some(e);
                self.release().await;
                self.set_state(InputSlotState::Closed);
            }
        }
    }

    fn interruption(&self) -> SlotError {
        if self.detached.load(Ordering::SeqCst) {
            SlotError::Disconnected
        } else {
            SlotError::Closed
        }
    }

    async fn drive(
        self: &Arc<Self>,
        assignment: oneshot::Receiver<PeerAssignment>,
    ) -> Result<(), SlotError> {
        self.ctx.registry.register(self.clone());

        let request = BindRequest::new(self.instance(), self.ctx.identity.owner, Role::Consumer)
            .with_idempotency_key(self.bind_key.clone());
        let response = self.ctx.bind(request, &self.cancel).await?;
        self.bound.store(true, Ordering::SeqCst);

        let (peer, transfer_id) = match (response.peer, response.transfer_id) {
            (Some(peer), Some(transfer_id)) => {
                // Later pushes are rejected
                self.mailbox.lock().take();
                (peer, transfer_id)
            }
            _ => {
                self.set_state(InputSlotState::WaitingForPeer);
                debug!(slot_id = %self.slot_id, "Waiting for a producer");
                assignment.await.map_err(|_| SlotError::Closed)?
            }
        };

        self.set_state(InputSlotState::Downloading);
        let bytes = self.download(peer, transfer_id).await?;
        self.set_state(InputSlotState::Ready);
        self.ctx.emit(&self.slot_id, SlotEventKind::Ready);
        info!(slot_id = %self.slot_id, channel_id = %self.channel_id, bytes, "Input slot ready");

        let companion = OutputSlot::spawn_with_priority(
            self.backend.to_output()?,
            format!("{}-out", self.slot_id),
            self.channel_id.clone(),
            self.ctx.clone(),
            PriorityClass::Backup,
        );
        *self.companion.lock() = Some(companion);
        self.release().await;
        Ok(())
    }

    /// Downloads everything, failing over to new peers on peer errors.
    async fn download(
        &self,
        mut peer: PeerDescription,
        mut transfer_id: TransferId,
    ) -> Result<u64, SlotError> {
        let mut offset = 0;
        let mut failovers = 0;
        loop {
            self.ctx.emit(
                &self.slot_id,
                SlotEventKind::TransferStarted {
                    transfer_id: transfer_id.clone(),
                },
            );
            debug!(slot_id = %self.slot_id, %transfer_id, %peer, offset, "Pulling from peer");

            let interrupted = match self.pull(&peer, offset).await {
                Ok(bytes) => {
                    self.backend.finish().await?;
                    self.ctx
                        .transfer_completed(&self.channel_id, &transfer_id, &self.cancel)
                        .await?;
                    self.ctx.emit(
                        &self.slot_id,
                        SlotEventKind::TransferCompleted {
                            transfer_id,
                            bytes,
                        },
                    );
                    return Ok(bytes);
                }
                Err(interrupted) => interrupted,
            };

            let reason = match interrupted.error {
                TransferError::Peer(reason) => reason,
                TransferError::Backend(e) => return Err(e.into()),
            };
            offset = interrupted.position;
            warn!(
                slot_id = %self.slot_id,
                %transfer_id,
                %peer,
                position = offset,
                reason = %reason,
                "Peer failed, failing over"
            );
            self.ctx.emit(
                &self.slot_id,
                SlotEventKind::TransferFailed {
                    transfer_id: transfer_id.clone(),
                    reason: reason.clone(),
                },
            );
            if failovers >= self.ctx.settings.max_failovers {
                return Err(SlotError::FailoverExhausted { failovers, reason });
            }
            failovers += 1;

            let replacement = self
                .ctx
                .transfer_failed(&self.channel_id, &transfer_id, &reason, &self.cancel)
                .await?;
            peer = replacement.new_peer;
            transfer_id = replacement.new_transfer_id;
        }
    }

    /// One attempt against one peer, from `offset` to the end of the data.
    async fn pull(&self, peer: &PeerDescription, offset: u64) -> Result<u64, Interrupted> {
        let at = |error: TransferError| Interrupted {
            position: offset,
            error,
        };
        let mut transfer = self.ctx.transfers.input(peer, offset).map_err(at)?;
        let mut writer = self
            .backend
            .open_writer(offset)
            .await
            .map_err(|e| at(e.into()))?;

        let ended = loop {
            match transfer.transfer_chunk_to(&mut writer).await {
                Ok(Some(_)) => {}
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        let position = transfer.position();
        // Everything up to `position` must be durable before a reopen
        if let Err(e) = writer.shutdown().await {
            return Err(Interrupted {
                position,
                error: e.into(),
            });
        }
        match ended {
            Ok(()) => Ok(position),
            Err(error) => Err(Interrupted { position, error }),
        }
    }

    /// Marked released only once every step ran, so a release cut short
    /// by `close()` is redone there.
    async fn release(&self) {
        if self.released.load(Ordering::SeqCst) {
            return;
        }
        self.ctx.registry.unregister(&self.slot_id);
        self.mailbox.lock().take();
        if self.bound.load(Ordering::SeqCst) && !self.detached.load(Ordering::SeqCst) {
            self.ctx.unbind_quietly(&self.slot_uri).await;
        }
        if let Err(e) = self.backend.close().await {
            warn!(slot_id = %self.slot_id, error = %e, "Closing input backend failed");
        }
        self.released.store(true, Ordering::SeqCst);
    }

    fn instance(&self) -> SlotInstance {
        SlotInstance {
            slot_id: self.slot_id.clone(),
            slot_uri: self.slot_uri.clone(),
            channel_id: self.channel_id.clone(),
            task_id: self.ctx.identity.task_id.clone(),
            direction: Direction::Input,
            peer_url: self.ctx.identity.api_url.clone(),
        }
    }
}

impl Slot for InputSlot {
    fn id(&self) -> &str {
        &self.slot_id
    }

    fn start_transfer(&self, peer: PeerDescription, transfer_id: TransferId) -> Result<(), Status> {
        let mailbox = self.mailbox.lock().take().ok_or_else(|| {
            Status::failed_precondition("Transfer is already started in this slot")
        })?;
        mailbox
            .send((peer, transfer_id))
            .map_err(|_| Status::cancelled(format!("Slot {} is closed", self.slot_id)))
    }

    fn read(&self, _offset: u64) -> Result<ChunkStream, Status> {
        Err(Status::unimplemented("Input slots cannot be read"))
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(InputSlot::close(self))
    }

    fn disconnect(&self) {
        self.detached.store(true, Ordering::SeqCst);
        self.disconnected.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{
        ChannelManagerApi, TransferCompletedRequest, TransferFailedRequest, TransferFailedResponse,
        UnbindRequest,
    };
    use crate::backend::{
        BackendWriter, InputFileBackend, MemoryBlobStore, OutputSlotBackend,
    };
    use crate::config::SlotSettings;
    use crate::model::{BindResponse, Operation, OperationResponse, SlotOwner};
    use crate::slots::{SlotRegistry, SlotsContext, TaskIdentity};
    use crate::transfer::{ConnectionCache, LocalNetwork, TransferFactory};
    use std::io;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    // =========================================================================
    // Test Helpers
    // =========================================================================

    /// Hands consumers a storage peer and leaves the first unbind hanging.
    #[derive(Default)]
    struct StallingManager {
        unbinds: Mutex<Vec<String>>,
        stalled: AtomicBool,
    }

    impl ChannelManagerApi for StallingManager {
        fn bind(&self, request: BindRequest) -> BoxFuture<'_, Result<Operation, Status>> {
            let response = match request.role {
                Role::Consumer => BindResponse {
                    peer: Some(PeerDescription::storage("blob", "mem://in")),
                    transfer_id: Some(TransferId::generate()),
                },
                Role::Producer => BindResponse::default(),
            };
            Box::pin(async move {
                Ok(Operation::completed(
                    "bind",
                    None,
                    OperationResponse::Bind(response),
                ))
            })
        }

        fn unbind(&self, request: UnbindRequest) -> BoxFuture<'_, Result<Operation, Status>> {
            self.unbinds.lock().push(request.slot_uri);
            let stall = !self.stalled.swap(true, Ordering::SeqCst);
            Box::pin(async move {
                if stall {
                    std::future::pending::<()>().await;
                }
                Ok(Operation::completed("unbind", None, OperationResponse::Unbind))
            })
        }

        fn await_operation(
            &self,
            _operation_id: String,
            _timeout: Duration,
        ) -> BoxFuture<'_, Result<Operation, Status>> {
            Box::pin(async { Err(Status::unimplemented("await_operation")) })
        }

        fn transfer_completed(
            &self,
            _request: TransferCompletedRequest,
        ) -> BoxFuture<'_, Result<(), Status>> {
            Box::pin(async { Ok(()) })
        }

        fn transfer_failed(
            &self,
            _request: TransferFailedRequest,
        ) -> BoxFuture<'_, Result<TransferFailedResponse, Status>> {
            Box::pin(async { Err(Status::internal("no failover")) })
        }
    }

    /// File backend counting how often it is closed.
    struct CountingBackend {
        inner: InputFileBackend,
        closes: AtomicUsize,
    }

    impl InputSlotBackend for CountingBackend {
        fn open_writer(&self, offset: u64) -> BoxFuture<'_, io::Result<BackendWriter>> {
            self.inner.open_writer(offset)
        }

        fn finish(&self) -> BoxFuture<'_, io::Result<()>> {
            self.inner.finish()
        }

        fn to_output(&self) -> io::Result<Arc<dyn OutputSlotBackend>> {
            self.inner.to_output()
        }

        fn close(&self) -> BoxFuture<'_, io::Result<()>> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.inner.close()
        }
    }

    fn context(manager: Arc<StallingManager>) -> SlotsContext {
        let blobs = Arc::new(MemoryBlobStore::new());
        blobs.insert("mem://in", b"payload".to_vec());
        let transfers = Arc::new(TransferFactory::new(
            Arc::new(ConnectionCache::new(Arc::new(LocalNetwork::new()))),
            blobs,
            4,
        ));
        SlotsContext::new(
            TaskIdentity {
                execution_id: "exec1".into(),
                task_id: "t1".into(),
                owner: SlotOwner::Worker,
                api_url: "local://w".into(),
            },
            manager,
            Arc::new(SlotRegistry::new()),
            transfers,
            SlotSettings::default(),
        )
    }

    // =========================================================================
    // Release
    // =========================================================================

    #[tokio::test]
    async fn test_close_finishes_interrupted_release() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(StallingManager::default());
        let backend = Arc::new(CountingBackend {
            inner: InputFileBackend::new(dir.path().join("in")),
            closes: AtomicUsize::new(0),
        });
        let slot = InputSlot::spawn(backend.clone(), "s2", "ch1", context(manager.clone()));
        slot.ready().await.unwrap();

        // The post-download unbind hangs
        tokio::time::timeout(Duration::from_secs(5), async {
            while manager.unbinds.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(backend.closes.load(Ordering::SeqCst), 0);

        tokio::time::timeout(Duration::from_secs(5), slot.close())
            .await
            .unwrap();

        let own_unbinds = manager
            .unbinds
            .lock()
            .iter()
            .filter(|uri| uri.as_str() == slot.slot_uri())
            .count();
        assert_eq!(own_unbinds, 2);
        assert_eq!(backend.closes.load(Ordering::SeqCst), 1);
        assert_eq!(slot.state(), InputSlotState::Closed);
    }
}
