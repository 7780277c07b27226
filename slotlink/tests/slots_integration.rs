//! Integration tests for input and output slots against a live manager.
//!
//! Workers are wired through an in-process network: each worker serves
//! its slot registry at its own url, and the manager pushes peers to the
//! same urls.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

use slotlink::api::{
    BoxFuture, CreateChannelRequest, DestroyAllRequest, DestroyRequest, SlotsApi,
    StartTransferRequest,
};
use slotlink::backend::{
    BackendReader, InputFileBackend, MemoryBlobStore, OutputFileBackend, OutputSlotBackend,
};
use slotlink::config::{ManagerSettings, SlotSettings};
use slotlink::manager::ChannelManager;
use slotlink::model::{ChannelSpec, OperationResponse, PeerDescription, SlotOwner, TransferId};
use slotlink::slots::{
    InputSlot, InputSlotState, OutputSlot, SlotError, SlotEventKind, SlotRegistry, SlotsContext,
    TaskIdentity,
};
use slotlink::status::Code;
use slotlink::store::MemoryStorage;
use slotlink::transfer::{ConnectionCache, LocalNetwork, TransferFactory};

// =============================================================================
// Test Helpers
// =============================================================================

const WAIT: Duration = Duration::from_secs(10);

fn slot_settings(max_failovers: usize) -> SlotSettings {
    SlotSettings {
        chunk_size: 4,
        read_join_grace_ms: 50,
        max_failovers,
        rpc_initial_backoff_ms: 5,
        rpc_max_backoff_ms: 50,
        operation_poll_timeout_ms: 200,
    }
}

struct Cluster {
    manager: Arc<ChannelManager>,
    network: Arc<LocalNetwork>,
    blobs: Arc<MemoryBlobStore>,
    dir: TempDir,
}

struct Worker {
    ctx: SlotsContext,
    registry: Arc<SlotRegistry>,
}

impl Cluster {
    fn new() -> Self {
        let network = Arc::new(LocalNetwork::new());
        let manager = Arc::new(ChannelManager::new(
            Arc::new(MemoryStorage::new()),
            network.clone(),
            ManagerSettings::default(),
        ));
        Self {
            manager,
            network,
            blobs: Arc::new(MemoryBlobStore::new()),
            dir: TempDir::new().unwrap(),
        }
    }

    async fn channel(&self, spec: ChannelSpec) -> String {
        self.manager
            .create(CreateChannelRequest {
                execution_id: "exec1".into(),
                workflow_name: "wf".into(),
                spec,
            })
            .await
            .unwrap()
    }

    fn worker(&self, name: &str, settings: SlotSettings) -> Worker {
        let url = format!("local://{}", name);
        let registry = Arc::new(SlotRegistry::new());
        self.network.register(url.clone(), registry.clone());
        let transfers = Arc::new(TransferFactory::new(
            Arc::new(ConnectionCache::new(self.network.clone())),
            self.blobs.clone(),
            settings.chunk_size,
        ));
        let ctx = SlotsContext::new(
            TaskIdentity {
                execution_id: "exec1".into(),
                task_id: name.into(),
                owner: SlotOwner::Worker,
                api_url: url,
            },
            self.manager.clone(),
            registry.clone(),
            transfers,
            settings,
        );
        Worker { ctx, registry }
    }

    /// A finished output file holding `data`.
    async fn produced_file(&self, name: &str, data: &[u8]) -> Arc<dyn OutputSlotBackend> {
        let path = self.dir.path().join(name);
        tokio::fs::write(&path, data).await.unwrap();
        Arc::new(OutputFileBackend::completed(path))
    }

    fn download_file(&self, name: &str) -> (Arc<InputFileBackend>, std::path::PathBuf) {
        let path = self.dir.path().join(name);
        (Arc::new(InputFileBackend::new(path.clone())), path)
    }
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Serves `data[..fail_at]`, then fails every read.
struct BrokenBackend {
    data: Vec<u8>,
    fail_at: usize,
}

struct FailingReader;

impl AsyncRead for FailingReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "disk vanished")))
    }
}

impl OutputSlotBackend for BrokenBackend {
    fn wait_completed(&self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn read_from(&self, offset: u64) -> BoxFuture<'_, io::Result<BackendReader>> {
        Box::pin(async move {
            let start = (offset as usize).min(self.fail_at);
            let good = io::Cursor::new(self.data[start..self.fail_at].to_vec());
            Ok(Box::new(good.chain(FailingReader)) as BackendReader)
        })
    }

    fn close(&self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

async fn within<T>(what: &str, fut: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(WAIT, fut)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_producer_to_consumer_then_destroy() {
    let cluster = Cluster::new();
    let ch1 = cluster.channel(ChannelSpec::new("ch1", "plain")).await;
    let a = cluster.worker("worker-a", slot_settings(4));
    let b = cluster.worker("worker-b", slot_settings(4));
    let data = payload(37);

    let s1 = OutputSlot::spawn(cluster.produced_file("s1", &data).await, "s1", &ch1, a.ctx.clone());
    within("producer bound", s1.prepared()).await.unwrap();

    let (backend, path) = cluster.download_file("s2");
    let s2 = InputSlot::spawn(backend, "s2", &ch1, b.ctx.clone());
    within("consumer ready", s2.ready()).await.unwrap();
    assert_eq!(s2.state(), InputSlotState::Ready);
    assert_eq!(tokio::fs::read(&path).await.unwrap(), data);

    s2.close().await;
    s1.close().await;
    assert_eq!(s2.state(), InputSlotState::Closed);
    assert!(a.registry.is_empty());
    assert!(b.registry.is_empty());

    let operation = cluster
        .manager
        .destroy(DestroyRequest {
            channel_id: ch1.clone(),
            idempotency_key: None,
        })
        .await
        .unwrap();
    let done = cluster
        .manager
        .await_operation(&operation.id, WAIT)
        .await
        .unwrap();
    assert_eq!(done.response(), Some(&OperationResponse::Destroy));
    assert_eq!(
        cluster.manager.status(&ch1).await.unwrap_err().code(),
        Code::NotFound
    );
}

#[tokio::test]
async fn test_destroy_tears_down_live_slots() {
    let cluster = Cluster::new();
    let ch1 = cluster.channel(ChannelSpec::new("ch1", "plain")).await;
    let ch2 = cluster.channel(ChannelSpec::new("ch2", "plain")).await;
    let a = cluster.worker("worker-a", slot_settings(4));
    let b = cluster.worker("worker-b", slot_settings(4));

    let (backend, _) = cluster.download_file("s2");
    let s2 = InputSlot::spawn(backend, "s2", &ch1, b.ctx.clone());
    let mut states = s2.states();
    within(
        "consumer waiting",
        states.wait_for(|s| *s == InputSlotState::WaitingForPeer),
    )
    .await
    .unwrap();
    let s3 = OutputSlot::spawn(cluster.produced_file("s3", &payload(8)).await, "s3", &ch2, a.ctx.clone());
    within("producer bound", s3.prepared()).await.unwrap();

    let operation = cluster
        .manager
        .destroy_all(DestroyAllRequest {
            execution_id: "exec1".into(),
            idempotency_key: None,
        })
        .await
        .unwrap();
    let done = within(
        "destroy",
        cluster.manager.await_operation(&operation.id, WAIT),
    )
    .await
    .unwrap();
    assert_eq!(done.response(), Some(&OperationResponse::Destroy));

    // Both slots are closed by the time the destroy is done
    assert_eq!(s2.state(), InputSlotState::Closed);
    assert_eq!(s2.ready().await, Err(SlotError::Disconnected));
    assert!(!b.registry.contains("s2"));
    assert!(!a.registry.contains("s3"));
    let err = a.registry.read("s3".into(), 0).await.unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
    for channel in [&ch1, &ch2] {
        assert_eq!(
            cluster.manager.status(channel).await.unwrap_err().code(),
            Code::NotFound
        );
    }

    // Owners closing afterwards find nothing left to release
    s2.close().await;
    s3.close().await;
    a.ctx.slots.close_all().await;
    b.ctx.slots.close_all().await;
}

#[tokio::test]
async fn test_waiting_consumer_receives_pushed_producer() {
    let cluster = Cluster::new();
    let ch1 = cluster.channel(ChannelSpec::new("ch1", "plain")).await;
    let a = cluster.worker("worker-a", slot_settings(4));
    let b = cluster.worker("worker-b", slot_settings(4));
    let data = payload(9);

    let (backend, path) = cluster.download_file("s2");
    let s2 = InputSlot::spawn(backend, "s2", &ch1, b.ctx.clone());
    let mut states = s2.states();
    within(
        "consumer waiting",
        states.wait_for(|s| *s == InputSlotState::WaitingForPeer),
    )
    .await
    .unwrap();

    let _s1 = OutputSlot::spawn(cluster.produced_file("s1", &data).await, "s1", &ch1, a.ctx.clone());
    within("consumer ready", s2.ready()).await.unwrap();
    assert_eq!(tokio::fs::read(&path).await.unwrap(), data);

    // A second push is refused once the peer is delivered
    let err = b
        .registry
        .start_transfer(StartTransferRequest {
            slot_id: "s2".into(),
            peer: PeerDescription::slot("s1", "local://worker-a"),
            transfer_id: TransferId::generate(),
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err.code(),
        Code::NotFound | Code::FailedPrecondition
    ));

    a.ctx.slots.close_all().await;
    b.ctx.slots.close_all().await;
}

#[tokio::test]
async fn test_peer_failure_fails_over_and_resumes() {
    let cluster = Cluster::new();
    let ch1 = cluster.channel(ChannelSpec::new("ch1", "plain")).await;
    let a = cluster.worker("worker-a", slot_settings(4));
    let backup = cluster.worker("worker-backup", slot_settings(4));
    let b = cluster.worker("worker-b", slot_settings(4));
    let data = payload(32);

    let flaky = OutputSlot::spawn(
        Arc::new(BrokenBackend {
            data: data.clone(),
            fail_at: 16,
        }),
        "flaky",
        &ch1,
        a.ctx.clone(),
    );
    let healthy = OutputSlot::spawn_with_priority(
        cluster.produced_file("copy", &data).await,
        "copy",
        &ch1,
        backup.ctx.clone(),
        slotlink::model::PriorityClass::Backup,
    );
    within("flaky bound", flaky.prepared()).await.unwrap();
    within("backup bound", healthy.prepared()).await.unwrap();

    let mut events = b.ctx.subscribe();
    let (backend, path) = cluster.download_file("s2");
    let s2 = InputSlot::spawn(backend, "s2", &ch1, b.ctx.clone());
    within("consumer ready", s2.ready()).await.unwrap();

    let downloaded = tokio::fs::read(&path).await.unwrap();
    assert_eq!(downloaded.len(), data.len());
    assert_eq!(downloaded, data);

    let mut failed = 0;
    let mut completed_bytes = None;
    while let Ok(event) = events.try_recv() {
        match event.kind {
            SlotEventKind::TransferFailed { .. } => failed += 1,
            SlotEventKind::TransferCompleted { bytes, .. } => completed_bytes = Some(bytes),
            _ => {}
        }
    }
    assert_eq!(failed, 1);
    assert_eq!(completed_bytes, Some(data.len() as u64));

    for worker in [&a, &backup, &b] {
        worker.ctx.slots.close_all().await;
    }
}

#[tokio::test]
async fn test_failover_exhaustion_fails_the_slot() {
    let cluster = Cluster::new();
    let ch1 = cluster.channel(ChannelSpec::new("ch1", "plain")).await;
    let a = cluster.worker("worker-a", slot_settings(0));
    let b = cluster.worker("worker-b", slot_settings(0));

    let flaky = OutputSlot::spawn(
        Arc::new(BrokenBackend {
            data: payload(8),
            fail_at: 4,
        }),
        "flaky",
        &ch1,
        a.ctx.clone(),
    );
    within("flaky bound", flaky.prepared()).await.unwrap();

    let (backend, _) = cluster.download_file("s2");
    let s2 = InputSlot::spawn(backend, "s2", &ch1, b.ctx.clone());
    let err = within("consumer failure", s2.ready()).await.unwrap_err();
    assert!(matches!(err, SlotError::FailoverExhausted { failovers: 0, .. }));
    assert_eq!(s2.state(), InputSlotState::Closed);

    a.ctx.slots.close_all().await;
    b.ctx.slots.close_all().await;
}

#[tokio::test]
async fn test_ready_input_publishes_companion() {
    let cluster = Cluster::new();
    let ch1 = cluster.channel(ChannelSpec::new("ch1", "plain")).await;
    let a = cluster.worker("worker-a", slot_settings(4));
    let b = cluster.worker("worker-b", slot_settings(4));
    let c = cluster.worker("worker-c", slot_settings(4));
    let data = payload(12);

    let s1 = OutputSlot::spawn(cluster.produced_file("s1", &data).await, "s1", &ch1, a.ctx.clone());
    within("producer bound", s1.prepared()).await.unwrap();
    let (backend, _) = cluster.download_file("s2");
    let s2 = InputSlot::spawn(backend, "s2", &ch1, b.ctx.clone());
    within("consumer ready", s2.ready()).await.unwrap();

    let companion = s2.companion().unwrap();
    assert_eq!(companion.id(), "s2-out");
    within("companion bound", companion.prepared()).await.unwrap();

    // The original producer leaves; a late consumer reads from the companion
    s1.close().await;
    let (backend, path) = cluster.download_file("s3");
    let s3 = InputSlot::spawn(backend, "s3", &ch1, c.ctx.clone());
    within("late consumer ready", s3.ready()).await.unwrap();
    assert_eq!(tokio::fs::read(&path).await.unwrap(), data);

    let status = cluster.manager.status(&ch1).await.unwrap();
    assert!(status
        .producers
        .iter()
        .any(|e| e.slot_uri == companion.slot_uri()));

    for worker in [&a, &b, &c] {
        worker.ctx.slots.close_all().await;
    }
}

#[tokio::test]
async fn test_producer_uploads_to_storage_consumer() {
    let cluster = Cluster::new();
    let ch1 = cluster
        .channel(ChannelSpec::new("ch1", "plain").with_storage_consumer("s3://bucket/ch1"))
        .await;
    let a = cluster.worker("worker-a", slot_settings(4));
    let data = payload(21);

    let s1 = OutputSlot::spawn(cluster.produced_file("s1", &data).await, "s1", &ch1, a.ctx.clone());
    within("upload", s1.prepared()).await.unwrap();
    assert_eq!(cluster.blobs.object("s3://bucket/ch1").unwrap(), &data[..]);

    let status = cluster.manager.status(&ch1).await.unwrap();
    assert!(status.consumers.is_empty());
    assert!(status.producers.iter().any(|e| e.owner == SlotOwner::Storage));

    s1.close().await;
}

#[tokio::test]
async fn test_consumer_downloads_from_storage_producer() {
    let cluster = Cluster::new();
    let data = payload(10);
    cluster.blobs.insert("s3://bucket/input", data.clone());
    let ch1 = cluster
        .channel(ChannelSpec::new("ch1", "plain").with_storage_producer("s3://bucket/input"))
        .await;
    let b = cluster.worker("worker-b", slot_settings(4));

    let (backend, path) = cluster.download_file("s2");
    let s2 = InputSlot::spawn(backend, "s2", &ch1, b.ctx.clone());
    within("consumer ready", s2.ready()).await.unwrap();
    assert_eq!(tokio::fs::read(&path).await.unwrap(), data);

    b.ctx.slots.close_all().await;
}

#[tokio::test]
async fn test_close_interrupts_waiting_consumer() {
    let cluster = Cluster::new();
    let ch1 = cluster.channel(ChannelSpec::new("ch1", "plain")).await;
    let b = cluster.worker("worker-b", slot_settings(4));

    let (backend, _) = cluster.download_file("s2");
    let s2 = InputSlot::spawn(backend, "s2", &ch1, b.ctx.clone());
    let mut states = s2.states();
    within(
        "consumer waiting",
        states.wait_for(|s| *s == InputSlotState::WaitingForPeer),
    )
    .await
    .unwrap();

    // Input slots serve no reads
    let err = b.registry.read("s2".into(), 0).await.unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);

    s2.close().await;
    s2.close().await;
    assert_eq!(s2.ready().await, Err(SlotError::Closed));
    assert!(b.registry.is_empty());
    let status = cluster.manager.status(&ch1).await.unwrap();
    assert!(status.consumers.is_empty());
}

#[tokio::test]
async fn test_output_slot_rejects_pushes_and_serves_reads() {
    let cluster = Cluster::new();
    let ch1 = cluster.channel(ChannelSpec::new("ch1", "plain")).await;
    let a = cluster.worker("worker-a", slot_settings(4));
    let data = payload(10);

    let s1 = OutputSlot::spawn(cluster.produced_file("s1", &data).await, "s1", &ch1, a.ctx.clone());
    within("producer bound", s1.prepared()).await.unwrap();

    let err = a
        .registry
        .start_transfer(StartTransferRequest {
            slot_id: "s1".into(),
            peer: PeerDescription::slot("x", "local://x"),
            transfer_id: TransferId::generate(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);

    let mut stream = a.registry.read("s1".into(), 6).await.unwrap();
    let mut received = Vec::new();
    while let Some(chunk) = stream.next().await {
        match chunk.unwrap() {
            slotlink::api::ReadChunk::Data(bytes) => {
                assert!(bytes.len() <= 4);
                received.extend_from_slice(&bytes);
            }
            slotlink::api::ReadChunk::EndOfStream => break,
        }
    }
    assert_eq!(received, &data[6..]);

    s1.close().await;
    let err = a.registry.read("s1".into(), 0).await.unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
}
