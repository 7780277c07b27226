//! State shared by the request path and the executor.

use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use std::fmt;
use tracing::{debug, error, info, warn};

use super::idempotency;
use super::lock::GrainedLock;
use crate::api::StartTransferRequest;
use crate::config::ManagerSettings;
use crate::model::{
    ChannelOperation, ChannelOperationKind, Endpoint, EndpointStatus, IdempotencyKey, Operation,
    OperationResult, PeerDescription, Transfer, TransferState,
};
use crate::retry::{with_rpc_retries, with_store_retries, RetryPolicy};
use crate::status::{Code, Status};
use crate::store::{Storage, StoreError, Transaction};
use crate::transfer::ConnectionCache;

/// Slot teardown calls, in the order they are made.
#[derive(Debug, Clone, Copy)]
enum SlotTeardown {
    Disconnect,
    Destroy,
}

impl fmt::Display for SlotTeardown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotTeardown::Disconnect => write!(f, "disconnect_slot"),
            SlotTeardown::Destroy => write!(f, "destroy_slot"),
        }
    }
}

pub(crate) struct ManagerCore {
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) locks: GrainedLock,
    pub(crate) settings: ManagerSettings,
    pub(crate) connections: Arc<ConnectionCache>,
    pub(crate) shutdown: CancellationToken,
    store_retry: RetryPolicy,
    push_retry: RetryPolicy,
    completed: Notify,
}

impl ManagerCore {
    pub(crate) fn new(
        storage: Arc<dyn Storage>,
        connections: Arc<ConnectionCache>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            storage,
            locks: GrainedLock::new(),
            store_retry: settings.store_retry_policy(),
            push_retry: settings.start_transfer_policy(),
            settings,
            connections,
            shutdown: CancellationToken::new(),
            completed: Notify::new(),
        }
    }

    /// Runs `f` in a transaction and commits, retrying transient failures.
    pub(crate) async fn transact<T, F>(&self, mut f: F) -> Result<T, Status>
    where
        T: Send,
        F: FnMut(&mut dyn Transaction) -> Result<T, Status> + Send,
    {
        with_store_retries(&self.store_retry, || {
            let mut tx = self.storage.begin()?;
            let value = f(tx.as_mut())?;
            tx.commit()?;
            Ok(value)
        })
        .await
    }

    /// Runs `f` against a transaction that is discarded afterwards.
    pub(crate) async fn read<T, F>(&self, mut f: F) -> Result<T, Status>
    where
        T: Send,
        F: FnMut(&dyn Transaction) -> Result<T, Status> + Send,
    {
        with_store_retries(&self.store_retry, || {
            let tx = self.storage.begin()?;
            f(tx.as_ref())
        })
        .await
    }

    /// The operation already created under `key`, if any.
    pub(crate) async fn existing_operation(
        &self,
        key: Option<&IdempotencyKey>,
    ) -> Result<Option<Operation>, Status> {
        match key {
            Some(key) => self.read(|tx| idempotency::find_operation(tx, key)).await,
            None => Ok(None),
        }
    }

    /// After a failed insert, a concurrent duplicate may have won the key.
    pub(crate) async fn recover_key_conflict(
        &self,
        key: Option<&IdempotencyKey>,
        status: Status,
    ) -> Result<Operation, Status> {
        match self.existing_operation(key).await? {
            Some(winner) => {
                debug!(operation_id = %winner.id, "Returning operation of concurrent duplicate");
                Ok(winner)
            }
            None => Err(status),
        }
    }

    pub(crate) fn notify_completed(&self) {
        self.completed.notify_waiters();
    }

    pub(crate) fn completions(&self) -> &Notify {
        &self.completed
    }

    /// Records `status` as the terminal error of `operation` and undoes
    /// the intent the request path persisted.
    pub(crate) async fn fail_operation(&self, operation: &ChannelOperation, status: Status) {
        let channel_ids = operation.kind.channel_ids();
        let _guards = self.locks.acquire_many(&channel_ids).await;
        let result = self
            .transact(|tx| {
                match tx.complete_operation(
                    &operation.operation_id,
                    OperationResult::Error(status.clone()),
                ) {
                    Ok(_) => {}
                    Err(StoreError::OperationCompleted(_)) => {
                        warn!(
                            operation_id = %operation.operation_id,
                            "Operation already completed, keeping its result"
                        );
                    }
                    Err(e) => return Err(e.into()),
                }
                match &operation.kind {
                    ChannelOperationKind::Bind { slot_uri, .. } => {
                        if let Some(endpoint) = tx.find_endpoint(slot_uri)? {
                            if endpoint.status == EndpointStatus::Binding {
                                tx.delete_endpoint(slot_uri)?;
                            }
                        }
                    }
                    ChannelOperationKind::Unbind { slot_uri, .. } => {
                        if let Some(mut endpoint) = tx.find_endpoint(slot_uri)? {
                            if endpoint.status == EndpointStatus::Unbinding {
                                endpoint.status = EndpointStatus::Active;
                                tx.update_endpoint(endpoint)?;
                            }
                        }
                    }
                    // Channels stay DESTROYING for inspection
                    ChannelOperationKind::Destroy { .. } => {}
                }
                match tx.delete_channel_operation(&operation.operation_id) {
                    Ok(()) | Err(StoreError::NotFound(_)) => Ok(()),
                    Err(e) => Err(e.into()),
                }
            })
            .await;
        if let Err(e) = result {
            error!(
                operation_id = %operation.operation_id,
                error = %e,
                "Failed to record operation failure"
            );
        }
        self.notify_completed();
    }

    /// Hands a PENDING transfer to its consumer slot.
    ///
    /// The transfer becomes ACTIVE before the push so the consumer can
    /// report on it right away. If the push finally fails the transfer is
    /// FAILED and the consumer is unpaired again.
    pub(crate) async fn push_start_transfer(&self, transfer: Transfer) {
        let PeerDescription::Slot { peer_id, url } = &transfer.to else {
            return;
        };
        let activated = {
            let _guard = self.locks.acquire(&transfer.channel_id).await;
            self.transact(|tx| match tx.find_transfer(&transfer.id)? {
                Some(mut current) if current.state == TransferState::Pending => {
                    current.state = TransferState::Active;
                    tx.update_transfer(current)?;
                    Ok(true)
                }
                _ => Ok(false),
            })
            .await
        };
        match activated {
            Ok(true) => {}
            Ok(false) => {
                debug!(transfer_id = %transfer.id, "Transfer no longer pending, skipping push");
                return;
            }
            Err(e) => {
                error!(transfer_id = %transfer.id, error = %e, "Cannot activate transfer");
                return;
            }
        }

        let request = StartTransferRequest {
            slot_id: peer_id.clone(),
            peer: transfer.from.clone(),
            transfer_id: transfer.id.clone(),
        };
        let pushed = with_rpc_retries(&self.push_retry, &self.shutdown, "start_transfer", || {
            let connections = self.connections.clone();
            let url = url.clone();
            let request = request.clone();
            async move {
                let connection = connections.connect(&url)?;
                connection.start_transfer(request).await
            }
        })
        .await;

        match pushed {
            Ok(()) => debug!(
                transfer_id = %transfer.id,
                consumer = %transfer.to_uri,
                producer = %transfer.from_uri,
                "Pushed peer to waiting consumer"
            ),
            Err(status) => {
                warn!(
                    transfer_id = %transfer.id,
                    consumer = %transfer.to_uri,
                    error = %status,
                    "Push of peer to consumer failed"
                );
                self.abandon_push(&transfer, &status).await;
            }
        }
    }

    /// Disconnects, then destroys, the live slot behind `endpoint`.
    ///
    /// A slot its worker no longer knows counts as torn down. Storage
    /// endpoints have no slot.
    pub(crate) async fn teardown_slot(&self, endpoint: &Endpoint) -> Result<(), Status> {
        let PeerDescription::Slot { peer_id, url } = &endpoint.peer else {
            return Ok(());
        };
        for call in [SlotTeardown::Disconnect, SlotTeardown::Destroy] {
            let what = call.to_string();
            let result = with_rpc_retries(&self.push_retry, &self.shutdown, &what, || {
                let connections = self.connections.clone();
                let url = url.clone();
                let slot_id = peer_id.clone();
                async move {
                    let connection = connections.connect(&url)?;
                    match call {
                        SlotTeardown::Disconnect => connection.disconnect_slot(slot_id).await,
                        SlotTeardown::Destroy => connection.destroy_slot(slot_id).await,
                    }
                }
            })
            .await;
            match result {
                Ok(()) => debug!(slot_uri = %endpoint.slot_uri, %call, "Slot teardown call done"),
                Err(status) if status.code() == Code::NotFound => {
                    info!(slot_uri = %endpoint.slot_uri, %call, "Slot already gone");
                    return Ok(());
                }
                Err(status) => {
                    error!(slot_uri = %endpoint.slot_uri, %call, error = %status, "Slot teardown failed");
                    return Err(Status::internal(format!(
                        "Cannot {} slot {}: {}",
                        call, endpoint.slot_uri, status
                    )));
                }
            }
        }
        Ok(())
    }

    async fn abandon_push(&self, transfer: &Transfer, status: &Status) {
        // The consumer already has a transfer of its own
        let unpair = status.code() != Code::FailedPrecondition;
        let _guard = self.locks.acquire(&transfer.channel_id).await;
        let result = self
            .transact(|tx| {
                if let Some(mut current) = tx.find_transfer(&transfer.id)? {
                    if !current.state.is_terminal() {
                        current.state = TransferState::Failed;
                        current.failure = Some(status.to_string());
                        tx.update_transfer(current)?;
                    }
                }
                if unpair {
                    if let Some(mut consumer) = tx.find_endpoint(&transfer.to_uri)? {
                        consumer.connected = false;
                        tx.update_endpoint(consumer)?;
                    }
                }
                Ok(())
            })
            .await;
        if let Err(e) = result {
            error!(transfer_id = %transfer.id, error = %e, "Cannot record failed push");
        }
    }
}
