//! Shared pieces every slot of a task needs.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::events::{SlotError, SlotEvent, SlotEventKind};
use super::registry::{Slot, SlotRegistry};
use crate::api::{
    BindRequest, ChannelManagerApi, TransferCompletedRequest, TransferFailedRequest,
    TransferFailedResponse, UnbindRequest,
};
use crate::config::SlotSettings;
use crate::model::{BindResponse, Operation, OperationResponse, OperationResult, SlotOwner, TransferId};
use crate::retry::with_rpc_retries;
use crate::status::Status;
use crate::transfer::TransferFactory;

const EVENT_CAPACITY: usize = 256;

/// Who runs the slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskIdentity {
    pub execution_id: String,
    pub task_id: String,
    pub owner: SlotOwner,
    /// Url of this worker's slots API.
    pub api_url: String,
}

/// Every slot opened for one execution, for teardown.
#[derive(Default)]
pub struct ExecutionSlots {
    slots: DashMap<String, Arc<dyn Slot>>,
}

impl ExecutionSlots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, slot: Arc<dyn Slot>) {
        self.slots.insert(slot.id().to_string(), slot);
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Closes and forgets every tracked slot.
    pub async fn close_all(&self) {
        let slots: Vec<Arc<dyn Slot>> = self.slots.iter().map(|e| e.value().clone()).collect();
        self.slots.clear();
        debug!(count = slots.len(), "Closing all slots of execution");
        futures::future::join_all(slots.iter().map(|slot| slot.close())).await;
    }
}

#[derive(Clone)]
pub struct SlotsContext {
    pub identity: TaskIdentity,
    pub manager: Arc<dyn ChannelManagerApi>,
    pub registry: Arc<SlotRegistry>,
    pub transfers: Arc<TransferFactory>,
    pub slots: Arc<ExecutionSlots>,
    pub events: broadcast::Sender<SlotEvent>,
    pub settings: SlotSettings,
}

impl SlotsContext {
    pub fn new(
        identity: TaskIdentity,
        manager: Arc<dyn ChannelManagerApi>,
        registry: Arc<SlotRegistry>,
        transfers: Arc<TransferFactory>,
        settings: SlotSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            identity,
            manager,
            registry,
            transfers,
            slots: Arc::new(ExecutionSlots::new()),
            events,
            settings,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SlotEvent> {
        self.events.subscribe()
    }

    /// Binding identity of a slot served by this worker.
    pub fn slot_uri(&self, slot_id: &str) -> String {
        format!("{}/{}", self.identity.api_url, slot_id)
    }

    pub(crate) fn emit(&self, slot_id: &str, kind: SlotEventKind) {
        // No subscribers is fine
        let _ = self.events.send(SlotEvent {
            slot_id: slot_id.to_string(),
            kind,
        });
    }

    // =========================================================================
    // Channel manager calls
    // =========================================================================

    /// Binds and waits for the bind operation to finish.
    ///
    /// UNAVAILABLE is retried until `cancel` fires; a failed operation is
    /// returned as its error.
    pub(crate) async fn bind(
        &self,
        request: BindRequest,
        cancel: &CancellationToken,
    ) -> Result<BindResponse, SlotError> {
        let policy = self.settings.rpc_retry_policy();
        let operation = with_rpc_retries(&policy, cancel, "bind", || {
            let manager = self.manager.clone();
            let request = request.clone();
            async move { manager.bind(request).await }
        })
        .await?;
        match self.await_done(operation, cancel).await?.result {
            Some(OperationResult::Response(OperationResponse::Bind(response))) => Ok(response),
            Some(OperationResult::Error(status)) => Err(status.into()),
            other => Err(Status::internal(format!("Unexpected bind result {:?}", other)).into()),
        }
    }

    async fn await_done(
        &self,
        mut operation: Operation,
        cancel: &CancellationToken,
    ) -> Result<Operation, SlotError> {
        let policy = self.settings.rpc_retry_policy();
        let slice = self.settings.operation_poll_timeout();
        while !operation.is_done() {
            let operation_id = operation.id.clone();
            operation = with_rpc_retries(&policy, cancel, "await_operation", || {
                let manager = self.manager.clone();
                let operation_id = operation_id.clone();
                async move { manager.await_operation(operation_id, slice).await }
            })
            .await?;
        }
        Ok(operation)
    }

    /// Unbinds, logging instead of failing: the slot is going away anyway.
    pub(crate) async fn unbind_quietly(&self, slot_uri: &str) {
        let operation = match self.manager.unbind(UnbindRequest::new(slot_uri)).await {
            Ok(operation) => operation,
            Err(status) => {
                warn!(slot_uri, error = %status, "Unbind rejected");
                return;
            }
        };
        let settled = self
            .manager
            .await_operation(operation.id.clone(), self.settings.operation_poll_timeout())
            .await;
        match settled {
            Ok(op) if op.error().is_some() => {
                warn!(slot_uri, error = ?op.error(), "Unbind failed")
            }
            Ok(op) if !op.is_done() => debug!(slot_uri, operation_id = %op.id, "Unbind still running"),
            Ok(_) => debug!(slot_uri, "Slot unbound"),
            Err(status) => warn!(slot_uri, error = %status, "Unbind not confirmed"),
        }
    }

    pub(crate) async fn transfer_completed(
        &self,
        channel_id: &str,
        transfer_id: &TransferId,
        cancel: &CancellationToken,
    ) -> Result<(), Status> {
        let request = TransferCompletedRequest {
            transfer_id: transfer_id.clone(),
            channel_id: channel_id.to_string(),
            idempotency_key: Some(format!("{}:completed", transfer_id)),
        };
        let policy = self.settings.rpc_retry_policy();
        with_rpc_retries(&policy, cancel, "transfer_completed", || {
            let manager = self.manager.clone();
            let request = request.clone();
            async move { manager.transfer_completed(request).await }
        })
        .await
    }

    pub(crate) async fn transfer_failed(
        &self,
        channel_id: &str,
        transfer_id: &TransferId,
        reason: &str,
        cancel: &CancellationToken,
    ) -> Result<TransferFailedResponse, Status> {
        let request = TransferFailedRequest {
            transfer_id: transfer_id.clone(),
            channel_id: channel_id.to_string(),
            description: reason.to_string(),
            idempotency_key: Some(format!("{}:failed", transfer_id)),
        };
        let policy = self.settings.rpc_retry_policy();
        with_rpc_retries(&policy, cancel, "transfer_failed", || {
            let manager = self.manager.clone();
            let request = request.clone();
            async move { manager.transfer_failed(request).await }
        })
        .await
    }
}
