//! Channel manager request path.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use super::executor::ChannelOperationExecutor;
use super::idempotency;
use super::pairing::storage_endpoint;
use super::preconditions::{self, channel_not_found, endpoint_not_found};
use super::shared::ManagerCore;
use super::validator;
use crate::api::{
    BindRequest, BoxFuture, ChannelManagerApi, CreateChannelRequest, DestroyAllRequest,
    DestroyRequest, TransferCompletedRequest, TransferFailedRequest, TransferFailedResponse,
    UnbindRequest,
};
use crate::config::ManagerSettings;
use crate::model::{
    Channel, ChannelOperation, ChannelOperationKind, ChannelStatus, Endpoint, EndpointStatus,
    LifeStatus, Operation, OperationResponse, OperationResult, Role,
};
use crate::status::Status;
use crate::store::Storage;
use crate::transfer::{ConnectionCache, PeerConnector};

/// The control-plane authority over channels and their endpoints.
///
/// Mutating calls validate, check preconditions under the channel lock,
/// persist their intent together with a long-running operation, and
/// return that operation. The executor finishes the work.
pub struct ChannelManager {
    pub(super) core: Arc<ManagerCore>,
    executor: ChannelOperationExecutor,
}

impl ChannelManager {
    pub fn new(
        storage: Arc<dyn Storage>,
        connector: Arc<dyn PeerConnector>,
        settings: ManagerSettings,
    ) -> Self {
        let executor_workers = settings.executor_workers;
        let connections = Arc::new(ConnectionCache::new(connector));
        let core = Arc::new(ManagerCore::new(storage, connections, settings));
        let executor = ChannelOperationExecutor::new(core.clone(), executor_workers);
        Self { core, executor }
    }

    // =========================================================================
    // Channels
    // =========================================================================

    /// Creates a channel and registers its storage endpoints; returns its id.
    #[instrument(skip_all, fields(execution_id = %request.execution_id, name = %request.spec.name))]
    pub async fn create(&self, request: CreateChannelRequest) -> Result<String, Status> {
        validator::validate_create(&request)?;
        let channel = Channel::new(
            &request.execution_id,
            &request.workflow_name,
            request.spec.clone(),
        );
        let channel_id = channel.id.clone();

        let _guard = self.core.locks.acquire(&channel_id).await;
        self.core
            .transact(|tx| {
                if tx.find_channel(&channel.id)?.is_some() {
                    return Err(Status::already_exists(format!(
                        "Channel with id {} already exists",
                        channel.id
                    )));
                }
                tx.insert_channel(channel.clone())?;
                if let Some(uri) = &channel.spec.storage_producer_uri {
                    tx.insert_endpoint(storage_endpoint(&channel, Role::Producer, uri))?;
                }
                if let Some(uri) = &channel.spec.storage_consumer_uri {
                    tx.insert_endpoint(storage_endpoint(&channel, Role::Consumer, uri))?;
                }
                Ok(())
            })
            .await?;

        info!(channel_id = %channel_id, "Channel created");
        Ok(channel_id)
    }

    /// Marks a channel DESTROYING and schedules its teardown.
    #[instrument(skip_all, fields(channel_id = %request.channel_id))]
    pub async fn destroy(&self, request: DestroyRequest) -> Result<Operation, Status> {
        validator::validate_destroy(&request)?;
        let key = idempotency::operation_key(request.idempotency_key.as_deref(), &request)?;
        if let Some(existing) = self.core.existing_operation(key.as_ref()).await? {
            return Ok(existing);
        }

        let operation = Operation::new(format!("Destroy channel {}", request.channel_id), key.clone());
        let channel_operation = ChannelOperation::new(
            &operation.id,
            self.core.settings.operation_deadline(),
            ChannelOperationKind::Destroy {
                channel_ids: vec![request.channel_id.clone()],
            },
        );

        let persisted = {
            let _guard = self.core.locks.acquire(&request.channel_id).await;
            self.core
                .transact(|tx| {
                    if tx.find_channel(&request.channel_id)?.is_none() {
                        let done = finished(&operation, OperationResponse::Destroy);
                        tx.insert_operation(done.clone())?;
                        return Ok(Some(done));
                    }
                    tx.set_life_status(&request.channel_id, LifeStatus::Destroying)?;
                    tx.insert_operation(operation.clone())?;
                    tx.insert_channel_operation(channel_operation.clone())?;
                    Ok(None)
                })
                .await
        };
        match persisted {
            Ok(Some(done)) => {
                debug!("Channel already gone, destroy is a no-op");
                Ok(done)
            }
            Ok(None) => {
                info!(operation_id = %operation.id, "Channel destroy scheduled");
                self.executor.submit(channel_operation);
                Ok(operation)
            }
            Err(status) => self.core.recover_key_conflict(key.as_ref(), status).await,
        }
    }

    /// Destroys every alive channel of an execution, all or nothing.
    #[instrument(skip_all, fields(execution_id = %request.execution_id))]
    pub async fn destroy_all(&self, request: DestroyAllRequest) -> Result<Operation, Status> {
        validator::validate_destroy_all(&request)?;
        let key = idempotency::operation_key(request.idempotency_key.as_deref(), &request)?;
        if let Some(existing) = self.core.existing_operation(key.as_ref()).await? {
            return Ok(existing);
        }

        let channels = self
            .core
            .read(|tx| Ok(tx.list_channels(&request.execution_id)?))
            .await?;
        let channel_ids: Vec<String> = channels
            .into_iter()
            .filter(Channel::is_alive)
            .map(|c| c.id)
            .collect();
        let operation = Operation::new(
            format!("Destroy channels of execution {}", request.execution_id),
            key.clone(),
        );

        if channel_ids.is_empty() {
            let done = finished(&operation, OperationResponse::Destroy);
            let persisted = self
                .core
                .transact(|tx| Ok(tx.insert_operation(done.clone())?))
                .await;
            return match persisted {
                Ok(()) => Ok(done),
                Err(status) => self.core.recover_key_conflict(key.as_ref(), status).await,
            };
        }

        let channel_operation = ChannelOperation::new(
            &operation.id,
            self.core.settings.operation_deadline(),
            ChannelOperationKind::Destroy {
                channel_ids: channel_ids.clone(),
            },
        );
        let persisted = {
            let _guards = self.core.locks.acquire_many(&channel_ids).await;
            self.core
                .transact(|tx| {
                    for channel_id in &channel_ids {
                        // Gone since listing: nothing left to mark
                        if let Some(channel) = tx.find_channel(channel_id)? {
                            if channel.is_alive() {
                                tx.set_life_status(channel_id, LifeStatus::Destroying)?;
                            }
                        }
                    }
                    tx.insert_operation(operation.clone())?;
                    tx.insert_channel_operation(channel_operation.clone())?;
                    Ok(())
                })
                .await
        };
        if let Err(status) = persisted {
            return self.core.recover_key_conflict(key.as_ref(), status).await;
        }

        info!(
            operation_id = %operation.id,
            channels = channel_ids.len(),
            "Execution destroy scheduled"
        );
        self.executor.submit(channel_operation);
        Ok(operation)
    }

    /// Snapshot of an alive channel.
    pub async fn status(&self, channel_id: &str) -> Result<ChannelStatus, Status> {
        if channel_id.trim().is_empty() {
            return Err(Status::invalid_argument("channel_id must not be empty"));
        }
        self.core
            .read(|tx| {
                let channel = tx
                    .find_channel(channel_id)?
                    .filter(Channel::is_alive)
                    .ok_or_else(|| channel_not_found(channel_id))?;
                let endpoints = tx.list_endpoints(channel_id)?;
                Ok(ChannelStatus::new(channel, endpoints))
            })
            .await
    }

    /// Snapshots of every alive channel of an execution.
    pub async fn status_all(&self, execution_id: &str) -> Result<Vec<ChannelStatus>, Status> {
        if execution_id.trim().is_empty() {
            return Err(Status::invalid_argument("execution_id must not be empty"));
        }
        self.core
            .read(|tx| {
                let mut statuses = Vec::new();
                for channel in tx.list_channels(execution_id)? {
                    if channel.is_alive() {
                        let endpoints = tx.list_endpoints(&channel.id)?;
                        statuses.push(ChannelStatus::new(channel, endpoints));
                    }
                }
                Ok(statuses)
            })
            .await
    }

    // =========================================================================
    // Endpoints
    // =========================================================================

    /// Binds a slot to its channel.
    #[instrument(skip_all, fields(
        channel_id = %request.slot_instance.channel_id,
        slot_uri = %request.slot_instance.slot_uri,
        role = ?request.role
    ))]
    pub async fn bind(&self, request: BindRequest) -> Result<Operation, Status> {
        validator::validate_bind(&request)?;
        let key = idempotency::operation_key(request.idempotency_key.as_deref(), &request)?;
        if let Some(existing) = self.core.existing_operation(key.as_ref()).await? {
            return Ok(existing);
        }

        // Optimistic: rejects most bad binds without queueing on the lock
        self.core
            .read(|tx| preconditions::check_bind(tx, &request))
            .await?;

        let slot = &request.slot_instance;
        let operation = Operation::new(
            format!("Bind slot {} to channel {}", slot.slot_uri, slot.channel_id),
            key.clone(),
        );
        let channel_operation = ChannelOperation::new(
            &operation.id,
            self.core.settings.operation_deadline(),
            ChannelOperationKind::Bind {
                channel_id: slot.channel_id.clone(),
                slot_uri: slot.slot_uri.clone(),
            },
        );
        let endpoint = binding_endpoint(&request);

        let persisted = {
            let _guard = self.core.locks.acquire(&slot.channel_id).await;
            self.core
                .transact(|tx| {
                    preconditions::check_bind(tx, &request)?;
                    tx.insert_endpoint(endpoint.clone())?;
                    tx.insert_operation(operation.clone())?;
                    tx.insert_channel_operation(channel_operation.clone())?;
                    Ok(())
                })
                .await
        };
        if let Err(status) = persisted {
            return self.core.recover_key_conflict(key.as_ref(), status).await;
        }

        debug!(operation_id = %operation.id, "Bind scheduled");
        self.executor.submit(channel_operation);
        Ok(operation)
    }

    /// Unbinds an active endpoint.
    #[instrument(skip_all, fields(slot_uri = %request.slot_uri))]
    pub async fn unbind(&self, request: UnbindRequest) -> Result<Operation, Status> {
        validator::validate_unbind(&request)?;
        let key = idempotency::operation_key(request.idempotency_key.as_deref(), &request)?;
        if let Some(existing) = self.core.existing_operation(key.as_ref()).await? {
            return Ok(existing);
        }

        let endpoint = self
            .core
            .read(|tx| Ok(tx.find_endpoint(&request.slot_uri)?))
            .await?
            .ok_or_else(|| endpoint_not_found(&request.slot_uri))?;
        let channel_id = endpoint.channel_id;

        let operation = Operation::new(
            format!("Unbind slot {} from channel {}", request.slot_uri, channel_id),
            key.clone(),
        );
        let channel_operation = ChannelOperation::new(
            &operation.id,
            self.core.settings.operation_deadline(),
            ChannelOperationKind::Unbind {
                channel_id: channel_id.clone(),
                slot_uri: request.slot_uri.clone(),
            },
        );

        let persisted = {
            let _guard = self.core.locks.acquire(&channel_id).await;
            self.core
                .transact(|tx| {
                    let (_, mut endpoint) = preconditions::check_unbind(tx, &request)?;
                    if endpoint.channel_id != channel_id {
                        return Err(endpoint_not_found(&request.slot_uri));
                    }
                    endpoint.status = EndpointStatus::Unbinding;
                    tx.update_endpoint(endpoint)?;
                    tx.insert_operation(operation.clone())?;
                    tx.insert_channel_operation(channel_operation.clone())?;
                    Ok(())
                })
                .await
        };
        if let Err(status) = persisted {
            return self.core.recover_key_conflict(key.as_ref(), status).await;
        }

        debug!(operation_id = %operation.id, "Unbind scheduled");
        self.executor.submit(channel_operation);
        Ok(operation)
    }

    // =========================================================================
    // Operations
    // =========================================================================

    pub async fn get_operation(&self, operation_id: &str) -> Result<Operation, Status> {
        self.core
            .read(|tx| Ok(tx.find_operation(operation_id)?))
            .await?
            .ok_or_else(|| Status::not_found(format!("Operation {} not found", operation_id)))
    }

    /// Waits until the operation is done or `timeout` elapses, then returns
    /// it as it stands.
    pub async fn await_operation(
        &self,
        operation_id: &str,
        timeout: Duration,
    ) -> Result<Operation, Status> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register before reading so a completion in between is not missed
            let notified = self.core.completions().notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let operation = self.get_operation(operation_id).await?;
            if operation.is_done() {
                return Ok(operation);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.get_operation(operation_id).await;
            }
        }
    }

    /// Re-submits every persisted channel operation, as after a restart.
    pub async fn restore(&self) -> Result<usize, Status> {
        let pending = self
            .core
            .read(|tx| Ok(tx.list_channel_operations()?))
            .await?;
        let count = pending.len();
        for channel_operation in pending {
            debug!(
                operation_id = %channel_operation.operation_id,
                kind = %channel_operation.kind,
                "Restoring channel operation"
            );
            self.executor.submit(channel_operation);
        }
        info!(count, "Channel operations restored");
        Ok(count)
    }

    /// Stops accepting executor work and waits for running actions.
    pub async fn shutdown(&self) {
        self.core.shutdown.cancel();
        self.executor.shutdown().await;
    }

    // =========================================================================
    // Data-plane bookkeeping
    // =========================================================================

    /// Reports a finished transfer.
    pub async fn transfer_completed(&self, request: TransferCompletedRequest) -> Result<(), Status> {
        super::transfers::transfer_completed(&self.core, request).await
    }

    /// Reports a failed transfer and returns a replacement producer.
    pub async fn transfer_failed(
        &self,
        request: TransferFailedRequest,
    ) -> Result<TransferFailedResponse, Status> {
        super::transfers::transfer_failed(&self.core, request).await
    }
}

fn finished(operation: &Operation, response: OperationResponse) -> Operation {
    let mut done = operation.clone();
    done.result = Some(OperationResult::Response(response));
    done.modified_at = Utc::now();
    done
}

fn binding_endpoint(request: &BindRequest) -> Endpoint {
    let slot = &request.slot_instance;
    Endpoint {
        slot_uri: slot.slot_uri.clone(),
        channel_id: slot.channel_id.clone(),
        owner_task_id: slot.task_id.clone(),
        owner: request.owner,
        role: request.role,
        direction: slot.direction,
        status: EndpointStatus::Binding,
        peer: slot.peer(),
        class: request.priority,
        priority: request.priority.initial_priority(),
        connected: false,
        bound_at: Utc::now(),
    }
}

impl ChannelManagerApi for ChannelManager {
    fn bind(&self, request: BindRequest) -> BoxFuture<'_, Result<Operation, Status>> {
        Box::pin(ChannelManager::bind(self, request))
    }

    fn unbind(&self, request: UnbindRequest) -> BoxFuture<'_, Result<Operation, Status>> {
        Box::pin(ChannelManager::unbind(self, request))
    }

    fn await_operation(
        &self,
        operation_id: String,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<Operation, Status>> {
        Box::pin(async move { ChannelManager::await_operation(self, &operation_id, timeout).await })
    }

    fn transfer_completed(
        &self,
        request: TransferCompletedRequest,
    ) -> BoxFuture<'_, Result<(), Status>> {
        Box::pin(ChannelManager::transfer_completed(self, request))
    }

    fn transfer_failed(
        &self,
        request: TransferFailedRequest,
    ) -> BoxFuture<'_, Result<TransferFailedResponse, Status>> {
        Box::pin(ChannelManager::transfer_failed(self, request))
    }
}
