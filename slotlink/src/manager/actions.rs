//! The asynchronous half of bind, unbind and destroy.
//!
//! Each action re-reads state under the channel lock: anything that moved
//! under it since the request was accepted is a CANCELLED operation.

use std::sync::Arc;
use tracing::{debug, info};

use super::pairing;
use super::shared::ManagerCore;
use super::transfers::fail_open_transfers;
use crate::model::{
    Channel, ChannelOperation, ChannelOperationKind, Endpoint, EndpointStatus,
    OperationResponse, OperationResult, Role,
};
use crate::status::Status;
use crate::store::{StoreError, Transaction};

pub(super) async fn run(core: Arc<ManagerCore>, operation: ChannelOperation) -> Result<(), Status> {
    match &operation.kind {
        ChannelOperationKind::Bind {
            channel_id,
            slot_uri,
        } => bind(&core, &operation, channel_id, slot_uri).await,
        ChannelOperationKind::Unbind {
            channel_id,
            slot_uri,
        } => unbind(&core, &operation, channel_id, slot_uri).await,
        ChannelOperationKind::Destroy { channel_ids } => {
            destroy(&core, &operation, channel_ids.clone()).await
        }
    }
}

/// Completes the operation and consumes its channel operation.
fn complete(
    tx: &mut dyn Transaction,
    operation: &ChannelOperation,
    response: OperationResponse,
) -> Result<(), Status> {
    match tx.complete_operation(&operation.operation_id, OperationResult::Response(response)) {
        Ok(_) => {}
        Err(StoreError::OperationCompleted(id)) => {
            return Err(Status::cancelled(format!("Operation {} is already completed", id)));
        }
        Err(e) => return Err(e.into()),
    }
    match tx.delete_channel_operation(&operation.operation_id) {
        Ok(()) | Err(StoreError::NotFound(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn bind(
    core: &Arc<ManagerCore>,
    operation: &ChannelOperation,
    channel_id: &str,
    slot_uri: &str,
) -> Result<(), Status> {
    let pushes = {
        let _guard = core.locks.acquire(channel_id).await;
        core.transact(|tx| {
            if tx.find_channel(channel_id)?.filter(Channel::is_alive).is_none() {
                return Err(Status::cancelled(format!(
                    "Channel {} is no longer alive",
                    channel_id
                )));
            }
            let mut endpoint = tx
                .find_endpoint(slot_uri)?
                .filter(|e| e.channel_id == channel_id && e.status == EndpointStatus::Binding)
                .ok_or_else(|| {
                    Status::cancelled(format!("Endpoint {} is no longer binding", slot_uri))
                })?;
            endpoint.status = EndpointStatus::Active;

            let others: Vec<Endpoint> = tx
                .list_endpoints(channel_id)?
                .into_iter()
                .filter(|e| e.slot_uri != slot_uri)
                .collect();
            let (response, pushes) = match endpoint.role {
                Role::Consumer => (
                    pairing::pair_consumer(tx, &mut endpoint, &others)?,
                    Vec::new(),
                ),
                Role::Producer => pairing::pair_producer(tx, &endpoint, &others)?,
            };
            tx.update_endpoint(endpoint)?;
            complete(tx, operation, OperationResponse::Bind(response))?;
            Ok(pushes)
        })
        .await?
    };

    info!(
        operation_id = %operation.operation_id,
        channel_id,
        slot_uri,
        waiting_consumers = pushes.len(),
        "Endpoint bound"
    );
    core.notify_completed();

    // Pushes outlive the action; its deadline covers the binding only
    for transfer in pushes {
        let core = core.clone();
        tokio::spawn(async move { core.push_start_transfer(transfer).await });
    }
    Ok(())
}

async fn unbind(
    core: &ManagerCore,
    operation: &ChannelOperation,
    channel_id: &str,
    slot_uri: &str,
) -> Result<(), Status> {
    // A producer's slot is torn down before its endpoint goes away
    let producer = {
        let _guard = core.locks.acquire(channel_id).await;
        core.read(|tx| {
            Ok(tx.find_endpoint(slot_uri)?.filter(|e| {
                e.channel_id == channel_id
                    && e.status == EndpointStatus::Unbinding
                    && e.is_producer()
            }))
        })
        .await?
    };
    if let Some(producer) = &producer {
        core.teardown_slot(producer).await?;
    }

    let _guard = core.locks.acquire(channel_id).await;
    let channel_deleted = core
        .transact(|tx| {
            match tx.find_endpoint(slot_uri)?.filter(|e| e.channel_id == channel_id) {
                Some(e) if e.status == EndpointStatus::Unbinding => tx.delete_endpoint(slot_uri)?,
                Some(_) => {
                    return Err(Status::cancelled(format!(
                        "Endpoint {} is no longer unbinding",
                        slot_uri
                    )))
                }
                // Already removed by a destroy
                None => {}
            }

            let mut deleted = false;
            if let Some(channel) = tx.find_channel(channel_id)? {
                if !channel.is_alive() && tx.list_endpoints(channel_id)?.is_empty() {
                    fail_open_transfers(tx, &channel, "channel destroyed")?;
                    tx.delete_channel(channel_id)?;
                    deleted = true;
                }
            }
            complete(tx, operation, OperationResponse::Unbind)?;
            Ok(deleted)
        })
        .await?;

    debug!(operation_id = %operation.operation_id, channel_id, slot_uri, "Endpoint unbound");
    if channel_deleted {
        info!(channel_id, "Last endpoint of destroying channel unbound, channel deleted");
    }
    core.notify_completed();
    Ok(())
}

/// Tears down each channel in turn: its live slots first, consumers
/// before producers, then its records. Progress is persisted per channel
/// so a restored destroy skips what is already gone.
async fn destroy(
    core: &ManagerCore,
    operation: &ChannelOperation,
    channel_ids: Vec<String>,
) -> Result<(), Status> {
    for (done, channel_id) in channel_ids.iter().enumerate() {
        let rest = channel_ids[done + 1..].to_vec();

        let endpoints = {
            let _guard = core.locks.acquire(channel_id).await;
            core.read(|tx| match tx.find_channel(channel_id)? {
                Some(channel) if channel.is_alive() => Err(revived(channel_id)),
                Some(_) => Ok(tx.list_endpoints(channel_id)?),
                None => Ok(Vec::new()),
            })
            .await?
        };
        // Slots unbind through this manager while closing; no lock held
        let (consumers, producers): (Vec<Endpoint>, Vec<Endpoint>) =
            endpoints.into_iter().partition(Endpoint::is_consumer);
        for endpoint in consumers.iter().chain(producers.iter()) {
            core.teardown_slot(endpoint).await?;
        }

        let _guard = core.locks.acquire(channel_id).await;
        let removed = core
            .transact(|tx| {
                let mut removed = None;
                if let Some(channel) = tx.find_channel(channel_id)? {
                    if channel.is_alive() {
                        return Err(revived(channel_id));
                    }
                    let endpoints = tx.list_endpoints(channel_id)?;
                    for endpoint in &endpoints {
                        match tx.delete_endpoint(&endpoint.slot_uri) {
                            Ok(()) | Err(StoreError::NotFound(_)) => {}
                            Err(e) => return Err(e.into()),
                        }
                    }
                    let transfers = fail_open_transfers(tx, &channel, "channel destroyed")?;
                    tx.delete_channel(channel_id)?;
                    removed = Some((endpoints.len(), transfers));
                }

                let mut progress = operation.clone();
                progress.kind = ChannelOperationKind::Destroy {
                    channel_ids: rest.clone(),
                };
                match tx.update_channel_operation(progress) {
                    Ok(()) | Err(StoreError::NotFound(_)) => Ok(removed),
                    Err(e) => Err(e.into()),
                }
            })
            .await?;

        match removed {
            Some((endpoints, transfers)) => info!(
                channel_id = %channel_id,
                endpoints,
                torn_down = consumers.len() + producers.len(),
                failed_transfers = transfers,
                "Channel destroyed"
            ),
            None => debug!(channel_id = %channel_id, "Channel already gone"),
        }
    }

    core.transact(|tx| complete(tx, operation, OperationResponse::Destroy))
        .await?;
    core.notify_completed();
    Ok(())
}

fn revived(channel_id: &str) -> Status {
    Status::cancelled(format!(
        "Channel {} was revived while being destroyed",
        channel_id
    ))
}
