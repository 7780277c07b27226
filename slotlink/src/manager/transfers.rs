//! Transfer completion and failover bookkeeping.
//!
//! Slots report the outcome of every transfer. A completed upload turns
//! the storage consumer into a BACKUP producer; a failed download costs
//! its producer a priority point and yields a replacement peer.

use tracing::{info, warn};

use super::idempotency;
use super::pairing::{promote_storage_consumer, select_producer};
use super::preconditions::channel_not_found;
use super::shared::ManagerCore;
use super::validator;
use crate::api::{TransferCompletedRequest, TransferFailedRequest, TransferFailedResponse};
use crate::model::{Channel, Transfer, TransferId, TransferState};
use crate::status::Status;
use crate::store::Transaction;

/// Loads an ACTIVE transfer of an existing channel.
fn active_transfer(
    tx: &dyn Transaction,
    channel_id: &str,
    transfer_id: &TransferId,
) -> Result<Transfer, Status> {
    tx.find_channel(channel_id)?
        .ok_or_else(|| channel_not_found(channel_id))?;
    let transfer = tx
        .find_transfer(transfer_id)?
        .filter(|t| t.channel_id == channel_id)
        .ok_or_else(|| Status::not_found(format!("Transfer {} not found", transfer_id)))?;
    if !transfer.is_active() {
        return Err(Status::failed_precondition("Transfer is not active"));
    }
    Ok(transfer)
}

pub(super) async fn transfer_completed(
    core: &ManagerCore,
    request: TransferCompletedRequest,
) -> Result<(), Status> {
    validator::validate_transfer_completed(&request)?;
    let key = idempotency::operation_key(request.idempotency_key.as_deref(), &request)?;

    let _guard = core.locks.acquire(&request.channel_id).await;
    core.transact(|tx| {
        if let Some(key) = &key {
            if let Some(()) = idempotency::find_response::<()>(tx, key)? {
                return Ok(());
            }
        }
        let mut transfer = active_transfer(tx, &request.channel_id, &request.transfer_id)?;
        transfer.state = TransferState::Completed;
        let to_storage = transfer.to.is_storage();
        let consumer_uri = transfer.to_uri.clone();
        tx.update_transfer(transfer)?;

        if to_storage {
            if let Some(mut consumer) = tx.find_endpoint(&consumer_uri)? {
                promote_storage_consumer(&mut consumer);
                tx.update_endpoint(consumer)?;
            }
        }
        if let Some(key) = &key {
            idempotency::store_response(tx, key, &())?;
        }
        Ok(())
    })
    .await?;

    info!(
        transfer_id = %request.transfer_id,
        channel_id = %request.channel_id,
        "Transfer completed"
    );
    Ok(())
}

enum Failover {
    Replaced(TransferFailedResponse),
    UploadFailed,
    NoProducers,
}

pub(super) async fn transfer_failed(
    core: &ManagerCore,
    request: TransferFailedRequest,
) -> Result<TransferFailedResponse, Status> {
    validator::validate_transfer_failed(&request)?;
    let key = idempotency::operation_key(request.idempotency_key.as_deref(), &request)?;

    let _guard = core.locks.acquire(&request.channel_id).await;
    let outcome = core
        .transact(|tx| {
            if let Some(key) = &key {
                if let Some(stored) = idempotency::find_response(tx, key)? {
                    return Ok(Failover::Replaced(stored));
                }
            }
            let mut failed = active_transfer(tx, &request.channel_id, &request.transfer_id)?;
            failed.state = TransferState::Failed;
            failed.failure = Some(request.description.clone());
            tx.update_transfer(failed.clone())?;

            // The failure itself is committed whatever the outcome
            if failed.to.is_storage() {
                return Ok(Failover::UploadFailed);
            }
            if let Some(mut producer) = tx.find_endpoint(&failed.from_uri)? {
                producer.priority -= 1;
                tx.update_endpoint(producer)?;
            }

            let endpoints = tx.list_endpoints(&request.channel_id)?;
            let Some(producer) = select_producer(&endpoints, Some(&failed.from_uri)) else {
                return Ok(Failover::NoProducers);
            };
            let replacement = Transfer::new(
                &request.channel_id,
                (&producer.slot_uri, &producer.peer),
                (&failed.to_uri, &failed.to),
                TransferState::Active,
            );
            let response = TransferFailedResponse {
                new_peer: producer.peer.clone(),
                new_transfer_id: replacement.id.clone(),
            };
            tx.insert_transfer(replacement)?;
            if let Some(key) = &key {
                idempotency::store_response(tx, key, &response)?;
            }
            Ok(Failover::Replaced(response))
        })
        .await?;

    match outcome {
        Failover::Replaced(response) => {
            warn!(
                failed_transfer = %request.transfer_id,
                new_transfer = %response.new_transfer_id,
                new_peer = %response.new_peer,
                reason = %request.description,
                "Transfer failed, consumer moved to new producer"
            );
            Ok(response)
        }
        Failover::UploadFailed => {
            warn!(transfer_id = %request.transfer_id, reason = %request.description, "Upload to storage failed");
            Err(Status::internal("Uploading data to storage failed"))
        }
        Failover::NoProducers => {
            warn!(
                transfer_id = %request.transfer_id,
                channel_id = %request.channel_id,
                "No producer left for failover"
            );
            Err(Status::internal(
                "No more producers in channel, while there are consumers",
            ))
        }
    }
}

/// Fails every open transfer of a channel being torn down.
pub(super) fn fail_open_transfers(
    tx: &mut dyn Transaction,
    channel: &Channel,
    reason: &str,
) -> Result<usize, Status> {
    let mut failed = 0;
    for mut transfer in tx.list_transfers(&channel.id)? {
        if !transfer.state.is_terminal() {
            transfer.state = TransferState::Failed;
            transfer.failure = Some(reason.to_string());
            tx.update_transfer(transfer)?;
            failed += 1;
        }
    }
    Ok(failed)
}
