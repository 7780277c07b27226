//! Producer selection and consumer pairing.
//!
//! ```text
//!   consumer binds ──► best producer? ──yes──► ACTIVE transfer, peer in response
//!                                     └─no───► consumer waits for a push
//!
//!   producer binds ──► each unconnected consumer:
//!                        storage consumer ─► ACTIVE transfer (first one in response)
//!                        slot consumer    ─► PENDING transfer, pushed after commit
//! ```
//!
//! The best producer is an ACTIVE producer with non-negative priority,
//! highest priority first, earliest binding on ties.

use chrono::Utc;

use crate::model::{
    BindResponse, Channel, Direction, Endpoint, EndpointStatus, PeerDescription, PriorityClass,
    Role, SlotOwner, Transfer, TransferState,
};
use crate::status::Status;
use crate::store::Transaction;

/// Picks the producer a consumer should read from.
///
/// `exclude` is skipped whenever any other eligible producer exists.
pub fn select_producer<'a>(endpoints: &'a [Endpoint], exclude: Option<&str>) -> Option<&'a Endpoint> {
    let eligible: Vec<&Endpoint> = endpoints.iter().filter(|e| e.is_eligible_producer()).collect();
    let preferred: Vec<&Endpoint> = match exclude {
        Some(uri) if eligible.iter().any(|e| e.slot_uri != uri) => eligible
            .into_iter()
            .filter(|e| e.slot_uri != uri)
            .collect(),
        _ => eligible,
    };
    // max_by keeps the last maximum; iterate in reverse so the earliest wins ties
    preferred
        .into_iter()
        .rev()
        .max_by(|a, b| a.priority.cmp(&b.priority).then(b.bound_at.cmp(&a.bound_at)))
}

/// Slot uri of a channel's storage endpoint.
pub fn storage_slot_uri(role: Role, channel_id: &str) -> String {
    match role {
        Role::Producer => format!("storage-producer:{}", channel_id),
        Role::Consumer => format!("storage-consumer:{}", channel_id),
    }
}

/// Endpoint for an object-storage location declared in the channel spec.
pub fn storage_endpoint(channel: &Channel, role: Role, uri: &str) -> Endpoint {
    let slot_uri = storage_slot_uri(role, &channel.id);
    let (direction, class) = match role {
        Role::Producer => (Direction::Output, PriorityClass::Primary),
        Role::Consumer => (Direction::Input, PriorityClass::Backup),
    };
    Endpoint {
        peer: PeerDescription::storage(slot_uri.clone(), uri),
        slot_uri,
        channel_id: channel.id.clone(),
        owner_task_id: channel.execution_id.clone(),
        owner: SlotOwner::Storage,
        role,
        direction,
        status: EndpointStatus::Active,
        class,
        priority: class.initial_priority(),
        connected: false,
        bound_at: Utc::now(),
    }
}

/// Turns a storage consumer that finished its upload into a BACKUP producer.
pub fn promote_storage_consumer(endpoint: &mut Endpoint) {
    endpoint.role = Role::Producer;
    endpoint.direction = Direction::Output;
    endpoint.class = PriorityClass::Backup;
    endpoint.priority = PriorityClass::Backup.initial_priority();
    endpoint.connected = true;
}

/// Pairs a newly active consumer with the best producer, if any.
pub fn pair_consumer(
    tx: &mut dyn Transaction,
    consumer: &mut Endpoint,
    endpoints: &[Endpoint],
) -> Result<BindResponse, Status> {
    let Some(producer) = select_producer(endpoints, None) else {
        return Ok(BindResponse::default());
    };
    let transfer = Transfer::new(
        &consumer.channel_id,
        (&producer.slot_uri, &producer.peer),
        (&consumer.slot_uri, &consumer.peer),
        TransferState::Active,
    );
    let response = BindResponse {
        peer: Some(producer.peer.clone()),
        transfer_id: Some(transfer.id.clone()),
    };
    tx.insert_transfer(transfer)?;
    consumer.connected = true;
    Ok(response)
}

/// Pairs a newly active producer with every waiting consumer.
///
/// Returns the bind response and the PENDING transfers to push to slot
/// consumers once the transaction is committed.
pub fn pair_producer(
    tx: &mut dyn Transaction,
    producer: &Endpoint,
    endpoints: &[Endpoint],
) -> Result<(BindResponse, Vec<Transfer>), Status> {
    let mut response = BindResponse::default();
    let mut pushes = Vec::new();

    let waiting = endpoints
        .iter()
        .filter(|e| e.is_consumer() && e.is_active() && !e.connected);
    for consumer in waiting {
        let storage = consumer.peer.is_storage();
        if storage && response.peer.is_some() {
            // one upload per producer
            continue;
        }
        let state = if storage {
            TransferState::Active
        } else {
            TransferState::Pending
        };
        let transfer = Transfer::new(
            &producer.channel_id,
            (&producer.slot_uri, &producer.peer),
            (&consumer.slot_uri, &consumer.peer),
            state,
        );
        if storage {
            response = BindResponse {
                peer: Some(consumer.peer.clone()),
                transfer_id: Some(transfer.id.clone()),
            };
        } else {
            pushes.push(transfer.clone());
        }
        tx.insert_transfer(transfer)?;

        let mut connected = consumer.clone();
        connected.connected = true;
        tx.update_endpoint(connected)?;
    }
    Ok((response, pushes))
}
