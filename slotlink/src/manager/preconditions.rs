//! Bind and unbind preconditions.
//!
//! Bind is checked in order, first failure wins:
//!
//! 1. channel exists and is ALIVE             → NOT_FOUND
//! 2. owner exclusivity (PORTAL, WORKER)      → FAILED_PRECONDITION
//! 3. slot uri not already bound              → ALREADY_EXISTS
//!
//! The evaluation is a pure function over a channel snapshot so the
//! optimistic check outside the lock and the authoritative one inside it
//! are the same code.

use crate::api::{BindRequest, UnbindRequest};
use crate::model::{Channel, Direction, Endpoint, EndpointStatus, PriorityClass, SlotOwner};
use crate::status::Status;
use crate::store::Transaction;

pub fn channel_not_found(channel_id: &str) -> Status {
    Status::not_found(format!("Channel {} not found", channel_id))
}

pub fn endpoint_not_found(slot_uri: &str) -> Status {
    Status::not_found(format!("Endpoint {} not found", slot_uri))
}

/// Evaluates bind preconditions against a snapshot.
///
/// `endpoints` are the channel's endpoints; `existing` is whatever endpoint
/// record holds the requested uri, on any channel.
pub fn evaluate_bind(
    request: &BindRequest,
    channel: Option<&Channel>,
    endpoints: &[Endpoint],
    existing: Option<&Endpoint>,
) -> Result<(), Status> {
    let slot = &request.slot_instance;
    if !channel.map(Channel::is_alive).unwrap_or(false) {
        return Err(channel_not_found(&slot.channel_id));
    }

    match request.owner {
        SlotOwner::Portal => {
            let taken = endpoints.iter().any(|e| {
                e.owner == SlotOwner::Portal && e.role == request.role && e.is_bound()
            });
            if taken {
                return Err(Status::failed_precondition(
                    "PORTAL endpoint already bound to channel",
                ));
            }
        }
        SlotOwner::Worker => {
            let primary_output = slot.direction == Direction::Output
                && request.priority == PriorityClass::Primary;
            let taken = endpoints.iter().any(|e| {
                e.owner == SlotOwner::Worker
                    && e.is_producer()
                    && e.class == PriorityClass::Primary
                    && e.is_bound()
            });
            if primary_output && taken {
                return Err(Status::failed_precondition(
                    "WORKER endpoint already bound as input slot to channel",
                ));
            }
        }
        SlotOwner::Storage => {}
    }

    match existing {
        Some(e) if e.is_bound() => Err(Status::already_exists(format!(
            "Endpoint {} already exists",
            slot.slot_uri
        ))),
        Some(e) if e.status == EndpointStatus::Unbinding => Err(Status::failed_precondition(
            format!(
                "Endpoint {} is still unbinding from channel {}",
                slot.slot_uri, e.channel_id
            ),
        )),
        _ => Ok(()),
    }
}

/// Loads the snapshot for `request` and evaluates it.
pub fn check_bind(tx: &dyn Transaction, request: &BindRequest) -> Result<(), Status> {
    let slot = &request.slot_instance;
    let channel = tx.find_channel(&slot.channel_id)?;
    let endpoints = match &channel {
        Some(_) => tx.list_endpoints(&slot.channel_id)?,
        None => Vec::new(),
    };
    let existing = tx.find_endpoint(&slot.slot_uri)?;
    evaluate_bind(request, channel.as_ref(), &endpoints, existing.as_ref())
}

/// The endpoint must be ACTIVE on an ALIVE channel. Returns both.
pub fn check_unbind(
    tx: &dyn Transaction,
    request: &UnbindRequest,
) -> Result<(Channel, Endpoint), Status> {
    let endpoint = tx
        .find_endpoint(&request.slot_uri)?
        .filter(Endpoint::is_active)
        .ok_or_else(|| endpoint_not_found(&request.slot_uri))?;
    let channel = tx
        .find_channel(&endpoint.channel_id)?
        .filter(Channel::is_alive)
        .ok_or_else(|| channel_not_found(&endpoint.channel_id))?;
    Ok((channel, endpoint))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::SlotInstance;
    use crate::model::{ChannelSpec, LifeStatus, PeerDescription, Role};
    use crate::status::Code;
    use chrono::Utc;

    // =========================================================================
    // Test Helpers
    // =========================================================================

    fn channel() -> Channel {
        Channel::new("exec1", "wf", ChannelSpec::new("ch1", "plain"))
    }

    fn request(uri: &str, owner: SlotOwner, role: Role) -> BindRequest {
        let direction = match role {
            Role::Producer => Direction::Output,
            Role::Consumer => Direction::Input,
        };
        BindRequest::new(
            SlotInstance {
                slot_id: uri.into(),
                slot_uri: uri.into(),
                channel_id: "channel-exec1-ch1".into(),
                task_id: "t".into(),
                direction,
                peer_url: "local://w".into(),
            },
            owner,
            role,
        )
    }

    fn endpoint(uri: &str, owner: SlotOwner, role: Role, class: PriorityClass) -> Endpoint {
        let direction = match role {
            Role::Producer => Direction::Output,
            Role::Consumer => Direction::Input,
        };
        Endpoint {
            slot_uri: uri.into(),
            channel_id: "channel-exec1-ch1".into(),
            owner_task_id: "t".into(),
            owner,
            role,
            direction,
            status: EndpointStatus::Active,
            peer: PeerDescription::slot(uri, "local://w"),
            class,
            priority: class.initial_priority(),
            connected: false,
            bound_at: Utc::now(),
        }
    }

    // =========================================================================
    // Tests
    // =========================================================================

    #[test]
    fn test_missing_or_destroying_channel() {
        let req = request("s1", SlotOwner::Worker, Role::Producer);
        assert_eq!(evaluate_bind(&req, None, &[], None).unwrap_err().code(), Code::NotFound);

        let mut destroying = channel();
        destroying.life_status = LifeStatus::Destroying;
        let err = evaluate_bind(&req, Some(&destroying), &[], None).unwrap_err();
        assert_eq!(err.message(), "Channel channel-exec1-ch1 not found");
    }

    #[test]
    fn test_portal_exclusivity_per_role() {
        let existing = [endpoint("p1", SlotOwner::Portal, Role::Producer, PriorityClass::Primary)];
        let err = evaluate_bind(
            &request("p2", SlotOwner::Portal, Role::Producer),
            Some(&channel()),
            &existing,
            None,
        )
        .unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);
        assert_eq!(err.message(), "PORTAL endpoint already bound to channel");

        assert!(evaluate_bind(
            &request("p3", SlotOwner::Portal, Role::Consumer),
            Some(&channel()),
            &existing,
            None
        )
        .is_ok());
    }

    #[test]
    fn test_worker_exclusivity_ignores_backup_producers() {
        let existing = [endpoint("w1", SlotOwner::Worker, Role::Producer, PriorityClass::Backup)];
        assert!(evaluate_bind(
            &request("w2", SlotOwner::Worker, Role::Producer),
            Some(&channel()),
            &existing,
            None
        )
        .is_ok());

        let existing = [endpoint("w1", SlotOwner::Worker, Role::Producer, PriorityClass::Primary)];
        let err = evaluate_bind(
            &request("w2", SlotOwner::Worker, Role::Producer),
            Some(&channel()),
            &existing,
            None,
        )
        .unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);

        let companion = request("w2-out", SlotOwner::Worker, Role::Producer)
            .with_priority(PriorityClass::Backup);
        assert!(evaluate_bind(&companion, Some(&channel()), &existing, None).is_ok());
    }

    #[test]
    fn test_exclusivity_checked_before_uri() {
        let bound = endpoint("w1", SlotOwner::Worker, Role::Producer, PriorityClass::Primary);
        let err = evaluate_bind(
            &request("w1", SlotOwner::Worker, Role::Producer),
            Some(&channel()),
            std::slice::from_ref(&bound),
            Some(&bound),
        )
        .unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);
    }

    #[test]
    fn test_duplicate_uri() {
        let bound = endpoint("c1", SlotOwner::Worker, Role::Consumer, PriorityClass::Primary);
        let err = evaluate_bind(
            &request("c1", SlotOwner::Worker, Role::Consumer),
            Some(&channel()),
            std::slice::from_ref(&bound),
            Some(&bound),
        )
        .unwrap_err();
        assert_eq!(err.code(), Code::AlreadyExists);
        assert_eq!(err.message(), "Endpoint c1 already exists");
    }
}
