//! Request shape validation.
//!
//! Runs before any lock or storage access; every failure is
//! `INVALID_ARGUMENT`.

use crate::api::{
    BindRequest, CreateChannelRequest, DestroyAllRequest, DestroyRequest,
    TransferCompletedRequest, TransferFailedRequest, UnbindRequest,
};
use crate::model::{Direction, Role, SlotOwner};
use crate::status::Status;

fn require(field: &str, value: &str) -> Result<(), Status> {
    if value.trim().is_empty() {
        return Err(Status::invalid_argument(format!("{} must not be empty", field)));
    }
    Ok(())
}

fn require_key(key: &Option<String>) -> Result<(), Status> {
    match key {
        Some(token) => require("idempotency_key", token),
        None => Ok(()),
    }
}

pub fn validate_create(request: &CreateChannelRequest) -> Result<(), Status> {
    require("execution_id", &request.execution_id)?;
    require("workflow_name", &request.workflow_name)?;
    require("spec.name", &request.spec.name)?;
    if let Some(uri) = &request.spec.storage_producer_uri {
        require("spec.storage_producer_uri", uri)?;
    }
    if let Some(uri) = &request.spec.storage_consumer_uri {
        require("spec.storage_consumer_uri", uri)?;
    }
    Ok(())
}

pub fn validate_bind(request: &BindRequest) -> Result<(), Status> {
    let slot = &request.slot_instance;
    require("slot_instance.slot_id", &slot.slot_id)?;
    require("slot_instance.slot_uri", &slot.slot_uri)?;
    require("slot_instance.channel_id", &slot.channel_id)?;
    require("slot_instance.task_id", &slot.task_id)?;
    require("slot_instance.peer_url", &slot.peer_url)?;
    require_key(&request.idempotency_key)?;

    if request.owner == SlotOwner::Storage {
        return Err(Status::invalid_argument(
            "STORAGE endpoints are registered by create, not bind",
        ));
    }
    match (request.role, slot.direction) {
        (Role::Producer, Direction::Output) | (Role::Consumer, Direction::Input) => Ok(()),
        (role, direction) => Err(Status::invalid_argument(format!(
            "Role {:?} does not match slot direction {:?}",
            role, direction
        ))),
    }
}

pub fn validate_unbind(request: &UnbindRequest) -> Result<(), Status> {
    require("slot_uri", &request.slot_uri)?;
    require_key(&request.idempotency_key)
}

pub fn validate_destroy(request: &DestroyRequest) -> Result<(), Status> {
    require("channel_id", &request.channel_id)?;
    require_key(&request.idempotency_key)
}

pub fn validate_destroy_all(request: &DestroyAllRequest) -> Result<(), Status> {
    require("execution_id", &request.execution_id)?;
    require_key(&request.idempotency_key)
}

pub fn validate_transfer_completed(request: &TransferCompletedRequest) -> Result<(), Status> {
    require("transfer_id", request.transfer_id.as_str())?;
    require("channel_id", &request.channel_id)?;
    require_key(&request.idempotency_key)
}

pub fn validate_transfer_failed(request: &TransferFailedRequest) -> Result<(), Status> {
    require("transfer_id", request.transfer_id.as_str())?;
    require("channel_id", &request.channel_id)?;
    require_key(&request.idempotency_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::SlotInstance;
    use crate::status::Code;

    fn bind(role: Role, direction: Direction, owner: SlotOwner) -> BindRequest {
        BindRequest::new(
            SlotInstance {
                slot_id: "s1".into(),
                slot_uri: "local://w1/s1".into(),
                channel_id: "channel-exec1-ch1".into(),
                task_id: "task-1".into(),
                direction,
                peer_url: "local://w1".into(),
            },
            owner,
            role,
        )
    }

    #[test]
    fn test_valid_bind_passes() {
        assert!(validate_bind(&bind(Role::Producer, Direction::Output, SlotOwner::Worker)).is_ok());
        assert!(validate_bind(&bind(Role::Consumer, Direction::Input, SlotOwner::Portal)).is_ok());
    }

    #[test]
    fn test_role_direction_mismatch() {
        let err = validate_bind(&bind(Role::Producer, Direction::Input, SlotOwner::Worker)).unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[test]
    fn test_storage_owner_rejected() {
        let err = validate_bind(&bind(Role::Producer, Direction::Output, SlotOwner::Storage)).unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[test]
    fn test_empty_fields_rejected() {
        let mut request = bind(Role::Producer, Direction::Output, SlotOwner::Worker);
        request.slot_instance.channel_id = " ".into();
        assert_eq!(validate_bind(&request).unwrap_err().code(), Code::InvalidArgument);

        let request = bind(Role::Producer, Direction::Output, SlotOwner::Worker).with_idempotency_key("");
        assert_eq!(validate_bind(&request).unwrap_err().code(), Code::InvalidArgument);

        assert!(validate_unbind(&UnbindRequest::new("")).is_err());
        assert!(validate_destroy_all(&DestroyAllRequest {
            execution_id: String::new(),
            idempotency_key: None
        })
        .is_err());
    }
}
