//! Request and response messages of both RPC seams.

use serde::{Deserialize, Serialize};

use crate::model::{
    ChannelSpec, Direction, PeerDescription, PriorityClass, Role, SlotOwner, TransferId,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateChannelRequest {
    pub execution_id: String,
    pub workflow_name: String,
    pub spec: ChannelSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestroyRequest {
    pub channel_id: String,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestroyAllRequest {
    pub execution_id: String,
    pub idempotency_key: Option<String>,
}

/// A concrete slot of a running task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotInstance {
    /// Peer id other slots read from.
    pub slot_id: String,
    /// Unique binding identity on the channel.
    pub slot_uri: String,
    pub channel_id: String,
    pub task_id: String,
    pub direction: Direction,
    /// Slots API serving this slot.
    pub peer_url: String,
}

impl SlotInstance {
    pub fn peer(&self) -> PeerDescription {
        PeerDescription::slot(self.slot_id.clone(), self.peer_url.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindRequest {
    pub slot_instance: SlotInstance,
    pub owner: SlotOwner,
    pub role: Role,
    pub priority: PriorityClass,
    pub idempotency_key: Option<String>,
}

impl BindRequest {
    pub fn new(slot_instance: SlotInstance, owner: SlotOwner, role: Role) -> Self {
        Self {
            slot_instance,
            owner,
            role,
            priority: PriorityClass::Primary,
            idempotency_key: None,
        }
    }

    pub fn with_priority(mut self, priority: PriorityClass) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnbindRequest {
    pub slot_uri: String,
    pub idempotency_key: Option<String>,
}

impl UnbindRequest {
    pub fn new(slot_uri: impl Into<String>) -> Self {
        Self {
            slot_uri: slot_uri.into(),
            idempotency_key: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Manager → slot push of a resolved peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartTransferRequest {
    pub slot_id: String,
    pub peer: PeerDescription,
    pub transfer_id: TransferId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferCompletedRequest {
    pub transfer_id: TransferId,
    pub channel_id: String,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferFailedRequest {
    pub transfer_id: TransferId,
    pub channel_id: String,
    pub description: String,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferFailedResponse {
    pub new_peer: PeerDescription,
    pub new_transfer_id: TransferId,
}
