//! Slot progress events.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::model::TransferId;
use crate::status::Status;
use crate::transfer::TransferError;

/// Input slot states.
///
/// ```text
///   Binding ──► WaitingForPeer ──► Downloading ──► Ready
///      │              │                 │            │
///      └──────────────┴────────┬────────┴────────────┘
///                              ▼
///                            Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InputSlotState {
    Binding,
    WaitingForPeer,
    Downloading,
    Ready,
    Closed,
}

impl fmt::Display for InputSlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InputSlotState::Binding => "BINDING",
            InputSlotState::WaitingForPeer => "WAITING_FOR_PEER",
            InputSlotState::Downloading => "DOWNLOADING",
            InputSlotState::Ready => "READY",
            InputSlotState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SlotEventKind {
    StateChanged(InputSlotState),
    TransferStarted { transfer_id: TransferId },
    TransferFailed { transfer_id: TransferId, reason: String },
    TransferCompleted { transfer_id: TransferId, bytes: u64 },
    Ready,
    Closed,
}

/// Published on the execution's broadcast channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotEvent {
    pub slot_id: String,
    pub kind: SlotEventKind,
}

/// Why a slot stopped short of its goal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SlotError {
    #[error("channel manager call failed: {0}")]
    Manager(#[from] Status),

    #[error("backend failure: {0}")]
    Backend(String),

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("failover exhausted after {failovers} failovers, last failure: {reason}")]
    FailoverExhausted { failovers: usize, reason: String },

    #[error("slot was disconnected from its channel")]
    Disconnected,

    #[error("slot closed")]
    Closed,
}

impl From<std::io::Error> for SlotError {
    fn from(e: std::io::Error) -> Self {
        SlotError::Backend(e.to_string())
    }
}

impl From<TransferError> for SlotError {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::Peer(reason) => SlotError::Transfer(reason),
            TransferError::Backend(e) => e.into(),
        }
    }
}
