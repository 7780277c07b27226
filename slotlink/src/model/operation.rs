//! Long-running operations and the channel operations that drive them.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::peer::{PeerDescription, TransferId};
use crate::status::Status;

/// Client token plus a hash of the request it was first used with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub token: String,
    pub request_hash: String,
}

/// Result of a bind: the peer to transfer with, if one was already known.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindResponse {
    pub peer: Option<PeerDescription>,
    pub transfer_id: Option<TransferId>,
}

/// Success payload of a long-running operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationResponse {
    Bind(BindResponse),
    Unbind,
    Destroy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationResult {
    Response(OperationResponse),
    Error(Status),
}

/// Asynchronous, pollable result envelope.
///
/// Terminal results are write-once; the store rejects a second completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub idempotency_key: Option<IdempotencyKey>,
    pub result: Option<OperationResult>,
}

impl Operation {
    pub fn new(description: impl Into<String>, idempotency_key: Option<IdempotencyKey>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            description: description.into(),
            created_at: now,
            modified_at: now,
            idempotency_key,
            result: None,
        }
    }

    /// An operation that is done at creation.
    pub fn completed(
        description: impl Into<String>,
        idempotency_key: Option<IdempotencyKey>,
        response: OperationResponse,
    ) -> Self {
        let mut op = Self::new(description, idempotency_key);
        op.result = Some(OperationResult::Response(response));
        op
    }

    pub fn is_done(&self) -> bool {
        self.result.is_some()
    }

    pub fn response(&self) -> Option<&OperationResponse> {
        match &self.result {
            Some(OperationResult::Response(r)) => Some(r),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&Status> {
        match &self.result {
            Some(OperationResult::Error(e)) => Some(e),
            _ => None,
        }
    }
}

/// What a pending channel operation does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelOperationKind {
    Bind { channel_id: String, slot_uri: String },
    Unbind { channel_id: String, slot_uri: String },
    /// Channels still to tear down; shrinks as each one is destroyed.
    Destroy { channel_ids: Vec<String> },
}

impl ChannelOperationKind {
    /// Channels whose lock the operation runs under.
    pub fn channel_ids(&self) -> Vec<String> {
        match self {
            ChannelOperationKind::Bind { channel_id, .. }
            | ChannelOperationKind::Unbind { channel_id, .. } => vec![channel_id.clone()],
            ChannelOperationKind::Destroy { channel_ids } => channel_ids.clone(),
        }
    }
}

impl fmt::Display for ChannelOperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelOperationKind::Bind { .. } => write!(f, "BIND"),
            ChannelOperationKind::Unbind { .. } => write!(f, "UNBIND"),
            ChannelOperationKind::Destroy { .. } => write!(f, "DESTROY"),
        }
    }
}

/// Persisted intent of a bind/unbind/destroy, consumed once by the executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelOperation {
    pub operation_id: String,
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub kind: ChannelOperationKind,
}

impl ChannelOperation {
    pub fn new(operation_id: &str, timeout: std::time::Duration, kind: ChannelOperationKind) -> Self {
        let started_at = Utc::now();
        let timeout = Duration::from_std(timeout).unwrap_or_else(|_| Duration::seconds(30));
        Self {
            operation_id: operation_id.to_string(),
            started_at,
            deadline: started_at + timeout,
            kind,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline
    }

    /// Time left before the deadline, zero once passed.
    pub fn remaining(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.deadline - now).to_std().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_operation_is_pending() {
        let op = Operation::new("Bind s1", None);
        assert!(!op.is_done());
        assert!(op.response().is_none());
        assert!(op.error().is_none());
    }

    #[test]
    fn test_completed_operation_carries_response() {
        let op = Operation::completed("Destroy", None, OperationResponse::Destroy);
        assert!(op.is_done());
        assert_eq!(op.response(), Some(&OperationResponse::Destroy));
    }

    #[test]
    fn test_channel_operation_deadline() {
        let chop = ChannelOperation::new(
            "op",
            std::time::Duration::from_secs(30),
            ChannelOperationKind::Unbind {
                channel_id: "c".into(),
                slot_uri: "s".into(),
            },
        );
        assert!(!chop.is_expired(Utc::now()));
        assert!(chop.is_expired(chop.deadline));
        assert!(chop.remaining(Utc::now()) <= std::time::Duration::from_secs(30));
        assert_eq!(chop.remaining(chop.deadline + Duration::seconds(1)), <std::time::Duration as Default>::default());
    }
}
