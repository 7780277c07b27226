//! Channel and operation storage.
//!
//! The channel manager never touches records directly; it opens a
//! [`Transaction`] on a [`Storage`], reads and mutates through it, and
//! commits. Dropping a transaction without committing discards it.
//!
//! ```text
//!   ChannelManager ──begin()──► Transaction ──commit()──► Storage
//!                                 │
//!            channels · endpoints · transfers · operations
//!            channel operations · idempotent responses
//! ```
//!
//! Transactions are synchronous and must not be held across an `.await`.
//! [`MemoryStorage`] is the in-process implementation; a persistent
//! implementation plugs in behind the same traits.

mod memory;

pub use memory::MemoryStorage;

use crate::model::{
    Channel, ChannelOperation, Endpoint, LifeStatus, Operation, OperationResult, Transfer,
    TransferId,
};
use crate::status::Status;
use thiserror::Error;

/// Storage errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    /// Terminal operation results are write-once.
    #[error("Operation {0} is already completed")]
    OperationCompleted(String),

    /// Unique violation on an idempotency token.
    #[error("Idempotency key {0} is already in use")]
    IdempotencyKeyConflict(String),

    #[error("Transient storage failure: {0}")]
    Transient(String),

    #[error("Storage failure: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<StoreError> for Status {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(_) => Status::not_found(e.to_string()),
            StoreError::AlreadyExists(_) => Status::already_exists(e.to_string()),
            StoreError::OperationCompleted(_) => Status::failed_precondition(e.to_string()),
            StoreError::IdempotencyKeyConflict(_) => {
                Status::invalid_argument("IdempotencyKey conflict")
            }
            StoreError::Transient(_) => Status::unavailable(e.to_string()),
            StoreError::Internal(_) => Status::internal(e.to_string()),
        }
    }
}

/// Stored response of a synchronous idempotent call.
#[derive(Debug, Clone, PartialEq)]
pub struct IdempotentRecord {
    pub token: String,
    pub request_hash: String,
    pub response: serde_json::Value,
}

/// Opens transactions.
pub trait Storage: Send + Sync {
    fn begin(&self) -> Result<Box<dyn Transaction + '_>, StoreError>;
}

/// A unit of read-modify-write over every record kind.
pub trait Transaction {
    // ---- channels ----
    fn insert_channel(&mut self, channel: Channel) -> Result<(), StoreError>;
    fn find_channel(&self, channel_id: &str) -> Result<Option<Channel>, StoreError>;
    /// Channels of an execution, any life status, ordered by id.
    fn list_channels(&self, execution_id: &str) -> Result<Vec<Channel>, StoreError>;
    fn set_life_status(&mut self, channel_id: &str, status: LifeStatus) -> Result<(), StoreError>;
    fn delete_channel(&mut self, channel_id: &str) -> Result<(), StoreError>;

    // ---- endpoints ----
    fn insert_endpoint(&mut self, endpoint: Endpoint) -> Result<(), StoreError>;
    fn find_endpoint(&self, slot_uri: &str) -> Result<Option<Endpoint>, StoreError>;
    /// Endpoints of a channel, earliest bound first.
    fn list_endpoints(&self, channel_id: &str) -> Result<Vec<Endpoint>, StoreError>;
    fn update_endpoint(&mut self, endpoint: Endpoint) -> Result<(), StoreError>;
    fn delete_endpoint(&mut self, slot_uri: &str) -> Result<(), StoreError>;

    // ---- transfers ----
    fn insert_transfer(&mut self, transfer: Transfer) -> Result<(), StoreError>;
    fn find_transfer(&self, transfer_id: &TransferId) -> Result<Option<Transfer>, StoreError>;
    fn list_transfers(&self, channel_id: &str) -> Result<Vec<Transfer>, StoreError>;
    fn update_transfer(&mut self, transfer: Transfer) -> Result<(), StoreError>;

    // ---- operations ----
    /// Fails with `IdempotencyKeyConflict` if the token is taken.
    fn insert_operation(&mut self, operation: Operation) -> Result<(), StoreError>;
    fn find_operation(&self, operation_id: &str) -> Result<Option<Operation>, StoreError>;
    fn find_operation_by_key(&self, token: &str) -> Result<Option<Operation>, StoreError>;
    /// Fails with `OperationCompleted` if already terminal.
    fn complete_operation(
        &mut self,
        operation_id: &str,
        result: OperationResult,
    ) -> Result<Operation, StoreError>;

    // ---- channel operations ----
    fn insert_channel_operation(&mut self, operation: ChannelOperation) -> Result<(), StoreError>;
    fn update_channel_operation(&mut self, operation: ChannelOperation) -> Result<(), StoreError>;
    fn delete_channel_operation(&mut self, operation_id: &str) -> Result<(), StoreError>;
    fn list_channel_operations(&self) -> Result<Vec<ChannelOperation>, StoreError>;

    // ---- idempotent responses ----
    fn find_idempotent_response(&self, token: &str) -> Result<Option<IdempotentRecord>, StoreError>;
    fn insert_idempotent_response(&mut self, record: IdempotentRecord) -> Result<(), StoreError>;

    fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Code;

    #[test]
    fn test_store_error_status_mapping() {
        let cases = [
            (StoreError::NotFound("x".into()), Code::NotFound),
            (StoreError::AlreadyExists("x".into()), Code::AlreadyExists),
            (
                StoreError::OperationCompleted("x".into()),
                Code::FailedPrecondition,
            ),
            (
                StoreError::IdempotencyKeyConflict("x".into()),
                Code::InvalidArgument,
            ),
            (StoreError::Transient("x".into()), Code::Unavailable),
            (StoreError::Internal("x".into()), Code::Internal),
        ];
        for (err, code) in cases {
            assert_eq!(Status::from(err).code(), code);
        }
    }

    #[test]
    fn test_only_transient_is_transient() {
        assert!(StoreError::Transient("io".into()).is_transient());
        assert!(!StoreError::Internal("io".into()).is_transient());
    }
}
