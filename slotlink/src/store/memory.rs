//! In-memory transactional storage.

use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{IdempotentRecord, Storage, StoreError, Transaction};
use crate::model::{
    Channel, ChannelOperation, Endpoint, LifeStatus, Operation, OperationResult, Transfer,
    TransferId,
};

#[derive(Debug, Clone, Default)]
struct State {
    channels: BTreeMap<String, Channel>,
    endpoints: HashMap<String, Endpoint>,
    transfers: HashMap<TransferId, Transfer>,
    operations: HashMap<String, Operation>,
    /// idempotency token → operation id
    operation_keys: HashMap<String, String>,
    channel_operations: BTreeMap<String, ChannelOperation>,
    idempotent_responses: HashMap<String, IdempotentRecord>,
}

/// Serializable storage backed by a single mutex.
///
/// A transaction holds the mutex from `begin` until it is committed or
/// dropped, and works on a staged copy that replaces the state on commit.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: Mutex<State>,
    failing_commits: AtomicUsize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` commits fail with a transient error.
    pub fn fail_next_commits(&self, n: usize) {
        self.failing_commits.store(n, Ordering::SeqCst);
    }
}

impl Storage for MemoryStorage {
    fn begin(&self) -> Result<Box<dyn Transaction + '_>, StoreError> {
        let guard = self.state.lock();
        let staged = guard.clone();
        Ok(Box::new(MemoryTransaction {
            guard,
            staged,
            failing_commits: &self.failing_commits,
        }))
    }
}

struct MemoryTransaction<'a> {
    guard: MutexGuard<'a, State>,
    staged: State,
    failing_commits: &'a AtomicUsize,
}

impl Transaction for MemoryTransaction<'_> {
    fn insert_channel(&mut self, channel: Channel) -> Result<(), StoreError> {
        if self.staged.channels.contains_key(&channel.id) {
            return Err(StoreError::AlreadyExists(format!("Channel {}", channel.id)));
        }
        self.staged.channels.insert(channel.id.clone(), channel);
        Ok(())
    }

    fn find_channel(&self, channel_id: &str) -> Result<Option<Channel>, StoreError> {
        Ok(self.staged.channels.get(channel_id).cloned())
    }

    fn list_channels(&self, execution_id: &str) -> Result<Vec<Channel>, StoreError> {
        Ok(self
            .staged
            .channels
            .values()
            .filter(|c| c.execution_id == execution_id)
            .cloned()
            .collect())
    }

    fn set_life_status(&mut self, channel_id: &str, status: LifeStatus) -> Result<(), StoreError> {
        let channel = self
            .staged
            .channels
            .get_mut(channel_id)
            .ok_or_else(|| StoreError::NotFound(format!("Channel {}", channel_id)))?;
        channel.life_status = status;
        Ok(())
    }

    fn delete_channel(&mut self, channel_id: &str) -> Result<(), StoreError> {
        self.staged
            .channels
            .remove(channel_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("Channel {}", channel_id)))
    }

    fn insert_endpoint(&mut self, endpoint: Endpoint) -> Result<(), StoreError> {
        if self.staged.endpoints.contains_key(&endpoint.slot_uri) {
            return Err(StoreError::AlreadyExists(format!(
                "Endpoint {}",
                endpoint.slot_uri
            )));
        }
        self.staged
            .endpoints
            .insert(endpoint.slot_uri.clone(), endpoint);
        Ok(())
    }

    fn find_endpoint(&self, slot_uri: &str) -> Result<Option<Endpoint>, StoreError> {
        Ok(self.staged.endpoints.get(slot_uri).cloned())
    }

    fn list_endpoints(&self, channel_id: &str) -> Result<Vec<Endpoint>, StoreError> {
        let mut endpoints: Vec<Endpoint> = self
            .staged
            .endpoints
            .values()
            .filter(|e| e.channel_id == channel_id)
            .cloned()
            .collect();
        endpoints.sort_by(|a, b| {
            a.bound_at
                .cmp(&b.bound_at)
                .then_with(|| a.slot_uri.cmp(&b.slot_uri))
        });
        Ok(endpoints)
    }

    fn update_endpoint(&mut self, endpoint: Endpoint) -> Result<(), StoreError> {
        match self.staged.endpoints.get_mut(&endpoint.slot_uri) {
            Some(existing) => {
                *existing = endpoint;
                Ok(())
            }
            None => Err(StoreError::NotFound(format!(
                "Endpoint {}",
                endpoint.slot_uri
            ))),
        }
    }

    fn delete_endpoint(&mut self, slot_uri: &str) -> Result<(), StoreError> {
        self.staged
            .endpoints
            .remove(slot_uri)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("Endpoint {}", slot_uri)))
    }

    fn insert_transfer(&mut self, transfer: Transfer) -> Result<(), StoreError> {
        if self.staged.transfers.contains_key(&transfer.id) {
            return Err(StoreError::AlreadyExists(format!("Transfer {}", transfer.id)));
        }
        self.staged.transfers.insert(transfer.id.clone(), transfer);
        Ok(())
    }

    fn find_transfer(&self, transfer_id: &TransferId) -> Result<Option<Transfer>, StoreError> {
        Ok(self.staged.transfers.get(transfer_id).cloned())
    }

    fn list_transfers(&self, channel_id: &str) -> Result<Vec<Transfer>, StoreError> {
        let mut transfers: Vec<Transfer> = self
            .staged
            .transfers
            .values()
            .filter(|t| t.channel_id == channel_id)
            .cloned()
            .collect();
        transfers.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(transfers)
    }

    fn update_transfer(&mut self, transfer: Transfer) -> Result<(), StoreError> {
        match self.staged.transfers.get_mut(&transfer.id) {
            Some(existing) => {
                *existing = transfer;
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("Transfer {}", transfer.id))),
        }
    }

    fn insert_operation(&mut self, operation: Operation) -> Result<(), StoreError> {
        if let Some(key) = &operation.idempotency_key {
            if self.staged.operation_keys.contains_key(&key.token) {
                return Err(StoreError::IdempotencyKeyConflict(key.token.clone()));
            }
            self.staged
                .operation_keys
                .insert(key.token.clone(), operation.id.clone());
        }
        if self.staged.operations.contains_key(&operation.id) {
            return Err(StoreError::AlreadyExists(format!(
                "Operation {}",
                operation.id
            )));
        }
        self.staged
            .operations
            .insert(operation.id.clone(), operation);
        Ok(())
    }

    fn find_operation(&self, operation_id: &str) -> Result<Option<Operation>, StoreError> {
        Ok(self.staged.operations.get(operation_id).cloned())
    }

    fn find_operation_by_key(&self, token: &str) -> Result<Option<Operation>, StoreError> {
        Ok(self
            .staged
            .operation_keys
            .get(token)
            .and_then(|id| self.staged.operations.get(id))
            .cloned())
    }

    fn complete_operation(
        &mut self,
        operation_id: &str,
        result: OperationResult,
    ) -> Result<Operation, StoreError> {
        let op = self
            .staged
            .operations
            .get_mut(operation_id)
            .ok_or_else(|| StoreError::NotFound(format!("Operation {}", operation_id)))?;
        if op.is_done() {
            return Err(StoreError::OperationCompleted(operation_id.to_string()));
        }
        op.result = Some(result);
        op.modified_at = chrono::Utc::now();
        Ok(op.clone())
    }

    fn insert_channel_operation(&mut self, operation: ChannelOperation) -> Result<(), StoreError> {
        if self
            .staged
            .channel_operations
            .contains_key(&operation.operation_id)
        {
            return Err(StoreError::AlreadyExists(format!(
                "Channel operation {}",
                operation.operation_id
            )));
        }
        self.staged
            .channel_operations
            .insert(operation.operation_id.clone(), operation);
        Ok(())
    }

    fn update_channel_operation(&mut self, operation: ChannelOperation) -> Result<(), StoreError> {
        match self.staged.channel_operations.get_mut(&operation.operation_id) {
            Some(existing) => {
                *existing = operation;
                Ok(())
            }
            None => Err(StoreError::NotFound(format!(
                "Channel operation {}",
                operation.operation_id
            ))),
        }
    }

    fn delete_channel_operation(&mut self, operation_id: &str) -> Result<(), StoreError> {
        self.staged
            .channel_operations
            .remove(operation_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("Channel operation {}", operation_id)))
    }

    fn list_channel_operations(&self) -> Result<Vec<ChannelOperation>, StoreError> {
        Ok(self.staged.channel_operations.values().cloned().collect())
    }

    fn find_idempotent_response(&self, token: &str) -> Result<Option<IdempotentRecord>, StoreError> {
        Ok(self.staged.idempotent_responses.get(token).cloned())
    }

    fn insert_idempotent_response(&mut self, record: IdempotentRecord) -> Result<(), StoreError> {
        if self.staged.idempotent_responses.contains_key(&record.token) {
            return Err(StoreError::IdempotencyKeyConflict(record.token));
        }
        self.staged
            .idempotent_responses
            .insert(record.token.clone(), record);
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        let injected = this
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Transient("injected commit failure".to_string()));
        }
        let MemoryTransaction {
            mut guard, staged, ..
        } = this;
        *guard = staged;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChannelSpec, OperationResponse};
    use crate::status::Status;

    fn channel(name: &str) -> Channel {
        Channel::new("exec1", "wf", ChannelSpec::new(name, "plain"))
    }

    #[test]
    fn test_commit_makes_changes_visible() {
        let storage = MemoryStorage::new();
        let mut tx = storage.begin().unwrap();
        tx.insert_channel(channel("ch1")).unwrap();
        tx.commit().unwrap();

        let tx = storage.begin().unwrap();
        assert!(tx.find_channel("channel-exec1-ch1").unwrap().is_some());
    }

    #[test]
    fn test_dropped_transaction_is_discarded() {
        let storage = MemoryStorage::new();
        {
            let mut tx = storage.begin().unwrap();
            tx.insert_channel(channel("ch1")).unwrap();
        }
        let tx = storage.begin().unwrap();
        assert!(tx.find_channel("channel-exec1-ch1").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_channel_rejected() {
        let storage = MemoryStorage::new();
        let mut tx = storage.begin().unwrap();
        tx.insert_channel(channel("ch1")).unwrap();
        let err = tx.insert_channel(channel("ch1")).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[test]
    fn test_complete_operation_is_write_once() {
        let storage = MemoryStorage::new();
        let op = Operation::new("Unbind", None);
        let id = op.id.clone();
        let mut tx = storage.begin().unwrap();
        tx.insert_operation(op).unwrap();
        tx.complete_operation(&id, OperationResult::Response(OperationResponse::Unbind))
            .unwrap();

        let err = tx
            .complete_operation(&id, OperationResult::Error(Status::internal("late")))
            .unwrap_err();
        assert_eq!(err, StoreError::OperationCompleted(id.clone()));
        let stored = tx.find_operation(&id).unwrap().unwrap();
        assert_eq!(
            stored.response(),
            Some(&OperationResponse::Unbind),
            "second completion must not overwrite"
        );
    }

    #[test]
    fn test_idempotency_token_is_unique() {
        let storage = MemoryStorage::new();
        let key = crate::model::IdempotencyKey {
            token: "k1".into(),
            request_hash: "h".into(),
        };
        let mut tx = storage.begin().unwrap();
        tx.insert_operation(Operation::new("a", Some(key.clone())))
            .unwrap();
        let err = tx
            .insert_operation(Operation::new("b", Some(key)))
            .unwrap_err();
        assert_eq!(err, StoreError::IdempotencyKeyConflict("k1".into()));
        assert_eq!(tx.find_operation_by_key("k1").unwrap().unwrap().description, "a");
    }

    #[test]
    fn test_injected_commit_failures() {
        let storage = MemoryStorage::new();
        storage.fail_next_commits(1);

        let mut tx = storage.begin().unwrap();
        tx.insert_channel(channel("ch1")).unwrap();
        assert!(tx.commit().unwrap_err().is_transient());

        let mut tx = storage.begin().unwrap();
        tx.insert_channel(channel("ch1")).unwrap();
        tx.commit().unwrap();
    }
}
