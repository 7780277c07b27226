//! Idempotency keys for mutating calls.
//!
//! A key pins a client token to the hash of the request it was first used
//! with. Replaying the token with the same request returns the original
//! result; replaying it with a different request is a conflict.

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::model::{IdempotencyKey, Operation};
use crate::status::Status;
use crate::store::{IdempotentRecord, StoreError, Transaction};

const KEY_FIELD: &str = "idempotency_key";

/// SHA-256 hex digest of the request's JSON with the key field removed.
pub fn request_hash<R: Serialize>(request: &R) -> Result<String, Status> {
    let mut value = serde_json::to_value(request)
        .map_err(|e| Status::internal(format!("Cannot hash request: {}", e)))?;
    if let Some(object) = value.as_object_mut() {
        object.remove(KEY_FIELD);
    }
    let canonical = serde_json::to_vec(&value)
        .map_err(|e| Status::internal(format!("Cannot hash request: {}", e)))?;
    Ok(format!("{:x}", Sha256::digest(&canonical)))
}

/// Builds the key for `request`, if the caller supplied a token.
pub fn operation_key<R: Serialize>(
    token: Option<&str>,
    request: &R,
) -> Result<Option<IdempotencyKey>, Status> {
    match token {
        Some(token) => Ok(Some(IdempotencyKey {
            token: token.to_string(),
            request_hash: request_hash(request)?,
        })),
        None => Ok(None),
    }
}

fn conflict() -> Status {
    Status::invalid_argument("IdempotencyKey conflict")
}

/// The operation already created under `key`, if any.
pub fn find_operation(
    tx: &dyn Transaction,
    key: &IdempotencyKey,
) -> Result<Option<Operation>, Status> {
    match tx.find_operation_by_key(&key.token)? {
        Some(op) => {
            let same = op
                .idempotency_key
                .as_ref()
                .map(|k| k.request_hash == key.request_hash)
                .unwrap_or(false);
            if same {
                Ok(Some(op))
            } else {
                Err(conflict())
            }
        }
        None => Ok(None),
    }
}

/// The response stored under `key` by an earlier synchronous call, if any.
pub fn find_response<T: DeserializeOwned>(
    tx: &dyn Transaction,
    key: &IdempotencyKey,
) -> Result<Option<T>, Status> {
    match tx.find_idempotent_response(&key.token)? {
        Some(record) if record.request_hash == key.request_hash => {
            let response = serde_json::from_value(record.response)
                .map_err(|e| Status::internal(format!("Corrupt stored response: {}", e)))?;
            Ok(Some(response))
        }
        Some(_) => Err(conflict()),
        None => Ok(None),
    }
}

/// Stores `response` under `key` in the same transaction as the mutation.
pub fn store_response<T: Serialize>(
    tx: &mut dyn Transaction,
    key: &IdempotencyKey,
    response: &T,
) -> Result<(), Status> {
    let response = serde_json::to_value(response)
        .map_err(|e| Status::internal(format!("Cannot store response: {}", e)))?;
    tx.insert_idempotent_response(IdempotentRecord {
        token: key.token.clone(),
        request_hash: key.request_hash.clone(),
        response,
    })
    .map_err(|e| match e {
        StoreError::IdempotencyKeyConflict(_) => conflict(),
        other => other.into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::UnbindRequest;
    use crate::store::{MemoryStorage, Storage};
    use crate::status::Code;

    #[test]
    fn test_hash_ignores_key_field() {
        let a = UnbindRequest::new("local://w/s1").with_idempotency_key("k1");
        let b = UnbindRequest::new("local://w/s1").with_idempotency_key("k2");
        let c = UnbindRequest::new("local://w/s2").with_idempotency_key("k1");
        assert_eq!(request_hash(&a).unwrap(), request_hash(&b).unwrap());
        assert_ne!(request_hash(&a).unwrap(), request_hash(&c).unwrap());
        assert_eq!(request_hash(&a).unwrap().len(), 64);
    }

    #[test]
    fn test_no_token_no_key() {
        let request = UnbindRequest::new("local://w/s1");
        assert!(operation_key(None, &request).unwrap().is_none());
    }

    #[test]
    fn test_replay_and_conflict() {
        let storage = MemoryStorage::new();
        let first = UnbindRequest::new("local://w/s1");
        let key = operation_key(Some("k1"), &first).unwrap().unwrap();

        let mut tx = storage.begin().unwrap();
        let op = Operation::new("Unbind", Some(key.clone()));
        tx.insert_operation(op.clone()).unwrap();
        tx.commit().unwrap();

        let tx = storage.begin().unwrap();
        let found = find_operation(tx.as_ref(), &key).unwrap().unwrap();
        assert_eq!(found.id, op.id);

        let other = operation_key(Some("k1"), &UnbindRequest::new("local://w/s2"))
            .unwrap()
            .unwrap();
        let err = find_operation(tx.as_ref(), &other).unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert_eq!(err.message(), "IdempotencyKey conflict");
    }

    #[test]
    fn test_stored_response_round_trip() {
        let storage = MemoryStorage::new();
        let key = operation_key(Some("k1"), &UnbindRequest::new("u")).unwrap().unwrap();

        let mut tx = storage.begin().unwrap();
        store_response(tx.as_mut(), &key, &vec![1u32, 2, 3]).unwrap();
        tx.commit().unwrap();

        let tx = storage.begin().unwrap();
        let stored: Option<Vec<u32>> = find_response(tx.as_ref(), &key).unwrap();
        assert_eq!(stored, Some(vec![1, 2, 3]));
    }
}
