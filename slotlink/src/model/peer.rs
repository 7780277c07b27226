//! Peer descriptions and transfer records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How to reach the counterpart of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerDescription {
    /// A live slot served by a slots API at `url`.
    Slot { peer_id: String, url: String },
    /// An object in object storage.
    Storage { peer_id: String, uri: String },
}

impl PeerDescription {
    pub fn slot(peer_id: impl Into<String>, url: impl Into<String>) -> Self {
        PeerDescription::Slot {
            peer_id: peer_id.into(),
            url: url.into(),
        }
    }

    pub fn storage(peer_id: impl Into<String>, uri: impl Into<String>) -> Self {
        PeerDescription::Storage {
            peer_id: peer_id.into(),
            uri: uri.into(),
        }
    }

    pub fn peer_id(&self) -> &str {
        match self {
            PeerDescription::Slot { peer_id, .. } | PeerDescription::Storage { peer_id, .. } => {
                peer_id
            }
        }
    }

    pub fn is_storage(&self) -> bool {
        matches!(self, PeerDescription::Storage { .. })
    }
}

impl fmt::Display for PeerDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerDescription::Slot { peer_id, url } => write!(f, "slot {} at {}", peer_id, url),
            PeerDescription::Storage { uri, .. } => write!(f, "storage {}", uri),
        }
    }
}

/// Correlation id shared by both sides of one physical byte transfer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransferId(String);

impl TransferId {
    pub fn generate() -> Self {
        Self(format!("transfer-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TransferId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TransferId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferState {
    /// Created, consumer not yet told.
    Pending,
    Active,
    Completed,
    Failed,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Completed | TransferState::Failed)
    }
}

/// One producer → consumer byte stream, tracked by the manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: TransferId,
    pub channel_id: String,
    /// Slot uri of the producing endpoint.
    pub from_uri: String,
    pub from: PeerDescription,
    /// Slot uri of the consuming endpoint.
    pub to_uri: String,
    pub to: PeerDescription,
    pub state: TransferState,
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Transfer {
    pub fn new(
        channel_id: &str,
        (from_uri, from): (&str, &PeerDescription),
        (to_uri, to): (&str, &PeerDescription),
        state: TransferState,
    ) -> Self {
        Self {
            id: TransferId::generate(),
            channel_id: channel_id.to_string(),
            from_uri: from_uri.to_string(),
            from: from.clone(),
            to_uri: to_uri.to_string(),
            to: to.clone(),
            state,
            failure: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == TransferState::Active
    }
}
