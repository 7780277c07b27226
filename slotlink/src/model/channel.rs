//! Channels and the endpoints bound to them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::peer::PeerDescription;

/// Ranking class a producer binds with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PriorityClass {
    /// The slot that owns the data.
    Primary,
    /// Re-serves data it did not create: companion output slots, and
    /// storage after a finished upload.
    Backup,
}

impl PriorityClass {
    /// Starting priority; each failed transfer costs a producer one point.
    pub fn initial_priority(&self) -> i32 {
        match self {
            PriorityClass::Primary => 1,
            PriorityClass::Backup => 0,
        }
    }
}

/// Builds the deterministic channel id for an execution.
///
/// Every run of characters outside `[A-Za-z0-9-]` in the execution id is
/// collapsed into a single `-`.
pub fn channel_id(execution_id: &str, channel_name: &str) -> String {
    let mut sanitized = String::with_capacity(execution_id.len());
    let mut in_run = false;
    for c in execution_id.chars() {
        if c.is_ascii_alphanumeric() || c == '-' {
            sanitized.push(c);
            in_run = false;
        } else if !in_run {
            sanitized.push('-');
            in_run = true;
        }
    }
    format!("channel-{}-{}", sanitized, channel_name)
}

/// Declared shape of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSpec {
    /// Channel name, unique within an execution.
    pub name: String,
    /// Declared data type / media scheme of the payload.
    pub data_scheme: String,
    /// Object-storage location already holding the channel data.
    pub storage_producer_uri: Option<String>,
    /// Object-storage location the channel data is persisted to.
    pub storage_consumer_uri: Option<String>,
}

impl ChannelSpec {
    pub fn new(name: impl Into<String>, data_scheme: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_scheme: data_scheme.into(),
            storage_producer_uri: None,
            storage_consumer_uri: None,
        }
    }

    pub fn with_storage_producer(mut self, uri: impl Into<String>) -> Self {
        self.storage_producer_uri = Some(uri.into());
        self
    }

    pub fn with_storage_consumer(mut self, uri: impl Into<String>) -> Self {
        self.storage_consumer_uri = Some(uri.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifeStatus {
    Alive,
    Destroying,
}

/// A persisted channel record.
///
/// Endpoints are stored separately, keyed by slot uri.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub execution_id: String,
    pub workflow_name: String,
    pub spec: ChannelSpec,
    pub life_status: LifeStatus,
    pub created_at: DateTime<Utc>,
}

impl Channel {
    pub fn new(execution_id: &str, workflow_name: &str, spec: ChannelSpec) -> Self {
        Self {
            id: channel_id(execution_id, &spec.name),
            execution_id: execution_id.to_string(),
            workflow_name: workflow_name.to_string(),
            spec,
            life_status: LifeStatus::Alive,
            created_at: Utc::now(),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.life_status == LifeStatus::Alive
    }
}

/// Who owns the slot behind an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotOwner {
    Portal,
    Worker,
    /// Object storage registered by the manager itself.
    Storage,
}

impl SlotOwner {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotOwner::Portal => "PORTAL",
            SlotOwner::Worker => "WORKER",
            SlotOwner::Storage => "STORAGE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Producer,
    Consumer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointStatus {
    Binding,
    Active,
    Unbinding,
}

/// A slot's binding to a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub slot_uri: String,
    pub channel_id: String,
    pub owner_task_id: String,
    pub owner: SlotOwner,
    pub role: Role,
    pub direction: Direction,
    pub status: EndpointStatus,
    /// How other slots reach this endpoint.
    pub peer: PeerDescription,
    pub class: PriorityClass,
    /// Producer ranking; negative means never chosen.
    pub priority: i32,
    /// Consumer already paired with a producer.
    pub connected: bool,
    pub bound_at: DateTime<Utc>,
}

impl Endpoint {
    /// Binding or active: counts against exclusivity and uri uniqueness.
    pub fn is_bound(&self) -> bool {
        matches!(self.status, EndpointStatus::Binding | EndpointStatus::Active)
    }

    pub fn is_active(&self) -> bool {
        self.status == EndpointStatus::Active
    }

    pub fn is_producer(&self) -> bool {
        self.role == Role::Producer
    }

    pub fn is_consumer(&self) -> bool {
        self.role == Role::Consumer
    }

    /// Active producer eligible as a transfer source.
    pub fn is_eligible_producer(&self) -> bool {
        self.is_producer() && self.is_active() && self.priority >= 0
    }
}

/// Read-only snapshot of an alive channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStatus {
    pub channel: Channel,
    pub producers: Vec<Endpoint>,
    pub consumers: Vec<Endpoint>,
}

impl ChannelStatus {
    pub fn new(channel: Channel, endpoints: Vec<Endpoint>) -> Self {
        let (producers, consumers) = endpoints.into_iter().partition(Endpoint::is_producer);
        Self {
            channel,
            producers,
            consumers,
        }
    }
}
