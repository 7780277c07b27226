//! Data model shared by the channel manager and the slots.
//!
//! ```text
//!   Channel (id, execution, spec, ALIVE|DESTROYING)
//!      │ 1..n
//!      ▼
//!   Endpoint (slot uri, role, direction, BINDING|ACTIVE|UNBINDING, priority)
//!      │ producer ──Transfer──► consumer
//!      ▼
//!   Transfer (id, PENDING|ACTIVE|COMPLETED|FAILED)
//!
//!   Operation ◄── ChannelOperation (BIND|UNBIND|DESTROY, deadline)
//! ```
//!
//! Records are plain data; the [`crate::store`] owns them.

mod channel;
mod operation;
mod peer;

pub use channel::{
    channel_id, Channel, ChannelSpec, ChannelStatus, Direction, Endpoint, EndpointStatus,
    LifeStatus, PriorityClass, Role, SlotOwner,
};
pub use operation::{
    BindResponse, ChannelOperation, ChannelOperationKind, IdempotencyKey, Operation,
    OperationResponse, OperationResult,
};
pub use peer::{PeerDescription, Transfer, TransferId, TransferState};
