//! Channel manager: the control plane of the protocol.
//!
//! # Architecture
//!
//! ```text
//!   bind / unbind / destroy / destroy_all
//!          │
//!          ▼
//!   ┌─────────────┐   INVALID_ARGUMENT
//!   │  validator  │─────────────────────► caller
//!   └──────┬──────┘
//!          │ lock(channel)
//!          ▼
//!   ┌─────────────┐   NOT_FOUND / ALREADY_EXISTS / FAILED_PRECONDITION
//!   │preconditions│─────────────────────► caller
//!   └──────┬──────┘
//!          │ one transaction: intent + Operation + ChannelOperation
//!          ▼
//!     Operation ──────────────────────────► caller (long-running handle)
//!          │
//!          ▼
//!   ┌─────────────┐  lock(channel)  ┌──────────┐
//!   │  executor   │────────────────►│ actions  │── pairing, teardown
//!   └─────────────┘                 └────┬─────┘
//!                                        │ start_transfer (outside the lock)
//!                                        ▼
//!                                waiting consumer slots
//! ```
//!
//! Every precondition check and the mutation it guards run under the
//! channel's [`GrainedLock`] entry, so decisions on one channel are
//! serialized while distinct channels proceed in parallel.
//!
//! Transactions are synchronous and never held across an `.await`; the
//! channel lock is.

mod actions;
mod executor;
mod idempotency;
mod lock;
mod pairing;
mod preconditions;
mod service;
mod shared;
mod transfers;
mod validator;

pub use idempotency::request_hash;
pub use lock::{ChannelGuard, GrainedLock};
pub use pairing::{select_producer, storage_slot_uri};
pub use service::ChannelManager;
