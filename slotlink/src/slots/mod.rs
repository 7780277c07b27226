//! Slots: the data plane of the protocol.
//!
//! A task exposes its inputs and outputs as slots. Input slots bind as
//! consumers and download from whatever producer the channel manager
//! assigns; output slots bind as producers and serve reads.
//!
//! ```text
//!            worker A                                   worker B
//!   ┌──────────────────────┐                   ┌──────────────────────┐
//!   │ OutputSlot "a/out"   │◄── read(offset) ──│ InputSlot "b/in"     │
//!   │   prepare: bind      │                   │   bind, wait, pull   │
//!   │   reads: 1 task each │                   │   failover on peer   │
//!   └──────────┬───────────┘                   │   errors             │
//!              │ registered in                 └──────────┬───────────┘
//!   ┌──────────▼───────────┐                              │ READY
//!   │ SlotRegistry         │  ◄── start_transfer (manager) ▼
//!   │ (SlotsApi)           │                   OutputSlot "b/in-out"
//!   └──────────────────────┘                   (BACKUP companion)
//! ```
//!
//! Progress is published as [`SlotEvent`]s on a broadcast channel held by
//! the [`SlotsContext`].

mod context;
mod events;
mod input;
mod output;
mod registry;

pub use context::{ExecutionSlots, SlotsContext, TaskIdentity};
pub use events::{InputSlotState, SlotError, SlotEvent, SlotEventKind};
pub use input::InputSlot;
pub use output::OutputSlot;
pub use registry::{Slot, SlotRegistry};
