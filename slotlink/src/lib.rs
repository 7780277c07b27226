//! Slotlink - channel and slot binding for distributed workflows
//!
//! Tasks of a workflow execution exchange data through channels. A task
//! exposes slots; the channel manager binds them to channels as producers
//! or consumers, pairs them, and the slots move the bytes between each
//! other or to and from object storage.
//!
//! # High-Level API
//!
//! ```ignore
//! use slotlink::manager::ChannelManager;
//! use slotlink::slots::{InputSlot, OutputSlot, SlotsContext};
//!
//! let manager = Arc::new(ChannelManager::new(storage, network, settings.manager));
//! let channel_id = manager.create(request).await?;
//!
//! let producer = OutputSlot::spawn(output_backend, "task-a/out", &channel_id, ctx_a);
//! let consumer = InputSlot::spawn(input_backend, "task-b/in", &channel_id, ctx_b);
//! consumer.ready().await?;
//! ```

pub mod api;
pub mod backend;
pub mod config;
pub mod logging;
pub mod manager;
pub mod model;
pub mod retry;
pub mod slots;
pub mod status;
pub mod store;
pub mod transfer;

/// Version of the slotlink library.
///
/// The version is defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
