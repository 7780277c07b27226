//! The slots service of one worker.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, trace};

use crate::api::{BoxFuture, ChunkStream, SlotsApi, StartTransferRequest};
use crate::model::{PeerDescription, TransferId};
use crate::status::Status;

/// A live slot as seen by the slots service.
pub trait Slot: Send + Sync {
    fn id(&self) -> &str;

    /// Hands a waiting input slot the peer to download from.
    fn start_transfer(&self, peer: PeerDescription, transfer_id: TransferId) -> Result<(), Status>;

    /// Streams an output slot's data from `offset`.
    fn read(&self, offset: u64) -> Result<ChunkStream, Status>;

    /// Idempotent.
    fn close(&self) -> BoxFuture<'_, ()>;

    /// Stops moving data on the manager's behalf. The slot no longer
    /// unbinds itself; its endpoint belongs to the manager from here on.
    fn disconnect(&self);

    /// Disconnects, then closes.
    fn destroy(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.disconnect();
            self.close().await;
        })
    }
}

/// Slots reachable by peer id, served as [`SlotsApi`].
#[derive(Default)]
pub struct SlotRegistry {
    slots: DashMap<String, Arc<dyn Slot>>,
}

impl SlotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, slot: Arc<dyn Slot>) {
        trace!(slot_id = slot.id(), "Slot registered");
        self.slots.insert(slot.id().to_string(), slot);
    }

    pub fn unregister(&self, slot_id: &str) {
        if self.slots.remove(slot_id).is_some() {
            trace!(slot_id, "Slot unregistered");
        }
    }

    pub fn contains(&self, slot_id: &str) -> bool {
        self.slots.contains_key(slot_id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn get(&self, slot_id: &str) -> Result<Arc<dyn Slot>, Status> {
        self.slots
            .get(slot_id)
            .map(|slot| slot.clone())
            .ok_or_else(|| Status::not_found(format!("Slot {} not found", slot_id)))
    }
}

impl SlotsApi for SlotRegistry {
    fn read(&self, peer_id: String, offset: u64) -> BoxFuture<'_, Result<ChunkStream, Status>> {
        Box::pin(async move {
            let slot = self.get(&peer_id)?;
            debug!(slot_id = %peer_id, offset, "Serving read");
            slot.read(offset)
        })
    }

    fn start_transfer(&self, request: StartTransferRequest) -> BoxFuture<'_, Result<(), Status>> {
        Box::pin(async move {
            let slot = self.get(&request.slot_id)?;
            debug!(
                slot_id = %request.slot_id,
                transfer_id = %request.transfer_id,
                peer = %request.peer,
                "Peer pushed to slot"
            );
            slot.start_transfer(request.peer, request.transfer_id)
        })
    }

    fn disconnect_slot(&self, slot_id: String) -> BoxFuture<'_, Result<(), Status>> {
        Box::pin(async move {
            let slot = self.get(&slot_id)?;
            info!(slot_id = %slot_id, "Disconnecting slot");
            slot.disconnect();
            Ok(())
        })
    }

    fn destroy_slot(&self, slot_id: String) -> BoxFuture<'_, Result<(), Status>> {
        Box::pin(async move {
            let slot = self.get(&slot_id)?;
            info!(slot_id = %slot_id, "Destroying slot");
            slot.destroy().await;
            self.unregister(&slot_id);
            Ok(())
        })
    }
}
