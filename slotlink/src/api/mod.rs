//! The two RPC seams of the protocol.
//!
//! ```text
//!                    ┌──────────────────────┐
//!      bind/unbind   │  ChannelManagerApi   │  transfer_completed
//!   ┌───────────────►│  (control plane)     │◄──────────────────┐
//!   │                └──────────┬───────────┘  transfer_failed  │
//!   │                           │ start_transfer                │
//!   │                           ▼                               │
//! ┌─┴──────────┐  read   ┌──────────────┐                ┌──────┴─────┐
//! │ InputSlot  │────────►│   SlotsApi   │───────────────►│ OutputSlot │
//! └────────────┘         │ (data plane) │                └────────────┘
//!                        └──────────────┘
//! ```
//!
//! Both seams are object-safe traits returning boxed futures so an
//! in-process implementation and a network client are interchangeable.

mod requests;
mod stream;

pub use requests::{
    BindRequest, CreateChannelRequest, DestroyAllRequest, DestroyRequest, SlotInstance,
    StartTransferRequest, TransferCompletedRequest, TransferFailedRequest,
    TransferFailedResponse, UnbindRequest,
};
pub use stream::{chunk_channel, ChunkSender, ChunkStream, ReadChunk};

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::model::Operation;
use crate::status::Status;

/// Boxed future returned by the RPC traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Control-plane calls a slot makes against the channel manager.
pub trait ChannelManagerApi: Send + Sync {
    fn bind(&self, request: BindRequest) -> BoxFuture<'_, Result<Operation, Status>>;

    fn unbind(&self, request: UnbindRequest) -> BoxFuture<'_, Result<Operation, Status>>;

    /// Resolves once the operation is done or `timeout` elapses; returns
    /// the operation as it stands.
    fn await_operation(
        &self,
        operation_id: String,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<Operation, Status>>;

    fn transfer_completed(
        &self,
        request: TransferCompletedRequest,
    ) -> BoxFuture<'_, Result<(), Status>>;

    /// Reports a failed transfer and receives a replacement peer.
    fn transfer_failed(
        &self,
        request: TransferFailedRequest,
    ) -> BoxFuture<'_, Result<TransferFailedResponse, Status>>;
}

/// Data-plane calls served by a worker's slot registry.
pub trait SlotsApi: Send + Sync {
    /// Streams a registered slot's bytes from `offset`, ending with
    /// [`ReadChunk::EndOfStream`].
    fn read(&self, peer_id: String, offset: u64) -> BoxFuture<'_, Result<ChunkStream, Status>>;

    /// Pushes a resolved peer to a slot waiting for one.
    fn start_transfer(&self, request: StartTransferRequest) -> BoxFuture<'_, Result<(), Status>>;

    /// Stops a slot's transfers and detaches it from its channel. The slot
    /// stays registered until destroyed.
    fn disconnect_slot(&self, slot_id: String) -> BoxFuture<'_, Result<(), Status>>;

    /// Closes a slot without unbinding it and drops it from the registry.
    fn destroy_slot(&self, slot_id: String) -> BoxFuture<'_, Result<(), Status>>;
}
