//! Local data sinks and sources behind slots.
//!
//! An input slot downloads into an [`InputSlotBackend`]; an output slot
//! serves an [`OutputSlotBackend`]. Backends know nothing about peers or
//! transfers, only about positioned writes and reads.
//!
//! | Backend | Input side | Output side |
//! |---------|------------|-------------|
//! | file    | [`InputFileBackend`] | [`OutputFileBackend`] |
//! | pipe    | [`InputPipeBackend`] (spool, then forward) | [`OutputPipeBackend`] (drain into spool) |
//! | object storage | [`InputBlobBackend`] (stage, then upload) | [`OutputBlobBackend`] |
//!
//! Output data is append-then-freeze: once `wait_completed` resolves, the
//! bytes never change, so any number of readers may stream concurrently.

mod blob;
mod file;
mod pipe;

pub use blob::{BlobError, BlobStore, InputBlobBackend, MemoryBlobStore, OutputBlobBackend};
pub use file::{InputFileBackend, OutputFileBackend};
pub use pipe::{InputPipeBackend, OutputPipeBackend};

use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::api::BoxFuture;

pub type BackendWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type BackendReader = Box<dyn AsyncRead + Send + Unpin>;

/// Sink an input slot downloads into.
pub trait InputSlotBackend: Send + Sync {
    /// Writer positioned at `offset`. Bytes past `offset` left by an
    /// earlier attempt are discarded.
    fn open_writer(&self, offset: u64) -> BoxFuture<'_, io::Result<BackendWriter>>;

    /// Called once after the whole stream was written and the writer shut down.
    fn finish(&self) -> BoxFuture<'_, io::Result<()>>;

    /// Source serving the downloaded data.
    fn to_output(&self) -> io::Result<Arc<dyn OutputSlotBackend>>;

    fn close(&self) -> BoxFuture<'_, io::Result<()>>;
}

/// Source an output slot serves from.
pub trait OutputSlotBackend: Send + Sync {
    /// Resolves once the data is complete and immutable.
    fn wait_completed(&self) -> BoxFuture<'_, io::Result<()>>;

    fn read_from(&self, offset: u64) -> BoxFuture<'_, io::Result<BackendReader>>;

    fn close(&self) -> BoxFuture<'_, io::Result<()>>;
}
