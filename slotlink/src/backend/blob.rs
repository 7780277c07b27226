//! Object-storage slot data and the blob store seam.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{self, Cursor};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::io::AsyncWrite;
use tracing::debug;

use super::{BackendReader, BackendWriter, InputSlotBackend, OutputSlotBackend};
use crate::api::BoxFuture;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BlobError {
    #[error("Object {0} not found")]
    NotFound(String),

    #[error("Object storage unavailable: {0}")]
    Unavailable(String),
}

impl From<BlobError> for io::Error {
    fn from(err: BlobError) -> Self {
        let kind = match &err {
            BlobError::NotFound(_) => io::ErrorKind::NotFound,
            BlobError::Unavailable(_) => io::ErrorKind::ConnectionRefused,
        };
        io::Error::new(kind, err)
    }
}

/// Minimal object storage: whole-object puts, ranged gets.
pub trait BlobStore: Send + Sync {
    fn put<'a>(&'a self, uri: &'a str, data: Bytes) -> BoxFuture<'a, Result<(), BlobError>>;

    /// Up to `len` bytes starting at `offset`; empty past the end.
    fn get_range<'a>(
        &'a self,
        uri: &'a str,
        offset: u64,
        len: usize,
    ) -> BoxFuture<'a, Result<Bytes, BlobError>>;

    fn size<'a>(&'a self, uri: &'a str) -> BoxFuture<'a, Result<u64, BlobError>>;
}

/// In-memory [`BlobStore`] with fault injection.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<String, Bytes>>,
    failing_reads: AtomicUsize,
    failing_puts: AtomicUsize,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` ranged reads fail with `Unavailable`.
    pub fn fail_next_reads(&self, n: usize) {
        self.failing_reads.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` puts fail with `Unavailable`.
    pub fn fail_next_puts(&self, n: usize) {
        self.failing_puts.store(n, Ordering::SeqCst);
    }

    pub fn object(&self, uri: &str) -> Option<Bytes> {
        self.objects.lock().get(uri).cloned()
    }

    pub fn insert(&self, uri: impl Into<String>, data: impl Into<Bytes>) {
        self.objects.lock().insert(uri.into(), data.into());
    }

    fn take_fault(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl BlobStore for MemoryBlobStore {
    fn put<'a>(&'a self, uri: &'a str, data: Bytes) -> BoxFuture<'a, Result<(), BlobError>> {
        Box::pin(async move {
            if Self::take_fault(&self.failing_puts) {
                return Err(BlobError::Unavailable(format!("put {} rejected", uri)));
            }
            self.objects.lock().insert(uri.to_string(), data);
            Ok(())
        })
    }

    fn get_range<'a>(
        &'a self,
        uri: &'a str,
        offset: u64,
        len: usize,
    ) -> BoxFuture<'a, Result<Bytes, BlobError>> {
        Box::pin(async move {
            if Self::take_fault(&self.failing_reads) {
                return Err(BlobError::Unavailable(format!("get {} rejected", uri)));
            }
            let data = self
                .object(uri)
                .ok_or_else(|| BlobError::NotFound(uri.to_string()))?;
            let size = data.len() as u64;
            if offset >= size {
                return Ok(Bytes::new());
            }
            let end = offset.saturating_add(len as u64).min(size);
            Ok(data.slice(offset as usize..end as usize))
        })
    }

    fn size<'a>(&'a self, uri: &'a str) -> BoxFuture<'a, Result<u64, BlobError>> {
        Box::pin(async move {
            self.object(uri)
                .map(|data| data.len() as u64)
                .ok_or_else(|| BlobError::NotFound(uri.to_string()))
        })
    }
}

/// Serves an existing object.
pub struct OutputBlobBackend {
    store: Arc<dyn BlobStore>,
    uri: String,
}

impl OutputBlobBackend {
    pub fn new(store: Arc<dyn BlobStore>, uri: impl Into<String>) -> Self {
        Self {
            store,
            uri: uri.into(),
        }
    }
}

impl OutputSlotBackend for OutputBlobBackend {
    fn wait_completed(&self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            self.store.size(&self.uri).await?;
            Ok(())
        })
    }

    fn read_from(&self, offset: u64) -> BoxFuture<'_, io::Result<BackendReader>> {
        Box::pin(async move {
            let data = self.store.get_range(&self.uri, offset, usize::MAX).await?;
            Ok(Box::new(Cursor::new(data)) as BackendReader)
        })
    }

    fn close(&self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Stages a download in memory and uploads it as one object on finish.
pub struct InputBlobBackend {
    store: Arc<dyn BlobStore>,
    uri: String,
    staged: Arc<Mutex<Vec<u8>>>,
}

impl InputBlobBackend {
    pub fn new(store: Arc<dyn BlobStore>, uri: impl Into<String>) -> Self {
        Self {
            store,
            uri: uri.into(),
            staged: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl InputSlotBackend for InputBlobBackend {
    fn open_writer(&self, offset: u64) -> BoxFuture<'_, io::Result<BackendWriter>> {
        Box::pin(async move {
            let mut staged = self.staged.lock();
            if offset > staged.len() as u64 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("offset {} past staged length {}", offset, staged.len()),
                ));
            }
            staged.truncate(offset as usize);
            drop(staged);
            Ok(Box::new(StagingWriter {
                staged: self.staged.clone(),
            }) as BackendWriter)
        })
    }

    fn finish(&self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            let data = Bytes::from(self.staged.lock().clone());
            let size = data.len();
            self.store.put(&self.uri, data).await?;
            debug!(uri = %self.uri, size, "Uploaded staged object");
            Ok(())
        })
    }

    fn to_output(&self) -> io::Result<Arc<dyn OutputSlotBackend>> {
        Ok(Arc::new(OutputBlobBackend::new(
            self.store.clone(),
            self.uri.clone(),
        )))
    }

    fn close(&self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

struct StagingWriter {
    staged: Arc<Mutex<Vec<u8>>>,
}

impl AsyncWrite for StagingWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.staged.lock().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
