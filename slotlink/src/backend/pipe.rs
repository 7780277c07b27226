//! Pipe-backed slot data.
//!
//! Pipes cannot seek, so both directions go through a spool file: the
//! output side drains the upstream pipe into the spool and serves reads
//! from it, the input side downloads into the spool (where failover may
//! rewind it) and forwards the finished content downstream.

use parking_lot::Mutex;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::file::{open_at, read_at};
use super::{BackendReader, BackendWriter, InputSlotBackend, OutputFileBackend, OutputSlotBackend};
use crate::api::BoxFuture;

#[derive(Debug, Clone, PartialEq, Eq)]
enum PipeState {
    Filling,
    Completed,
    Failed(String),
}

/// Serves what an upstream process writes into a pipe, once it closes it.
pub struct OutputPipeBackend {
    spool: PathBuf,
    state: watch::Receiver<PipeState>,
    filler: Mutex<Option<JoinHandle<()>>>,
}

impl OutputPipeBackend {
    /// Starts draining `source` into `spool`.
    pub fn spawn<R>(mut source: R, spool: impl Into<PathBuf>) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let spool = spool.into();
        let (tx, rx) = watch::channel(PipeState::Filling);
        let path = spool.clone();
        let filler = tokio::spawn(async move {
            let drained = async {
                let mut file = File::create(&path).await?;
                let bytes = tokio::io::copy(&mut source, &mut file).await?;
                file.flush().await?;
                Ok::<_, io::Error>(bytes)
            }
            .await;
            match drained {
                Ok(bytes) => {
                    debug!(spool = %path.display(), bytes, "Pipe drained");
                    tx.send_replace(PipeState::Completed);
                }
                Err(e) => {
                    warn!(spool = %path.display(), error = %e, "Pipe drain failed");
                    tx.send_replace(PipeState::Failed(e.to_string()));
                }
            }
        });
        Arc::new(Self {
            spool,
            state: rx,
            filler: Mutex::new(Some(filler)),
        })
    }
}

impl OutputSlotBackend for OutputPipeBackend {
    fn wait_completed(&self) -> BoxFuture<'_, io::Result<()>> {
        let mut rx = self.state.clone();
        Box::pin(async move {
            let state = rx
                .wait_for(|s| *s != PipeState::Filling)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe drain aborted"))?
                .clone();
            match state {
                PipeState::Failed(reason) => Err(io::Error::new(io::ErrorKind::Other, reason)),
                _ => Ok(()),
            }
        })
    }

    fn read_from(&self, offset: u64) -> BoxFuture<'_, io::Result<BackendReader>> {
        Box::pin(read_at(&self.spool, offset))
    }

    fn close(&self) -> BoxFuture<'_, io::Result<()>> {
        if let Some(filler) = self.filler.lock().take() {
            filler.abort();
        }
        Box::pin(async move {
            match tokio::fs::remove_file(&self.spool).await {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
                _ => Ok(()),
            }
        })
    }
}

/// Downloads into a spool file and forwards it into a downstream pipe.
pub struct InputPipeBackend {
    spool: PathBuf,
    sink: tokio::sync::Mutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>,
}

impl InputPipeBackend {
    pub fn new<W>(sink: W, spool: impl Into<PathBuf>) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            spool: spool.into(),
            sink: tokio::sync::Mutex::new(Some(Box::new(sink))),
        }
    }
}

impl InputSlotBackend for InputPipeBackend {
    fn open_writer(&self, offset: u64) -> BoxFuture<'_, io::Result<BackendWriter>> {
        Box::pin(async move { Ok(Box::new(open_at(&self.spool, offset).await?) as BackendWriter) })
    }

    fn finish(&self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            let mut sink = self
                .sink
                .lock()
                .await
                .take()
                .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "pipe already closed"))?;
            let mut spool = File::open(&self.spool).await?;
            let bytes = tokio::io::copy(&mut spool, &mut sink).await?;
            sink.shutdown().await?;
            debug!(spool = %self.spool.display(), bytes, "Forwarded spool into pipe");
            Ok(())
        })
    }

    fn to_output(&self) -> io::Result<Arc<dyn OutputSlotBackend>> {
        Ok(Arc::new(OutputFileBackend::completed(self.spool.clone())))
    }

    fn close(&self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            if let Some(mut sink) = self.sink.lock().await.take() {
                sink.shutdown().await?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_output_pipe_completes_when_writer_closes() {
        let dir = tempfile::TempDir::new().unwrap();
        let (mut upstream, pipe_end) = tokio::io::duplex(64);
        let backend = OutputPipeBackend::spawn(pipe_end, dir.path().join("spool"));

        upstream.write_all(b"streamed bytes").await.unwrap();
        drop(upstream);

        backend.wait_completed().await.unwrap();
        let mut reader = backend.read_from(9).await.unwrap();
        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "bytes");
    }

    #[tokio::test]
    async fn test_input_pipe_forwards_after_finish() {
        let dir = tempfile::TempDir::new().unwrap();
        let (pipe_end, mut downstream) = tokio::io::duplex(64);
        let backend = InputPipeBackend::new(pipe_end, dir.path().join("spool"));

        let mut w = backend.open_writer(0).await.unwrap();
        w.write_all(b"abcdef").await.unwrap();
        w.shutdown().await.unwrap();
        // failover rewinds and rewrites the tail
        let mut w = backend.open_writer(3).await.unwrap();
        w.write_all(b"DEF").await.unwrap();
        w.shutdown().await.unwrap();

        backend.finish().await.unwrap();
        let mut out = Vec::new();
        downstream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"abcDEF");
    }
}
