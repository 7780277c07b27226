//! File-backed slot data.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncSeekExt;
use tokio::sync::watch;

use super::{BackendReader, BackendWriter, InputSlotBackend, OutputSlotBackend};
use crate::api::BoxFuture;

/// Downloads into a file.
#[derive(Debug, Clone)]
pub struct InputFileBackend {
    path: PathBuf,
}

impl InputFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl InputSlotBackend for InputFileBackend {
    fn open_writer(&self, offset: u64) -> BoxFuture<'_, io::Result<BackendWriter>> {
        Box::pin(async move { Ok(Box::new(open_at(&self.path, offset).await?) as BackendWriter) })
    }

    fn finish(&self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn to_output(&self) -> io::Result<Arc<dyn OutputSlotBackend>> {
        Ok(Arc::new(OutputFileBackend::completed(self.path.clone())))
    }

    fn close(&self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Opens `path` for writing, truncated to `offset` and positioned there.
pub(super) async fn open_at(path: &Path, offset: u64) -> io::Result<File> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .await?;
    file.set_len(offset).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    Ok(file)
}

/// Opens `path` for reading at `offset`.
pub(super) async fn read_at(path: &Path, offset: u64) -> io::Result<BackendReader> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    Ok(Box::new(file))
}

/// Serves a file once it is marked complete.
#[derive(Debug)]
pub struct OutputFileBackend {
    path: PathBuf,
    completed: watch::Sender<bool>,
}

impl OutputFileBackend {
    /// A file still being written by someone else.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let (completed, _) = watch::channel(false);
        Self {
            path: path.into(),
            completed,
        }
    }

    /// A file whose content is already final.
    pub fn completed(path: impl Into<PathBuf>) -> Self {
        let backend = Self::new(path);
        backend.mark_completed();
        backend
    }

    pub fn mark_completed(&self) {
        self.completed.send_replace(true);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl OutputSlotBackend for OutputFileBackend {
    fn wait_completed(&self) -> BoxFuture<'_, io::Result<()>> {
        let mut rx = self.completed.subscribe();
        Box::pin(async move {
            rx.wait_for(|done| *done)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "backend dropped"))?;
            Ok(())
        })
    }

    fn read_from(&self, offset: u64) -> BoxFuture<'_, io::Result<BackendReader>> {
        Box::pin(read_at(&self.path, offset))
    }

    fn close(&self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async { Ok(()) })
    }
}
