//! Scoped read/write handle returned by [`crate::DataSource::open`].
//!
//! The underlying file is released on [`ScopedStream::close`] or on drop,
//! whichever comes first. After `close` every operation reports
//! [`DataSourceError::StreamClosed`].

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::error::{io_err, DataSourceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    ReadWrite,
}

impl OpenMode {
    pub fn is_writable(self) -> bool {
        self == OpenMode::ReadWrite
    }
}

/// Point-in-time view of an open stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamStats {
    pub path: PathBuf,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub writable: bool,
}

#[derive(Debug)]
pub struct ScopedStream {
    path: PathBuf,
    mode: OpenMode,
    file: Option<File>,
}

impl ScopedStream {
    pub(crate) fn new(path: PathBuf, mode: OpenMode, file: File) -> Self {
        Self {
            path,
            mode,
            file: Some(file),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    fn file(&mut self) -> Result<&mut File, DataSourceError> {
        self.file.as_mut().ok_or(DataSourceError::StreamClosed)
    }

    fn writable_file(&mut self) -> Result<&mut File, DataSourceError> {
        if self.file.is_some() && !self.mode.is_writable() {
            return Err(DataSourceError::ReadOnlyStream);
        }
        self.file()
    }

    fn io(&self, source: io::Error) -> DataSourceError {
        io_err(&self.path, source).into()
    }

    /// Read up to `buf.len()` bytes starting at `offset`. Returns 0 at end of file.
    pub async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, DataSourceError> {
        let file = self.file()?;
        let result = async {
            file.seek(SeekFrom::Start(offset)).await?;
            file.read(buf).await
        }
        .await;
        result.map_err(|e| self.io(e))
    }

    /// Write all of `data` at `offset`, extending the file if needed.
    pub async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<usize, DataSourceError> {
        let file = self.writable_file()?;
        let result = async {
            file.seek(SeekFrom::Start(offset)).await?;
            file.write_all(data).await?;
            file.flush().await
        }
        .await;
        result.map_err(|e| self.io(e))?;
        Ok(data.len())
    }

    pub async fn seek(&mut self, pos: SeekFrom) -> Result<u64, DataSourceError> {
        let file = self.file()?;
        let result = file.seek(pos).await;
        result.map_err(|e| self.io(e))
    }

    pub async fn truncate(&mut self, len: u64) -> Result<(), DataSourceError> {
        let file = self.writable_file()?;
        let result = file.set_len(len).await;
        result.map_err(|e| self.io(e))
    }

    pub async fn stats(&mut self) -> Result<StreamStats, DataSourceError> {
        let writable = self.mode.is_writable();
        let file = self.file()?;
        let result = file.metadata().await;
        let meta = result.map_err(|e| self.io(e))?;
        Ok(StreamStats {
            path: self.path.clone(),
            size: meta.len(),
            modified: meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or(DateTime::UNIX_EPOCH),
            writable,
        })
    }

    /// Flush pending writes and release the handle.
    ///
    /// The handle is released even when the flush fails.
    pub async fn close(&mut self) -> Result<(), DataSourceError> {
        let mut file = self.file.take().ok_or(DataSourceError::StreamClosed)?;
        let result = if self.mode.is_writable() {
            file.flush().await
        } else {
            Ok(())
        };
        drop(file);
        tracing::trace!(path = %self.path.display(), "stream closed");
        result.map_err(|e| self.io(e))
    }
}

impl Drop for ScopedStream {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            tracing::trace!(path = %self.path.display(), "stream released on drop");
        }
    }
}

fn closed() -> io::Error {
    io::Error::other(DataSourceError::StreamClosed)
}

impl AsyncRead for ScopedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().file.as_mut() {
            Some(file) => Pin::new(file).poll_read(cx, buf),
            None => Poll::Ready(Err(closed())),
        }
    }
}

impl AsyncWrite for ScopedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if !this.mode.is_writable() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                DataSourceError::ReadOnlyStream,
            )));
        }
        match this.file.as_mut() {
            Some(file) => Pin::new(file).poll_write(cx, buf),
            None => Poll::Ready(Err(closed())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().file.as_mut() {
            Some(file) => Pin::new(file).poll_flush(cx),
            None => Poll::Ready(Err(closed())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().file.as_mut() {
            Some(file) => Pin::new(file).poll_shutdown(cx),
            None => Poll::Ready(Err(closed())),
        }
    }
}

impl AsyncSeek for ScopedStream {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        match self.get_mut().file.as_mut() {
            Some(file) => Pin::new(file).start_seek(position),
            None => Err(closed()),
        }
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        match self.get_mut().file.as_mut() {
            Some(file) => Pin::new(file).poll_complete(cx),
            None => Poll::Ready(Err(closed())),
        }
    }
}
