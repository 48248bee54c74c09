//! Rate-limited stream adapters.
//!
//! [`ThrottledReader`] charges the governor after each chunk it reads and
//! [`ThrottledWriter`] before each chunk it writes. Limiter cancellation
//! surfaces as an `io::Error` carrying [`TransferCancelled`].

use std::io;

use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use futures_util::stream;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use super::constants::CHUNK_SIZE;
use super::error::TransferCancelled;
use super::governor::Governor;
use super::progress::ProgressTracker;

/// Reader that waits on a [`Governor`] for every chunk it returns.
#[derive(Debug)]
pub struct ThrottledReader<R> {
    inner: R,
    governor: Governor,
    cancel: CancellationToken,
    bytes_read: u64,
}

impl<R> ThrottledReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: R, governor: Governor, cancel: CancellationToken) -> Self {
        Self {
            inner,
            governor,
            cancel,
            bytes_read: 0,
        }
    }

    /// Bytes returned so far.
    #[must_use]
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Reads one chunk into `buf`, then waits for the bytes it read.
    ///
    /// Returns 0 at end of stream.
    ///
    /// # Errors
    ///
    /// Propagates read errors; cancellation maps to an error carrying
    /// [`TransferCancelled`].
    pub async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf).await?;
        if n > 0 {
            self.bytes_read += n as u64;
            self.governor
                .wait(&self.cancel, n as u64)
                .await
                .map_err(TransferCancelled::into_io)?;
        }
        Ok(n)
    }

    /// Buffers chunks until end of stream or until more than `limit` bytes are held.
    ///
    /// # Errors
    ///
    /// Same as [`ThrottledReader::read_chunk`].
    pub async fn read_ahead(&mut self, limit: usize, progress: &ProgressTracker) -> io::Result<ReadAhead> {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut head = BytesMut::new();

        while head.len() <= limit {
            let n = self.read_chunk(&mut buf).await?;
            if n == 0 {
                return Ok(ReadAhead {
                    head: head.freeze(),
                    complete: true,
                });
            }
            head.extend_from_slice(&buf[..n]);
            progress.update(self.bytes_read);
        }

        Ok(ReadAhead {
            head: head.freeze(),
            complete: false,
        })
    }

    /// Turns the reader into a stream of throttled chunks that also reports progress.
    ///
    /// Suitable for streaming request bodies.
    pub fn into_stream(self, progress: ProgressTracker) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static
    where
        R: Send + 'static,
    {
        stream::try_unfold(
            (self, vec![0u8; CHUNK_SIZE], progress),
            |(mut reader, mut buf, progress)| async move {
                let n = reader.read_chunk(&mut buf).await?;
                if n == 0 {
                    return Ok(None);
                }
                progress.update(reader.bytes_read());
                let chunk = Bytes::copy_from_slice(&buf[..n]);
                Ok(Some((chunk, (reader, buf, progress))))
            },
        )
    }
}

/// Bytes buffered by [`ThrottledReader::read_ahead`].
#[derive(Debug, Clone)]
pub struct ReadAhead {
    pub head: Bytes,
    /// The reader ended before the limit was passed.
    pub complete: bool,
}

/// Writer that waits on a [`Governor`] before every chunk it writes.
#[derive(Debug)]
pub struct ThrottledWriter<W> {
    inner: W,
    governor: Governor,
    cancel: CancellationToken,
    bytes_written: u64,
}

impl<W> ThrottledWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(inner: W, governor: Governor, cancel: CancellationToken) -> Self {
        Self {
            inner,
            governor,
            cancel,
            bytes_written: 0,
        }
    }

    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Waits for `data.len()` bytes, then writes all of `data`.
    ///
    /// # Errors
    ///
    /// Propagates write errors; cancellation maps to an error carrying
    /// [`TransferCancelled`].
    pub async fn write_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.governor
            .wait(&self.cancel, data.len() as u64)
            .await
            .map_err(TransferCancelled::into_io)?;
        self.inner.write_all(data).await?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    /// Flushes and returns the inner writer.
    ///
    /// # Errors
    ///
    /// Propagates flush errors.
    pub async fn finish(mut self) -> io::Result<W> {
        self.inner.flush().await?;
        Ok(self.inner)
    }
}

/// Copies `reader` into `writer` through the governor, reporting progress per chunk.
///
/// Returns the number of bytes copied.
///
/// # Errors
///
/// Propagates read and write errors, including cancellation.
pub async fn copy_throttled<R, W>(
    reader: &mut R,
    writer: &mut W,
    governor: &Governor,
    cancel: &CancellationToken,
    progress: &ProgressTracker,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut copied = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        governor
            .wait(cancel, n as u64)
            .await
            .map_err(TransferCancelled::into_io)?;
        writer.write_all(&buf[..n]).await?;
        copied += n as u64;
        progress.update(copied);
    }
    writer.flush().await?;
    Ok(copied)
}
