//! Bounded in-memory pipe between a producer task and a consumer task.
//!
//! The writer suspends once `capacity` chunks are queued, so memory stays
//! bounded no matter how large the payload is. A failing producer closes
//! the pipe with its error, which the reader surfaces instead of a clean
//! end-of-stream.

use super::progress_stream::ProgressStream;
use super::Progress;
use crate::utils::errors::BackupError;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream, StreamExt};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use tokio_util::sync::PollSender;

type Chunk = io::Result<Bytes>;

/// Largest chunk queued by a single write.
const MAX_CHUNK: usize = 256 * 1024;

/// Create a pipe holding at most `capacity` chunks. When `progress` is
/// set, bytes are reported as the reader consumes them.
pub fn pipe(capacity: usize, progress: Option<Progress>) -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel::<Chunk>(capacity.max(1));

    let chunks: BoxStream<'static, Chunk> = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    })
    .boxed();

    let chunks = match progress {
        Some(progress) => ProgressStream::new(chunks, progress).boxed(),
        None => chunks,
    };

    let writer = PipeWriter {
        errors: tx.clone(),
        sender: PollSender::new(tx),
    };
    let reader = PipeReader {
        inner: StreamReader::new(chunks),
    };
    (writer, reader)
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "transfer pipe closed by reader")
}

/// Write half. Dropping it (or shutting it down) ends the stream.
pub struct PipeWriter {
    sender: PollSender<Chunk>,
    errors: mpsc::Sender<Chunk>,
}

impl PipeWriter {
    /// Handle that can close the pipe with an error after the writer
    /// itself has been consumed.
    pub fn error_sender(&self) -> PipeErrorSender {
        PipeErrorSender {
            sender: self.errors.clone(),
        }
    }
}

impl AsyncWrite for PipeWriter {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        ready!(self.sender.poll_reserve(cx)).map_err(|_| closed())?;
        let len = buf.len().min(MAX_CHUNK);
        self.sender
            .send_item(Ok(Bytes::copy_from_slice(&buf[..len])))
            .map_err(|_| closed())?;
        Poll::Ready(Ok(len))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.sender.close();
        Poll::Ready(Ok(()))
    }
}

/// Closes a pipe with an error on behalf of a failed producer.
pub struct PipeErrorSender {
    sender: mpsc::Sender<Chunk>,
}

impl PipeErrorSender {
    /// Queue `error` behind any buffered data. A reader that already went
    /// away is not an error.
    pub async fn fail(self, error: &BackupError) {
        let _ = self.sender.send(Err(io::Error::other(error.to_string()))).await;
    }
}

/// Read half.
pub struct PipeReader {
    inner: StreamReader<BoxStream<'static, Chunk>, Bytes>,
}

impl AsyncRead for PipeReader {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}
