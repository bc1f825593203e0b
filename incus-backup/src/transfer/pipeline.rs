//! Hashing copy loop and the two-task producer/consumer pipeline.

use super::pipe::{pipe, PipeReader, PipeWriter};
use super::progress_stream::Throttle;
use super::Progress;
use crate::utils::errors::{BackupError, Result};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Outcome of one copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transferred {
    pub bytes: u64,
    /// Lowercase hex SHA-256 of everything copied
    pub digest: String,
}

fn write_error(label: &str, e: io::Error) -> BackupError {
    if e.kind() == io::ErrorKind::BrokenPipe {
        BackupError::PipeClosed
    } else {
        BackupError::Transport(format!("writing {}: {}", label, e))
    }
}

/// Copy `source` into `sink`, hashing every byte and reporting progress at
/// most once per interval. The sink is shut down once the source is
/// exhausted.
pub async fn copy<R, W>(
    source: &mut R,
    sink: &mut W,
    label: &str,
    chunk_size: usize,
    progress: Option<&Progress>,
) -> Result<Transferred>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut hasher = Sha256::new();
    let mut total = 0u64;
    let mut throttle = progress.map(|p| Throttle::new(p.interval()));

    loop {
        let n = source
            .read(&mut buf)
            .await
            .map_err(|e| BackupError::Transport(format!("reading {}: {}", label, e)))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        sink.write_all(&buf[..n]).await.map_err(|e| write_error(label, e))?;
        total += n as u64;

        if let (Some(progress), Some(throttle)) = (progress, throttle.as_mut()) {
            if throttle.ready() {
                progress.report(total);
            }
        }
    }

    sink.shutdown().await.map_err(|e| write_error(label, e))?;
    if let Some(progress) = progress {
        progress.report(total);
    }

    let digest = hex::encode(hasher.finalize());
    debug!(label = %label, bytes = total, digest = %digest, "transfer complete");
    Ok(Transferred { bytes: total, digest })
}

/// Handle on a producer task feeding a pipe.
///
/// Dropping the handle aborts the task, so a producer never outlives the
/// transfer that started it.
pub struct ProducerHandle<T> {
    handle: Option<JoinHandle<Result<T>>>,
}

impl<T> ProducerHandle<T> {
    /// Wait for the producer and combine its result with the consumer's.
    pub async fn finish<U>(mut self, consumer: Result<U>) -> Result<(T, U)> {
        let producer = match self.handle.take() {
            Some(handle) => joined(handle.await),
            None => Err(BackupError::Cancelled),
        };
        settle(producer, consumer)
    }
}

impl<T> Drop for ProducerHandle<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Run `producer` as its own task writing into `writer`. A producer error
/// closes the pipe with that error so the reading side fails instead of
/// seeing a short, clean stream.
pub fn spawn_producer<F, Fut, T>(writer: PipeWriter, producer: F) -> ProducerHandle<T>
where
    F: FnOnce(PipeWriter) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let errors = writer.error_sender();
    let task = producer(writer);
    let handle = tokio::spawn(async move {
        let result = task.await;
        if let Err(e) = &result {
            if !e.is_pipe_artifact() {
                errors.fail(e).await;
            }
        }
        result
    });
    ProducerHandle { handle: Some(handle) }
}

/// Run a producer and a consumer as two tasks joined by a bounded pipe,
/// wait for both, and report the first real failure.
///
/// On cancellation both tasks are aborted before returning.
pub async fn run<P, PF, T, C, CF, U>(
    capacity: usize,
    cancel: &CancellationToken,
    producer: P,
    consumer: C,
) -> Result<(T, U)>
where
    P: FnOnce(PipeWriter) -> PF,
    PF: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
    C: FnOnce(PipeReader) -> CF,
    CF: Future<Output = Result<U>> + Send + 'static,
    U: Send + 'static,
{
    if cancel.is_cancelled() {
        return Err(BackupError::Cancelled);
    }

    let (writer, reader) = pipe(capacity, None);
    let mut producer = spawn_producer(writer, producer);
    let consumer = tokio::spawn(consumer(reader));
    let consumer_abort = consumer.abort_handle();

    tokio::select! {
        consumer_result = consumer => producer.finish(joined(consumer_result)).await,
        _ = cancel.cancelled() => {
            consumer_abort.abort();
            if let Some(handle) = producer.handle.take() {
                handle.abort();
            }
            Err(BackupError::Cancelled)
        }
    }
}

fn joined<T>(result: std::result::Result<Result<T>, tokio::task::JoinError>) -> Result<T> {
    match result {
        Ok(inner) => inner,
        Err(e) if e.is_cancelled() => Err(BackupError::Cancelled),
        Err(e) => Err(BackupError::Transport(format!("transfer task failed: {}", e))),
    }
}

/// First-error rule: a producer failure wins unless it only reports that
/// the consumer went away, in which case the consumer's error is the cause.
fn settle<T, U>(producer: Result<T>, consumer: Result<U>) -> Result<(T, U)> {
    match (producer, consumer) {
        (Ok(t), Ok(u)) => Ok((t, u)),
        (Err(p), Ok(_)) => Err(p),
        (Ok(_), Err(c)) => Err(c),
        (Err(p), Err(c)) => {
            if p.is_pipe_artifact() && !c.is_pipe_artifact() {
                Err(c)
            } else {
                Err(p)
            }
        }
    }
}
