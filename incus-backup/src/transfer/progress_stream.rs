//! Progress-tracking stream wrapper and the debounce both transfer
//! directions share.

use super::Progress;
use bytes::Bytes;
use futures_util::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::time::{Duration, Instant};

/// Rate limiter for progress callbacks.
#[derive(Debug)]
pub struct Throttle {
    last_update: Instant,
    update_interval: Duration,
}

impl Throttle {
    pub fn new(update_interval: Duration) -> Self {
        Self {
            last_update: Instant::now(),
            update_interval,
        }
    }

    /// True at most once per interval.
    pub fn ready(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.last_update) >= self.update_interval {
            self.last_update = now;
            true
        } else {
            false
        }
    }
}

/// Stream wrapper that tracks bytes transferred and reports progress
pub struct ProgressStream<S> {
    inner: S,
    bytes_transferred: u64,
    throttle: Throttle,
    progress: Progress,
    finished: bool,
}

impl<S> ProgressStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>>,
{
    pub fn new(inner: S, progress: Progress) -> Self {
        Self {
            inner,
            bytes_transferred: 0,
            throttle: Throttle::new(progress.interval()),
            progress,
            finished: false,
        }
    }

    /// Get total bytes transferred
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }
}

impl<S> Stream for ProgressStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Unpin,
{
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let inner = Pin::new(&mut self.inner);

        match inner.poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                self.bytes_transferred += bytes.len() as u64;
                if self.throttle.ready() {
                    self.progress.report(self.bytes_transferred);
                }
                Poll::Ready(Some(Ok(bytes)))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
            Poll::Ready(None) => {
                // Final update on completion
                if !self.finished {
                    self.finished = true;
                    self.progress.report(self.bytes_transferred);
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
