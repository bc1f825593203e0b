//! Streaming transfer pipeline.
//!
//! Payloads are multi-gigabyte tar streams. They move between the host and a
//! backend in bounded chunks, hashed on the way, and are never held in
//! memory as a whole.

pub mod pipe;
pub mod pipeline;
pub mod progress;
pub mod progress_stream;

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

pub use pipe::{pipe, PipeReader, PipeWriter};
pub use pipeline::{copy, run, spawn_producer, ProducerHandle, Transferred};

/// Boxed byte source handed between collaborators.
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed byte sink handed between collaborators.
pub type ByteSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Callback for progress updates: `(bytes_so_far, expected_size, label)`
pub type ProgressCallback = Arc<dyn Fn(u64, Option<u64>, &str) + Send + Sync>;

/// Default delay between two progress callbacks.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// Default read size.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Default number of chunks buffered in a pipe.
pub const DEFAULT_PIPE_CAPACITY: usize = 8;

/// Progress reporting for one labelled transfer.
#[derive(Clone)]
pub struct Progress {
    callback: ProgressCallback,
    label: String,
    expected: Option<u64>,
    interval: Duration,
}

impl Progress {
    pub fn new(callback: ProgressCallback, label: impl Into<String>) -> Self {
        Self {
            callback,
            label: label.into(),
            expected: None,
            interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }

    pub fn with_expected(mut self, expected: Option<u64>) -> Self {
        self.expected = expected;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn report(&self, bytes: u64) {
        (self.callback)(bytes, self.expected, &self.label);
    }
}

/// Tunables shared by every transfer of one invocation.
#[derive(Clone)]
pub struct TransferSettings {
    pub chunk_size: usize,
    pub pipe_capacity: usize,
    pub progress_interval: Duration,
    /// Progress sink; `None` disables progress reporting
    pub progress: Option<ProgressCallback>,
}

impl TransferSettings {
    /// Progress reporting for one transfer, if enabled.
    pub fn progress_for(&self, label: &str, expected: Option<u64>) -> Option<Progress> {
        self.progress.as_ref().map(|callback| {
            Progress::new(callback.clone(), label)
                .with_expected(expected)
                .with_interval(self.progress_interval)
        })
    }
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            progress: None,
        }
    }
}

impl From<&crate::config::Config> for TransferSettings {
    fn from(config: &crate::config::Config) -> Self {
        Self {
            chunk_size: config.transfer.chunk_size.max(1),
            pipe_capacity: config.transfer.pipe_capacity.max(1),
            progress_interval: config.progress_interval(),
            progress: None,
        }
    }
}
