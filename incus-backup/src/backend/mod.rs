//! Storage backends.
//!
//! A [`StorageBackend`] maps logical snapshots onto physical storage. The
//! directory backend uses one directory per snapshot; the restic backend
//! stores every part as its own tagged repository entry. Which one is used
//! is decided once, when the target is parsed.

pub mod directory;
pub mod restic;

use crate::model::{Entry, ExportOptions, Kind, LogicalSnapshot, Part, PartAddress, ResourceKey, Timestamp};
use crate::transfer::{ByteStream, ProducerHandle, Progress, Transferred};
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::future::Future;
use tokio::io::AsyncReadExt;

pub use directory::DirectoryBackend;
pub use restic::ResticBackend;

/// A readable part. For repository parts a producer task feeds the reader
/// and must be joined once the reader has been consumed.
pub struct PartStream {
    reader: ByteStream,
    producer: Option<ProducerHandle<()>>,
}

impl PartStream {
    pub fn from_reader(reader: ByteStream) -> Self {
        Self { reader, producer: None }
    }

    pub fn with_producer(reader: ByteStream, producer: ProducerHandle<()>) -> Self {
        Self {
            reader,
            producer: Some(producer),
        }
    }

    /// Hand the reader to `consumer`, then join the producer. The first
    /// real error from either side is returned.
    pub async fn consume<F, Fut, T>(self, consumer: F) -> Result<T>
    where
        F: FnOnce(ByteStream) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let PartStream { reader, producer } = self;
        let consumed = consumer(reader).await;
        match producer {
            Some(producer) => producer.finish(consumed).await.map(|(_, value)| value),
            None => consumed,
        }
    }

    /// Read the whole part. Only used for small parts (manifests,
    /// checksum lists, config items).
    pub async fn read_to_end(self) -> Result<Vec<u8>> {
        self.consume(|mut reader| async move {
            let mut buf = Vec::new();
            reader
                .read_to_end(&mut buf)
                .await
                .map_err(|e| BackupError::Transport(format!("reading part: {}", e)))?;
            Ok(buf)
        })
        .await
    }

    /// Hash the part without keeping it.
    pub async fn digest(self, chunk_size: usize) -> Result<Transferred> {
        self.consume(|mut reader| async move {
            let mut buf = vec![0u8; chunk_size.max(1)];
            let mut hasher = Sha256::new();
            let mut bytes = 0u64;
            loop {
                let n = reader
                    .read(&mut buf)
                    .await
                    .map_err(|e| BackupError::Transport(format!("reading part: {}", e)))?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                bytes += n as u64;
            }
            Ok(Transferred {
                bytes,
                digest: hex::encode(hasher.finalize()),
            })
        })
        .await
    }
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// `scheme:value` form of the target, for messages.
    fn describe(&self) -> String;

    /// Whether this backend stores snapshots of `kind`.
    fn supports(&self, kind: Kind) -> bool;

    /// Make the target ready for writing.
    async fn prepare(&self) -> Result<()>;

    /// One entry per stored version, sorted by identity then timestamp.
    async fn list(&self, kinds: &[Kind]) -> Result<Vec<Entry>>;

    /// Every logical snapshot of `kinds`, complete or not, in listing order.
    async fn snapshots(&self, kinds: &[Kind]) -> Result<Vec<LogicalSnapshot>>;

    /// Every logical snapshot of one resource, oldest first.
    async fn snapshots_of(&self, key: &ResourceKey) -> Result<Vec<LogicalSnapshot>>;

    /// Store one part, hashing it on the way.
    async fn write_part(
        &self,
        address: &PartAddress,
        options: ExportOptions,
        source: ByteStream,
        progress: Option<Progress>,
    ) -> Result<Transferred>;

    /// Open a file of a snapshot by its file name, or `None` when the
    /// snapshot has no such file.
    async fn open_file(
        &self,
        snapshot: &LogicalSnapshot,
        file_name: &str,
        progress: Option<Progress>,
    ) -> Result<Option<PartStream>>;

    /// Remove snapshots with all their parts. `reclaim` also frees the
    /// space they used where the backend distinguishes the two.
    async fn delete(&self, snapshots: &[LogicalSnapshot], reclaim: bool) -> Result<()>;
}

/// Open a required part, failing with [`BackupError::MissingPart`] when it
/// is absent.
pub async fn open_part(
    backend: &dyn StorageBackend,
    snapshot: &LogicalSnapshot,
    part: Part,
    progress: Option<Progress>,
) -> Result<PartStream> {
    let missing = || BackupError::MissingPart {
        snapshot: snapshot.describe(),
        part: part.as_str().to_string(),
    };
    let file_name = part.file_name(snapshot.kind()).ok_or_else(missing)?;
    if snapshot.part(part).is_none() {
        return Err(missing());
    }
    backend
        .open_file(snapshot, file_name, progress)
        .await?
        .ok_or_else(missing)
}

/// Pick the snapshot to restore: the requested version, or the newest one.
/// Either way it must carry a manifest.
pub async fn find_snapshot(
    backend: &dyn StorageBackend,
    key: &ResourceKey,
    version: Option<&Timestamp>,
) -> Result<LogicalSnapshot> {
    let snapshots = backend.snapshots_of(key).await?;
    let snapshot = match version {
        Some(version) => snapshots
            .into_iter()
            .find(|s| &s.timestamp == version)
            .ok_or_else(|| BackupError::NotFound(format!("{} at {} in {}", key, version, backend.describe())))?,
        None => snapshots
            .into_iter()
            .max_by(|a, b| a.timestamp.cmp(&b.timestamp))
            .ok_or_else(|| BackupError::NotFound(format!("no backups of {} in {}", key, backend.describe())))?,
    };
    if snapshot.part(Part::Manifest).is_none() {
        return Err(BackupError::MissingPart {
            snapshot: snapshot.describe(),
            part: Part::Manifest.as_str().to_string(),
        });
    }
    Ok(snapshot)
}

/// Entries of `snapshots`, sorted and deduplicated by identity and
/// timestamp.
pub fn entries_of(snapshots: &[LogicalSnapshot]) -> Vec<Entry> {
    let mut entries: Vec<Entry> = snapshots.iter().map(LogicalSnapshot::entry).collect();
    entries.sort();
    entries.dedup_by(|a, b| a.key == b.key && a.timestamp == b.timestamp);
    entries
}
