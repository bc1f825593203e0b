//! Directory backend: one directory per logical snapshot.
//!
//! ```text
//! <root>/instances/<project>/<name>/<timestamp>/export.tar.xz
//! <root>/volumes/<project>/<pool>/<name>/<timestamp>/volume.tar.xz
//! <root>/images/<fingerprint>/<timestamp>/
//! <root>/config/<timestamp>/projects.json ...
//! ```
//!
//! Parts are written to a hidden `.partial` file and renamed into place, so
//! a listing never sees a half-written part.

use super::{entries_of, PartStream, StorageBackend};
use crate::fs::{list_files, walk_snapshot_dirs, SnapshotDir};
use crate::model::{Entry, ExportOptions, Kind, LogicalSnapshot, Part, PartAddress, ResourceKey, SnapshotTable, Timestamp};
use crate::model::snapshot::PartRef;
use crate::transfer::progress_stream::ProgressStream;
use crate::transfer::{copy, ByteStream, Progress, Transferred, DEFAULT_CHUNK_SIZE};
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, info, warn};

pub struct DirectoryBackend {
    root: PathBuf,
    chunk_size: usize,
}

impl DirectoryBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_dir(&self, key: &ResourceKey) -> PathBuf {
        let mut dir = self.root.join(key.kind.dir_name());
        for segment in key.identity_segments() {
            dir.push(segment);
        }
        dir
    }

    pub fn snapshot_dir(&self, key: &ResourceKey, timestamp: &Timestamp) -> PathBuf {
        self.key_dir(key).join(timestamp.as_str())
    }

    async fn blocking<T, F>(f: F) -> Result<T>
    where
        F: FnOnce() -> std::io::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| BackupError::Transport(format!("filesystem task failed: {}", e)))?
            .map_err(BackupError::from)
    }
}

/// Build a snapshot from a timestamp directory whose segments are the
/// identity directories followed by the timestamp.
fn read_snapshot(kind: Kind, dir: &SnapshotDir) -> std::io::Result<Option<LogicalSnapshot>> {
    let Some((timestamp, identity)) = dir.segments.split_last() else {
        return Ok(None);
    };
    let Some(key) = ResourceKey::from_identity_segments(kind, identity) else {
        return Ok(None);
    };

    let location = dir.path.to_string_lossy().into_owned();
    let mut snapshot = LogicalSnapshot::new(key, Timestamp::from_stored(timestamp.clone()), location.clone());
    for file_name in list_files(&dir.path)? {
        if let Some(part) = Part::from_file_name(kind, &file_name) {
            let path = dir.path.join(&file_name);
            snapshot.parts.insert(part, PartRef::file(path.to_string_lossy()));
        }
    }
    snapshot.members.push(location);
    Ok(Some(snapshot))
}

/// Remove `dir`, then each now-empty parent up to (not including) `stop`.
fn remove_snapshot_dir(dir: &Path, stop: &Path) -> std::io::Result<()> {
    std::fs::remove_dir_all(dir)?;
    let mut parent = dir.parent();
    while let Some(p) = parent {
        if p == stop || !p.starts_with(stop) {
            break;
        }
        if std::fs::remove_dir(p).is_err() {
            break;
        }
        parent = p.parent();
    }
    Ok(())
}

#[async_trait]
impl StorageBackend for DirectoryBackend {
    fn describe(&self) -> String {
        format!("dir:{}", self.root.display())
    }

    fn supports(&self, _kind: Kind) -> bool {
        true
    }

    async fn prepare(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    async fn list(&self, kinds: &[Kind]) -> Result<Vec<Entry>> {
        let snapshots = self.snapshots(kinds).await?;
        Ok(entries_of(&snapshots))
    }

    async fn snapshots(&self, kinds: &[Kind]) -> Result<Vec<LogicalSnapshot>> {
        let root = self.root.clone();
        let kinds = kinds.to_vec();
        Self::blocking(move || {
            let mut table = SnapshotTable::new();
            for kind in kinds {
                let kind_root = root.join(kind.dir_name());
                for dir in walk_snapshot_dirs(&kind_root, kind.key_depth() + 1)? {
                    if let Some(snapshot) = read_snapshot(kind, &dir)? {
                        table.insert_snapshot(snapshot);
                    }
                }
            }
            Ok(table.into_snapshots())
        })
        .await
    }

    async fn snapshots_of(&self, key: &ResourceKey) -> Result<Vec<LogicalSnapshot>> {
        let key_dir = self.key_dir(key);
        let key = key.clone();
        Self::blocking(move || {
            let mut table = SnapshotTable::new();
            let identity: Vec<String> = key.identity_segments().iter().map(|s| s.to_string()).collect();
            for mut dir in walk_snapshot_dirs(&key_dir, 1)? {
                let mut segments = identity.clone();
                segments.append(&mut dir.segments);
                dir.segments = segments;
                if let Some(snapshot) = read_snapshot(key.kind, &dir)? {
                    table.insert_snapshot(snapshot);
                }
            }
            Ok(table.into_snapshots())
        })
        .await
    }

    async fn write_part(
        &self,
        address: &PartAddress,
        _options: ExportOptions,
        mut source: ByteStream,
        progress: Option<Progress>,
    ) -> Result<Transferred> {
        let dir = self.snapshot_dir(&address.key, &address.timestamp);
        let file_name = address.file_name()?;
        tokio::fs::create_dir_all(&dir).await?;

        let final_path = dir.join(file_name);
        let partial = dir.join(format!(".{}.partial", file_name));
        let mut file = tokio::fs::File::create(&partial).await?;

        let label = progress
            .as_ref()
            .map(|p| p.label().to_string())
            .unwrap_or_else(|| file_name.to_string());
        let copied = copy(&mut source, &mut file, &label, self.chunk_size, progress.as_ref()).await;
        let transferred = match copied {
            Ok(transferred) => transferred,
            Err(e) => {
                drop(file);
                if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
                    warn!(path = %partial.display(), error = %cleanup, "failed to remove partial file");
                }
                return Err(e);
            }
        };

        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&partial, &final_path).await?;
        debug!(path = %final_path.display(), bytes = transferred.bytes, "part written");
        Ok(transferred)
    }

    async fn open_file(
        &self,
        snapshot: &LogicalSnapshot,
        file_name: &str,
        progress: Option<Progress>,
    ) -> Result<Option<PartStream>> {
        if file_name.is_empty() || file_name.contains('/') || file_name.starts_with('.') {
            return Ok(None);
        }
        let path = Path::new(&snapshot.location).join(file_name);
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let reader: ByteStream = match progress {
            Some(progress) => {
                let size = file.metadata().await?.len();
                let chunks = ReaderStream::with_capacity(file, self.chunk_size);
                Box::new(StreamReader::new(ProgressStream::new(chunks, progress.with_expected(Some(size)))))
            }
            None => Box::new(file),
        };
        Ok(Some(PartStream::from_reader(reader)))
    }

    async fn delete(&self, snapshots: &[LogicalSnapshot], _reclaim: bool) -> Result<()> {
        for snapshot in snapshots {
            let dir = PathBuf::from(&snapshot.location);
            let stop = self.root.join(snapshot.kind().dir_name());
            if !dir.starts_with(&stop) || dir == stop {
                return Err(BackupError::Config(format!(
                    "refusing to delete {} outside {}",
                    dir.display(),
                    stop.display()
                )));
            }
            info!(path = %dir.display(), "deleting snapshot directory");
            Self::blocking(move || remove_snapshot_dir(&dir, &stop)).await?;
        }
        Ok(())
    }
}
