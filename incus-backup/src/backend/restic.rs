//! Repository backend: every part is a separate tagged entry.
//!
//! Entries are decoded into a [`SnapshotTable`] before anything else looks
//! at them, so grouping and deduplication happen in exactly one place.

use super::{PartStream, StorageBackend};
use crate::model::snapshot::PartRef;
use crate::model::tags;
use crate::model::{Entry, ExportOptions, Kind, LogicalSnapshot, Part, PartAddress, ResourceKey, SnapshotTable};
use crate::repository::{RepoEntry, Repository};
use crate::transfer::{self, copy, pipe, spawn_producer, ByteStream, Progress, TransferSettings, Transferred};
use crate::utils::errors::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct ResticBackend {
    repo: Arc<dyn Repository>,
    location: String,
    chunk_size: usize,
    pipe_capacity: usize,
    cancel: CancellationToken,
}

impl ResticBackend {
    pub fn new(
        repo: Arc<dyn Repository>,
        location: impl Into<String>,
        settings: &TransferSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            repo,
            location: location.into(),
            chunk_size: settings.chunk_size.max(1),
            pipe_capacity: settings.pipe_capacity.max(1),
            cancel,
        }
    }

    /// Decode entries into the grouping table, skipping any whose tags do
    /// not identify a resource. Entries that identify a resource but carry
    /// an unknown part or schema join its snapshot as members only.
    fn decode_into(table: &mut SnapshotTable, entries: Vec<RepoEntry>, only: Option<&ResourceKey>) {
        for entry in entries {
            let tag_set = entry.tag_set();
            let Some(address) = tags::decode(&tag_set, entry.time) else {
                match tags::decode_identity(&tag_set, entry.time) {
                    Some((key, timestamp)) if only.map_or(true, |only| *only == key) => {
                        warn!(id = %entry.short_id, resource = %key, %timestamp, "entry has an unknown part or schema");
                        table.insert_member(key, timestamp, entry.id);
                    }
                    Some(_) => {}
                    None => debug!(id = %entry.short_id, "skipping entry without identity tags"),
                }
                continue;
            };
            if only.is_some_and(|key| *key != address.key) {
                continue;
            }
            let Ok(relative) = address.relative_path() else {
                continue;
            };
            let part_ref = PartRef::entry(entry.id.clone(), entry.stored_path(&relative));
            table.insert_part(address, part_ref);
        }
    }
}

#[async_trait]
impl StorageBackend for ResticBackend {
    fn describe(&self) -> String {
        format!("restic:{}", self.location)
    }

    fn supports(&self, kind: Kind) -> bool {
        kind != Kind::Image
    }

    async fn prepare(&self) -> Result<()> {
        self.repo.ensure().await
    }

    async fn list(&self, kinds: &[Kind]) -> Result<Vec<Entry>> {
        let mut entries = Vec::new();
        for kind in kinds.iter().copied().filter(|k| self.supports(*k)) {
            let found = self.repo.list_entries(&tags::kind_query(kind, Some(Part::Manifest))).await?;
            for entry in found {
                if let Some(address) = tags::decode(&entry.tag_set(), entry.time) {
                    entries.push(Entry {
                        key: address.key,
                        timestamp: address.timestamp,
                        path: entry.id,
                    });
                }
            }
        }
        entries.sort();
        entries.dedup_by(|a, b| a.key == b.key && a.timestamp == b.timestamp);
        Ok(entries)
    }

    async fn snapshots(&self, kinds: &[Kind]) -> Result<Vec<LogicalSnapshot>> {
        let mut table = SnapshotTable::new();
        for kind in kinds.iter().copied().filter(|k| self.supports(*k)) {
            let found = self.repo.list_entries(&tags::kind_query(kind, None)).await?;
            Self::decode_into(&mut table, found, None);
        }
        Ok(table.into_snapshots())
    }

    async fn snapshots_of(&self, key: &ResourceKey) -> Result<Vec<LogicalSnapshot>> {
        if !self.supports(key.kind) {
            return Ok(Vec::new());
        }
        let mut table = SnapshotTable::new();
        let found = self.repo.list_entries(&tags::query(key, None, None)).await?;
        Self::decode_into(&mut table, found, Some(key));
        Ok(table.into_snapshots())
    }

    async fn write_part(
        &self,
        address: &PartAddress,
        options: ExportOptions,
        mut source: ByteStream,
        progress: Option<Progress>,
    ) -> Result<Transferred> {
        let file_name = address.relative_path()?;
        let tags = tags::encode(address, options);
        let label = progress
            .as_ref()
            .map(|p| p.label().to_string())
            .unwrap_or_else(|| file_name.clone());
        let chunk_size = self.chunk_size;
        let repo = self.repo.clone();
        debug!(file = %file_name, "streaming part into repository");

        let (transferred, ()) = transfer::run(
            self.pipe_capacity,
            &self.cancel,
            move |mut writer| async move { copy(&mut source, &mut writer, &label, chunk_size, progress.as_ref()).await },
            move |reader| async move { repo.backup_stream(&file_name, &tags, Box::new(reader)).await },
        )
        .await?;
        Ok(transferred)
    }

    async fn open_file(
        &self,
        snapshot: &LogicalSnapshot,
        file_name: &str,
        progress: Option<Progress>,
    ) -> Result<Option<PartStream>> {
        let Some(part) = Part::from_file_name(snapshot.kind(), file_name) else {
            return Ok(None);
        };
        let Some(part_ref) = snapshot.part(part) else {
            return Ok(None);
        };
        let id = part_ref.locator.clone();
        let path = match &part_ref.inner_path {
            Some(path) => path.clone(),
            None => format!("/{}", PartAddress::new(&snapshot.key, &snapshot.timestamp, part).relative_path()?),
        };

        let repo = self.repo.clone();
        let (writer, reader) = pipe(self.pipe_capacity, progress);
        let producer = spawn_producer(writer, move |writer| async move {
            repo.dump(&id, &path, Box::new(writer)).await
        });
        Ok(Some(PartStream::with_producer(Box::new(reader), producer)))
    }

    async fn delete(&self, snapshots: &[LogicalSnapshot], reclaim: bool) -> Result<()> {
        let mut ids: Vec<String> = Vec::new();
        for snapshot in snapshots {
            for member in &snapshot.members {
                if !ids.contains(member) {
                    ids.push(member.clone());
                }
            }
        }
        if ids.is_empty() {
            return Ok(());
        }
        info!(snapshots = snapshots.len(), entries = ids.len(), "forgetting repository entries");
        self.repo.forget(&ids, reclaim).await
    }
}
