//! In-memory repository used by unit tests.

use super::{RepoEntry, Repository};
use crate::model::tags::TagSet;
use crate::transfer::{ByteSink, ByteStream};
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use std::sync::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Default)]
pub struct FakeRepoState {
    pub entries: Vec<(RepoEntry, Vec<u8>)>,
    /// Every `forget` call as `(ids, prune)`
    pub forgets: Vec<(Vec<String>, bool)>,
    pub ensured: bool,
    /// Backups of files whose name contains this fail after reading the stream
    pub fail_backup_of: Option<String>,
    next_id: u64,
}

#[derive(Default)]
pub struct FakeRepository {
    pub state: Mutex<FakeRepoState>,
}

impl FakeRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> std::sync::MutexGuard<'_, FakeRepoState> {
        self.state.lock().unwrap()
    }

    /// Insert an entry directly, bypassing the tag encoder.
    pub fn insert(&self, tags: &[&str], path: &str, payload: &[u8]) -> String {
        let mut state = self.lock();
        state.next_id += 1;
        let id = format!("{:016x}", state.next_id);
        let time = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(state.next_id as i64);
        let entry = RepoEntry {
            id: id.clone(),
            short_id: id[8..].to_string(),
            time: Some(time),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            paths: vec![path.to_string()],
        };
        state.entries.push((entry, payload.to_vec()));
        id
    }

    pub fn ids(&self) -> Vec<String> {
        self.lock().entries.iter().map(|(e, _)| e.id.clone()).collect()
    }

    /// Replace the payload of every entry matching `tags`.
    pub fn corrupt(&self, tags: &[&str], payload: &[u8]) {
        let filters: Vec<String> = tags.iter().map(|t| t.to_string()).collect();
        for (entry, data) in self.lock().entries.iter_mut() {
            if entry.tag_set().matches(&filters) {
                *data = payload.to_vec();
            }
        }
    }
}

#[async_trait]
impl Repository for FakeRepository {
    async fn ensure(&self) -> Result<()> {
        self.lock().ensured = true;
        Ok(())
    }

    async fn backup_stream(&self, file_name: &str, tags: &[String], mut data: ByteStream) -> Result<()> {
        let mut payload = Vec::new();
        data.read_to_end(&mut payload)
            .await
            .map_err(|e| BackupError::Transport(format!("reading backup stream: {}", e)))?;
        if let Some(pattern) = self.lock().fail_backup_of.clone() {
            if file_name.contains(&pattern) {
                return Err(BackupError::Repository {
                    command: "restic backup".into(),
                    stderr: "injected failure".into(),
                });
            }
        }
        let tags: Vec<&str> = tags.iter().map(String::as_str).collect();
        self.insert(&tags, &format!("/{}", file_name), &payload);
        Ok(())
    }

    async fn dump(&self, id: &str, path: &str, mut sink: ByteSink) -> Result<()> {
        let payload = self
            .lock()
            .entries
            .iter()
            .find(|(e, _)| e.id == id && e.paths.iter().any(|p| p == path))
            .map(|(_, data)| data.clone())
            .ok_or_else(|| BackupError::Repository {
                command: format!("restic dump {} {}", id, path),
                stderr: "path not found in snapshot".into(),
            })?;
        sink.write_all(&payload).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::BrokenPipe {
                BackupError::PipeClosed
            } else {
                BackupError::Transport(e.to_string())
            }
        })?;
        sink.shutdown().await?;
        Ok(())
    }

    async fn list_entries(&self, filters: &[String]) -> Result<Vec<RepoEntry>> {
        Ok(self
            .lock()
            .entries
            .iter()
            .filter(|(e, _)| TagSet::parse(&e.tags).matches(filters))
            .map(|(e, _)| e.clone())
            .collect())
    }

    async fn forget(&self, ids: &[String], prune: bool) -> Result<()> {
        let mut state = self.lock();
        state.forgets.push((ids.to_vec(), prune));
        state.entries.retain(|(e, _)| !ids.contains(&e.id));
        Ok(())
    }
}
