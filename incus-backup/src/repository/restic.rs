//! `restic` subprocess driver.

use super::{RepoEntry, Repository};
use crate::process::{self, describe, Finished};
use crate::transfer::{ByteSink, ByteStream};
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Repository location handed to restic through the environment.
const REPOSITORY_ENV: &str = "RESTIC_REPOSITORY";

pub struct ResticCli {
    binary: PathBuf,
    repository: String,
    cancel: CancellationToken,
}

fn is_not_repository(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    stderr.contains("is not a repository") || stderr.contains("does not look like a restic repository")
}

/// `--tag a,b,c`: restic ANDs the tags of one `--tag` flag.
fn tag_args(tags: &[String]) -> Vec<String> {
    if tags.is_empty() {
        Vec::new()
    } else {
        vec!["--tag".to_string(), tags.join(",")]
    }
}

impl ResticCli {
    pub fn new(binary: impl Into<PathBuf>, repository: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            binary: binary.into(),
            repository: repository.into(),
            cancel,
        }
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    fn command<S: AsRef<str>>(&self, args: &[S]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.env(REPOSITORY_ENV, &self.repository);
        cmd.args(args.iter().map(|a| a.as_ref()));
        cmd
    }

    fn check(label: String, finished: Finished) -> Result<Finished> {
        if finished.success() {
            Ok(finished)
        } else {
            Err(BackupError::Repository {
                command: label,
                stderr: finished.failure_text(),
            })
        }
    }

    async fn run<S: AsRef<str>>(&self, args: &[S]) -> Result<Finished> {
        let cmd = self.command(args);
        let label = describe(&cmd);
        let finished = process::output(cmd, &self.cancel).await?;
        Self::check(label, finished)
    }
}

#[async_trait]
impl Repository for ResticCli {
    async fn ensure(&self) -> Result<()> {
        let probe = self.command(&["snapshots", "--json", "--limit", "1"]);
        let finished = process::output(probe, &self.cancel).await?;
        if finished.success() {
            return Ok(());
        }
        if is_not_repository(&finished.stderr) {
            info!(repository = %self.repository, "initialising restic repository");
            self.run(&["init"]).await?;
            return Ok(());
        }
        Err(BackupError::Repository {
            command: "restic snapshots".into(),
            stderr: finished.failure_text(),
        })
    }

    async fn backup_stream(&self, file_name: &str, tags: &[String], mut data: ByteStream) -> Result<()> {
        let mut args = vec![
            "backup".to_string(),
            "--stdin".to_string(),
            "--stdin-filename".to_string(),
            file_name.to_string(),
        ];
        for tag in tags {
            args.push("--tag".to_string());
            args.push(tag.clone());
        }
        let cmd = self.command(&args);
        let label = describe(&cmd);
        debug!(file = %file_name, "restic backup");
        let finished = process::feed(cmd, &mut data, &self.cancel).await?;
        Self::check(label, finished).map(|_| ())
    }

    async fn dump(&self, id: &str, path: &str, mut sink: ByteSink) -> Result<()> {
        let cmd = self.command(&["dump", id, path]);
        let label = describe(&cmd);
        debug!(id = %id, path = %path, "restic dump");
        let finished = process::drain(cmd, &mut sink, &self.cancel).await?;
        Self::check(label, finished).map(|_| ())
    }

    async fn list_entries(&self, filters: &[String]) -> Result<Vec<RepoEntry>> {
        let mut args = vec!["snapshots".to_string(), "--json".to_string()];
        args.extend(tag_args(filters));
        let finished = self.run(&args).await?;
        let mut entries: Vec<RepoEntry> = if finished.stdout.iter().all(u8::is_ascii_whitespace) {
            Vec::new()
        } else {
            serde_json::from_slice::<Option<Vec<RepoEntry>>>(&finished.stdout)?.unwrap_or_default()
        };
        // Older restic releases OR the tags of one flag; filter again.
        entries.retain(|entry| entry.tag_set().matches(filters));
        entries.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.id.cmp(&b.id)));
        Ok(entries)
    }

    async fn forget(&self, ids: &[String], prune: bool) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut args = vec!["forget".to_string()];
        if prune {
            args.push("--prune".to_string());
        }
        args.extend(ids.iter().cloned());
        info!(entries = ids.len(), prune, "restic forget");
        self.run(&args).await.map(|_| ())
    }
}
