//! Integrity verification against the recorded checksum lists.
//!
//! Verification is read-only. Every snapshot yields a report, and a
//! failure on one file or snapshot is recorded in the report rather than
//! aborting the run.

use crate::backend::StorageBackend;
use crate::model::manifest::ParsedLine;
use crate::model::{ChecksumSet, Kind, LogicalSnapshot, Part};
use crate::utils::errors::Result;
use serde::Serialize;
use std::fmt;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Ok,
    Mismatch,
    Missing,
    Error,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Ok => "ok",
            FileStatus::Mismatch => "mismatch",
            FileStatus::Missing => "missing",
            FileStatus::Error => "error",
        }
    }
}

/// Worst file status wins: `error > mismatch > ok`. A missing file makes
/// the snapshot `error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStatus {
    Ok,
    Mismatch,
    Error,
}

impl SnapshotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotStatus::Ok => "ok",
            SnapshotStatus::Mismatch => "mismatch",
            SnapshotStatus::Error => "error",
        }
    }

    fn of(status: FileStatus) -> Self {
        match status {
            FileStatus::Ok => SnapshotStatus::Ok,
            FileStatus::Mismatch => SnapshotStatus::Mismatch,
            FileStatus::Missing | FileStatus::Error => SnapshotStatus::Error,
        }
    }
}

impl fmt::Display for SnapshotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileReport {
    pub name: String,
    pub status: FileStatus,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub expected: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub actual: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl FileReport {
    fn new(name: impl Into<String>, status: FileStatus) -> Self {
        Self {
            name: name.into(),
            status,
            expected: String::new(),
            actual: String::new(),
            error: String::new(),
        }
    }

    fn expected(mut self, hash: &str) -> Self {
        self.expected = hash.to_string();
        self
    }

    fn error(mut self, error: impl Into<String>) -> Self {
        self.error = error.into();
        self
    }

    /// One-line description for table output.
    pub fn detail(&self) -> String {
        match self.status {
            FileStatus::Ok => "ok".to_string(),
            FileStatus::Mismatch => format!("mismatch (expected={} actual={})", self.expected, self.actual),
            FileStatus::Missing if !self.error.is_empty() => format!("missing ({})", self.error),
            FileStatus::Missing if !self.expected.is_empty() => format!("missing (expected={})", self.expected),
            FileStatus::Missing => "missing".to_string(),
            FileStatus::Error => format!("error ({})", self.error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotReport {
    #[serde(rename = "type")]
    pub kind: Kind,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub project: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub pool: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub fingerprint: String,
    pub timestamp: String,
    pub status: SnapshotStatus,
    pub path: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileReport>,
}

impl SnapshotReport {
    fn new(snapshot: &LogicalSnapshot, files: Vec<FileReport>) -> Self {
        let status = files
            .iter()
            .map(|f| SnapshotStatus::of(f.status))
            .max()
            .unwrap_or(SnapshotStatus::Ok);
        Self {
            kind: snapshot.kind(),
            project: snapshot.key.project.clone(),
            pool: snapshot.key.pool.clone(),
            name: snapshot.key.name.clone(),
            fingerprint: snapshot.key.fingerprint.clone(),
            timestamp: snapshot.timestamp.as_str().to_string(),
            status,
            path: snapshot.location.clone(),
            files,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == SnapshotStatus::Ok
    }
}

/// Recompute every recorded hash of one snapshot.
pub async fn verify_snapshot(
    backend: &dyn StorageBackend,
    snapshot: &LogicalSnapshot,
    chunk_size: usize,
) -> SnapshotReport {
    let checksums_name = Part::Checksums.file_name(snapshot.kind()).unwrap_or("checksums.txt");
    let text = match backend.open_file(snapshot, checksums_name, None).await {
        Ok(Some(stream)) => match stream.read_to_end().await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                let file = FileReport::new(checksums_name, FileStatus::Error).error(e.to_string());
                return SnapshotReport::new(snapshot, vec![file]);
            }
        },
        Ok(None) => {
            let file = FileReport::new(checksums_name, FileStatus::Missing).error("no checksum list recorded");
            return SnapshotReport::new(snapshot, vec![file]);
        }
        Err(e) => {
            let file = FileReport::new(checksums_name, FileStatus::Error).error(e.to_string());
            return SnapshotReport::new(snapshot, vec![file]);
        }
    };

    let mut files = Vec::new();
    let mut listed = Vec::new();
    for line in ChecksumSet::parse(&text) {
        let entry = match line {
            ParsedLine::Entry(entry) => entry,
            ParsedLine::Malformed { line_number, text } => {
                files.push(
                    FileReport::new(text, FileStatus::Error)
                        .error(format!("invalid checksum entry on line {}", line_number)),
                );
                continue;
            }
        };
        listed.push(entry.file_name.clone());
        files.push(verify_file(backend, snapshot, &entry.file_name, &entry.hash, chunk_size).await);
    }

    // required parts the list does not mention and storage does not have
    for part in snapshot.missing_parts() {
        if part == Part::Checksums {
            continue;
        }
        if let Some(name) = part.file_name(snapshot.kind()) {
            if !listed.iter().any(|l| l == name) {
                files.push(FileReport::new(name, FileStatus::Missing).error("required part not stored"));
            }
        }
    }

    let report = SnapshotReport::new(snapshot, files);
    debug!(snapshot = %snapshot.describe(), status = %report.status, "verified");
    report
}

async fn verify_file(
    backend: &dyn StorageBackend,
    snapshot: &LogicalSnapshot,
    name: &str,
    expected: &str,
    chunk_size: usize,
) -> FileReport {
    let stream = match backend.open_file(snapshot, name, None).await {
        Ok(Some(stream)) => stream,
        Ok(None) => return FileReport::new(name, FileStatus::Missing).expected(expected),
        Err(e) => return FileReport::new(name, FileStatus::Error).expected(expected).error(e.to_string()),
    };
    match stream.digest(chunk_size).await {
        Ok(actual) => {
            let status = if actual.digest.eq_ignore_ascii_case(expected) {
                FileStatus::Ok
            } else {
                warn!(snapshot = %snapshot.describe(), file = %name, "checksum mismatch");
                FileStatus::Mismatch
            };
            FileReport {
                name: name.to_string(),
                status,
                expected: expected.to_string(),
                actual: actual.digest,
                error: String::new(),
            }
        }
        Err(e) => FileReport::new(name, FileStatus::Error).expected(expected).error(e.to_string()),
    }
}

/// Verify every stored snapshot of `kinds`, one at a time in listing order.
pub async fn verify(backend: &dyn StorageBackend, kinds: &[Kind], chunk_size: usize) -> Result<Vec<SnapshotReport>> {
    let supported: Vec<Kind> = kinds.iter().copied().filter(|k| backend.supports(*k)).collect();
    let snapshots = backend.snapshots(&supported).await?;
    let mut reports = Vec::with_capacity(snapshots.len());
    for snapshot in &snapshots {
        reports.push(verify_snapshot(backend, snapshot, chunk_size).await);
    }
    Ok(reports)
}
