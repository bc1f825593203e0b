//! Table and JSON output of the read-only commands.

use crate::model::{Entry, LogicalSnapshot};
use crate::utils::table::{self, cell};
use crate::verify::SnapshotReport;
use clap::ValueEnum;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

pub fn json<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<String> {
    serde_json::to_string_pretty(value)
}

pub fn entries(entries: &[Entry]) -> String {
    let rows: Vec<Vec<String>> = entries
        .iter()
        .map(|entry| {
            vec![
                entry.key.kind.to_string(),
                cell(&entry.key.project),
                cell(&entry.key.pool),
                cell(&entry.key.name),
                cell(&entry.key.fingerprint),
                entry.timestamp.to_string(),
            ]
        })
        .collect();
    table::render(&["TYPE", "PROJECT", "POOL", "NAME", "FINGERPRINT", "TIMESTAMP"], &rows)
}

pub fn prune_candidates(candidates: &[LogicalSnapshot]) -> String {
    let rows: Vec<Vec<String>> = candidates
        .iter()
        .map(|snapshot| {
            let key = &snapshot.key;
            vec![
                key.kind.to_string(),
                cell(&key.project),
                cell(&key.pool),
                cell(&key.name),
                cell(&key.fingerprint),
                snapshot.timestamp.to_string(),
                if snapshot.is_complete() { "yes" } else { "no" }.to_string(),
            ]
        })
        .collect();
    table::render(
        &["TYPE", "PROJECT", "POOL", "NAME", "FINGERPRINT", "TIMESTAMP", "COMPLETE"],
        &rows,
    )
}

/// One row per checked file. A snapshot without any file still gets a row.
pub fn verify_reports(reports: &[SnapshotReport]) -> String {
    let mut rows = Vec::new();
    for report in reports {
        let prefix = |status: &str| {
            vec![
                status.to_string(),
                report.kind.to_string(),
                cell(&report.project),
                cell(&report.pool),
                cell(&report.name),
                cell(&report.fingerprint),
                report.timestamp.clone(),
            ]
        };
        if report.files.is_empty() {
            let mut row = prefix(report.status.as_str());
            row.extend(["-".to_string(), "-".to_string()]);
            rows.push(row);
        }
        for file in &report.files {
            let mut row = prefix(file.status.as_str());
            row.extend([file.name.clone(), file.detail()]);
            rows.push(row);
        }
    }
    table::render(
        &["STATUS", "TYPE", "PROJECT", "POOL", "NAME", "FINGERPRINT", "TIMESTAMP", "FILE", "DETAIL"],
        &rows,
    )
}
