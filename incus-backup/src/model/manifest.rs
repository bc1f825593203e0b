//! Manifest and checksum formats persisted with every snapshot.
//!
//! Both are produced here, never by a backend, so the bytes on disk and in
//! the repository are identical for the same snapshot.

use super::{ExportOptions, Kind, Part, ResourceKey};
use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// `manifest.json`: what a snapshot captured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub project: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pool: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(with = "rfc3339")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub includes: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

mod rfc3339 {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(at: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&at.to_rfc3339_opts(SecondsFormat::Secs, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|at| at.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

impl Manifest {
    /// Manifest of an instance or volume export.
    pub fn for_resource(key: &ResourceKey, created_at: DateTime<Utc>, options: ExportOptions) -> Self {
        let mut opts = BTreeMap::new();
        opts.insert("snapshot".to_string(), options.snapshot.to_string());
        opts.insert("optimized".to_string(), options.optimized.to_string());
        Self {
            kind: key.kind.as_str().to_string(),
            project: key.project.clone(),
            pool: key.pool.clone(),
            name: key.name.clone(),
            created_at,
            includes: Vec::new(),
            options: opts,
        }
    }

    /// Manifest of a config snapshot holding `parts`.
    pub fn for_config(created_at: DateTime<Utc>, parts: &[Part]) -> Self {
        Self {
            kind: Kind::Config.as_str().to_string(),
            project: String::new(),
            pool: String::new(),
            name: String::new(),
            created_at,
            includes: parts.iter().map(|p| p.as_str().to_string()).collect(),
            options: BTreeMap::new(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec_pretty(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Reject a manifest that does not describe `expected`.
    pub fn expect_kind(&self, expected: Kind, location: &str) -> Result<()> {
        if self.kind != expected.as_str() {
            return Err(BackupError::KindMismatch {
                location: location.to_string(),
                expected: expected.as_str().to_string(),
                found: self.kind.clone(),
            });
        }
        Ok(())
    }

    /// Config parts declared by `includes`, ignoring unknown names.
    pub fn included_parts(&self) -> Vec<Part> {
        self.includes
            .iter()
            .filter_map(|name| Part::parse(name))
            .filter(|part| Part::CONFIG_ITEMS.contains(part))
            .collect()
    }

    pub fn export_options(&self) -> ExportOptions {
        ExportOptions {
            snapshot: self.options.get("snapshot").map(String::as_str) == Some("true"),
            optimized: self.options.get("optimized").map(String::as_str) == Some("true"),
        }
    }
}

/// One `<hex-hash>  <file-name>` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumLine {
    pub hash: String,
    pub file_name: String,
}

/// Result of parsing one non-blank line of `checksums.txt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedLine {
    Entry(ChecksumLine),
    Malformed { line_number: usize, text: String },
}

/// `checksums.txt`: ordered hashes of every file in a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecksumSet {
    lines: Vec<ChecksumLine>,
}

impl ChecksumSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, hash: impl Into<String>, file_name: impl Into<String>) {
        self.lines.push(ChecksumLine {
            hash: hash.into(),
            file_name: file_name.into(),
        });
    }

    pub fn lines(&self) -> &[ChecksumLine] {
        &self.lines
    }

    pub fn render(&self) -> String {
        self.lines
            .iter()
            .map(|line| format!("{}  {}\n", line.hash, line.file_name))
            .collect()
    }

    /// Parse leniently: blank lines are skipped and a malformed line is
    /// returned in place rather than failing the whole file.
    pub fn parse(text: &str) -> Vec<ParsedLine> {
        text.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, raw)| {
                let line = raw.trim_end_matches('\r');
                match line.split_once("  ") {
                    Some((hash, name))
                        if is_hex_digest(hash.trim()) && !name.trim().is_empty() =>
                    {
                        ParsedLine::Entry(ChecksumLine {
                            hash: hash.trim().to_string(),
                            file_name: name.trim().to_string(),
                        })
                    }
                    _ => ParsedLine::Malformed {
                        line_number: idx + 1,
                        text: line.to_string(),
                    },
                }
            })
            .collect()
    }
}

fn is_hex_digest(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|c| c.is_ascii_hexdigit())
}
