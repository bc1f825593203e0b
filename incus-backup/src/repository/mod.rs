//! Deduplicating repository collaborator.
//!
//! [`Repository`] is the narrow surface the repository backend needs from
//! the external tool. [`restic::ResticCli`] implements it by running the
//! `restic` binary; tests use an in-memory fake.

pub mod detect;
pub mod restic;

#[cfg(test)]
pub mod fake;

use crate::model::tags::TagSet;
use crate::transfer::{ByteSink, ByteStream};
use crate::utils::errors::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

pub use detect::{ResticBinary, REQUIRED_VERSION};
pub use restic::ResticCli;

/// One entry as listed by the repository tool.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RepoEntry {
    pub id: String,
    #[serde(default)]
    pub short_id: String,
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub tags: Vec<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub paths: Vec<String>,
}

fn null_as_empty<'de, D>(d: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(d)?.unwrap_or_default())
}

impl RepoEntry {
    pub fn tag_set(&self) -> TagSet {
        TagSet::parse(&self.tags)
    }

    /// Path of the stored file inside the entry, for `dump`.
    pub fn stored_path(&self, file_name: &str) -> String {
        match self.paths.first() {
            Some(path) if !path.is_empty() => path.clone(),
            _ => format!("/{}", file_name.trim_start_matches('/')),
        }
    }
}

#[async_trait]
pub trait Repository: Send + Sync {
    /// Make sure the repository exists, initialising it when it does not.
    async fn ensure(&self) -> Result<()>;

    /// Store `data` as a new entry holding one file named `file_name`.
    async fn backup_stream(&self, file_name: &str, tags: &[String], data: ByteStream) -> Result<()>;

    /// Stream one file of an entry into `sink`.
    async fn dump(&self, id: &str, path: &str, sink: ByteSink) -> Result<()>;

    /// Entries carrying every tag in `filters`.
    async fn list_entries(&self, filters: &[String]) -> Result<Vec<RepoEntry>>;

    /// Remove entries, reclaiming their space when `prune` is set.
    async fn forget(&self, ids: &[String], prune: bool) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_from_restic_json() {
        let entries: Vec<RepoEntry> = serde_json::from_str(
            r#"[{"time":"2024-01-02T03:04:05.123456789+01:00","tree":"t","paths":["/instances/p/n/20240102T020405Z/export.tar.xz"],"hostname":"h","username":"root","tags":["type=instance","part=data"],"id":"abcdef0123","short_id":"abcdef01"}]"#,
        )
        .unwrap();
        let entry = &entries[0];
        assert_eq!(entry.id, "abcdef0123");
        assert_eq!(entry.time.unwrap().to_rfc3339(), "2024-01-02T02:04:05.123456789+00:00");
        assert_eq!(entry.tag_set().get("part"), Some("data"));
        assert_eq!(
            entry.stored_path("ignored"),
            "/instances/p/n/20240102T020405Z/export.tar.xz"
        );
    }

    #[test]
    fn test_stored_path_fallback() {
        let entry: RepoEntry = serde_json::from_str(r#"{"id":"x","tags":null,"paths":null}"#).unwrap();
        assert!(entry.tags.is_empty());
        assert_eq!(entry.stored_path("config/20240101T000000Z/manifest.json"), "/config/20240101T000000Z/manifest.json");
    }
}
