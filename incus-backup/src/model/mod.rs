//! Snapshot identity model.
//!
//! Every stored artifact is addressed by a [`ResourceKey`], a [`Timestamp`]
//! and a [`Part`]. Backends map these coordinates onto directory paths or
//! repository tags; nothing else in the crate builds paths or tags by hand.

pub mod manifest;
pub mod snapshot;
pub mod tags;

use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use manifest::{ChecksumLine, ChecksumSet, Manifest};
pub use snapshot::{LogicalSnapshot, SnapshotTable};

/// Format of every timestamp directory name and `timestamp=` tag.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Resource kinds, declared in name order so the derived `Ord` matches
/// the ordering of their string forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Config,
    Image,
    Instance,
    Volume,
}

impl Kind {
    pub const ALL: [Kind; 4] = [Kind::Instance, Kind::Volume, Kind::Image, Kind::Config];

    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Config => "config",
            Kind::Image => "image",
            Kind::Instance => "instance",
            Kind::Volume => "volume",
        }
    }

    /// Top-level directory of this kind in the directory layout.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Kind::Config => "config",
            Kind::Image => "images",
            Kind::Instance => "instances",
            Kind::Volume => "volumes",
        }
    }

    /// Number of identity directories between the kind directory and the
    /// timestamp directory.
    pub fn key_depth(&self) -> usize {
        match self {
            Kind::Config => 0,
            Kind::Image => 1,
            Kind::Instance => 2,
            Kind::Volume => 3,
        }
    }

    /// Parts a complete snapshot of this kind carries, in write order.
    pub fn parts(&self) -> &'static [Part] {
        match self {
            Kind::Instance | Kind::Volume => &[Part::Data, Part::Manifest, Part::Checksums],
            Kind::Image => &[Part::Manifest, Part::Checksums],
            Kind::Config => &[
                Part::Projects,
                Part::Profiles,
                Part::Networks,
                Part::StoragePools,
                Part::Manifest,
                Part::Checksums,
            ],
        }
    }

    /// Parse a CLI kind filter. Empty and `all` select every kind.
    pub fn parse_filter(value: &str) -> Result<Vec<Kind>> {
        match value.trim().to_lowercase().as_str() {
            "" | "all" => Ok(Kind::ALL.to_vec()),
            "instance" | "instances" => Ok(vec![Kind::Instance]),
            "volume" | "volumes" => Ok(vec![Kind::Volume]),
            "image" | "images" => Ok(vec![Kind::Image]),
            "config" => Ok(vec![Kind::Config]),
            other => Err(BackupError::Config(format!(
                "unknown kind '{}' (expected all, instances, volumes, images or config)",
                other
            ))),
        }
    }

    pub fn from_tag(value: &str) -> Option<Kind> {
        match value {
            "instance" => Some(Kind::Instance),
            "volume" => Some(Kind::Volume),
            "config" => Some(Kind::Config),
            "image" => Some(Kind::Image),
            _ => None,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named payload within a logical snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Part {
    Data,
    Manifest,
    Checksums,
    Projects,
    Profiles,
    Networks,
    StoragePools,
}

impl Part {
    /// Config parts holding one declarative resource type each.
    pub const CONFIG_ITEMS: [Part; 4] = [Part::Projects, Part::Profiles, Part::Networks, Part::StoragePools];

    pub fn as_str(&self) -> &'static str {
        match self {
            Part::Data => "data",
            Part::Manifest => "manifest",
            Part::Checksums => "checksums",
            Part::Projects => "projects",
            Part::Profiles => "profiles",
            Part::Networks => "networks",
            Part::StoragePools => "storage_pools",
        }
    }

    pub fn parse(value: &str) -> Option<Part> {
        match value {
            "data" => Some(Part::Data),
            "manifest" => Some(Part::Manifest),
            "checksums" => Some(Part::Checksums),
            "projects" => Some(Part::Projects),
            "profiles" => Some(Part::Profiles),
            "networks" => Some(Part::Networks),
            "storage_pools" => Some(Part::StoragePools),
            _ => None,
        }
    }

    /// File name of this part inside a snapshot of `kind`, or `None` when
    /// the kind has no such part.
    pub fn file_name(&self, kind: Kind) -> Option<&'static str> {
        if !kind.parts().contains(self) {
            return None;
        }
        Some(match self {
            Part::Data if kind == Kind::Volume => "volume.tar.xz",
            Part::Data => "export.tar.xz",
            Part::Manifest => "manifest.json",
            Part::Checksums => "checksums.txt",
            Part::Projects => "projects.json",
            Part::Profiles => "profiles.json",
            Part::Networks => "networks.json",
            Part::StoragePools => "storage_pools.json",
        })
    }

    /// Reverse of [`Part::file_name`].
    pub fn from_file_name(kind: Kind, file_name: &str) -> Option<Part> {
        kind.parts()
            .iter()
            .copied()
            .find(|part| part.file_name(kind) == Some(file_name))
    }
}

impl fmt::Display for Part {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one versioned resource, independent of backend.
///
/// Field order drives the derived `Ord`, which is the listing order.
/// Fields that do not apply to the kind are empty strings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ResourceKey {
    #[serde(rename = "type")]
    pub kind: Kind,
    pub project: String,
    pub pool: String,
    pub name: String,
    pub fingerprint: String,
}

impl ResourceKey {
    fn empty(kind: Kind) -> Self {
        Self {
            kind,
            project: String::new(),
            pool: String::new(),
            name: String::new(),
            fingerprint: String::new(),
        }
    }

    pub fn instance(project: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            name: name.into(),
            ..Self::empty(Kind::Instance)
        }
    }

    pub fn volume(project: impl Into<String>, pool: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            pool: pool.into(),
            name: name.into(),
            ..Self::empty(Kind::Volume)
        }
    }

    pub fn image(fingerprint: impl Into<String>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            ..Self::empty(Kind::Image)
        }
    }

    pub fn config() -> Self {
        Self::empty(Kind::Config)
    }

    /// Identity directories below the kind directory.
    pub fn identity_segments(&self) -> Vec<&str> {
        match self.kind {
            Kind::Config => vec![],
            Kind::Image => vec![self.fingerprint.as_str()],
            Kind::Instance => vec![self.project.as_str(), self.name.as_str()],
            Kind::Volume => vec![self.project.as_str(), self.pool.as_str(), self.name.as_str()],
        }
    }

    /// Rebuild a key from the identity directories found while walking.
    pub fn from_identity_segments(kind: Kind, segments: &[String]) -> Option<Self> {
        if segments.len() != kind.key_depth() || segments.iter().any(|s| s.is_empty()) {
            return None;
        }
        Some(match kind {
            Kind::Config => Self::config(),
            Kind::Image => Self::image(segments[0].clone()),
            Kind::Instance => Self::instance(segments[0].clone(), segments[1].clone()),
            Kind::Volume => Self::volume(segments[0].clone(), segments[1].clone(), segments[2].clone()),
        })
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            Kind::Config => write!(f, "config"),
            Kind::Image => write!(f, "image {}", self.fingerprint),
            Kind::Instance => write!(f, "instance {}/{}", self.project, self.name),
            Kind::Volume => write!(f, "volume {}/{}/{}", self.project, self.pool, self.name),
        }
    }
}

/// A UTC instant in `YYYYMMDDThhmmssZ` form. Lexical order is time order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(String);

impl Timestamp {
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Timestamp(at.format(TIMESTAMP_FORMAT).to_string())
    }

    /// Validate a user-supplied version string.
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT).map_err(|_| {
            BackupError::Config(format!(
                "invalid timestamp '{}' (expected YYYYMMDDThhmmssZ)",
                value
            ))
        })?;
        Ok(Timestamp(value.to_string()))
    }

    /// Wrap a name read back from storage without validating it.
    pub fn from_stored(value: impl Into<String>) -> Self {
        Timestamp(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One discovered version of a resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Entry {
    #[serde(flatten)]
    pub key: ResourceKey,
    pub timestamp: Timestamp,
    /// Snapshot directory or repository entry id
    pub path: String,
}

/// Coordinates of a single stored part.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartAddress {
    pub key: ResourceKey,
    pub timestamp: Timestamp,
    pub part: Part,
}

impl PartAddress {
    pub fn new(key: &ResourceKey, timestamp: &Timestamp, part: Part) -> Self {
        Self {
            key: key.clone(),
            timestamp: timestamp.clone(),
            part,
        }
    }

    pub fn file_name(&self) -> Result<&'static str> {
        self.part.file_name(self.key.kind).ok_or_else(|| {
            BackupError::Config(format!("{} snapshots have no '{}' part", self.key.kind, self.part))
        })
    }

    /// Path of the part relative to the storage root, e.g.
    /// `instances/default/web/20240101T000000Z/export.tar.xz`.
    pub fn relative_path(&self) -> Result<String> {
        let mut segments = vec![self.key.kind.dir_name()];
        segments.extend(self.key.identity_segments());
        segments.push(self.timestamp.as_str());
        segments.push(self.file_name()?);
        Ok(segments.join("/"))
    }
}

/// How a resource was captured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportOptions {
    /// Quiesced through a temporary snapshot
    pub snapshot: bool,
    /// Storage-driver optimized export format
    pub optimized: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_order_matches_names() {
        let mut kinds = Kind::ALL.to_vec();
        kinds.sort();
        let names: Vec<_> = kinds.iter().map(|k| k.as_str()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn test_parse_filter() {
        assert_eq!(Kind::parse_filter("").unwrap().len(), 4);
        assert_eq!(Kind::parse_filter("ALL").unwrap().len(), 4);
        assert_eq!(Kind::parse_filter("instances").unwrap(), vec![Kind::Instance]);
        assert_eq!(Kind::parse_filter("volume").unwrap(), vec![Kind::Volume]);
        assert!(Kind::parse_filter("containers").is_err());
    }

    #[test]
    fn test_part_file_names() {
        assert_eq!(Part::Data.file_name(Kind::Instance), Some("export.tar.xz"));
        assert_eq!(Part::Data.file_name(Kind::Volume), Some("volume.tar.xz"));
        assert_eq!(Part::Data.file_name(Kind::Config), None);
        assert_eq!(Part::StoragePools.file_name(Kind::Config), Some("storage_pools.json"));
        assert_eq!(Part::Projects.file_name(Kind::Instance), None);

        for kind in Kind::ALL {
            for part in kind.parts() {
                let name = part.file_name(kind).unwrap();
                assert_eq!(Part::from_file_name(kind, name), Some(*part));
            }
        }
        assert_eq!(Part::from_file_name(Kind::Instance, "export.tar"), None);
    }

    #[test]
    fn test_relative_paths() {
        let ts = Timestamp::from_stored("20240102T030405Z");
        let inst = PartAddress::new(&ResourceKey::instance("default", "web"), &ts, Part::Data);
        assert_eq!(
            inst.relative_path().unwrap(),
            "instances/default/web/20240102T030405Z/export.tar.xz"
        );

        let vol = PartAddress::new(&ResourceKey::volume("default", "fast", "data"), &ts, Part::Manifest);
        assert_eq!(
            vol.relative_path().unwrap(),
            "volumes/default/fast/data/20240102T030405Z/manifest.json"
        );

        let cfg = PartAddress::new(&ResourceKey::config(), &ts, Part::Networks);
        assert_eq!(cfg.relative_path().unwrap(), "config/20240102T030405Z/networks.json");

        let bad = PartAddress::new(&ResourceKey::config(), &ts, Part::Data);
        assert!(bad.relative_path().is_err());
    }

    #[test]
    fn test_identity_segments_round_trip() {
        let keys = vec![
            ResourceKey::instance("p", "n"),
            ResourceKey::volume("p", "pool", "n"),
            ResourceKey::image("abc123"),
            ResourceKey::config(),
        ];
        for key in keys {
            let segments: Vec<String> = key.identity_segments().iter().map(|s| s.to_string()).collect();
            assert_eq!(ResourceKey::from_identity_segments(key.kind, &segments), Some(key));
        }
        assert_eq!(ResourceKey::from_identity_segments(Kind::Instance, &["p".into()]), None);
    }

    #[test]
    fn test_timestamp_format() {
        let at = DateTime::parse_from_rfc3339("2024-05-06T07:08:09Z").unwrap().with_timezone(&Utc);
        assert_eq!(Timestamp::from_datetime(at).as_str(), "20240506T070809Z");
        assert!(Timestamp::parse("20240506T070809Z").is_ok());
        assert!(Timestamp::parse("2024-05-06").is_err());
    }

    #[test]
    fn test_entry_ordering() {
        let ts1 = Timestamp::from_stored("20240101T000000Z");
        let ts2 = Timestamp::from_stored("20240201T000000Z");
        let mut entries = vec![
            Entry { key: ResourceKey::volume("default", "a", "v"), timestamp: ts1.clone(), path: String::new() },
            Entry { key: ResourceKey::instance("default", "web"), timestamp: ts2.clone(), path: String::new() },
            Entry { key: ResourceKey::config(), timestamp: ts1.clone(), path: String::new() },
            Entry { key: ResourceKey::instance("default", "web"), timestamp: ts1.clone(), path: String::new() },
            Entry { key: ResourceKey::instance("default", "db"), timestamp: ts2.clone(), path: String::new() },
        ];
        entries.sort();
        let order: Vec<String> = entries.iter().map(|e| format!("{} {}", e.key, e.timestamp)).collect();
        assert_eq!(
            order,
            vec![
                "config 20240101T000000Z",
                "instance default/db 20240201T000000Z",
                "instance default/web 20240101T000000Z",
                "instance default/web 20240201T000000Z",
                "volume default/a/v 20240101T000000Z",
            ]
        );
    }

    #[test]
    fn test_entry_json_fields() {
        let entry = Entry {
            key: ResourceKey::instance("default", "web"),
            timestamp: Timestamp::from_stored("20240101T000000Z"),
            path: "/srv/instances/default/web/20240101T000000Z".into(),
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["type"], "instance");
        assert_eq!(value["project"], "default");
        assert_eq!(value["pool"], "");
        assert_eq!(value["timestamp"], "20240101T000000Z");
    }
}
