//! Logical snapshots and the grouping table built from listings.

use super::{Entry, Kind, Part, PartAddress, ResourceKey, Timestamp};
use std::collections::BTreeMap;

/// Where one part is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartRef {
    /// File path (directory backend) or entry id (repository backend)
    pub locator: String,
    /// Path of the payload inside a repository entry
    pub inner_path: Option<String>,
}

impl PartRef {
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            locator: path.into(),
            inner_path: None,
        }
    }

    pub fn entry(id: impl Into<String>, inner_path: impl Into<String>) -> Self {
        Self {
            locator: id.into(),
            inner_path: Some(inner_path.into()),
        }
    }
}

/// One resource version and the parts found for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalSnapshot {
    pub key: ResourceKey,
    pub timestamp: Timestamp,
    /// Snapshot directory, or the id of the entry that represents it
    pub location: String,
    pub parts: BTreeMap<Part, PartRef>,
    /// Every stored object removed when this snapshot is pruned
    pub members: Vec<String>,
}

impl LogicalSnapshot {
    pub fn new(key: ResourceKey, timestamp: Timestamp, location: impl Into<String>) -> Self {
        Self {
            key,
            timestamp,
            location: location.into(),
            parts: BTreeMap::new(),
            members: Vec::new(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.key.kind
    }

    pub fn part(&self, part: Part) -> Option<&PartRef> {
        self.parts.get(&part)
    }

    /// Required parts that were not found.
    pub fn missing_parts(&self) -> Vec<Part> {
        self.kind()
            .parts()
            .iter()
            .copied()
            .filter(|part| !self.parts.contains_key(part))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.missing_parts().is_empty()
    }

    pub fn entry(&self) -> Entry {
        Entry {
            key: self.key.clone(),
            timestamp: self.timestamp.clone(),
            path: self.location.clone(),
        }
    }

    /// Human readable reference used in errors and logs.
    pub fn describe(&self) -> String {
        format!("{} at {}", self.key, self.timestamp)
    }
}

/// `(ResourceKey, Timestamp) -> {part -> stored object}`.
///
/// Backends decode their listings into this table before any prune,
/// verify or restore logic looks at them.
#[derive(Debug, Default)]
pub struct SnapshotTable {
    snapshots: BTreeMap<(ResourceKey, Timestamp), LogicalSnapshot>,
}

impl SnapshotTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one stored part. The first object seen for a
    /// `(key, timestamp, part)` triple wins; later duplicates are still
    /// tracked as members so pruning removes them too.
    pub fn insert_part(&mut self, address: PartAddress, part_ref: PartRef) {
        let member = part_ref.locator.clone();
        let snapshot = self
            .snapshots
            .entry((address.key.clone(), address.timestamp.clone()))
            .or_insert_with(|| LogicalSnapshot::new(address.key, address.timestamp, member.clone()));

        if address.part == Part::Manifest && !snapshot.parts.contains_key(&Part::Manifest) {
            snapshot.location = member.clone();
        }
        snapshot.parts.entry(address.part).or_insert(part_ref);
        if !snapshot.members.contains(&member) {
            snapshot.members.push(member);
        }
    }

    /// Record a stored object that belongs to a snapshot but is not one of
    /// its readable parts. It is deleted along with the snapshot.
    pub fn insert_member(&mut self, key: ResourceKey, timestamp: Timestamp, member: String) {
        let snapshot = self
            .snapshots
            .entry((key.clone(), timestamp.clone()))
            .or_insert_with(|| LogicalSnapshot::new(key, timestamp, member.clone()));
        if !snapshot.members.contains(&member) {
            snapshot.members.push(member);
        }
    }

    /// Record a snapshot discovered as a unit (a timestamp directory).
    pub fn insert_snapshot(&mut self, snapshot: LogicalSnapshot) {
        self.snapshots
            .entry((snapshot.key.clone(), snapshot.timestamp.clone()))
            .or_insert(snapshot);
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// All snapshots in listing order.
    pub fn into_snapshots(self) -> Vec<LogicalSnapshot> {
        self.snapshots.into_values().collect()
    }

    /// Snapshots grouped by identity, each group oldest first.
    pub fn into_groups(self) -> Vec<(ResourceKey, Vec<LogicalSnapshot>)> {
        let mut groups: Vec<(ResourceKey, Vec<LogicalSnapshot>)> = Vec::new();
        for ((key, _), snapshot) in self.snapshots {
            match groups.last_mut() {
                Some((last, members)) if *last == key => members.push(snapshot),
                _ => groups.push((key, vec![snapshot])),
            }
        }
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(key: &ResourceKey, ts: &str, part: Part) -> PartAddress {
        PartAddress::new(key, &Timestamp::from_stored(ts), part)
    }

    #[test]
    fn test_parts_group_by_key_and_timestamp() {
        let web = ResourceKey::instance("default", "web");
        let mut table = SnapshotTable::new();
        table.insert_part(address(&web, "20240101T000000Z", Part::Data), PartRef::entry("a1", "/x"));
        table.insert_part(address(&web, "20240101T000000Z", Part::Manifest), PartRef::entry("a2", "/y"));
        table.insert_part(address(&web, "20240102T000000Z", Part::Data), PartRef::entry("b1", "/x"));

        let snapshots = table.into_snapshots();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].location, "a2");
        assert_eq!(snapshots[0].members, vec!["a1", "a2"]);
        assert_eq!(snapshots[0].missing_parts(), vec![Part::Checksums]);
        assert_eq!(snapshots[1].location, "b1");
    }

    #[test]
    fn test_duplicate_parts_keep_one() {
        let key = ResourceKey::config();
        let mut table = SnapshotTable::new();
        table.insert_part(address(&key, "20240101T000000Z", Part::Manifest), PartRef::entry("first", "/m"));
        table.insert_part(address(&key, "20240101T000000Z", Part::Manifest), PartRef::entry("second", "/m"));
        table.insert_part(address(&key, "20240101T000000Z", Part::Manifest), PartRef::entry("first", "/m"));

        let snapshots = table.into_snapshots();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].part(Part::Manifest).unwrap().locator, "first");
        assert_eq!(snapshots[0].members, vec!["first", "second"]);
    }

    #[test]
    fn test_groups_are_oldest_first() {
        let a = ResourceKey::instance("default", "a");
        let b = ResourceKey::instance("default", "b");
        let mut table = SnapshotTable::new();
        for (key, ts) in [(&b, "20240103T000000Z"), (&a, "20240102T000000Z"), (&a, "20240101T000000Z")] {
            table.insert_part(address(key, ts, Part::Data), PartRef::file(format!("{}-{}", key.name, ts)));
        }

        let groups = table.into_groups();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, a);
        let stamps: Vec<_> = groups[0].1.iter().map(|s| s.timestamp.as_str().to_string()).collect();
        assert_eq!(stamps, vec!["20240101T000000Z", "20240102T000000Z"]);
        assert_eq!(groups[1].1.len(), 1);
    }

    #[test]
    fn test_complete_config_snapshot() {
        let key = ResourceKey::config();
        let mut table = SnapshotTable::new();
        for part in Kind::Config.parts() {
            table.insert_part(address(&key, "20240101T000000Z", *part), PartRef::file(part.as_str()));
        }
        assert!(table.into_snapshots()[0].is_complete());
    }
}
