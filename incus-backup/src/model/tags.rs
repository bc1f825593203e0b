//! Repository tag encoding.
//!
//! Each repository entry carries a flat `key=value` tag set that identifies
//! the resource, timestamp and part it stores. Encoding and decoding live
//! here so the rest of the crate never parses tags directly.

use super::{ExportOptions, Kind, Part, PartAddress, ResourceKey, Timestamp};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

pub const SCHEMA_VERSION: &str = "v1";

/// Parsed `key=value` tags. A tag without `=` maps to an empty value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagSet(BTreeMap<String, String>);

impl TagSet {
    pub fn parse<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let map = tags
            .into_iter()
            .map(|tag| match tag.as_ref().split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (tag.as_ref().to_string(), String::new()),
            })
            .collect();
        TagSet(map)
    }

    /// Value of `key`, treating an empty value as absent.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    pub fn flag(&self, key: &str) -> bool {
        self.get(key) == Some("true")
    }

    /// True when every `key=value` filter is present in this set.
    pub fn matches(&self, filters: &[String]) -> bool {
        filters.iter().all(|filter| {
            let (k, v) = filter.split_once('=').unwrap_or((filter.as_str(), ""));
            self.0.get(k).map(String::as_str) == Some(v)
        })
    }
}

fn tag(key: &str, value: &str) -> String {
    format!("{}={}", key, value)
}

/// Identity tags of a resource, without timestamp or part.
fn identity_tags(key: &ResourceKey) -> Vec<String> {
    let mut tags = vec![tag("type", key.kind.as_str())];
    match key.kind {
        Kind::Instance => {
            tags.push(tag("project", &key.project));
            tags.push(tag("name", &key.name));
        }
        Kind::Volume => {
            tags.push(tag("project", &key.project));
            tags.push(tag("pool", &key.pool));
            tags.push(tag("name", &key.name));
        }
        Kind::Image => tags.push(tag("fingerprint", &key.fingerprint)),
        Kind::Config => {}
    }
    tags
}

/// Full tag set written with one part.
pub fn encode(address: &PartAddress, options: ExportOptions) -> Vec<String> {
    let mut tags = vec![tag("type", address.key.kind.as_str()), tag("schema", SCHEMA_VERSION)];
    tags.extend(identity_tags(&address.key).into_iter().skip(1));
    tags.push(tag("timestamp", address.timestamp.as_str()));
    tags.push(tag("part", address.part.as_str()));
    if options.optimized {
        tags.push(tag("optimized", "true"));
    }
    if options.snapshot {
        tags.push(tag("snapshot", "true"));
    }
    tags
}

/// Tags that select every part of `key`, optionally narrowed to one
/// timestamp and one part.
pub fn query(key: &ResourceKey, timestamp: Option<&Timestamp>, part: Option<Part>) -> Vec<String> {
    let mut tags = identity_tags(key);
    if let Some(ts) = timestamp {
        tags.push(tag("timestamp", ts.as_str()));
    }
    if let Some(part) = part {
        tags.push(tag("part", part.as_str()));
    }
    tags
}

/// Tags that select every entry of `kind`, optionally one part only.
pub fn kind_query(kind: Kind, part: Option<Part>) -> Vec<String> {
    let mut tags = vec![tag("type", kind.as_str())];
    if let Some(part) = part {
        tags.push(tag("part", part.as_str()));
    }
    tags
}

/// Rebuild the coordinates of an entry from its tags.
///
/// Returns `None` when a tag needed to attribute the entry is missing or
/// unknown. A missing `timestamp` tag falls back to the entry's creation
/// time.
pub fn decode(tags: &TagSet, created: Option<DateTime<Utc>>) -> Option<PartAddress> {
    if let Some(schema) = tags.get("schema") {
        if schema != SCHEMA_VERSION {
            return None;
        }
    }
    let (key, timestamp) = decode_identity(tags, created)?;
    let part = Part::parse(tags.get("part")?)?;
    part.file_name(key.kind)?;
    Some(PartAddress { key, timestamp, part })
}

/// The resource and timestamp an entry belongs to, ignoring its part and
/// schema. Used to attribute entries that [`decode`] cannot place.
pub fn decode_identity(tags: &TagSet, created: Option<DateTime<Utc>>) -> Option<(ResourceKey, Timestamp)> {
    let kind = Kind::from_tag(tags.get("type")?)?;
    let key = match kind {
        Kind::Instance => ResourceKey::instance(tags.get("project")?, tags.get("name")?),
        Kind::Volume => ResourceKey::volume(tags.get("project")?, tags.get("pool")?, tags.get("name")?),
        Kind::Image => ResourceKey::image(tags.get("fingerprint")?),
        Kind::Config => ResourceKey::config(),
    };
    let timestamp = match tags.get("timestamp") {
        Some(ts) => Timestamp::from_stored(ts),
        None => Timestamp::from_datetime(created?),
    };
    Some((key, timestamp))
}

/// Capture options recorded in the tags of an entry.
pub fn decode_options(tags: &TagSet) -> ExportOptions {
    ExportOptions {
        snapshot: tags.flag("snapshot"),
        optimized: tags.flag("optimized"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts() -> Timestamp {
        Timestamp::from_stored("20240101T000000Z")
    }

    #[test]
    fn test_instance_tags() {
        let address = PartAddress::new(&ResourceKey::instance("default", "web"), &ts(), Part::Data);
        let tags = encode(&address, ExportOptions { snapshot: true, optimized: true });
        assert_eq!(
            tags,
            vec![
                "type=instance",
                "schema=v1",
                "project=default",
                "name=web",
                "timestamp=20240101T000000Z",
                "part=data",
                "optimized=true",
                "snapshot=true",
            ]
        );
    }

    #[test]
    fn test_round_trip_every_part() {
        let keys = vec![
            ResourceKey::instance("p", "n"),
            ResourceKey::volume("p", "pool", "n"),
            ResourceKey::config(),
        ];
        for key in keys {
            for part in key.kind.parts() {
                let address = PartAddress::new(&key, &ts(), *part);
                let set = TagSet::parse(encode(&address, ExportOptions::default()));
                assert_eq!(decode(&set, None), Some(address));
            }
        }
    }

    #[test]
    fn test_options_round_trip() {
        let address = PartAddress::new(&ResourceKey::volume("p", "pool", "v"), &ts(), Part::Manifest);
        let options = ExportOptions { snapshot: false, optimized: true };
        let set = TagSet::parse(encode(&address, options));
        assert_eq!(decode_options(&set), options);
    }

    #[test]
    fn test_missing_required_tags_are_skipped() {
        let no_name = TagSet::parse(["type=instance", "project=p", "timestamp=20240101T000000Z", "part=data"]);
        assert_eq!(decode(&no_name, None), None);

        let no_pool = TagSet::parse(["type=volume", "project=p", "name=v", "part=data"]);
        assert_eq!(decode(&no_pool, Some(Utc::now())), None);

        let wrong_part = TagSet::parse(["type=config", "part=data", "timestamp=20240101T000000Z"]);
        assert_eq!(decode(&wrong_part, None), None);

        let future_schema = TagSet::parse(["type=config", "schema=v9", "part=manifest", "timestamp=20240101T000000Z"]);
        assert_eq!(decode(&future_schema, None), None);

        // Still attributable to the config snapshot they belong to.
        let stamp = Timestamp::from_stored("20240101T000000Z");
        assert_eq!(decode_identity(&wrong_part, None), Some((ResourceKey::config(), stamp.clone())));
        assert_eq!(decode_identity(&future_schema, None), Some((ResourceKey::config(), stamp)));
        assert_eq!(decode_identity(&no_name, None), None);
    }

    #[test]
    fn test_timestamp_falls_back_to_creation_time() {
        let created = DateTime::parse_from_rfc3339("2023-12-31T23:59:58Z").unwrap().with_timezone(&Utc);
        let set = TagSet::parse(["type=config", "schema=v1", "part=manifest"]);
        let address = decode(&set, Some(created)).unwrap();
        assert_eq!(address.timestamp.as_str(), "20231231T235958Z");
        assert_eq!(decode(&set, None), None);
    }

    #[test]
    fn test_tag_without_value() {
        let set = TagSet::parse(["legacy", "type=config"]);
        assert_eq!(set.get("legacy"), None);
        assert_eq!(set.get("type"), Some("config"));
        assert!(set.matches(&["type=config".to_string()]));
        assert!(!set.matches(&["type=instance".to_string()]));
    }

    #[test]
    fn test_query_tags() {
        let key = ResourceKey::volume("p", "pool", "v");
        assert_eq!(
            query(&key, Some(&ts()), Some(Part::Data)),
            vec!["type=volume", "project=p", "pool=pool", "name=v", "timestamp=20240101T000000Z", "part=data"]
        );
        assert_eq!(kind_query(Kind::Config, Some(Part::Manifest)), vec!["type=config", "part=manifest"]);
    }
}
