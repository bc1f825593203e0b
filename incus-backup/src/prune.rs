//! Retention: keep the newest N versions of every resource.

use crate::backend::StorageBackend;
use crate::model::{Kind, LogicalSnapshot, ResourceKey, Timestamp};
use crate::utils::errors::{BackupError, Result};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Number of versions kept per resource. Always at least one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keep(usize);

impl Keep {
    pub fn new(value: i64) -> Result<Self> {
        if value <= 0 {
            return Err(BackupError::Config(format!(
                "--keep must be a positive integer, got {}",
                value
            )));
        }
        Ok(Keep(value as usize))
    }

    pub fn get(&self) -> usize {
        self.0
    }
}

/// Snapshots to delete so that every resource keeps its newest `keep`
/// versions. With `only`, candidates are further narrowed to that
/// timestamp; nothing keep-N retains is ever selected.
///
/// Completeness plays no part: the newest versions are kept even when
/// incomplete, and older incomplete ones are deleted like any other.
pub fn select(snapshots: Vec<LogicalSnapshot>, keep: Keep, only: Option<&Timestamp>) -> Vec<LogicalSnapshot> {
    let mut groups: BTreeMap<ResourceKey, Vec<LogicalSnapshot>> = BTreeMap::new();
    for snapshot in snapshots {
        groups.entry(snapshot.key.clone()).or_default().push(snapshot);
    }

    let mut candidates = Vec::new();
    for (_, mut versions) in groups {
        versions.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        versions.dedup_by(|a, b| a.timestamp == b.timestamp);
        if versions.len() <= keep.get() {
            continue;
        }
        let excess = versions.len() - keep.get();
        candidates.extend(
            versions
                .into_iter()
                .take(excess)
                .filter(|s| only.map_or(true, |ts| &s.timestamp == ts)),
        );
    }
    candidates
}

/// List the snapshots of `kinds` and select deletion candidates.
pub async fn plan(
    backend: &dyn StorageBackend,
    kinds: &[Kind],
    keep: Keep,
    only: Option<&Timestamp>,
) -> Result<Vec<LogicalSnapshot>> {
    let supported: Vec<Kind> = kinds.iter().copied().filter(|k| backend.supports(*k)).collect();
    for kind in kinds.iter().filter(|k| !supported.contains(k)) {
        warn!(kind = %kind, target = %backend.describe(), "pruning this kind is not supported by the target");
    }
    let snapshots = backend.snapshots(&supported).await?;
    Ok(select(snapshots, keep, only))
}

/// Delete the candidates, every part of a snapshot together. Returns the
/// number of snapshots removed.
pub async fn execute(backend: &dyn StorageBackend, candidates: &[LogicalSnapshot]) -> Result<usize> {
    if candidates.is_empty() {
        return Ok(0);
    }
    for candidate in candidates {
        info!(snapshot = %candidate.describe(), parts = candidate.parts.len(), "pruning");
    }
    backend.delete(candidates, true).await?;
    Ok(candidates.len())
}
