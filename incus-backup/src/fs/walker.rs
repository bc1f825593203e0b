//! Fixed-depth traversal of the snapshot directory layout.
//!
//! A backup root holds `<kind>/<identity...>/<timestamp>/` directories. The
//! walker only descends through directories, skips hidden entries at every
//! level and returns results in file-name order.

use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// A directory found exactly `depth` levels below the walk root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotDir {
    /// Full path to the directory
    pub path: PathBuf,

    /// Directory names from the root down, the last being the directory
    /// itself
    pub segments: Vec<String>,
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|name| name.starts_with('.'))
        .unwrap_or(true)
}

/// Collect every directory exactly `depth` levels below `root`.
///
/// A missing root yields no directories. Files at any level are ignored, as
/// are hidden entries and names that are not valid UTF-8.
pub fn walk_snapshot_dirs(root: &Path, depth: usize) -> std::io::Result<Vec<SnapshotDir>> {
    if depth == 0 || !root.is_dir() {
        return Ok(Vec::new());
    }

    let walker = WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .max_depth(depth)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || (entry.file_type().is_dir() && !is_hidden(entry)));

    let mut dirs = Vec::new();
    for entry in walker {
        let entry = entry?;
        if entry.depth() != depth {
            continue;
        }
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let segments = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        dirs.push(SnapshotDir {
            path: entry.path().to_path_buf(),
            segments,
        });
    }

    Ok(dirs)
}

/// Names of the visible regular files directly inside `dir`, sorted.
pub fn list_files(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry?;
        if entry.file_type().is_file() && !is_hidden(&entry) {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(names)
}
