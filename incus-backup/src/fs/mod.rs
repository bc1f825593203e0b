//! Filesystem helpers for the directory backend.

pub mod walker;

pub use walker::{list_files, walk_snapshot_dirs, SnapshotDir};
