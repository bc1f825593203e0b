//! Incus backup library
//!
//! Backs up Incus instances, custom volumes and declarative configuration to
//! a directory tree or a restic repository, and restores them.

pub mod backend;
pub mod cli;
pub mod config;
pub mod executor;
pub mod fs;
pub mod host;
pub mod model;
pub mod process;
pub mod prune;
pub mod reconcile;
pub mod repository;
pub mod safety;
pub mod target;
pub mod transfer;
pub mod utils;
pub mod verify;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::{BackupError, Result};
