//! Utility modules shared across the crate.

pub mod errors;
pub mod logger;
pub mod table;

pub use errors::{BackupError, Result};
