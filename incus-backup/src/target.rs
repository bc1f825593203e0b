//! Backup target URIs (`dir:/path`, `restic:<repository>`) and backend
//! construction.

use crate::backend::{DirectoryBackend, ResticBackend, StorageBackend};
use crate::config::Config;
use crate::repository::{detect, ResticCli};
use crate::transfer::TransferSettings;
use crate::utils::errors::{BackupError, Result};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Dir(PathBuf),
    Restic(String),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Dir(path) => write!(f, "dir:{}", path.display()),
            Target::Restic(location) => write!(f, "restic:{}", location),
        }
    }
}

/// Parse `<scheme>:<value>`.
pub fn parse(input: &str) -> Result<Target> {
    let input = input.trim();
    if input.is_empty() {
        return Err(BackupError::Config("empty target".into()));
    }
    let invalid = || {
        BackupError::Config(format!(
            "invalid target '{}': expected <scheme>:<value>",
            input
        ))
    };
    let (scheme, value) = input.split_once(':').ok_or_else(invalid)?;
    if value.trim().is_empty() {
        return Err(invalid());
    }

    match scheme.trim().to_lowercase().as_str() {
        "dir" => {
            let path = Path::new(value.trim());
            if !path.is_absolute() {
                return Err(BackupError::Config(format!(
                    "directory target must be an absolute path, got '{}'",
                    value
                )));
            }
            Ok(Target::Dir(clean(path)))
        }
        "restic" => Ok(Target::Restic(value.to_string())),
        other => Err(BackupError::Config(format!("unsupported backend scheme '{}'", other))),
    }
}

/// Lexical cleanup: drops `.`, resolves `..` against earlier components and
/// collapses repeated separators. Never touches the filesystem.
fn clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Build the backend for `target`. For restic targets the binary is
/// located and its version checked; an old restic is refused unless
/// `force` is set.
pub async fn open_backend(
    target: &Target,
    config: &Config,
    settings: &TransferSettings,
    force: bool,
    cancel: CancellationToken,
) -> Result<Arc<dyn StorageBackend>> {
    match target {
        Target::Dir(root) => Ok(Arc::new(DirectoryBackend::new(root.clone()).with_chunk_size(settings.chunk_size))),
        Target::Restic(location) => {
            let binary = detect::detect(config.restic.binary.as_deref(), config.version_timeout()).await?;
            let required = &config.restic.required_version;
            if !binary.is_compatible(required) {
                if !force {
                    return Err(BackupError::Config(format!(
                        "restic {} is older than the required {} (use --force to continue anyway)",
                        binary.version, required
                    )));
                }
                warn!(version = %binary.version, required = %required, "continuing with unsupported restic version");
            }
            info!(path = %binary.path.display(), version = %binary.version, "using restic");
            let cli = ResticCli::new(binary.path, location.clone(), cancel.clone());
            Ok(Arc::new(ResticBackend::new(Arc::new(cli), location.clone(), settings, cancel)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dir() {
        assert_eq!(parse("dir:/srv/backups").unwrap(), Target::Dir("/srv/backups".into()));
        assert_eq!(parse("  DIR:/srv//backups/./x/../y/ ").unwrap(), Target::Dir("/srv/backups/y".into()));
        assert!(parse("dir:relative/path").is_err());
    }

    #[test]
    fn test_parse_restic() {
        assert_eq!(
            parse("restic:s3:https://s3.example.com/bucket").unwrap(),
            Target::Restic("s3:https://s3.example.com/bucket".into())
        );
        assert_eq!(parse("restic:/srv/restic").unwrap().to_string(), "restic:/srv/restic");
    }

    #[test]
    fn test_parse_errors() {
        let empty = parse("   ").unwrap_err().to_string();
        assert!(empty.contains("empty target"), "{empty}");

        let missing = parse("/srv/backups").unwrap_err().to_string();
        assert!(missing.contains("expected <scheme>:<value>"), "{missing}");
        assert!(parse("dir:").is_err());

        let scheme = parse("s3:bucket").unwrap_err().to_string();
        assert!(scheme.contains("unsupported backend scheme 's3'"), "{scheme}");
    }

    #[tokio::test]
    async fn test_open_directory_backend() {
        let dir = tempfile::TempDir::new().unwrap();
        let target = parse(&format!("dir:{}", dir.path().display())).unwrap();
        let backend = open_backend(
            &target,
            &Config::default(),
            &TransferSettings::default(),
            false,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(backend.describe().starts_with("dir:"));
        assert!(backend.list(&[crate::model::Kind::Config]).await.unwrap().is_empty());
    }
}
