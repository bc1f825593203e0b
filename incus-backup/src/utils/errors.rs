//! Error types shared by every engine, backend and collaborator.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Snapshot {snapshot} is missing required part '{part}'")]
    MissingPart { snapshot: String, part: String },

    #[error("Snapshot {location} declares type '{found}', expected '{expected}'")]
    KindMismatch {
        location: String,
        expected: String,
        found: String,
    },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Transfer error: {0}")]
    Transport(String),

    /// The other end of a transfer pipe went away. Never the root cause of a failure.
    #[error("Transfer pipe closed")]
    PipeClosed,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Failed to {op} {resource} '{name}': {source}")]
    Apply {
        op: &'static str,
        resource: &'static str,
        name: String,
        #[source]
        source: Box<BackupError>,
    },

    #[error("Host error: {0}")]
    Host(String),

    #[error("Repository command '{command}' failed: {stderr}")]
    Repository { command: String, stderr: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration file: {0}")]
    ConfigFile(#[from] toml::de::Error),
}

impl BackupError {
    /// True for errors that only describe the far side of a pipe going away.
    pub fn is_pipe_artifact(&self) -> bool {
        match self {
            BackupError::PipeClosed | BackupError::Cancelled => true,
            BackupError::Io(e) => e.kind() == std::io::ErrorKind::BrokenPipe,
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BackupError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_artifacts() {
        assert!(BackupError::PipeClosed.is_pipe_artifact());
        assert!(BackupError::Io(std::io::ErrorKind::BrokenPipe.into()).is_pipe_artifact());
        assert!(!BackupError::Transport("export failed".into()).is_pipe_artifact());
    }

    #[test]
    fn test_apply_error_names_resource() {
        let err = BackupError::Apply {
            op: "create",
            resource: "network",
            name: "br0".into(),
            source: Box::new(BackupError::Host("boom".into())),
        };
        assert_eq!(err.to_string(), "Failed to create network 'br0': Host error: boom");
    }
}
