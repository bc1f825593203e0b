//! Locating the restic binary and checking its version.

use crate::utils::errors::{BackupError, Result};
use regex::Regex;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Oldest restic release known to work.
pub const REQUIRED_VERSION: &str = "0.18.0";

fn version_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"restic\s+([0-9]+\.[0-9]+\.[0-9]+(?:-[A-Za-z0-9.]+)?)").expect("version pattern is valid")
    })
}

/// A located binary and the version it reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResticBinary {
    pub path: PathBuf,
    pub version: String,
}

impl ResticBinary {
    pub fn is_compatible(&self, required: &str) -> bool {
        is_compatible(&self.version, required)
    }
}

/// Configured path, else `restic` on `PATH`.
pub fn locate(configured: Option<&Path>) -> Result<PathBuf> {
    match configured {
        Some(path) => which::which(path)
            .map_err(|e| BackupError::Config(format!("restic binary {} not usable: {}", path.display(), e))),
        None => which::which("restic")
            .map_err(|e| BackupError::Config(format!("restic binary not found on PATH: {}", e))),
    }
}

/// Locate the binary and probe its version.
pub async fn detect(configured: Option<&Path>, timeout: Duration) -> Result<ResticBinary> {
    let path = locate(configured)?;
    let version = query_version(&path, timeout).await?;
    debug!(path = %path.display(), version = %version, "detected restic");
    Ok(ResticBinary { path, version })
}

/// Run `restic version` with a bounded timeout.
pub async fn query_version(binary: &Path, timeout: Duration) -> Result<String> {
    let mut cmd = Command::new(binary);
    cmd.arg("version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| BackupError::Transport(format!("restic version timed out after {:?}", timeout)))??;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let version = extract_version(&stdout)
        .or_else(|| extract_version(&stderr))
        .ok_or_else(|| BackupError::Transport("could not parse restic version output".into()))?;

    if !output.status.success() {
        warn!(status = %output.status, "restic version exited unsuccessfully");
        return Err(BackupError::Repository {
            command: "restic version".into(),
            stderr: stderr.trim().to_string(),
        });
    }
    Ok(version)
}

/// First `restic X.Y.Z[-pre]` found in `output`.
pub fn extract_version(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| version_regex().captures(line))
        .map(|caps| caps[1].to_string())
}

#[derive(Debug, PartialEq, Eq)]
struct SemVersion {
    major: u64,
    minor: u64,
    patch: u64,
    pre: String,
}

impl SemVersion {
    fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let (core, pre) = value.split_once('-').unwrap_or((value, ""));
        let mut nums = core.split('.');
        let major = nums.next()?.parse().ok()?;
        let minor = nums.next()?.parse().ok()?;
        let patch = nums.next()?.parse().ok()?;
        if nums.next().is_some() {
            return None;
        }
        Some(Self {
            major,
            minor,
            patch,
            pre: pre.to_string(),
        })
    }
}

impl Ord for SemVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (self.pre.is_empty(), other.pre.is_empty()) {
                (true, true) => Ordering::Equal,
                // a prerelease sorts below its release
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => self.pre.cmp(&other.pre),
            })
    }
}

impl PartialOrd for SemVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// True when `version` is at least `required`. Unparseable versions are
/// never compatible.
pub fn is_compatible(version: &str, required: &str) -> bool {
    match (SemVersion::parse(version), SemVersion::parse(required)) {
        (Some(found), Some(required)) => found >= required,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_version() {
        let out = "restic 0.18.0 compiled with go1.24.1 on linux/amd64\n";
        assert_eq!(extract_version(out), Some("0.18.0".to_string()));
        assert_eq!(
            extract_version("debug\nrestic 0.19.0-dev.1 compiled with go1.25"),
            Some("0.19.0-dev.1".to_string())
        );
        assert_eq!(extract_version("no version here"), None);
    }

    #[test]
    fn test_compatibility() {
        assert!(is_compatible("0.18.0", REQUIRED_VERSION));
        assert!(is_compatible("0.18.1", REQUIRED_VERSION));
        assert!(is_compatible("1.0.0", REQUIRED_VERSION));
        assert!(!is_compatible("0.17.3", REQUIRED_VERSION));
        assert!(!is_compatible("0.18.0-rc1", REQUIRED_VERSION));
        assert!(is_compatible("0.18.0-rc2", "0.18.0-rc1"));
        assert!(!is_compatible("garbage", REQUIRED_VERSION));
        assert!(!is_compatible("0.18", REQUIRED_VERSION));
    }

    #[tokio::test]
    async fn test_query_version_from_script() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("restic");
        std::fs::write(&script, "#!/bin/sh\necho 'restic 0.18.1 compiled with go1.24 on linux/amd64'\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let detected = detect(Some(&script), Duration::from_secs(5)).await.unwrap();
        assert_eq!(detected.version, "0.18.1");
        assert!(detected.is_compatible(REQUIRED_VERSION));
    }

    #[tokio::test]
    async fn test_query_version_times_out() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("restic");
        std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let err = query_version(&script, Duration::from_millis(100)).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
