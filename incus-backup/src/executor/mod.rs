//! Backup and restore orchestration.
//!
//! The executor ties a [`Host`] to a [`StorageBackend`]: it exports
//! resources through the transfer pipeline, writes manifests and checksum
//! lists, and drives restores in the opposite direction. Resources are
//! processed one at a time, in listing order.

pub mod backup;
pub mod restore;

use crate::backend::{open_part, StorageBackend};
use crate::host::Host;
use crate::model::{ChecksumSet, ExportOptions, Kind, LogicalSnapshot, Manifest, Part, PartAddress, ResourceKey, Timestamp};
use crate::safety::{self, SafetyOptions};
use crate::transfer::TransferSettings;
use crate::utils::errors::{BackupError, Result};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

pub use backup::{BackupOptions, BackupResult};
pub use restore::{RestoreAction, RestoreOptions, RestoreOutcome};

/// Line-oriented user output (plans, previews, per-item progress).
pub type Printer = Arc<dyn Fn(&str) + Send + Sync>;

pub fn stdout_printer() -> Printer {
    Arc::new(|line: &str| println!("{}", line))
}

/// Split a `POOL/NAME` volume reference.
pub fn parse_volume_ref(value: &str) -> Result<(String, String)> {
    match value.split_once('/') {
        Some((pool, name)) if !pool.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok((pool.to_string(), name.to_string()))
        }
        _ => Err(BackupError::Config(format!(
            "invalid volume '{}': expected POOL/NAME",
            value
        ))),
    }
}

pub struct Executor {
    host: Arc<dyn Host>,
    backend: Arc<dyn StorageBackend>,
    settings: TransferSettings,
    safety: SafetyOptions,
    cancel: CancellationToken,
    out: Printer,
    prepared: OnceCell<()>,
}

impl Executor {
    pub fn new(
        host: Arc<dyn Host>,
        backend: Arc<dyn StorageBackend>,
        settings: TransferSettings,
        safety: SafetyOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            host,
            backend,
            settings,
            safety,
            cancel,
            out: stdout_printer(),
            prepared: OnceCell::new(),
        }
    }

    pub fn with_printer(mut self, out: Printer) -> Self {
        self.out = out;
        self
    }

    pub fn backend(&self) -> &dyn StorageBackend {
        self.backend.as_ref()
    }

    pub fn safety(&self) -> &SafetyOptions {
        &self.safety
    }

    fn say(&self, line: impl AsRef<str>) {
        (self.out)(line.as_ref());
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(BackupError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Prepare the target once per executor.
    async fn prepare(&self) -> Result<()> {
        self.prepared.get_or_try_init(|| self.backend.prepare()).await?;
        Ok(())
    }

    async fn confirm(&self, question: &str) -> Result<bool> {
        safety::confirm(&self.safety, question).await
    }

    /// Store a small in-memory part and record its hash.
    async fn write_bytes(
        &self,
        address: PartAddress,
        options: ExportOptions,
        bytes: Vec<u8>,
        checksums: &mut ChecksumSet,
    ) -> Result<()> {
        let file_name = address.file_name()?;
        let written = self
            .backend
            .write_part(&address, options, Box::new(std::io::Cursor::new(bytes)), None)
            .await?;
        checksums.push(written.digest, file_name);
        Ok(())
    }

    /// Write the manifest and then the checksum list, which closes the
    /// snapshot.
    async fn finish_snapshot(
        &self,
        key: &ResourceKey,
        timestamp: &Timestamp,
        manifest: &Manifest,
        options: ExportOptions,
        mut checksums: ChecksumSet,
    ) -> Result<()> {
        let address = PartAddress::new(key, timestamp, Part::Manifest);
        self.write_bytes(address, options, manifest.to_bytes()?, &mut checksums).await?;

        let address = PartAddress::new(key, timestamp, Part::Checksums);
        self.backend
            .write_part(
                &address,
                options,
                Box::new(std::io::Cursor::new(checksums.render().into_bytes())),
                None,
            )
            .await?;
        Ok(())
    }

    /// Read and check the manifest of `snapshot` before anything else.
    async fn read_manifest(&self, snapshot: &LogicalSnapshot, expected: Kind) -> Result<Manifest> {
        let bytes = open_part(self.backend.as_ref(), snapshot, Part::Manifest, None)
            .await?
            .read_to_end()
            .await?;
        let manifest = Manifest::from_bytes(&bytes)?;
        manifest.expect_kind(expected, &snapshot.describe())?;
        Ok(manifest)
    }
}
