use super::{parse_volume_ref, Executor};
use crate::model::{ChecksumSet, ExportOptions, Kind, Manifest, Part, PartAddress, ResourceKey, Timestamp};
use crate::transfer::progress::{format_bytes, format_duration};
use crate::utils::errors::{BackupError, Result};
use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::time::Instant;
use tracing::{info, warn};

/// Name prefix of the temporary snapshot taken before an export.
pub const TEMP_SNAPSHOT_PREFIX: &str = "tmp-incus-backup-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupOptions {
    /// Use the storage driver's optimized export format
    pub optimized: bool,
    /// Export from a temporary snapshot instead of the live resource
    pub snapshot: bool,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            optimized: false,
            snapshot: true,
        }
    }
}

/// Summary of one stored snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct BackupResult {
    #[serde(flatten)]
    pub key: ResourceKey,
    pub timestamp: Timestamp,
    pub bytes: u64,
    pub duration_secs: u64,
}

impl fmt::Display for BackupResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Backed up {} at {} ({} in {})",
            self.key,
            self.timestamp,
            format_bytes(self.bytes),
            format_duration(self.duration_secs)
        )
    }
}

fn json_array<T: Serialize>(items: &[T]) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(items)?;
    bytes.push(b'\n');
    Ok(bytes)
}

impl Executor {
    /// Store projects, profiles, networks and storage pools as one config
    /// snapshot.
    pub async fn backup_config(&self) -> Result<Option<BackupResult>> {
        self.check_cancelled()?;
        if self.safety.dry_run {
            self.say(format!(
                "Would back up config (projects, profiles, networks, storage pools) to {}",
                self.backend.describe()
            ));
            return Ok(None);
        }
        self.prepare().await?;

        let started = Instant::now();
        let created_at = Utc::now();
        let timestamp = Timestamp::from_datetime(created_at);
        let key = ResourceKey::config();

        let mut projects = self.host.list_projects().await?;
        projects.sort_by(|a, b| a.name.cmp(&b.name));
        let mut profiles = self.host.list_profiles().await?;
        profiles.sort_by(|a, b| a.name.cmp(&b.name));
        let mut networks = self.host.list_networks().await?;
        networks.sort_by(|a, b| a.name.cmp(&b.name));
        let mut pools = self.host.list_storage_pools().await?;
        pools.sort_by(|a, b| a.name.cmp(&b.name));

        let items = [
            (Part::Projects, json_array(&projects)?),
            (Part::Profiles, json_array(&profiles)?),
            (Part::Networks, json_array(&networks)?),
            (Part::StoragePools, json_array(&pools)?),
        ];

        let mut checksums = ChecksumSet::new();
        let mut bytes = 0u64;
        for (part, payload) in items {
            bytes += payload.len() as u64;
            let address = PartAddress::new(&key, &timestamp, part);
            self.write_bytes(address, ExportOptions::default(), payload, &mut checksums)
                .await?;
        }

        let manifest = Manifest::for_config(created_at, &Part::CONFIG_ITEMS);
        self.finish_snapshot(&key, &timestamp, &manifest, ExportOptions::default(), checksums)
            .await?;

        info!(
            timestamp = %timestamp,
            projects = projects.len(),
            profiles = profiles.len(),
            networks = networks.len(),
            storage_pools = pools.len(),
            "Config backup stored"
        );
        let result = BackupResult {
            key,
            timestamp,
            bytes,
            duration_secs: started.elapsed().as_secs(),
        };
        self.say(result.to_string());
        Ok(Some(result))
    }

    /// Back up instances of `project` one at a time, in name order. An
    /// empty `names` selects every instance of the project.
    pub async fn backup_instances(
        &self,
        project: &str,
        names: &[String],
        options: BackupOptions,
    ) -> Result<Vec<BackupResult>> {
        let mut names = if names.is_empty() {
            self.host
                .list_instances(project)
                .await?
                .into_iter()
                .map(|instance| instance.name)
                .collect()
        } else {
            names.to_vec()
        };
        names.sort();
        names.dedup();
        if names.is_empty() {
            self.say(format!("No instances in project {}", project));
            return Ok(Vec::new());
        }

        let total = names.len();
        let mut results = Vec::new();
        for (i, name) in names.iter().enumerate() {
            self.check_cancelled()?;
            let key = ResourceKey::instance(project, name.as_str());
            if self.safety.dry_run {
                self.say(format!("[inst {}/{}] would back up {} to {}", i + 1, total, key, self.backend.describe()));
                continue;
            }
            self.say(format!("[inst {}/{}] {}", i + 1, total, name));
            let result = self.backup_resource(key, options).await?;
            self.say(result.to_string());
            results.push(result);
        }
        Ok(results)
    }

    /// Back up custom volumes given as `POOL/NAME`. An empty `volumes`
    /// selects every custom volume of the project.
    pub async fn backup_volumes(
        &self,
        project: &str,
        volumes: &[String],
        options: BackupOptions,
    ) -> Result<Vec<BackupResult>> {
        let mut refs = if volumes.is_empty() {
            self.host
                .list_custom_volumes(project)
                .await?
                .into_iter()
                .map(|volume| (volume.pool, volume.name))
                .collect()
        } else {
            volumes
                .iter()
                .map(|value| parse_volume_ref(value))
                .collect::<Result<Vec<_>>>()?
        };
        refs.sort();
        refs.dedup();
        if refs.is_empty() {
            self.say(format!("No custom volumes in project {}", project));
            return Ok(Vec::new());
        }

        let total = refs.len();
        let mut results = Vec::new();
        for (i, (pool, name)) in refs.iter().enumerate() {
            self.check_cancelled()?;
            let key = ResourceKey::volume(project, pool.as_str(), name.as_str());
            if self.safety.dry_run {
                self.say(format!("[vol {}/{}] would back up {} to {}", i + 1, total, key, self.backend.describe()));
                continue;
            }
            self.say(format!("[vol {}/{}] {}/{}", i + 1, total, pool, name));
            let result = self.backup_resource(key, options).await?;
            self.say(result.to_string());
            results.push(result);
        }
        Ok(results)
    }

    /// Config, then volumes, then instances.
    pub async fn backup_all(&self, project: &str, options: BackupOptions) -> Result<Vec<BackupResult>> {
        let mut results = Vec::new();
        results.extend(self.backup_config().await?);
        results.extend(self.backup_volumes(project, &[], options).await?);
        results.extend(self.backup_instances(project, &[], options).await?);
        Ok(results)
    }

    /// Export one instance or volume: data, then manifest, then checksums.
    async fn backup_resource(&self, key: ResourceKey, options: BackupOptions) -> Result<BackupResult> {
        self.prepare().await?;

        let started = Instant::now();
        let created_at = Utc::now();
        let timestamp = Timestamp::from_datetime(created_at);
        let export = ExportOptions {
            snapshot: options.snapshot,
            optimized: options.optimized,
        };

        let snapshot_name = export
            .snapshot
            .then(|| format!("{}{}", TEMP_SNAPSHOT_PREFIX, timestamp));
        if let Some(snapshot) = &snapshot_name {
            self.create_temp_snapshot(&key, snapshot).await?;
        }

        let exported = self.export_data(&key, &timestamp, export, snapshot_name.as_deref()).await;

        if let Some(snapshot) = &snapshot_name {
            if let Err(e) = self.delete_temp_snapshot(&key, snapshot).await {
                warn!(resource = %key, snapshot = %snapshot, error = %e, "Failed to delete temporary snapshot");
            }
        }
        let (bytes, checksums) = exported?;

        let manifest = Manifest::for_resource(&key, created_at, export);
        self.finish_snapshot(&key, &timestamp, &manifest, export, checksums)
            .await?;

        info!(resource = %key, timestamp = %timestamp, bytes, "Backup stored");
        Ok(BackupResult {
            key,
            timestamp,
            bytes,
            duration_secs: started.elapsed().as_secs(),
        })
    }

    async fn export_data(
        &self,
        key: &ResourceKey,
        timestamp: &Timestamp,
        options: ExportOptions,
        snapshot: Option<&str>,
    ) -> Result<(u64, ChecksumSet)> {
        let stream = match key.kind {
            Kind::Instance => {
                self.host
                    .export_instance(&key.project, &key.name, options.optimized, snapshot)
                    .await?
            }
            Kind::Volume => {
                self.host
                    .export_volume(&key.project, &key.pool, &key.name, options.optimized, snapshot)
                    .await?
            }
            other => {
                return Err(BackupError::Config(format!("{} snapshots carry no export", other)));
            }
        };

        let address = PartAddress::new(key, timestamp, Part::Data);
        let file_name = address.file_name()?;
        let progress = self
            .settings
            .progress_for(&format!("export {}", key.name), stream.size);
        let written = self
            .backend
            .write_part(&address, options, stream.reader, progress)
            .await?;

        let mut checksums = ChecksumSet::new();
        checksums.push(written.digest, file_name);
        Ok((written.bytes, checksums))
    }

    async fn create_temp_snapshot(&self, key: &ResourceKey, snapshot: &str) -> Result<()> {
        match key.kind {
            Kind::Volume => {
                self.host
                    .create_volume_snapshot(&key.project, &key.pool, &key.name, snapshot)
                    .await
            }
            _ => {
                self.host
                    .create_instance_snapshot(&key.project, &key.name, snapshot)
                    .await
            }
        }
    }

    async fn delete_temp_snapshot(&self, key: &ResourceKey, snapshot: &str) -> Result<()> {
        match key.kind {
            Kind::Volume => {
                self.host
                    .delete_volume_snapshot(&key.project, &key.pool, &key.name, snapshot)
                    .await
            }
            _ => {
                self.host
                    .delete_instance_snapshot(&key.project, &key.name, snapshot)
                    .await
            }
        }
    }
}
