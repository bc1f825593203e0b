//! Host collaborator backed by the `incus` command line client.

use super::{ExportStream, Host, Instance, Network, Profile, Project, StoragePool, Volume};
use crate::process::{self, describe};
use crate::transfer::ByteStream;
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use tempfile::TempPath;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Drives a local or remote incus daemon through its CLI.
pub struct IncusCli {
    binary: PathBuf,
    cancel: CancellationToken,
}

/// An export file that is removed once the reader is dropped.
struct TempExport {
    file: tokio::fs::File,
    _path: TempPath,
}

impl AsyncRead for TempExport {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.file).poll_read(cx, buf)
    }
}

fn is_not_found(text: &str) -> bool {
    text.to_lowercase().contains("not found")
}

/// `path?recursion=1&project=p` style URL for `incus query`.
fn api_url(path: &str, recursion: bool, project: Option<&str>) -> String {
    let mut params = Vec::new();
    if recursion {
        params.push("recursion=1".to_string());
    }
    if let Some(project) = project.filter(|p| !p.is_empty()) {
        params.push(format!("project={}", project));
    }
    if params.is_empty() {
        path.to_string()
    } else {
        format!("{}?{}", path, params.join("&"))
    }
}

impl IncusCli {
    pub fn new(binary: impl Into<PathBuf>, cancel: CancellationToken) -> Self {
        Self {
            binary: binary.into(),
            cancel,
        }
    }

    fn command(&self, args: &[&str], project: Option<&str>) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        if let Some(project) = project.filter(|p| !p.is_empty()) {
            cmd.arg("--project").arg(project);
        }
        cmd
    }

    /// Run to completion and return stdout, mapping a non-zero exit to a
    /// host error carrying stderr.
    async fn run(&self, cmd: Command) -> Result<String> {
        let label = describe(&cmd);
        let finished = process::output(cmd, &self.cancel).await?;
        if !finished.success() {
            return Err(BackupError::Host(format!("{}: {}", label, finished.failure_text())));
        }
        Ok(finished.stdout_text())
    }

    async fn query<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let stdout = self.run(self.command(&["query", url], None)).await?;
        Ok(serde_json::from_str(&stdout)?)
    }

    async fn send(&self, method: &str, url: &str, body: Option<serde_json::Value>) -> Result<()> {
        let data = body.map(|b| b.to_string());
        let mut args = vec!["query", "-X", method];
        if let Some(data) = data.as_deref() {
            args.push("--data");
            args.push(data);
        }
        args.push(url);
        debug!(method = %method, url = %url, "incus api call");
        self.run(self.command(&args, None)).await.map(|_| ())
    }

    async fn exists(&self, url: &str) -> Result<bool> {
        let cmd = self.command(&["query", url], None);
        let label = describe(&cmd);
        let finished = process::output(cmd, &self.cancel).await?;
        if finished.success() {
            return Ok(true);
        }
        let text = finished.failure_text();
        if is_not_found(&text) {
            Ok(false)
        } else {
            Err(BackupError::Host(format!("{}: {}", label, text)))
        }
    }

    /// Run an export command that writes to a private temporary file, then
    /// hand back a stream over that file.
    async fn export_to_temp(&self, mut args: Vec<String>, optimized: bool, project: &str) -> Result<ExportStream> {
        let path = tempfile::Builder::new()
            .prefix("incus-export-")
            .suffix(".tar.xz")
            .tempfile()?
            .into_temp_path();

        args.push(path.to_string_lossy().into_owned());
        args.push("--compression=xz".to_string());
        if optimized {
            args.push("--optimized-storage".to_string());
        }
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(self.command(&args, Some(project))).await?;

        let file = tokio::fs::File::open(&path).await?;
        let size = file.metadata().await?.len();
        Ok(ExportStream {
            reader: Box::new(TempExport { file, _path: path }),
            size: Some(size),
        })
    }

    async fn import_from(&self, args: &[&str], project: &str, mut data: ByteStream) -> Result<()> {
        let cmd = self.command(args, Some(project));
        let label = describe(&cmd);
        let finished = process::feed(cmd, &mut data, &self.cancel).await?;
        if !finished.success() {
            return Err(BackupError::Host(format!("{}: {}", label, finished.failure_text())));
        }
        Ok(())
    }
}

#[derive(serde::Deserialize)]
struct VolumeRecord {
    name: String,
    #[serde(default)]
    content_type: String,
}

#[async_trait]
impl Host for IncusCli {
    async fn list_projects(&self) -> Result<Vec<Project>> {
        self.query(&api_url("/1.0/projects", true, None)).await
    }

    async fn list_profiles(&self) -> Result<Vec<Profile>> {
        self.query(&api_url("/1.0/profiles", true, None)).await
    }

    async fn list_networks(&self) -> Result<Vec<Network>> {
        let networks: Vec<Network> = self.query(&api_url("/1.0/networks", true, None)).await?;
        Ok(networks.into_iter().filter(|n| n.managed).collect())
    }

    async fn list_storage_pools(&self) -> Result<Vec<StoragePool>> {
        self.query(&api_url("/1.0/storage-pools", true, None)).await
    }

    async fn list_instances(&self, project: &str) -> Result<Vec<Instance>> {
        let mut instances: Vec<Instance> = self.query(&api_url("/1.0/instances", true, Some(project))).await?;
        for instance in &mut instances {
            if instance.project.is_empty() {
                instance.project = project.to_string();
            }
        }
        instances.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(instances)
    }

    async fn list_custom_volumes(&self, project: &str) -> Result<Vec<Volume>> {
        let mut volumes = Vec::new();
        for pool in self.list_storage_pools().await? {
            let url = api_url(&format!("/1.0/storage-pools/{}/volumes/custom", pool.name), true, Some(project));
            let records: Vec<VolumeRecord> = self.query(&url).await?;
            // Snapshots of custom volumes are listed as `volume/snapshot`.
            volumes.extend(records.into_iter().filter(|r| !r.name.contains('/')).map(|r| Volume {
                project: project.to_string(),
                pool: pool.name.clone(),
                name: r.name,
                content_type: r.content_type,
            }));
        }
        volumes.sort_by(|a, b| (&a.pool, &a.name).cmp(&(&b.pool, &b.name)));
        Ok(volumes)
    }

    async fn create_project(&self, project: &Project) -> Result<()> {
        let body = json!({ "name": project.name, "description": project.description, "config": project.config });
        self.send("POST", "/1.0/projects", Some(body)).await
    }

    async fn update_project(&self, project: &Project) -> Result<()> {
        let body = json!({ "description": project.description, "config": project.config });
        self.send("PUT", &format!("/1.0/projects/{}", project.name), Some(body)).await
    }

    async fn delete_project(&self, name: &str) -> Result<()> {
        self.send("DELETE", &format!("/1.0/projects/{}", name), None).await
    }

    async fn create_network(&self, network: &Network) -> Result<()> {
        let body = json!({
            "name": network.name,
            "description": network.description,
            "type": network.kind,
            "config": network.config,
        });
        self.send("POST", "/1.0/networks", Some(body)).await
    }

    async fn update_network(&self, network: &Network) -> Result<()> {
        let body = json!({ "description": network.description, "config": network.config });
        self.send("PUT", &format!("/1.0/networks/{}", network.name), Some(body)).await
    }

    async fn delete_network(&self, name: &str) -> Result<()> {
        self.send("DELETE", &format!("/1.0/networks/{}", name), None).await
    }

    async fn create_storage_pool(&self, pool: &StoragePool) -> Result<()> {
        let body = json!({
            "name": pool.name,
            "driver": pool.driver,
            "description": pool.description,
            "config": pool.config,
        });
        self.send("POST", "/1.0/storage-pools", Some(body)).await
    }

    async fn update_storage_pool(&self, pool: &StoragePool) -> Result<()> {
        let body = json!({ "description": pool.description, "config": pool.config });
        self.send("PUT", &format!("/1.0/storage-pools/{}", pool.name), Some(body)).await
    }

    async fn delete_storage_pool(&self, name: &str) -> Result<()> {
        self.send("DELETE", &format!("/1.0/storage-pools/{}", name), None).await
    }

    async fn export_instance(
        &self,
        project: &str,
        name: &str,
        optimized: bool,
        snapshot: Option<&str>,
    ) -> Result<ExportStream> {
        // `incus export` captures the instance with its snapshots; the
        // temporary snapshot only quiesces the source.
        info!(project = %project, instance = %name, snapshot = ?snapshot, "exporting instance");
        self.export_to_temp(vec!["export".into(), name.into()], optimized, project).await
    }

    async fn import_instance(&self, project: &str, target_name: &str, data: ByteStream) -> Result<()> {
        info!(project = %project, instance = %target_name, "importing instance");
        self.import_from(&["import", "/dev/stdin", target_name], project, data).await
    }

    async fn export_volume(
        &self,
        project: &str,
        pool: &str,
        name: &str,
        optimized: bool,
        snapshot: Option<&str>,
    ) -> Result<ExportStream> {
        info!(project = %project, pool = %pool, volume = %name, snapshot = ?snapshot, "exporting volume");
        let args = vec!["storage".into(), "volume".into(), "export".into(), pool.into(), name.into()];
        self.export_to_temp(args, optimized, project).await
    }

    async fn import_volume(&self, project: &str, pool: &str, target_name: &str, data: ByteStream) -> Result<()> {
        info!(project = %project, pool = %pool, volume = %target_name, "importing volume");
        self.import_from(
            &["storage", "volume", "import", pool, "/dev/stdin", target_name],
            project,
            data,
        )
        .await
    }

    async fn create_instance_snapshot(&self, project: &str, name: &str, snapshot: &str) -> Result<()> {
        self.run(self.command(&["snapshot", "create", name, snapshot], Some(project)))
            .await
            .map(|_| ())
    }

    async fn delete_instance_snapshot(&self, project: &str, name: &str, snapshot: &str) -> Result<()> {
        self.run(self.command(&["snapshot", "delete", name, snapshot], Some(project)))
            .await
            .map(|_| ())
    }

    async fn create_volume_snapshot(&self, project: &str, pool: &str, name: &str, snapshot: &str) -> Result<()> {
        let args = ["storage", "volume", "snapshot", "create", pool, name, snapshot];
        self.run(self.command(&args, Some(project))).await.map(|_| ())
    }

    async fn delete_volume_snapshot(&self, project: &str, pool: &str, name: &str, snapshot: &str) -> Result<()> {
        let args = ["storage", "volume", "snapshot", "delete", pool, name, snapshot];
        self.run(self.command(&args, Some(project))).await.map(|_| ())
    }

    async fn instance_exists(&self, project: &str, name: &str) -> Result<bool> {
        self.exists(&api_url(&format!("/1.0/instances/{}", name), false, Some(project)))
            .await
    }

    async fn volume_exists(&self, project: &str, pool: &str, name: &str) -> Result<bool> {
        let path = format!("/1.0/storage-pools/{}/volumes/custom/{}", pool, name);
        self.exists(&api_url(&path, false, Some(project))).await
    }

    async fn stop_instance(&self, project: &str, name: &str, force: bool) -> Result<()> {
        let mut args = vec!["stop", name];
        if force {
            args.push("--force");
        }
        match self.run(self.command(&args, Some(project))).await {
            Err(BackupError::Host(msg)) if msg.contains("already stopped") => Ok(()),
            other => other.map(|_| ()),
        }
    }

    async fn delete_instance(&self, project: &str, name: &str) -> Result<()> {
        info!(project = %project, instance = %name, "deleting instance");
        self.run(self.command(&["delete", name], Some(project))).await.map(|_| ())
    }

    async fn delete_volume(&self, project: &str, pool: &str, name: &str) -> Result<()> {
        info!(project = %project, pool = %pool, volume = %name, "deleting volume");
        self.run(self.command(&["storage", "volume", "delete", pool, name], Some(project)))
            .await
            .map(|_| ())
    }
}
