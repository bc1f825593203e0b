//! In-memory host used by unit tests.

use super::{ExportStream, Host, Instance, Network, Profile, Project, StoragePool, Volume};
use crate::transfer::ByteStream;
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use tokio::io::AsyncReadExt;

#[derive(Default)]
pub struct FakeState {
    pub projects: BTreeMap<String, Project>,
    pub profiles: BTreeMap<String, Profile>,
    pub networks: BTreeMap<String, Network>,
    pub pools: BTreeMap<String, StoragePool>,
    /// `(project, name) -> export payload`
    pub instances: BTreeMap<(String, String), Vec<u8>>,
    /// `(project, pool, name) -> export payload`
    pub volumes: BTreeMap<(String, String, String), Vec<u8>>,
    pub snapshots: BTreeSet<String>,
    pub stopped: BTreeSet<(String, String)>,
    /// Every mutating call, in order
    pub calls: Vec<String>,
    /// Mutating calls whose log line starts with this prefix fail
    pub fail_on: Option<String>,
}

#[derive(Default)]
pub struct FakeHost {
    pub state: Mutex<FakeState>,
}

fn conflict(resource: &str, name: &str) -> BackupError {
    BackupError::Conflict(format!("{} '{}' already exists", resource, name))
}

fn not_found(resource: &str, name: &str) -> BackupError {
    BackupError::NotFound(format!("{} '{}'", resource, name))
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instance(self, project: &str, name: &str, payload: &[u8]) -> Self {
        self.lock()
            .instances
            .insert((project.to_string(), name.to_string()), payload.to_vec());
        self
    }

    pub fn with_volume(self, project: &str, pool: &str, name: &str, payload: &[u8]) -> Self {
        self.lock()
            .volumes
            .insert((project.to_string(), pool.to_string(), name.to_string()), payload.to_vec());
        self
    }

    pub fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn fail_on(&self, prefix: &str) {
        self.lock().fail_on = Some(prefix.to_string());
    }

    /// Log a mutating call, failing it when it matches `fail_on`.
    fn record(&self, call: String) -> Result<()> {
        let mut state = self.lock();
        if let Some(prefix) = &state.fail_on {
            if call.starts_with(prefix.as_str()) {
                return Err(BackupError::Host(format!("injected failure: {}", call)));
            }
        }
        state.calls.push(call);
        Ok(())
    }
}

async fn read_all(mut data: ByteStream) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    data.read_to_end(&mut out)
        .await
        .map_err(|e| BackupError::Transport(format!("reading import stream: {}", e)))?;
    Ok(out)
}

fn export(payload: Vec<u8>) -> ExportStream {
    let size = payload.len() as u64;
    ExportStream {
        reader: Box::new(std::io::Cursor::new(payload)),
        size: Some(size),
    }
}

#[async_trait]
impl Host for FakeHost {
    async fn list_projects(&self) -> Result<Vec<Project>> {
        Ok(self.lock().projects.values().cloned().collect())
    }

    async fn list_profiles(&self) -> Result<Vec<Profile>> {
        Ok(self.lock().profiles.values().cloned().collect())
    }

    async fn list_networks(&self) -> Result<Vec<Network>> {
        Ok(self.lock().networks.values().filter(|n| n.managed).cloned().collect())
    }

    async fn list_storage_pools(&self) -> Result<Vec<StoragePool>> {
        Ok(self.lock().pools.values().cloned().collect())
    }

    async fn list_instances(&self, project: &str) -> Result<Vec<Instance>> {
        Ok(self
            .lock()
            .instances
            .keys()
            .filter(|(p, _)| p == project)
            .map(|(p, n)| Instance {
                project: p.clone(),
                name: n.clone(),
                kind: "container".into(),
            })
            .collect())
    }

    async fn list_custom_volumes(&self, project: &str) -> Result<Vec<Volume>> {
        Ok(self
            .lock()
            .volumes
            .keys()
            .filter(|(p, _, _)| p == project)
            .map(|(p, pool, n)| Volume {
                project: p.clone(),
                pool: pool.clone(),
                name: n.clone(),
                content_type: "filesystem".into(),
            })
            .collect())
    }

    async fn create_project(&self, project: &Project) -> Result<()> {
        self.record(format!("create project {}", project.name))?;
        let mut state = self.lock();
        if state.projects.contains_key(&project.name) {
            return Err(conflict("project", &project.name));
        }
        state.projects.insert(project.name.clone(), project.clone());
        Ok(())
    }

    async fn update_project(&self, project: &Project) -> Result<()> {
        self.record(format!("update project {}", project.name))?;
        let mut state = self.lock();
        match state.projects.get_mut(&project.name) {
            Some(existing) => {
                *existing = project.clone();
                Ok(())
            }
            None => Err(not_found("project", &project.name)),
        }
    }

    async fn delete_project(&self, name: &str) -> Result<()> {
        self.record(format!("delete project {}", name))?;
        self.lock()
            .projects
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found("project", name))
    }

    async fn create_network(&self, network: &Network) -> Result<()> {
        self.record(format!("create network {}", network.name))?;
        let mut state = self.lock();
        if state.networks.contains_key(&network.name) {
            return Err(conflict("network", &network.name));
        }
        state.networks.insert(network.name.clone(), network.clone());
        Ok(())
    }

    async fn update_network(&self, network: &Network) -> Result<()> {
        self.record(format!("update network {}", network.name))?;
        let mut state = self.lock();
        match state.networks.get_mut(&network.name) {
            Some(existing) => {
                *existing = network.clone();
                Ok(())
            }
            None => Err(not_found("network", &network.name)),
        }
    }

    async fn delete_network(&self, name: &str) -> Result<()> {
        self.record(format!("delete network {}", name))?;
        self.lock()
            .networks
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found("network", name))
    }

    async fn create_storage_pool(&self, pool: &StoragePool) -> Result<()> {
        self.record(format!("create storage_pool {}", pool.name))?;
        let mut state = self.lock();
        if state.pools.contains_key(&pool.name) {
            return Err(conflict("storage pool", &pool.name));
        }
        state.pools.insert(pool.name.clone(), pool.clone());
        Ok(())
    }

    async fn update_storage_pool(&self, pool: &StoragePool) -> Result<()> {
        self.record(format!("update storage_pool {}", pool.name))?;
        let mut state = self.lock();
        match state.pools.get_mut(&pool.name) {
            Some(existing) => {
                *existing = pool.clone();
                Ok(())
            }
            None => Err(not_found("storage pool", &pool.name)),
        }
    }

    async fn delete_storage_pool(&self, name: &str) -> Result<()> {
        self.record(format!("delete storage_pool {}", name))?;
        self.lock()
            .pools
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found("storage pool", name))
    }

    async fn export_instance(
        &self,
        project: &str,
        name: &str,
        _optimized: bool,
        _snapshot: Option<&str>,
    ) -> Result<ExportStream> {
        self.record(format!("export instance {}/{}", project, name))?;
        let payload = self
            .lock()
            .instances
            .get(&(project.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| not_found("instance", name))?;
        Ok(export(payload))
    }

    async fn import_instance(&self, project: &str, target_name: &str, data: ByteStream) -> Result<()> {
        self.record(format!("import instance {}/{}", project, target_name))?;
        let payload = read_all(data).await?;
        let mut state = self.lock();
        let key = (project.to_string(), target_name.to_string());
        if state.instances.contains_key(&key) {
            return Err(conflict("instance", target_name));
        }
        state.instances.insert(key, payload);
        Ok(())
    }

    async fn export_volume(
        &self,
        project: &str,
        pool: &str,
        name: &str,
        _optimized: bool,
        _snapshot: Option<&str>,
    ) -> Result<ExportStream> {
        self.record(format!("export volume {}/{}/{}", project, pool, name))?;
        let payload = self
            .lock()
            .volumes
            .get(&(project.to_string(), pool.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| not_found("volume", name))?;
        Ok(export(payload))
    }

    async fn import_volume(&self, project: &str, pool: &str, target_name: &str, data: ByteStream) -> Result<()> {
        self.record(format!("import volume {}/{}/{}", project, pool, target_name))?;
        let payload = read_all(data).await?;
        let mut state = self.lock();
        let key = (project.to_string(), pool.to_string(), target_name.to_string());
        if state.volumes.contains_key(&key) {
            return Err(conflict("volume", target_name));
        }
        state.volumes.insert(key, payload);
        Ok(())
    }

    async fn create_instance_snapshot(&self, project: &str, name: &str, snapshot: &str) -> Result<()> {
        let id = format!("{}/{}/{}", project, name, snapshot);
        self.record(format!("create snapshot {}", id))?;
        self.lock().snapshots.insert(id);
        Ok(())
    }

    async fn delete_instance_snapshot(&self, project: &str, name: &str, snapshot: &str) -> Result<()> {
        let id = format!("{}/{}/{}", project, name, snapshot);
        self.record(format!("delete snapshot {}", id))?;
        if self.lock().snapshots.remove(&id) {
            Ok(())
        } else {
            Err(not_found("snapshot", &id))
        }
    }

    async fn create_volume_snapshot(&self, project: &str, pool: &str, name: &str, snapshot: &str) -> Result<()> {
        let id = format!("{}/{}/{}/{}", project, pool, name, snapshot);
        self.record(format!("create snapshot {}", id))?;
        self.lock().snapshots.insert(id);
        Ok(())
    }

    async fn delete_volume_snapshot(&self, project: &str, pool: &str, name: &str, snapshot: &str) -> Result<()> {
        let id = format!("{}/{}/{}/{}", project, pool, name, snapshot);
        self.record(format!("delete snapshot {}", id))?;
        if self.lock().snapshots.remove(&id) {
            Ok(())
        } else {
            Err(not_found("snapshot", &id))
        }
    }

    async fn instance_exists(&self, project: &str, name: &str) -> Result<bool> {
        Ok(self
            .lock()
            .instances
            .contains_key(&(project.to_string(), name.to_string())))
    }

    async fn volume_exists(&self, project: &str, pool: &str, name: &str) -> Result<bool> {
        Ok(self
            .lock()
            .volumes
            .contains_key(&(project.to_string(), pool.to_string(), name.to_string())))
    }

    async fn stop_instance(&self, project: &str, name: &str, _force: bool) -> Result<()> {
        self.record(format!("stop instance {}/{}", project, name))?;
        self.lock().stopped.insert((project.to_string(), name.to_string()));
        Ok(())
    }

    async fn delete_instance(&self, project: &str, name: &str) -> Result<()> {
        self.record(format!("delete instance {}/{}", project, name))?;
        self.lock()
            .instances
            .remove(&(project.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| not_found("instance", name))
    }

    async fn delete_volume(&self, project: &str, pool: &str, name: &str) -> Result<()> {
        self.record(format!("delete volume {}/{}/{}", project, pool, name))?;
        self.lock()
            .volumes
            .remove(&(project.to_string(), pool.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| not_found("volume", name))
    }
}
