//! Virtualization host collaborator.
//!
//! The engines only see the [`Host`] trait. [`incus::IncusCli`] drives the
//! real `incus` client; tests inject [`fake::FakeHost`].

pub mod incus;

#[cfg(test)]
pub mod fake;

use crate::transfer::ByteStream;
use crate::utils::errors::Result;
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

pub use incus::IncusCli;

/// Key/value configuration of a declarative resource.
pub type ConfigMap = BTreeMap<String, String>;

/// A `null` config decodes to an empty map, so absent and empty compare equal.
fn null_as_empty<'de, D, T>(d: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(d)?.unwrap_or_default())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub config: ConfigMap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub config: ConfigMap,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub devices: BTreeMap<String, ConfigMap>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub managed: bool,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub config: ConfigMap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePool {
    pub name: String,
    #[serde(default)]
    pub driver: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub config: ConfigMap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    #[serde(default)]
    pub project: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub pool: String,
    pub name: String,
    #[serde(default)]
    pub content_type: String,
}

/// An export in flight.
pub struct ExportStream {
    pub reader: ByteStream,
    /// Payload size when the host knows it up front
    pub size: Option<u64>,
}

/// Everything the engines need from the virtualization host.
#[async_trait]
pub trait Host: Send + Sync {
    async fn list_projects(&self) -> Result<Vec<Project>>;
    async fn list_profiles(&self) -> Result<Vec<Profile>>;
    async fn list_networks(&self) -> Result<Vec<Network>>;
    async fn list_storage_pools(&self) -> Result<Vec<StoragePool>>;
    async fn list_instances(&self, project: &str) -> Result<Vec<Instance>>;
    async fn list_custom_volumes(&self, project: &str) -> Result<Vec<Volume>>;

    async fn create_project(&self, project: &Project) -> Result<()>;
    async fn update_project(&self, project: &Project) -> Result<()>;
    async fn delete_project(&self, name: &str) -> Result<()>;

    async fn create_network(&self, network: &Network) -> Result<()>;
    async fn update_network(&self, network: &Network) -> Result<()>;
    async fn delete_network(&self, name: &str) -> Result<()>;

    async fn create_storage_pool(&self, pool: &StoragePool) -> Result<()>;
    async fn update_storage_pool(&self, pool: &StoragePool) -> Result<()>;
    async fn delete_storage_pool(&self, name: &str) -> Result<()>;

    async fn export_instance(
        &self,
        project: &str,
        name: &str,
        optimized: bool,
        snapshot: Option<&str>,
    ) -> Result<ExportStream>;
    async fn import_instance(&self, project: &str, target_name: &str, data: ByteStream) -> Result<()>;

    async fn export_volume(
        &self,
        project: &str,
        pool: &str,
        name: &str,
        optimized: bool,
        snapshot: Option<&str>,
    ) -> Result<ExportStream>;
    async fn import_volume(&self, project: &str, pool: &str, target_name: &str, data: ByteStream) -> Result<()>;

    async fn create_instance_snapshot(&self, project: &str, name: &str, snapshot: &str) -> Result<()>;
    async fn delete_instance_snapshot(&self, project: &str, name: &str, snapshot: &str) -> Result<()>;
    async fn create_volume_snapshot(&self, project: &str, pool: &str, name: &str, snapshot: &str) -> Result<()>;
    async fn delete_volume_snapshot(&self, project: &str, pool: &str, name: &str, snapshot: &str) -> Result<()>;

    async fn instance_exists(&self, project: &str, name: &str) -> Result<bool>;
    async fn volume_exists(&self, project: &str, pool: &str, name: &str) -> Result<bool>;
    async fn stop_instance(&self, project: &str, name: &str, force: bool) -> Result<()>;
    async fn delete_instance(&self, project: &str, name: &str) -> Result<()>;
    async fn delete_volume(&self, project: &str, pool: &str, name: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_config_is_empty() {
        let project: Project = serde_json::from_str(r#"{"name":"p","config":null}"#).unwrap();
        assert!(project.config.is_empty());

        let missing: Project = serde_json::from_str(r#"{"name":"p"}"#).unwrap();
        assert_eq!(project, missing);
    }

    #[test]
    fn test_network_api_shape() {
        let net: Network = serde_json::from_str(
            r#"{"name":"br0","description":"lan","managed":true,"type":"bridge","config":{"ipv4.address":"10.0.0.1/24"},"used_by":[]}"#,
        )
        .unwrap();
        assert_eq!(net.kind, "bridge");
        assert!(net.managed);
        assert_eq!(net.config["ipv4.address"], "10.0.0.1/24");
    }
}
