//! Create/update/delete diffs between live and backed-up declarative config.

use crate::host::{ConfigMap, Host, Network, Project, StoragePool};
use crate::utils::errors::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// A declarative resource type the engine can diff and apply.
#[async_trait]
pub trait Reconcilable: Clone + Serialize + Send + Sync + 'static {
    /// Singular name used in errors, e.g. `storage pool`
    const RESOURCE: &'static str;
    /// Prefix of apply lines, e.g. `[storage]`
    const TAG: &'static str;
    /// Plural key used in summaries and JSON output
    const LABEL: &'static str;

    fn name(&self) -> &str;
    fn config(&self) -> &ConfigMap;

    /// Compared as part of the desired state when present.
    fn description(&self) -> Option<&str> {
        None
    }

    /// Attribute the host cannot change in place, as `(field, value)`.
    fn fixed_attribute(&self) -> Option<(&'static str, &str)> {
        None
    }

    async fn create(host: &dyn Host, item: &Self) -> Result<()>;
    async fn update(host: &dyn Host, item: &Self) -> Result<()>;
    async fn delete(host: &dyn Host, name: &str) -> Result<()>;
}

#[async_trait]
impl Reconcilable for Project {
    const RESOURCE: &'static str = "project";
    const TAG: &'static str = "[projects]";
    const LABEL: &'static str = "projects";

    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> &ConfigMap {
        &self.config
    }

    async fn create(host: &dyn Host, item: &Self) -> Result<()> {
        host.create_project(item).await
    }

    async fn update(host: &dyn Host, item: &Self) -> Result<()> {
        host.update_project(item).await
    }

    async fn delete(host: &dyn Host, name: &str) -> Result<()> {
        host.delete_project(name).await
    }
}

#[async_trait]
impl Reconcilable for Network {
    const RESOURCE: &'static str = "network";
    const TAG: &'static str = "[networks]";
    const LABEL: &'static str = "networks";

    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> &ConfigMap {
        &self.config
    }

    fn description(&self) -> Option<&str> {
        Some(&self.description)
    }

    fn fixed_attribute(&self) -> Option<(&'static str, &str)> {
        Some(("type", &self.kind))
    }

    async fn create(host: &dyn Host, item: &Self) -> Result<()> {
        host.create_network(item).await
    }

    async fn update(host: &dyn Host, item: &Self) -> Result<()> {
        host.update_network(item).await
    }

    async fn delete(host: &dyn Host, name: &str) -> Result<()> {
        host.delete_network(name).await
    }
}

#[async_trait]
impl Reconcilable for StoragePool {
    const RESOURCE: &'static str = "storage pool";
    const TAG: &'static str = "[storage]";
    const LABEL: &'static str = "storage_pools";

    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> &ConfigMap {
        &self.config
    }

    fn description(&self) -> Option<&str> {
        Some(&self.description)
    }

    fn fixed_attribute(&self) -> Option<(&'static str, &str)> {
        Some(("driver", &self.driver))
    }

    async fn create(host: &dyn Host, item: &Self) -> Result<()> {
        host.create_storage_pool(item).await
    }

    async fn update(host: &dyn Host, item: &Self) -> Result<()> {
        host.update_storage_pool(item).await
    }

    async fn delete(host: &dyn Host, name: &str) -> Result<()> {
        host.delete_storage_pool(name).await
    }
}

/// An item present on both sides with a differing desired state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Update<T> {
    pub name: String,
    pub current: T,
    pub desired: T,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan<T> {
    pub to_create: Vec<T>,
    pub to_update: Vec<Update<T>>,
    pub to_delete: Vec<T>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl<T> Default for Plan<T> {
    fn default() -> Self {
        Self {
            to_create: Vec::new(),
            to_update: Vec::new(),
            to_delete: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

/// Maps from the host decode `null` to empty, so plain map equality gives
/// nil/empty equivalence while a missing key still differs from `""`.
fn same_state<T: Reconcilable>(current: &T, desired: &T) -> bool {
    current.config() == desired.config()
        && current.description() == desired.description()
        && current.fixed_attribute() == desired.fixed_attribute()
}

/// Diff `current` against `desired`. Every list is sorted by name.
pub fn build_plan<T: Reconcilable>(current: &[T], desired: &[T]) -> Plan<T> {
    let current: BTreeMap<&str, &T> = current.iter().map(|item| (item.name(), item)).collect();
    let desired: BTreeMap<&str, &T> = desired.iter().map(|item| (item.name(), item)).collect();
    let mut plan = Plan::default();

    for (name, want) in &desired {
        match current.get(name) {
            None => plan.to_create.push((*want).clone()),
            Some(have) if !same_state(*have, *want) => {
                if let (Some((field, from)), Some((_, to))) = (have.fixed_attribute(), want.fixed_attribute()) {
                    if from != to {
                        plan.warnings.push(format!(
                            "{} '{}': {} change {} -> {} cannot be applied in place; recreate it manually",
                            T::RESOURCE,
                            name,
                            field,
                            from,
                            to
                        ));
                    }
                }
                plan.to_update.push(Update {
                    name: name.to_string(),
                    current: (*have).clone(),
                    desired: (*want).clone(),
                });
            }
            Some(_) => {}
        }
    }

    for (name, have) in &current {
        if !desired.contains_key(name) {
            plan.to_delete.push((*have).clone());
        }
    }

    plan
}

impl<T: Reconcilable> Plan<T> {
    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }

    /// `(action, name)` rows in apply order.
    pub fn rows(&self) -> Vec<(&'static str, String)> {
        let mut rows = Vec::new();
        rows.extend(self.to_create.iter().map(|item| ("create", item.name().to_string())));
        rows.extend(self.to_update.iter().map(|update| ("update", update.name.clone())));
        rows.extend(self.to_delete.iter().map(|item| ("delete", item.name().to_string())));
        rows
    }

    /// Human readable preview block.
    pub fn render(&self, title: &str) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Config preview ({})", title);
        let _ = writeln!(out, "Create: {}", self.to_create.len());
        for item in &self.to_create {
            let _ = writeln!(out, "  + {}", item.name());
        }
        let _ = writeln!(out, "Update: {}", self.to_update.len());
        for update in &self.to_update {
            let _ = writeln!(out, "  ~ {}", update.name);
        }
        let _ = writeln!(out, "Delete: {}", self.to_delete.len());
        for item in &self.to_delete {
            let _ = writeln!(out, "  - {}", item.name());
        }
        for warning in &self.warnings {
            let _ = writeln!(out, "  ! {}", warning);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project(name: &str, config: &[(&str, &str)]) -> Project {
        Project {
            name: name.into(),
            description: String::new(),
            config: config.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    fn network(name: &str, kind: &str, description: &str) -> Network {
        Network {
            name: name.into(),
            description: description.into(),
            managed: true,
            kind: kind.into(),
            config: ConfigMap::new(),
        }
    }

    #[test]
    fn test_projects_plan() {
        let current = vec![project("alpha", &[("a", "1")]), project("beta", &[("b", "2")])];
        let desired = vec![project("gamma", &[("g", "3")]), project("alpha", &[("a", "1"), ("x", "9")])];

        let plan = build_plan(&current, &desired);
        let created: Vec<&str> = plan.to_create.iter().map(|p| p.name.as_str()).collect();
        let updated: Vec<&str> = plan.to_update.iter().map(|u| u.name.as_str()).collect();
        let deleted: Vec<&str> = plan.to_delete.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(created, vec!["gamma"]);
        assert_eq!(updated, vec!["alpha"]);
        assert_eq!(deleted, vec!["beta"]);
        assert_eq!(plan.to_update[0].current.config.len(), 1);
        assert_eq!(plan.to_update[0].desired.config["x"], "9");
        assert!(plan.warnings.is_empty());
    }

    #[test]
    fn test_empty_and_null_config_are_equal() {
        let current: Vec<Project> = vec![serde_json::from_str(r#"{"name":"default","config":null}"#).unwrap()];
        let desired = vec![project("default", &[])];
        assert!(build_plan(&current, &desired).is_empty());
    }

    #[test]
    fn test_missing_key_differs_from_empty_value() {
        let current = vec![project("p", &[])];
        let desired = vec![project("p", &[("limits.cpu", "")])];
        assert_eq!(build_plan(&current, &desired).to_update.len(), 1);
    }

    #[test]
    fn test_lists_are_sorted() {
        let desired = vec![project("c", &[]), project("a", &[]), project("b", &[])];
        let plan = build_plan(&[], &desired);
        let names: Vec<&str> = plan.to_create.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_network_type_change_is_update_with_warning() {
        let current = vec![network("br0", "bridge", "lan")];
        let desired = vec![network("br0", "macvlan", "lan")];
        let plan = build_plan(&current, &desired);
        assert_eq!(plan.to_update.len(), 1);
        assert_eq!(plan.warnings.len(), 1);
        assert!(plan.warnings[0].contains("type change bridge -> macvlan"));
    }

    #[test]
    fn test_network_description_is_compared() {
        let current = vec![network("br0", "bridge", "lan")];
        let desired = vec![network("br0", "bridge", "office lan")];
        let plan = build_plan(&current, &desired);
        assert_eq!(plan.to_update.len(), 1);
        assert!(plan.warnings.is_empty());
    }

    #[test]
    fn test_pool_driver_change_warns() {
        let pool = |driver: &str| StoragePool {
            name: "fast".into(),
            driver: driver.into(),
            description: String::new(),
            config: ConfigMap::new(),
        };
        let plan = build_plan(&[pool("zfs")], &[pool("btrfs")]);
        assert_eq!(plan.to_update.len(), 1);
        assert!(plan.warnings[0].contains("driver change zfs -> btrfs"));
    }

    #[test]
    fn test_render_preview() {
        let plan = build_plan(&[project("old", &[])], &[project("new", &[])]);
        let text = plan.render("projects");
        assert!(text.starts_with("Config preview (projects)\n"));
        assert!(text.contains("  + new\n"));
        assert!(text.contains("  - old\n"));
        assert_eq!(plan.rows(), vec![("create", "new".to_string()), ("delete", "old".to_string())]);
    }
}
