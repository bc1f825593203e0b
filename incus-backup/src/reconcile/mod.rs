//! Declarative config reconciliation for projects, networks and storage
//! pools.
//!
//! A config snapshot is loaded into a [`DesiredConfig`], diffed against the
//! live host into [`ConfigPlans`], previewed, and optionally applied.

pub mod apply;
pub mod plan;

use crate::host::{Host, Network, Profile, Project, StoragePool};
use crate::utils::errors::Result;
use serde::Serialize;

pub use apply::{apply_all, apply_plan, ApplySummary, Emit};
pub use plan::{build_plan, Plan, Reconcilable, Update};

/// Resources read from a config snapshot. A type the snapshot does not
/// declare stays `None` and is left alone on restore.
#[derive(Debug, Clone, Default)]
pub struct DesiredConfig {
    pub projects: Option<Vec<Project>>,
    pub profiles: Option<Vec<Profile>>,
    pub networks: Option<Vec<Network>>,
    pub storage_pools: Option<Vec<StoragePool>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConfigPlans {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_pools: Option<Plan<StoragePool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub networks: Option<Plan<Network>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub projects: Option<Plan<Project>>,
}

impl ConfigPlans {
    /// Diff the live host against `desired`.
    pub async fn build(host: &dyn Host, desired: &DesiredConfig) -> Result<Self> {
        let mut plans = ConfigPlans::default();
        if let Some(pools) = &desired.storage_pools {
            plans.storage_pools = Some(build_plan(&host.list_storage_pools().await?, pools));
        }
        if let Some(networks) = &desired.networks {
            plans.networks = Some(build_plan(&host.list_networks().await?, networks));
        }
        if let Some(projects) = &desired.projects {
            plans.projects = Some(build_plan(&host.list_projects().await?, projects));
        }
        Ok(plans)
    }

    pub fn is_empty(&self) -> bool {
        self.storage_pools.as_ref().map_or(true, Plan::is_empty)
            && self.networks.as_ref().map_or(true, Plan::is_empty)
            && self.projects.as_ref().map_or(true, Plan::is_empty)
    }

    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if let Some(plan) = &self.storage_pools {
            warnings.extend(plan.warnings.iter().cloned());
        }
        if let Some(plan) = &self.networks {
            warnings.extend(plan.warnings.iter().cloned());
        }
        warnings
    }

    /// Preview of every plan, in apply order.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(plan) = &self.storage_pools {
            out.push_str(&plan.render("storage pools"));
        }
        if let Some(plan) = &self.networks {
            out.push_str(&plan.render("networks"));
        }
        if let Some(plan) = &self.projects {
            out.push_str(&plan.render("projects"));
        }
        out
    }

    /// `Storage Pools => Create: 1, Update: 0, Delete: 2` lines.
    pub fn counts(&self) -> Vec<String> {
        fn line<T: Reconcilable>(title: &str, plan: &Plan<T>) -> String {
            format!(
                "{} => Create: {}, Update: {}, Delete: {}",
                title,
                plan.to_create.len(),
                plan.to_update.len(),
                plan.to_delete.len()
            )
        }
        let mut lines = Vec::new();
        if let Some(plan) = &self.storage_pools {
            lines.push(line("Storage Pools", plan));
        }
        if let Some(plan) = &self.networks {
            lines.push(line("Networks", plan));
        }
        if let Some(plan) = &self.projects {
            lines.push(line("Projects", plan));
        }
        lines
    }
}
