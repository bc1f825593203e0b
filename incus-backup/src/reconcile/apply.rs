//! Applying plans against the host.
//!
//! Operations are issued one by one in a fixed order and are not rolled
//! back: a failure leaves earlier operations in place, and re-running
//! yields a plan with only the remaining differences.

use super::plan::{Plan, Reconcilable};
use super::ConfigPlans;
use crate::host::Host;
use crate::utils::errors::{BackupError, Result};
use serde::Serialize;
use std::fmt;
use tracing::{info, warn};

/// Line sink for `[storage] create X` style progress output.
pub type Emit<'a> = &'a mut (dyn FnMut(String) + Send);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplySummary {
    pub resource: &'static str,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Deletions left out because they were not allowed
    pub skipped_deletes: usize,
}

impl fmt::Display for ApplySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: created={} updated={} deleted={}",
            self.resource, self.created, self.updated, self.deleted
        )
    }
}

fn failed(op: &'static str, resource: &'static str, name: &str, source: BackupError) -> BackupError {
    BackupError::Apply {
        op,
        resource,
        name: name.to_string(),
        source: Box::new(source),
    }
}

/// Apply one plan: creates, then updates, then deletes when allowed.
pub async fn apply_plan<T: Reconcilable>(
    host: &dyn Host,
    plan: &Plan<T>,
    allow_delete: bool,
    emit: Emit<'_>,
) -> Result<ApplySummary> {
    let mut summary = ApplySummary {
        resource: T::LABEL,
        ..Default::default()
    };

    for item in &plan.to_create {
        emit(format!("{} create {}", T::TAG, item.name()));
        info!(resource = T::RESOURCE, name = %item.name(), "creating");
        T::create(host, item)
            .await
            .map_err(|e| failed("create", T::RESOURCE, item.name(), e))?;
        summary.created += 1;
    }

    for update in &plan.to_update {
        emit(format!("{} update {}", T::TAG, update.name));
        info!(resource = T::RESOURCE, name = %update.name, "updating");
        T::update(host, &update.desired)
            .await
            .map_err(|e| failed("update", T::RESOURCE, &update.name, e))?;
        summary.updated += 1;
    }

    if allow_delete {
        for item in &plan.to_delete {
            emit(format!("{} delete {}", T::TAG, item.name()));
            info!(resource = T::RESOURCE, name = %item.name(), "deleting");
            T::delete(host, item.name())
                .await
                .map_err(|e| failed("delete", T::RESOURCE, item.name(), e))?;
            summary.deleted += 1;
        }
    } else if !plan.to_delete.is_empty() {
        summary.skipped_deletes = plan.to_delete.len();
        warn!(
            resource = T::RESOURCE,
            count = plan.to_delete.len(),
            "leaving resources that are not in the backup; use --force to delete them"
        );
    }

    emit(summary.to_string());
    Ok(summary)
}

/// Apply every plan present, storage pools first, then networks, then
/// projects. Pool and network deletions need `force`.
pub async fn apply_all(host: &dyn Host, plans: &ConfigPlans, force: bool, emit: Emit<'_>) -> Result<Vec<ApplySummary>> {
    let mut summaries = Vec::new();
    if let Some(plan) = &plans.storage_pools {
        summaries.push(apply_plan(host, plan, force, &mut *emit).await?);
    }
    if let Some(plan) = &plans.networks {
        summaries.push(apply_plan(host, plan, force, &mut *emit).await?);
    }
    if let Some(plan) = &plans.projects {
        summaries.push(apply_plan(host, plan, true, &mut *emit).await?);
    }
    Ok(summaries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::fake::FakeHost;
    use crate::host::{ConfigMap, Network, Project, StoragePool};
    use crate::reconcile::build_plan;

    fn project(name: &str) -> Project {
        Project {
            name: name.into(),
            description: String::new(),
            config: ConfigMap::new(),
        }
    }

    fn network(name: &str) -> Network {
        Network {
            name: name.into(),
            description: String::new(),
            managed: true,
            kind: "bridge".into(),
            config: ConfigMap::new(),
        }
    }

    fn pool(name: &str) -> StoragePool {
        StoragePool {
            name: name.into(),
            driver: "dir".into(),
            description: String::new(),
            config: ConfigMap::new(),
        }
    }

    fn seeded() -> FakeHost {
        let host = FakeHost::new();
        {
            let mut state = host.lock();
            state.projects.insert("old".into(), project("old"));
            state.networks.insert("stale0".into(), network("stale0"));
            state.pools.insert("legacy".into(), pool("legacy"));
        }
        host
    }

    async fn plans_for(host: &FakeHost) -> ConfigPlans {
        ConfigPlans {
            storage_pools: Some(build_plan(&host.list_storage_pools().await.unwrap(), &[pool("fast")])),
            networks: Some(build_plan(&host.list_networks().await.unwrap(), &[network("br0")])),
            projects: Some(build_plan(&host.list_projects().await.unwrap(), &[project("web")])),
        }
    }

    #[tokio::test]
    async fn test_apply_order_without_force() {
        let host = seeded();
        let plans = plans_for(&host).await;
        let mut lines = Vec::new();
        let summaries = apply_all(&host, &plans, false, &mut |line: String| lines.push(line)).await.unwrap();

        assert_eq!(
            host.calls(),
            vec![
                "create storage_pool fast",
                "create network br0",
                "create project web",
                "delete project old",
            ]
        );
        assert_eq!(lines[0], "[storage] create fast");
        assert!(lines.contains(&"storage_pools: created=1 updated=0 deleted=0".to_string()));
        assert!(lines.contains(&"projects: created=1 updated=0 deleted=1".to_string()));
        assert_eq!(summaries[0].skipped_deletes, 1);
        assert_eq!(summaries[1].skipped_deletes, 1);
        assert!(host.lock().pools.contains_key("legacy"));
    }

    #[tokio::test]
    async fn test_force_deletes_infrastructure() {
        let host = seeded();
        let plans = plans_for(&host).await;
        let mut lines = Vec::new();
        apply_all(&host, &plans, true, &mut |line: String| lines.push(line)).await.unwrap();

        let calls = host.calls();
        assert!(calls.contains(&"delete storage_pool legacy".to_string()));
        assert!(calls.contains(&"delete network stale0".to_string()));
        assert!(lines.contains(&"[networks] delete stale0".to_string()));
    }

    #[tokio::test]
    async fn test_failure_keeps_earlier_operations() {
        let host = seeded();
        host.fail_on("create network");
        let plans = plans_for(&host).await;
        let mut lines = Vec::new();
        let err = apply_all(&host, &plans, false, &mut |line: String| lines.push(line)).await.unwrap_err();

        assert_eq!(err.to_string(), "Failed to create network 'br0': Host error: injected failure: create network br0");
        assert!(host.lock().pools.contains_key("fast"));
        assert!(!host.lock().projects.contains_key("web"));

        // a second run only has the remaining work
        host.lock().fail_on = None;
        let again = plans_for(&host).await;
        assert!(again.storage_pools.as_ref().unwrap().to_create.is_empty());
        assert_eq!(again.networks.as_ref().unwrap().to_create.len(), 1);
    }
}
