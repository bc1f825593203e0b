use super::{parse_volume_ref, Executor};
use crate::backend::{find_snapshot, open_part};
use crate::model::{Kind, LogicalSnapshot, Manifest, Part, ResourceKey, Timestamp};
use crate::reconcile::{apply_all, ConfigPlans, DesiredConfig};
use crate::utils::errors::{BackupError, Result};
use crate::utils::table;
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    /// Exact snapshot timestamp; newest when absent
    pub version: Option<Timestamp>,
    /// Restore under a different name
    pub target_name: Option<String>,
    /// Delete an existing resource of the same name first
    pub replace: bool,
    /// Leave an existing resource of the same name alone
    pub skip_existing: bool,
}

/// What a restore does to the host for one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreAction {
    Create,
    /// Target exists and neither `--replace` nor `--skip-existing` was given
    Conflict,
    Replace,
    Skip,
}

impl RestoreAction {
    fn decide(exists: bool, options: &RestoreOptions) -> Self {
        match (exists, options.skip_existing, options.replace) {
            (false, _, _) => RestoreAction::Create,
            (true, true, _) => RestoreAction::Skip,
            (true, false, true) => RestoreAction::Replace,
            (true, false, false) => RestoreAction::Conflict,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreAction::Create => "create",
            RestoreAction::Conflict => "conflict",
            RestoreAction::Replace => "replace",
            RestoreAction::Skip => "skip",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    Restored,
    Skipped,
    /// Dry run: nothing changed
    Previewed,
}

/// One row of the `restore all` preview.
struct PlannedRestore {
    snapshot: LogicalSnapshot,
    action: RestoreAction,
}

impl Executor {
    pub async fn restore_instance(&self, project: &str, name: &str, options: &RestoreOptions) -> Result<RestoreOutcome> {
        self.restore_one(ResourceKey::instance(project, name), options).await
    }

    pub async fn restore_volume(
        &self,
        project: &str,
        pool: &str,
        name: &str,
        options: &RestoreOptions,
    ) -> Result<RestoreOutcome> {
        self.restore_one(ResourceKey::volume(project, pool, name), options).await
    }

    /// Restore instances one at a time. An empty `names` selects every
    /// instance of the project that has backups.
    pub async fn restore_instances(
        &self,
        project: &str,
        names: &[String],
        options: &RestoreOptions,
    ) -> Result<Vec<RestoreOutcome>> {
        let keys = if names.is_empty() {
            self.backed_up(Kind::Instance, project).await?
        } else {
            let mut keys: Vec<ResourceKey> = names
                .iter()
                .map(|name| ResourceKey::instance(project, name.as_str()))
                .collect();
            keys.sort();
            keys.dedup();
            keys
        };
        self.restore_batch(keys, options).await
    }

    /// Restore custom volumes given as `POOL/NAME`. An empty `volumes`
    /// selects every volume of the project that has backups.
    pub async fn restore_volumes(
        &self,
        project: &str,
        volumes: &[String],
        options: &RestoreOptions,
    ) -> Result<Vec<RestoreOutcome>> {
        let keys = if volumes.is_empty() {
            self.backed_up(Kind::Volume, project).await?
        } else {
            let mut keys = Vec::new();
            for value in volumes {
                let (pool, name) = parse_volume_ref(value)?;
                keys.push(ResourceKey::volume(project, pool, name));
            }
            keys.sort();
            keys.dedup();
            keys
        };
        self.restore_batch(keys, options).await
    }

    /// Preview the config snapshot against the host and, with `apply`,
    /// reconcile the host after confirmation.
    pub async fn restore_config(&self, version: Option<&Timestamp>, apply: bool) -> Result<ConfigPlans> {
        self.check_cancelled()?;
        let snapshot = find_snapshot(self.backend.as_ref(), &ResourceKey::config(), version).await?;
        let plans = self.plan_config(&snapshot).await?;
        self.say(format!("Config snapshot {} from {}", snapshot.timestamp, self.backend.describe()));
        self.print_plans(&plans);

        if !apply {
            return Ok(plans);
        }
        if plans.is_empty() {
            self.say("Host config already matches the snapshot");
            return Ok(plans);
        }
        if self.safety.dry_run {
            self.say("Dry run: no changes applied");
            return Ok(plans);
        }
        if !self.confirm("Apply config changes?").await? {
            self.say("Aborted");
            return Ok(plans);
        }
        self.apply_config(&plans).await?;
        Ok(plans)
    }

    /// Preview config, volumes and instances of `project`, confirm once,
    /// then restore in that order. Existing resources are replaced once
    /// the restore is confirmed, unless `--skip-existing` is given.
    pub async fn restore_all(&self, project: &str, apply_config: bool, options: &RestoreOptions) -> Result<()> {
        self.check_cancelled()?;

        let config = match find_snapshot(self.backend.as_ref(), &ResourceKey::config(), None).await {
            Ok(snapshot) => Some(snapshot),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        let plans = match &config {
            Some(snapshot) => Some(self.plan_config(snapshot).await?),
            None => None,
        };

        let volumes = self.plan_restores(Kind::Volume, project, options).await?;
        let instances = self.plan_restores(Kind::Instance, project, options).await?;

        let mut rows = Vec::new();
        if let Some(snapshot) = &config {
            let action = if apply_config { "apply" } else { "preview" };
            rows.push(vec![
                action.to_string(),
                "config".to_string(),
                "-".to_string(),
                "-".to_string(),
                "-".to_string(),
                snapshot.timestamp.to_string(),
            ]);
        }
        for planned in volumes.iter().chain(instances.iter()) {
            let key = &planned.snapshot.key;
            rows.push(vec![
                planned.action.as_str().to_string(),
                key.kind.to_string(),
                table::cell(&key.project),
                table::cell(&key.pool),
                table::cell(&key.name),
                planned.snapshot.timestamp.to_string(),
            ]);
        }
        if rows.is_empty() {
            self.say(format!("Nothing to restore for project {} in {}", project, self.backend.describe()));
            return Ok(());
        }
        for line in table::render(&["ACTION", "TYPE", "PROJECT", "POOL", "NAME", "VERSION"], &rows).lines() {
            self.say(line);
        }
        if let Some(plans) = &plans {
            self.print_plans(plans);
        }
        if self.safety.dry_run {
            return Ok(());
        }

        let question = format!(
            "Apply restore for config (apply={}), {} volumes, {} instances?",
            apply_config,
            volumes.len(),
            instances.len()
        );
        if !self.confirm(&question).await? {
            self.say("Aborted");
            return Ok(());
        }

        if apply_config {
            if let Some(plans) = plans.filter(|p| !p.is_empty()) {
                self.apply_config(&plans).await?;
            }
        }
        self.run_planned("vol", &volumes).await?;
        self.run_planned("inst", &instances).await?;
        Ok(())
    }

    async fn restore_one(&self, key: ResourceKey, options: &RestoreOptions) -> Result<RestoreOutcome> {
        self.check_cancelled()?;
        let snapshot = find_snapshot(self.backend.as_ref(), &key, options.version.as_ref()).await?;
        self.read_manifest(&snapshot, key.kind).await?;

        let target = options.target_name.clone().unwrap_or_else(|| key.name.clone());
        let action = RestoreAction::decide(self.target_exists(&key, &target).await?, options);
        let subject = location(&key, &target);

        match action {
            RestoreAction::Skip => {
                self.say(format!("Skipping existing {}", subject));
                return Ok(RestoreOutcome::Skipped);
            }
            _ if self.safety.dry_run => {
                self.say(format!(
                    "Would restore {} from {} ({})",
                    subject,
                    snapshot.timestamp,
                    action.as_str()
                ));
                return Ok(RestoreOutcome::Previewed);
            }
            RestoreAction::Conflict => {
                let question = format!("{} already exists. Replace it?", capitalize(&subject));
                if !self.confirm(&question).await? {
                    return Err(BackupError::Conflict(format!("{} already exists", subject)));
                }
                self.restore_snapshot(&snapshot, &target, RestoreAction::Replace).await?;
            }
            action => self.restore_snapshot(&snapshot, &target, action).await?,
        }
        Ok(RestoreOutcome::Restored)
    }

    async fn restore_batch(&self, keys: Vec<ResourceKey>, options: &RestoreOptions) -> Result<Vec<RestoreOutcome>> {
        if options.target_name.is_some() && keys.len() > 1 {
            return Err(BackupError::Config(
                "--target-name needs exactly one resource".to_string(),
            ));
        }
        if keys.is_empty() {
            self.say(format!("No backups found in {}", self.backend.describe()));
            return Ok(Vec::new());
        }

        let total = keys.len();
        let mut outcomes = Vec::new();
        for (i, key) in keys.into_iter().enumerate() {
            let label = match key.kind {
                Kind::Volume => format!("[vol {}/{}] {}/{}", i + 1, total, key.pool, key.name),
                _ => format!("[inst {}/{}] {}", i + 1, total, key.name),
            };
            self.say(label);
            outcomes.push(self.restore_one(key, options).await?);
        }
        Ok(outcomes)
    }

    /// Replace or create the target from `snapshot`. The data part is
    /// streamed straight into the host import.
    async fn restore_snapshot(&self, snapshot: &LogicalSnapshot, target: &str, action: RestoreAction) -> Result<()> {
        self.check_cancelled()?;
        let key = &snapshot.key;

        if action == RestoreAction::Replace {
            match key.kind {
                Kind::Volume => self.host.delete_volume(&key.project, &key.pool, target).await?,
                _ => {
                    if let Err(e) = self.host.stop_instance(&key.project, target, true).await {
                        warn!(project = %key.project, instance = %target, error = %e, "Stop before replace failed");
                    }
                    self.host.delete_instance(&key.project, target).await?;
                }
            }
        }

        let progress = self.settings.progress_for(&format!("import {}", target), None);
        let data = open_part(self.backend.as_ref(), snapshot, Part::Data, progress).await?;
        match key.kind {
            Kind::Volume => {
                data.consume(|reader| self.host.import_volume(&key.project, &key.pool, target, reader))
                    .await?
            }
            Kind::Instance => {
                data.consume(|reader| self.host.import_instance(&key.project, target, reader))
                    .await?
            }
            other => {
                return Err(BackupError::Config(format!("{} snapshots cannot be imported", other)));
            }
        }

        info!(resource = %key, target = %target, timestamp = %snapshot.timestamp, "Restored");
        self.say(format!("Restored {} from {}", location(key, target), snapshot.timestamp));
        Ok(())
    }

    async fn target_exists(&self, key: &ResourceKey, target: &str) -> Result<bool> {
        match key.kind {
            Kind::Volume => self.host.volume_exists(&key.project, &key.pool, target).await,
            _ => self.host.instance_exists(&key.project, target).await,
        }
    }

    /// Keys of `kind` in `project` that have at least one stored version.
    async fn backed_up(&self, kind: Kind, project: &str) -> Result<Vec<ResourceKey>> {
        let mut keys: Vec<ResourceKey> = self
            .backend
            .list(&[kind])
            .await?
            .into_iter()
            .filter(|entry| entry.key.project == project)
            .map(|entry| entry.key)
            .collect();
        keys.dedup();
        Ok(keys)
    }

    async fn plan_restores(&self, kind: Kind, project: &str, options: &RestoreOptions) -> Result<Vec<PlannedRestore>> {
        let mut planned = Vec::new();
        for key in self.backed_up(kind, project).await? {
            let snapshot = match find_snapshot(self.backend.as_ref(), &key, None).await {
                Ok(snapshot) => snapshot,
                Err(e) if e.is_not_found() => {
                    warn!(resource = %key, "No snapshot found, skipping");
                    continue;
                }
                Err(e) => return Err(e),
            };
            self.read_manifest(&snapshot, kind).await?;
            let exists = self.target_exists(&key, &key.name).await?;
            planned.push(PlannedRestore {
                snapshot,
                action: RestoreAction::decide(exists, options),
            });
        }
        Ok(planned)
    }

    async fn run_planned(&self, label: &str, planned: &[PlannedRestore]) -> Result<()> {
        let total = planned.len();
        for (i, item) in planned.iter().enumerate() {
            let key = &item.snapshot.key;
            let name = match key.kind {
                Kind::Volume => format!("{}/{}", key.pool, key.name),
                _ => key.name.clone(),
            };
            if item.action == RestoreAction::Skip {
                self.say(format!("[{} {}/{}] skip existing {}", label, i + 1, total, name));
                continue;
            }
            self.say(format!("[{} {}/{}] {}", label, i + 1, total, name));
            // conflicts were part of the confirmed preview
            let action = match item.action {
                RestoreAction::Conflict => RestoreAction::Replace,
                action => action,
            };
            self.restore_snapshot(&item.snapshot, &key.name, action).await?;
        }
        Ok(())
    }

    /// Read every config part the manifest declares into a desired state.
    async fn plan_config(&self, snapshot: &LogicalSnapshot) -> Result<ConfigPlans> {
        let manifest = self.read_manifest(snapshot, Kind::Config).await?;
        let desired = self.load_desired(snapshot, &manifest).await?;
        ConfigPlans::build(self.host.as_ref(), &desired).await
    }

    async fn load_desired(&self, snapshot: &LogicalSnapshot, manifest: &Manifest) -> Result<DesiredConfig> {
        let mut parts = manifest.included_parts();
        if parts.is_empty() {
            parts = Part::CONFIG_ITEMS
                .iter()
                .copied()
                .filter(|part| snapshot.part(*part).is_some())
                .collect();
        }

        let mut desired = DesiredConfig::default();
        for part in parts {
            let bytes = open_part(self.backend.as_ref(), snapshot, part, None)
                .await?
                .read_to_end()
                .await?;
            match part {
                Part::Projects => desired.projects = Some(serde_json::from_slice(&bytes)?),
                Part::Profiles => desired.profiles = Some(serde_json::from_slice(&bytes)?),
                Part::Networks => desired.networks = Some(serde_json::from_slice(&bytes)?),
                Part::StoragePools => desired.storage_pools = Some(serde_json::from_slice(&bytes)?),
                _ => {}
            }
        }
        Ok(desired)
    }

    fn print_plans(&self, plans: &ConfigPlans) {
        for line in plans.render().lines() {
            self.say(line);
        }
        for line in plans.counts() {
            self.say(line);
        }
    }

    async fn apply_config(&self, plans: &ConfigPlans) -> Result<()> {
        let out = self.out.clone();
        let mut emit = move |line: String| out(&line);
        apply_all(self.host.as_ref(), plans, self.safety.force, &mut emit).await?;
        Ok(())
    }
}

fn location(key: &ResourceKey, target: &str) -> String {
    match key.kind {
        Kind::Volume => format!("volume {}/{} in project {}", key.pool, target, key.project),
        _ => format!("instance {} in project {}", target, key.project),
    }
}

fn capitalize(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
