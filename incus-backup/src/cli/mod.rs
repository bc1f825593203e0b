//! Command line surface.

pub mod render;

use crate::backend::StorageBackend;
use crate::config::Config;
use crate::executor::{BackupOptions, Executor, RestoreOptions};
use crate::host::IncusCli;
use crate::model::{Kind, Timestamp};
use crate::prune::{self, Keep};
use crate::repository::detect;
use crate::safety::{self, SafetyOptions};
use crate::target::{self, Target};
use crate::transfer::progress::console_callback;
use crate::transfer::TransferSettings;
use crate::verify;
use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use render::OutputFormat;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "incus-backup", author, version, about, long_about = None)]
pub struct Cli {
    /// Backup target: dir:/path or restic:<repository>
    #[arg(long, global = true, value_name = "SCHEME:VALUE")]
    pub target: Option<String>,

    /// Show what would happen without changing anything
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Answer yes to every confirmation
    #[arg(short = 'y', long, global = true)]
    pub yes: bool,

    /// Allow destructive config deletions and unsupported restic versions
    #[arg(long, global = true)]
    pub force: bool,

    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Suppress progress output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List stored snapshots
    List {
        /// all, instances, volumes, images or config
        #[arg(default_value = "all")]
        kind: String,
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },
    /// Back up config, instances or volumes
    Backup {
        #[command(subcommand)]
        what: BackupCommand,
    },
    /// Restore from the target
    Restore {
        #[command(subcommand)]
        what: RestoreCommand,
    },
    /// Delete all but the newest versions of every resource
    Prune {
        #[arg(default_value = "all")]
        kind: String,
        /// Versions to keep per resource
        #[arg(long)]
        keep: Option<i64>,
        /// Only delete candidates with this timestamp
        #[arg(long, value_name = "YYYYMMDDThhmmssZ")]
        timestamp: Option<String>,
    },
    /// Check stored files against their checksums
    Verify {
        #[arg(default_value = "all")]
        kind: String,
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },
    /// Show tool and restic versions
    Version,
}

#[derive(Args, Debug, Clone, Copy)]
pub struct ExportArgs {
    /// Use the storage driver's optimized export format
    #[arg(long)]
    pub optimized: bool,
    /// Export the live resource instead of a temporary snapshot
    #[arg(long)]
    pub no_snapshot: bool,
}

impl From<ExportArgs> for BackupOptions {
    fn from(args: ExportArgs) -> Self {
        BackupOptions {
            optimized: args.optimized,
            snapshot: !args.no_snapshot,
        }
    }
}

#[derive(Args, Debug, Clone, Copy)]
pub struct ExistingArgs {
    /// Delete an existing resource of the same name first
    #[arg(long, conflicts_with = "skip_existing")]
    pub replace: bool,
    /// Leave existing resources alone
    #[arg(long)]
    pub skip_existing: bool,
}

#[derive(Subcommand, Debug)]
pub enum BackupCommand {
    /// Config, then every volume, then every instance of the project
    All {
        #[arg(long)]
        project: Option<String>,
        #[command(flatten)]
        export: ExportArgs,
    },
    Config,
    Instances {
        names: Vec<String>,
        #[arg(long)]
        project: Option<String>,
        #[command(flatten)]
        export: ExportArgs,
    },
    Volumes {
        /// POOL/NAME
        volumes: Vec<String>,
        #[arg(long)]
        project: Option<String>,
        #[command(flatten)]
        export: ExportArgs,
    },
}

#[derive(Subcommand, Debug)]
pub enum RestoreCommand {
    /// Config, then volumes, then instances of the project
    All {
        #[arg(long)]
        project: Option<String>,
        /// Also reconcile host config with the newest config snapshot
        #[arg(long)]
        apply_config: bool,
        #[arg(long)]
        skip_existing: bool,
    },
    Config {
        #[arg(long, value_name = "YYYYMMDDThhmmssZ")]
        version: Option<String>,
        /// Apply the plan instead of only previewing it
        #[arg(long)]
        apply: bool,
    },
    Instance {
        name: String,
        #[arg(long)]
        project: Option<String>,
        #[arg(long, value_name = "YYYYMMDDThhmmssZ")]
        version: Option<String>,
        #[arg(long)]
        target_name: Option<String>,
        #[command(flatten)]
        existing: ExistingArgs,
    },
    Instances {
        names: Vec<String>,
        #[arg(long)]
        project: Option<String>,
        #[command(flatten)]
        existing: ExistingArgs,
    },
    Volume {
        /// POOL/NAME
        volume: String,
        #[arg(long)]
        project: Option<String>,
        #[arg(long, value_name = "YYYYMMDDThhmmssZ")]
        version: Option<String>,
        #[arg(long)]
        target_name: Option<String>,
        #[command(flatten)]
        existing: ExistingArgs,
    },
    Volumes {
        volumes: Vec<String>,
        #[arg(long)]
        project: Option<String>,
        #[command(flatten)]
        existing: ExistingArgs,
    },
}

impl Cli {
    pub fn safety(&self) -> SafetyOptions {
        SafetyOptions {
            dry_run: self.dry_run,
            yes: self.yes,
            force: self.force,
        }
    }
}

fn parse_version(value: Option<&str>) -> crate::Result<Option<Timestamp>> {
    value.map(Timestamp::parse).transpose()
}

fn restore_options(version: Option<&str>, target_name: Option<String>, existing: ExistingArgs) -> crate::Result<RestoreOptions> {
    Ok(RestoreOptions {
        version: parse_version(version)?,
        target_name,
        replace: existing.replace,
        skip_existing: existing.skip_existing,
    })
}

/// State shared by every command of one invocation.
struct Session {
    config: Config,
    safety: SafetyOptions,
    settings: TransferSettings,
    target: Option<String>,
    cancel: CancellationToken,
}

impl Session {
    fn target(&self) -> anyhow::Result<Target> {
        let raw = self
            .target
            .as_deref()
            .or(self.config.target.default.as_deref())
            .context("no target given: use --target, [target] default or INCUS_BACKUP_TARGET")?;
        Ok(target::parse(raw)?)
    }

    async fn backend(&self) -> anyhow::Result<Arc<dyn StorageBackend>> {
        let target = self.target()?;
        let backend = target::open_backend(&target, &self.config, &self.settings, self.safety.force, self.cancel.clone())
            .await
            .with_context(|| format!("opening target {}", target))?;
        Ok(backend)
    }

    async fn executor(&self) -> anyhow::Result<Executor> {
        let backend = self.backend().await?;
        let host = Arc::new(IncusCli::new(self.config.host.incus_binary.clone(), self.cancel.clone()));
        Ok(Executor::new(host, backend, self.settings.clone(), self.safety, self.cancel.clone()))
    }

    fn project(&self, flag: Option<String>) -> String {
        flag.unwrap_or_else(|| self.config.host.project.clone())
    }
}

/// Run one parsed command line. Returns the process exit code.
pub async fn run(cli: Cli, config: Config, cancel: CancellationToken) -> anyhow::Result<ExitCode> {
    let mut settings = TransferSettings::from(&config);
    if !cli.quiet {
        settings.progress = Some(console_callback());
    }
    let session = Session {
        safety: cli.safety(),
        target: cli.target.clone(),
        config,
        settings,
        cancel,
    };

    match cli.command {
        Command::List { kind, output } => {
            let kinds = Kind::parse_filter(&kind)?;
            let entries = session.backend().await?.list(&kinds).await?;
            match output {
                OutputFormat::Json => println!("{}", render::json(&entries)?),
                OutputFormat::Table => print!("{}", render::entries(&entries)),
            }
        }
        Command::Backup { what } => backup(&session, what).await?,
        Command::Restore { what } => restore(&session, what).await?,
        Command::Prune { kind, keep, timestamp } => {
            let kinds = Kind::parse_filter(&kind)?;
            let keep = keep
                .or(session.config.prune.keep)
                .context("--keep is required (or set [prune] keep)")?;
            let keep = Keep::new(keep)?;
            let only = parse_version(timestamp.as_deref())?;
            prune_command(&session, &kinds, keep, only.as_ref()).await?;
        }
        Command::Verify { kind, output } => {
            let kinds = Kind::parse_filter(&kind)?;
            let backend = session.backend().await?;
            let reports = verify::verify(backend.as_ref(), &kinds, session.settings.chunk_size).await?;
            match output {
                OutputFormat::Json => println!("{}", render::json(&reports)?),
                OutputFormat::Table => print!("{}", render::verify_reports(&reports)),
            }
            let failed = reports.iter().filter(|r| !r.is_ok()).count();
            if failed > 0 {
                eprintln!("{} of {} snapshots failed verification", failed, reports.len());
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Version => version(&session).await,
    }
    Ok(ExitCode::SUCCESS)
}

async fn backup(session: &Session, what: BackupCommand) -> anyhow::Result<()> {
    let executor = session.executor().await?;
    let results = match what {
        BackupCommand::All { project, export } => {
            executor.backup_all(&session.project(project), export.into()).await?
        }
        BackupCommand::Config => executor.backup_config().await?.into_iter().collect(),
        BackupCommand::Instances { names, project, export } => {
            executor
                .backup_instances(&session.project(project), &names, export.into())
                .await?
        }
        BackupCommand::Volumes { volumes, project, export } => {
            executor
                .backup_volumes(&session.project(project), &volumes, export.into())
                .await?
        }
    };
    if !session.safety.dry_run {
        info!(snapshots = results.len(), target = %executor.backend().describe(), "Backup finished");
    }
    Ok(())
}

async fn restore(session: &Session, what: RestoreCommand) -> anyhow::Result<()> {
    let executor = session.executor().await?;
    match what {
        RestoreCommand::All {
            project,
            apply_config,
            skip_existing,
        } => {
            let options = RestoreOptions {
                skip_existing,
                ..Default::default()
            };
            executor
                .restore_all(&session.project(project), apply_config, &options)
                .await?;
        }
        RestoreCommand::Config { version, apply } => {
            let version = parse_version(version.as_deref())?;
            executor.restore_config(version.as_ref(), apply).await?;
        }
        RestoreCommand::Instance {
            name,
            project,
            version,
            target_name,
            existing,
        } => {
            let options = restore_options(version.as_deref(), target_name, existing)?;
            executor
                .restore_instance(&session.project(project), &name, &options)
                .await?;
        }
        RestoreCommand::Instances { names, project, existing } => {
            let options = restore_options(None, None, existing)?;
            executor
                .restore_instances(&session.project(project), &names, &options)
                .await?;
        }
        RestoreCommand::Volume {
            volume,
            project,
            version,
            target_name,
            existing,
        } => {
            let (pool, name) = crate::executor::parse_volume_ref(&volume)?;
            let options = restore_options(version.as_deref(), target_name, existing)?;
            executor
                .restore_volume(&session.project(project), &pool, &name, &options)
                .await?;
        }
        RestoreCommand::Volumes { volumes, project, existing } => {
            let options = restore_options(None, None, existing)?;
            executor
                .restore_volumes(&session.project(project), &volumes, &options)
                .await?;
        }
    }
    Ok(())
}

async fn prune_command(session: &Session, kinds: &[Kind], keep: Keep, only: Option<&Timestamp>) -> anyhow::Result<()> {
    let backend = session.backend().await?;
    let candidates = prune::plan(backend.as_ref(), kinds, keep, only).await?;
    if candidates.is_empty() {
        println!("Nothing to prune (keep={})", keep.get());
        return Ok(());
    }
    print!("{}", render::prune_candidates(&candidates));
    if session.safety.dry_run {
        return Ok(());
    }

    let question = format!("Delete {} snapshots from {}?", candidates.len(), backend.describe());
    if !safety::confirm(&session.safety, &question).await? {
        println!("Aborted");
        return Ok(());
    }
    let deleted = prune::execute(backend.as_ref(), &candidates).await?;
    println!("Deleted {} snapshots", deleted);
    Ok(())
}

async fn version(session: &Session) {
    println!("incus-backup {}", env!("CARGO_PKG_VERSION"));
    let required = &session.config.restic.required_version;
    match detect::detect(session.config.restic.binary.as_deref(), session.config.version_timeout()).await {
        Ok(binary) => {
            let verdict = if binary.is_compatible(required) {
                "compatible".to_string()
            } else {
                format!("unsupported, requires >= {}", required)
            };
            println!("restic {} ({}) at {}", binary.version, verdict, binary.path.display());
        }
        Err(e) => println!("restic not available: {}", e),
    }
}
