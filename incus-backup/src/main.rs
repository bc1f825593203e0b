//! incus-backup - Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use incus_backup::{cli, config::Config, utils};
use std::process::ExitCode;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Cancel `token` on SIGINT or SIGTERM. Running transfers observe the token
/// and close their pipes.
fn spawn_signal_watcher(token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                tracing::warn!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to listen for SIGTERM: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => tracing::warn!("Received SIGINT (Ctrl+C), cancelling"),
            _ = terminate => tracing::warn!("Received SIGTERM, cancelling"),
        }
        token.cancel();
    });
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = cli::Cli::parse();

    // Load configuration
    let config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::default(),
    }
    .with_env_overrides();

    // Initialize logging
    let log_level = args.log_level.clone().unwrap_or_else(|| config.log.level.clone());
    utils::logger::init(&log_level)?;

    tracing::debug!("incus-backup v{}", env!("CARGO_PKG_VERSION"));

    let cancel = CancellationToken::new();
    spawn_signal_watcher(cancel.clone());

    cli::run(args, config, cancel).await
}
