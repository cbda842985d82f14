//! # Sync Scheduler Daemon Entry Point

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use syncd::{
    adapters::LoggingAdapterLink, config::ConfigLoader, facade, models::account::LocalAccounts,
    server::run_server, telemetry,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(name = "syncd")]
#[command(about = "System sync scheduler daemon")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler and its request API (default)
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Arc::new(ConfigLoader::new().load().context("loading configuration")?);
    telemetry::init_tracing(&config).context("initializing telemetry")?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
    }
}

async fn serve(config: Arc<syncd::config::AppConfig>) -> anyhow::Result<()> {
    info!(profile = %config.profile, "Starting sync scheduler daemon");
    if let Ok(json) = config.as_json() {
        info!(config = %json, "Loaded configuration");
    }

    let scheduler = facade::start(
        config.clone(),
        Arc::new(LocalAccounts),
        Arc::new(LoggingAdapterLink),
    )
    .context("starting scheduler worker")?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            signal_token.cancel();
        }
    });

    let handle = scheduler.handle();
    run_server(config, handle, shutdown)
        .await
        .map_err(|err| anyhow::anyhow!(err))?;

    // Flush scheduler state before the process exits.
    scheduler.shutdown().await;
    Ok(())
}
