//! plan-sync service
//!
//! Main entry point: resolves the environment, installs the API token, loads
//! configuration and runs the sync jobs until interrupted.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;

use plan_sync::config::{CONFIG_PATH_VAR, DEFAULT_CONFIG_PATH};
use plan_sync::secrets::{install_access_token, EnvSecretStore};
use plan_sync::sheets::SmartsheetClient;
use plan_sync::{logging, Environment, Orchestrator, ResizePolicy, Scheduler, SyncConfig, SyncJob, Trigger};

#[derive(Parser, Debug)]
#[command(name = "plan-sync", about = "Smartsheet plan sheet synchronisation", version)]
struct Args {
    /// --dev|-d|--debug, --staging|-s or --prod|-p (default: dev)
    #[arg(allow_hyphen_values = true)]
    environment: Option<String>,
}

async fn run(env: Environment) -> anyhow::Result<()> {
    let config_path =
        std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    tracing::info!(path = %config_path, environment = %env, "Loading configuration");
    let config = SyncConfig::from_file(&config_path, env)
        .with_context(|| format!("loading {}", config_path))?;

    tracing::info!(
        workspaces = config.workspace_ids.len(),
        index_sheet = config.index_sheet_id,
        push_sheet = config.push_sheet_id,
        interval_secs = config.scheduler.sync_interval_secs,
        "Configuration loaded"
    );

    let client = Arc::new(SmartsheetClient::from_env(&config.client)?);
    let policy = ResizePolicy::from_config(&config.scheduler);
    let interval = Duration::from_secs(config.scheduler.sync_interval_secs);
    let full_sync_at = config.scheduler.full_sync_at;

    let orchestrator = Arc::new(Orchestrator::new(client, config));
    orchestrator
        .initialize()
        .await
        .context("initial discovery")?;

    let mut scheduler = Scheduler::new(policy);
    scheduler.add(
        Arc::new(SyncJob::incremental(orchestrator.clone())),
        Trigger::Interval(interval),
    );
    if let Some(at) = full_sync_at {
        scheduler.add(
            Arc::new(SyncJob::full(orchestrator.clone())),
            Trigger::Daily { at },
        );
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received");
        }
        let _ = shutdown_tx.send(true);
    });

    let outcome = scheduler.run(shutdown_rx).await;
    for stats in scheduler.stats() {
        tracing::info!(
            job = %stats.name,
            runs = stats.runs,
            dropped = stats.dropped,
            "Job summary"
        );
    }
    outcome.context("sync job stopped the scheduler")?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let (env, unknown) = Environment::from_arg(args.environment.as_deref());
    let _log_guard = logging::init(env);

    if let Some(arg) = unknown {
        tracing::warn!(argument = %arg, "Unknown argument; running in dev");
    }
    tracing::info!(environment = %env, "Starting plan-sync");

    if let Err(error) = install_access_token(&EnvSecretStore, env).await {
        tracing::error!(error = %error, "Failed to obtain API token");
        return ExitCode::FAILURE;
    }

    match run(env).await {
        Ok(()) => {
            tracing::info!("plan-sync stopped");
            ExitCode::SUCCESS
        }
        Err(error) => {
            tracing::error!(error = %format!("{:#}", error), "Fatal error");
            ExitCode::FAILURE
        }
    }
}
