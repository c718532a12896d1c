//! mediasync: copies new media from a cloud provider library into a durable
//! object store, exactly once per item.
//!
//! Each run pages through the provider's catalog, drops items the sync ledger
//! already has as COMPLETED, and streams the rest into the store with bounded
//! concurrency. The ledger is the de-duplication source of truth, so failed
//! items are retried simply by running again.

#![warn(clippy::all)]

mod alert;
mod catalog;
mod cli;
mod config;
mod credentials;
mod ledger;
mod metrics;
pub mod retry;
mod shutdown;
mod store;
mod sync;
mod types;
mod verify;

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use serde_json::json;
use tracing_subscriber::EnvFilter;

use alert::{AlertChannel, AlertEvent, LogAlertChannel, WebhookAlertChannel};
use catalog::{GoProAdapter, GoProCatalog, ItemAdapter, RemoteCatalog};
use cli::Command;
use credentials::{CredentialProvider, FileCredentialProvider};
use ledger::{SqliteLedger, SyncLedger};
use metrics::{MetricsSink, TracingMetrics};
use store::{FsObjectStore, ObjectStore};
use sync::{DiscoveryWalker, RunOutcome, SyncOrchestrator, TransferWorker};
use types::Provider;

const METRICS_NAMESPACE: &str = "MediaSync";

/// Run the status command.
async fn run_status(args: cli::StatusArgs) -> anyhow::Result<()> {
    let ledger_path = config::expand_tilde(&args.ledger.ledger);

    if !ledger_path.exists() {
        println!("No sync ledger found at {}", ledger_path.display());
        println!("Run a sync first to create the ledger.");
        return Ok(());
    }

    let ledger = SqliteLedger::open(&ledger_path).await?;
    let summary = ledger.summary().await?;

    println!("Sync Ledger: {}", ledger_path.display());
    println!();
    println!("Items:");
    println!("  Total:       {}", summary.total);
    println!("  Completed:   {}", summary.completed);
    println!("  Pending:     {}", summary.pending);
    println!("  In progress: {}", summary.in_progress);
    println!("  Failed:      {}", summary.failed);
    println!();

    if let Some(started) = &summary.last_run_started {
        println!(
            "Last run started:   {}",
            started.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    if let Some(completed) = &summary.last_run_completed {
        println!(
            "Last run completed: {}",
            completed.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    if let Some(outcome) = &summary.last_run_outcome {
        println!("Last run outcome:   {}", outcome);
    }

    if args.failed && summary.failed > 0 {
        println!();
        println!("Failed items:");
        for record in ledger.failed_records().await? {
            println!(
                "  {} ({}) - {} [retries: {}]",
                record.source_filename,
                record.item_id,
                record.last_error.as_deref().unwrap_or("unknown error"),
                record.retry_count
            );
        }
    }

    Ok(())
}

/// Run the verify command.
async fn run_verify(args: cli::VerifyArgs) -> anyhow::Result<()> {
    let ledger_path = config::expand_tilde(&args.ledger.ledger);
    let store_dir = config::expand_tilde(&args.store_dir);

    if !ledger_path.exists() {
        println!("No sync ledger found at {}", ledger_path.display());
        println!("Run a sync first to create the ledger.");
        return Ok(());
    }
    if !store_dir.is_dir() {
        anyhow::bail!("Store directory does not exist: {}", store_dir.display());
    }

    let ledger = SqliteLedger::open(&ledger_path).await?;
    let store = FsObjectStore::open(&store_dir).await?;

    println!("Verifying completed items against {}...", store_dir.display());
    println!();

    let report = verify::reconcile(&ledger, &store).await?;
    for problem in &report.problems {
        println!("{}", problem);
    }
    for upload_id in &report.orphaned_uploads {
        println!("ORPHANED UPLOAD: {}", upload_id);
    }

    println!();
    println!("Results:");
    println!("  Verified:         {}", report.verified);
    println!("  Source deleted:   {}", report.source_deleted);
    println!("  Problems:         {}", report.problems.len());
    println!("  Orphaned uploads: {}", report.orphaned_uploads.len());

    if !report.is_clean() {
        std::process::exit(1);
    }

    Ok(())
}

fn build_alerts(webhook: Option<&str>) -> Arc<dyn AlertChannel> {
    match webhook {
        Some(url) => Arc::new(WebhookAlertChannel::new(url)),
        None => Arc::new(LogAlertChannel),
    }
}

fn build_catalog(
    provider: Provider,
    credentials: Arc<dyn CredentialProvider>,
    config: &config::Config,
) -> anyhow::Result<(Arc<dyn RemoteCatalog>, Arc<dyn ItemAdapter>)> {
    match provider {
        Provider::GoPro => {
            let catalog = GoProCatalog::new(credentials, config.api_base_url.clone())?;
            let adapter = GoProAdapter::new(config.include_prefixes.clone());
            Ok((Arc::new(catalog), Arc::new(adapter)))
        }
    }
}

/// Open the ledger, turning failure into a critical alert.
async fn open_ledger(path: &Path, alerts: &dyn AlertChannel) -> Option<Arc<SqliteLedger>> {
    match SqliteLedger::open(path).await {
        Ok(ledger) => {
            tracing::debug!("Sync ledger opened at {}", ledger.path().display());
            Some(Arc::new(ledger))
        }
        Err(e) => {
            tracing::error!("Failed to open sync ledger at {}: {}", path.display(), e);
            alerts.publish(
                AlertEvent::CriticalFailure,
                json!({
                    "reason": format!("sync ledger unavailable: {e}"),
                    "ledger": path.display().to_string(),
                }),
            );
            None
        }
    }
}

/// Run the sync command, once or in watch mode.
async fn run_sync(args: cli::SyncArgs) -> anyhow::Result<()> {
    let config = config::Config::from_args(args)?;
    tracing::info!(
        provider = config.provider.as_str(),
        concurrency = config.concurrency,
        "Starting mediasync"
    );
    tracing::debug!(?config, "Loaded configuration");

    let alerts = build_alerts(config.alert_webhook.as_deref());

    let Some(ledger) = open_ledger(&config.ledger_path, alerts.as_ref()).await else {
        alerts.flush().await;
        std::process::exit(RunOutcome::CriticalFailure.exit_code());
    };
    let ledger: Arc<dyn SyncLedger> = ledger;

    let store = FsObjectStore::open(&config.store_dir).await?;
    tracing::debug!("Object store at {}", store.root().display());
    let store: Arc<dyn ObjectStore> = Arc::new(store);
    let credentials: Arc<dyn CredentialProvider> =
        Arc::new(FileCredentialProvider::new(&config.credentials_path));
    let metrics: Arc<dyn MetricsSink> = Arc::new(TracingMetrics::new(METRICS_NAMESPACE));
    let (catalog, adapter) = build_catalog(config.provider, credentials.clone(), &config)?;

    let walker = DiscoveryWalker::new(
        catalog.clone(),
        adapter,
        ledger.clone(),
        metrics.clone(),
        config.discovery_config(),
    );
    let worker = TransferWorker::new(
        catalog,
        ledger.clone(),
        store,
        metrics,
        config.transfer_config(),
    );
    let orchestrator = SyncOrchestrator::new(
        walker,
        worker,
        ledger,
        credentials,
        alerts.clone(),
        config.orchestrator_config(),
    );

    let shutdown_token = shutdown::install_signal_handler()?;
    let mut last_outcome = RunOutcome::Success;

    loop {
        if shutdown_token.is_cancelled() {
            tracing::info!("Shutdown requested, exiting...");
            break;
        }

        let summary = orchestrator.run(shutdown_token.clone()).await;
        last_outcome = summary.outcome;

        let Some(interval) = config.watch_with_interval else {
            break;
        };
        if shutdown_token.is_cancelled() {
            tracing::info!("Shutdown requested, exiting...");
            break;
        }
        if summary.outcome == RunOutcome::CriticalFailure {
            tracing::warn!("Run failed critically; will try again after the interval");
        }
        tracing::info!("Waiting {} seconds...", interval);
        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_secs(interval)) => {}
            _ = shutdown_token.cancelled() => {
                tracing::info!("Shutdown during wait, exiting...");
                break;
            }
        }
    }

    alerts.flush().await;
    let code = last_outcome.exit_code();
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_filter())),
        )
        .init();

    match cli.command {
        Command::Sync(args) => run_sync(args).await,
        Command::Status(args) => run_status(args).await,
        Command::Verify(args) => run_verify(args).await,
    }
}
