//! Sync orchestrator: drives discovery page by page, dispatches transfers
//! under a global concurrency bound, and decides how the run ends.
//!
//! The run is an explicit state machine:
//!
//! ```text
//! Start -> DiscoverPage -> (NoNewItems | DispatchTransfers) -> AdvancePage
//!       -> (DiscoverPage | Complete) -> Success | PartialFailure | CriticalFailure
//! ```
//!
//! Discovery is strictly sequential. Page N+1 is discovered as soon as page
//! N's transfers have been dispatched, not when they finish; the semaphore
//! bounds outstanding transfers across pages.

use std::io::IsTerminal;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::alert::{AlertChannel, AlertEvent};
use crate::catalog::{Pagination, WorkItem};
use crate::credentials::CredentialProvider;
use crate::ledger::{RunStats, SyncLedger};
use crate::retry::{retry_with_backoff, RetryAction, RetryConfig};

use super::discovery::DiscoveryWalker;
use super::error::DiscoveryError;
use super::transfer::TransferWorker;
use super::types::{
    DiscoveredPage, FailedItem, PageCursor, RunOutcome, RunSummary, TransferOutcome,
    TransferStatus,
};

/// Subset of application config consumed by the orchestrator.
/// Decoupled from CLI parsing so the engine can be tested independently.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum transfers in flight at once, across all pages.
    pub(crate) concurrency: usize,
    /// Backoff for a whole discovery page; exhaustion ends the run.
    pub(crate) discovery_retry: RetryConfig,
    pub(crate) no_progress_bar: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            discovery_retry: RetryConfig::default(),
            no_progress_bar: false,
        }
    }
}

enum Phase {
    Start,
    DiscoverPage,
    NoNewItems(Pagination),
    DispatchTransfers(DiscoveredPage),
    AdvancePage {
        pagination: Pagination,
        dispatched: usize,
    },
    Complete,
    Critical(String),
}

/// Mutable state of one run. Only the orchestrator loop touches it.
struct RunContext {
    summary: RunSummary,
    cursor: PageCursor,
    run_id: Option<i64>,
    permits: Arc<Semaphore>,
    in_flight: JoinSet<TransferOutcome>,
    pb: ProgressBar,
}

fn create_progress_bar(no_progress_bar: bool) -> ProgressBar {
    if no_progress_bar || !std::io::stdout().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::with_template(
            "[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        )
        .expect("valid template")
        .progress_chars("=> "),
    );
    pb
}

/// Format a duration as a human-readable string (e.g. "1h 23m 45s", "5m 12s", "3s").
pub fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{hours}h {minutes:02}m {seconds:02}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds:02}s")
    } else {
        format!("{seconds}s")
    }
}

/// Format a byte count with binary units (e.g. "1.5 GiB").
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn classify_discovery(e: &DiscoveryError) -> RetryAction {
    if e.is_retryable() {
        RetryAction::Retry
    } else {
        RetryAction::Abort
    }
}

pub struct SyncOrchestrator {
    walker: DiscoveryWalker,
    worker: Arc<TransferWorker>,
    ledger: Arc<dyn SyncLedger>,
    credentials: Arc<dyn CredentialProvider>,
    alerts: Arc<dyn AlertChannel>,
    config: OrchestratorConfig,
}

impl SyncOrchestrator {
    pub fn new(
        walker: DiscoveryWalker,
        worker: TransferWorker,
        ledger: Arc<dyn SyncLedger>,
        credentials: Arc<dyn CredentialProvider>,
        alerts: Arc<dyn AlertChannel>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            walker,
            worker: Arc::new(worker),
            ledger,
            credentials,
            alerts,
            config,
        }
    }

    /// Execute one full run. Always returns a summary; the outcome inside it
    /// says whether the run succeeded.
    pub async fn run(&self, shutdown: CancellationToken) -> RunSummary {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!(
            "sync_run",
            correlation_id = %correlation_id,
            provider = %self.walker.provider()
        );
        self.run_inner(correlation_id, shutdown).instrument(span).await
    }

    async fn run_inner(&self, correlation_id: String, shutdown: CancellationToken) -> RunSummary {
        let started = Instant::now();
        let mut ctx = RunContext {
            summary: RunSummary::new(correlation_id),
            cursor: PageCursor::start(),
            run_id: None,
            permits: Arc::new(Semaphore::new(self.config.concurrency.max(1))),
            in_flight: JoinSet::new(),
            pb: create_progress_bar(self.config.no_progress_bar),
        };
        tracing::info!("Starting sync run");

        let mut phase = Phase::Start;
        let critical_reason = loop {
            phase = match phase {
                Phase::Start => self.start(&mut ctx).await,
                Phase::DiscoverPage => self.discover(&mut ctx, &shutdown).await,
                Phase::NoNewItems(pagination) => {
                    tracing::debug!(page = pagination.current_page, "No new items on page");
                    Phase::AdvancePage {
                        pagination,
                        dispatched: 0,
                    }
                }
                Phase::DispatchTransfers(page) => {
                    let pagination = page.pagination;
                    let dispatched = self.dispatch(&mut ctx, page.work_items, &shutdown).await;
                    Phase::AdvancePage {
                        pagination,
                        dispatched,
                    }
                }
                Phase::AdvancePage {
                    pagination,
                    dispatched,
                } => {
                    if ctx.cursor.advance(&pagination, dispatched) {
                        tracing::debug!(
                            next_page = ctx.cursor.current_page,
                            total_pages = ?ctx.cursor.total_pages,
                            dispatched_so_far = ctx.cursor.items_dispatched_so_far,
                            "Advancing to next page"
                        );
                        Phase::DiscoverPage
                    } else {
                        Phase::Complete
                    }
                }
                Phase::Complete => break None,
                Phase::Critical(reason) => break Some(reason),
            };
        };

        self.drain(&mut ctx).await;
        ctx.pb.finish_and_clear();
        ctx.summary.elapsed = started.elapsed();
        self.finish(ctx, critical_reason).await
    }

    async fn start(&self, ctx: &mut RunContext) -> Phase {
        if let Err(e) = self.credentials.get_valid_credentials().await {
            return Phase::Critical(format!("Credentials unavailable: {e}"));
        }
        match self.ledger.start_run(&ctx.summary.correlation_id).await {
            Ok(run_id) => {
                ctx.run_id = Some(run_id);
                Phase::DiscoverPage
            }
            Err(e) => Phase::Critical(format!("Ledger unavailable: {e}")),
        }
    }

    async fn discover(&self, ctx: &mut RunContext, shutdown: &CancellationToken) -> Phase {
        if shutdown.is_cancelled() {
            ctx.pb.suspend(|| tracing::info!("Shutdown requested, not discovering further pages"));
            ctx.summary.interrupted = true;
            return Phase::Complete;
        }

        let page_number = ctx.cursor.current_page;
        let result = retry_with_backoff(
            &self.config.discovery_retry,
            "Discover page",
            classify_discovery,
            || self.walker.discover_page(page_number),
        )
        .await;

        let page = match result {
            Ok(page) => page,
            Err(e) => return Phase::Critical(format!("Discovery of page {page_number} failed: {e}")),
        };

        ctx.summary.pages += 1;
        ctx.summary.items_listed += page.listed as u64;
        tracing::debug!(
            page = page_number,
            listed = page.listed,
            excluded = page.excluded,
            already_synced = page.already_synced,
            new_items = page.work_items.len(),
            library_items = page.pagination.total_items,
            "Discovered page"
        );
        if !page.warnings.is_empty() {
            ctx.summary.structural_warnings += page.warnings.len() as u64;
            let warnings: Vec<String> = page.warnings.iter().map(ToString::to_string).collect();
            self.alerts.publish(
                AlertEvent::ApiStructureChange,
                json!({
                    "correlation_id": ctx.summary.correlation_id,
                    "provider": self.walker.provider(),
                    "page": page_number,
                    "warnings": warnings,
                }),
            );
        }

        if page.work_items.is_empty() {
            Phase::NoNewItems(page.pagination)
        } else {
            Phase::DispatchTransfers(page)
        }
    }

    /// Hand every item to a transfer task, waiting only for a free slot.
    async fn dispatch(
        &self,
        ctx: &mut RunContext,
        items: Vec<WorkItem>,
        shutdown: &CancellationToken,
    ) -> usize {
        let mut dispatched = 0usize;
        ctx.pb.inc_length(items.len() as u64);

        for item in items {
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    ctx.pb.suspend(|| tracing::info!("Shutdown requested, stopping new transfers"));
                    ctx.summary.interrupted = true;
                    break;
                }
                permit = Arc::clone(&ctx.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let worker = Arc::clone(&self.worker);
            ctx.in_flight.spawn(
                async move {
                    let _permit = permit;
                    let transfer = AssertUnwindSafe(worker.transfer(&item)).catch_unwind().await;
                    transfer.unwrap_or_else(|_| {
                        let mut outcome =
                            TransferOutcome::new(&item, TransferStatus::Failed, Duration::ZERO);
                        outcome.error = Some("transfer task panicked".into());
                        outcome
                    })
                }
                .in_current_span(),
            );
            dispatched += 1;
            ctx.summary.items_dispatched += 1;

            while let Some(joined) = ctx.in_flight.try_join_next() {
                Self::absorb(ctx, joined);
            }
        }
        dispatched
    }

    async fn drain(&self, ctx: &mut RunContext) {
        while let Some(joined) = ctx.in_flight.join_next().await {
            Self::absorb(ctx, joined);
        }
    }

    fn absorb(ctx: &mut RunContext, joined: Result<TransferOutcome, JoinError>) {
        match joined {
            Ok(outcome) => {
                if outcome.status == TransferStatus::Failed {
                    ctx.pb.suspend(|| {
                        tracing::error!(
                            item_id = %outcome.item_id,
                            elapsed_ms = outcome.duration.as_millis() as u64,
                            "Transfer failed: {}: {}",
                            outcome.filename,
                            outcome.error.as_deref().unwrap_or("unknown error")
                        );
                    });
                } else {
                    tracing::debug!(
                        item_id = %outcome.item_id,
                        status = ?outcome.status,
                        elapsed_ms = outcome.duration.as_millis() as u64,
                        "Transfer finished"
                    );
                }
                ctx.pb.set_message(outcome.filename.clone());
                ctx.pb.inc(1);
                ctx.summary.record(outcome);
            }
            Err(e) => {
                ctx.pb.suspend(|| tracing::error!("Transfer task did not finish: {}", e));
                ctx.pb.inc(1);
                ctx.summary.failed.push(FailedItem {
                    item_id: "<unknown>".into(),
                    filename: "<unknown>".into(),
                    reason: e.to_string(),
                });
            }
        }
    }

    async fn finish(&self, mut ctx: RunContext, critical_reason: Option<String>) -> RunSummary {
        let summary = &mut ctx.summary;
        summary.outcome = if critical_reason.is_some() {
            RunOutcome::CriticalFailure
        } else if !summary.failed.is_empty() {
            RunOutcome::PartialFailure
        } else {
            RunOutcome::Success
        };
        summary.critical_reason = critical_reason;

        match summary.outcome {
            RunOutcome::CriticalFailure => {
                let reason = summary.critical_reason.clone().unwrap_or_default();
                tracing::error!("Sync run aborted: {}", reason);
                self.alerts.publish(
                    AlertEvent::CriticalFailure,
                    json!({
                        "correlation_id": summary.correlation_id,
                        "provider": self.walker.provider(),
                        "reason": reason,
                        "pages_completed": summary.pages,
                    }),
                );
            }
            RunOutcome::PartialFailure => {
                let failed: Vec<_> = summary
                    .failed
                    .iter()
                    .map(|f| json!({"item_id": f.item_id, "filename": f.filename, "reason": f.reason}))
                    .collect();
                self.alerts.publish(
                    AlertEvent::PartialFailure,
                    json!({
                        "correlation_id": summary.correlation_id,
                        "provider": self.walker.provider(),
                        "failed_count": failed.len(),
                        "succeeded_count": summary.succeeded(),
                        "failed": failed,
                    }),
                );
            }
            RunOutcome::Success => {}
        }

        if let Some(run_id) = ctx.run_id {
            let stats = RunStats {
                pages: u64::from(summary.pages),
                items_listed: summary.items_listed,
                items_dispatched: summary.items_dispatched,
                items_completed: summary.succeeded(),
                items_failed: summary.failed.len() as u64,
                bytes_transferred: summary.bytes_transferred,
                outcome: summary.outcome.as_str().to_string(),
                interrupted: summary.interrupted,
            };
            if let Err(e) = self.ledger.complete_run(run_id, &stats).await {
                tracing::warn!("Failed to record run completion: {}", e);
            }
        }

        log_summary(summary);
        ctx.summary
    }
}

fn log_summary(summary: &RunSummary) {
    tracing::info!("── Summary ──");
    if summary.interrupted {
        tracing::info!("  Interrupted before all pages were processed");
    }
    tracing::info!(
        "  {} transferred, {} already present, {} deleted upstream, {} skipped, {} failed",
        summary.completed,
        summary.already_present,
        summary.source_deleted,
        summary.skipped,
        summary.failed.len()
    );
    tracing::info!(
        "  {} pages, {} items listed, {} dispatched",
        summary.pages,
        summary.items_listed,
        summary.items_dispatched
    );
    tracing::info!("  {} written", format_bytes(summary.bytes_transferred));
    tracing::info!("  elapsed: {}", format_duration(summary.elapsed));
    tracing::info!("  outcome: {}", summary.outcome);
    for failed in &summary.failed {
        tracing::error!("  failed: {} ({}): {}", failed.filename, failed.item_id, failed.reason);
    }
}
