//! Discovery walker: one catalog page in, a de-duplicated work list out.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use crate::catalog::{ItemAdapter, RemoteCatalog, WorkItem};
use crate::ledger::{LedgerError, SyncLedger, SyncRecord, SyncStatus};
use crate::metrics::{self, MetricsSink, Unit};
use crate::retry::{self, RetryAction, RetryConfig};

use super::error::DiscoveryError;
use super::types::DiscoveredPage;

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub page_size: u32,
    /// Maximum keys per ledger batch read.
    pub batch_size: usize,
    /// Backoff for ledger reads and for keys the ledger left unprocessed.
    pub ledger_retry: RetryConfig,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            batch_size: 100,
            ledger_retry: RetryConfig {
                max_retries: 3,
                base_delay: std::time::Duration::from_secs(1),
                max_delay: std::time::Duration::from_secs(8),
            },
        }
    }
}

pub struct DiscoveryWalker {
    catalog: Arc<dyn RemoteCatalog>,
    adapter: Arc<dyn ItemAdapter>,
    ledger: Arc<dyn SyncLedger>,
    metrics: Arc<dyn MetricsSink>,
    config: DiscoveryConfig,
}

fn classify_ledger(e: &LedgerError) -> RetryAction {
    if e.is_retryable() {
        RetryAction::Retry
    } else {
        RetryAction::Abort
    }
}

impl DiscoveryWalker {
    pub fn new(
        catalog: Arc<dyn RemoteCatalog>,
        adapter: Arc<dyn ItemAdapter>,
        ledger: Arc<dyn SyncLedger>,
        metrics: Arc<dyn MetricsSink>,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            catalog,
            adapter,
            ledger,
            metrics,
            config,
        }
    }

    pub fn provider(&self) -> &str {
        self.catalog.name()
    }

    /// Fetch one page, drop non-target and malformed items, and keep only
    /// items the ledger does not have as COMPLETED.
    pub async fn discover_page(&self, page: u32) -> Result<DiscoveredPage, DiscoveryError> {
        let provider = self.catalog.name();
        let started = Instant::now();
        let catalog_page = self.catalog.list_page(page, self.config.page_size).await?;
        self.metrics.record(
            metrics::LISTING_DURATION,
            started.elapsed().as_secs_f64(),
            Unit::Seconds,
            &[("provider", provider)],
        );

        let listed = catalog_page.items.len();
        let mut warnings = Vec::new();
        let mut excluded = 0usize;
        let mut seen = HashSet::new();
        let mut candidates: Vec<WorkItem> = Vec::with_capacity(listed);

        for raw in &catalog_page.items {
            let item = match self.adapter.parse(raw) {
                Ok(item) => item,
                Err(warning) => {
                    tracing::warn!(page, "Skipping item: {}", warning);
                    warnings.push(warning);
                    continue;
                }
            };
            if !self.adapter.include(&item) {
                tracing::debug!(item_id = %item.item_id, filename = %item.filename, "Excluded by filter");
                excluded += 1;
                continue;
            }
            // Pages can shift while we walk them; never dispatch an id twice.
            if seen.insert(item.item_id.clone()) {
                candidates.push(item);
            }
        }

        let ids: Vec<String> = candidates.iter().map(|i| i.item_id.clone()).collect();
        let records = self.lookup(provider, &ids).await?;

        let before = candidates.len();
        let work_items: Vec<WorkItem> = candidates
            .into_iter()
            .filter(|item| {
                records
                    .get(&item.item_id)
                    .is_none_or(|record| record.status != SyncStatus::Completed)
            })
            .collect();
        let already_synced = before - work_items.len();

        self.metrics.record(
            metrics::MEDIA_LISTED,
            listed as f64,
            Unit::Count,
            &[("provider", provider)],
        );
        self.metrics.record(
            metrics::NEW_ITEMS_FOUND,
            work_items.len() as f64,
            Unit::Count,
            &[("provider", provider)],
        );
        if !warnings.is_empty() {
            self.metrics.record(
                metrics::STRUCTURAL_WARNINGS,
                warnings.len() as f64,
                Unit::Count,
                &[("provider", provider)],
            );
        }

        tracing::info!(
            page,
            total_pages = catalog_page.pagination.total_pages,
            listed,
            excluded,
            already_synced,
            new = work_items.len(),
            warnings = warnings.len(),
            "Discovered page"
        );

        Ok(DiscoveredPage {
            work_items,
            pagination: catalog_page.pagination,
            listed,
            excluded,
            already_synced,
            warnings,
        })
    }

    /// Batched ledger read, chunked to the batch size limit.
    async fn lookup(
        &self,
        provider: &str,
        ids: &[String],
    ) -> Result<HashMap<String, SyncRecord>, DiscoveryError> {
        let mut records = HashMap::with_capacity(ids.len());
        for chunk in ids.chunks(self.config.batch_size.max(1)) {
            self.lookup_chunk(provider, chunk, &mut records).await?;
        }
        Ok(records)
    }

    async fn lookup_chunk(
        &self,
        provider: &str,
        chunk: &[String],
        records: &mut HashMap<String, SyncRecord>,
    ) -> Result<(), DiscoveryError> {
        let retry_config = &self.config.ledger_retry;
        let mut pending: Vec<String> = chunk.to_vec();
        let mut round = 0u32;

        loop {
            let result = retry::retry_with_backoff(
                retry_config,
                "Ledger batch read",
                classify_ledger,
                || self.ledger.batch_get(provider, &pending),
            )
            .await?;

            records.extend(result.found);
            if result.unprocessed.is_empty() {
                return Ok(());
            }
            if round >= retry_config.max_retries {
                // Treated as "no record": the claim and the idempotency
                // guard stop a second copy if one of these was done.
                tracing::warn!(
                    keys = result.unprocessed.len(),
                    "Ledger left keys unprocessed after {} retries; treating them as new",
                    retry_config.max_retries
                );
                return Ok(());
            }

            let delay = retry_config.delay_for_retry(round);
            tracing::debug!(
                keys = result.unprocessed.len(),
                delay_ms = delay.as_millis() as u64,
                "Retrying unprocessed ledger keys"
            );
            tokio::time::sleep(delay).await;
            pending = result.unprocessed;
            round += 1;
        }
    }
}
