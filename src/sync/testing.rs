//! Ledger wrapper that simulates a throttled batch read.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::ledger::types::{BatchGet, LedgerSummary};
use crate::ledger::{
    ClaimRequest, ClaimResult, Completion, LedgerError, RunStats, SqliteLedger, SyncLedger,
    SyncRecord, SyncStatus,
};

/// Delegates to a real ledger, but its first `flaky_reads` batch reads only
/// process the first half of the keys and return the rest as unprocessed.
pub struct FlakyLedger {
    inner: SqliteLedger,
    flaky_reads: AtomicU32,
    batch_sizes: Mutex<Vec<usize>>,
}

impl FlakyLedger {
    pub fn new(inner: SqliteLedger, flaky_reads: u32) -> Self {
        Self {
            inner,
            flaky_reads: AtomicU32::new(flaky_reads),
            batch_sizes: Mutex::new(Vec::new()),
        }
    }

    /// Number of keys passed to each `batch_get` call, in call order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().unwrap().clone()
    }
}

#[async_trait]
impl SyncLedger for FlakyLedger {
    async fn get(&self, provider: &str, item_id: &str) -> Result<Option<SyncRecord>, LedgerError> {
        self.inner.get(provider, item_id).await
    }

    async fn batch_get(
        &self,
        provider: &str,
        item_ids: &[String],
    ) -> Result<BatchGet, LedgerError> {
        self.batch_sizes.lock().unwrap().push(item_ids.len());
        let flaky = self
            .flaky_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !flaky {
            return self.inner.batch_get(provider, item_ids).await;
        }
        let (processed, skipped) = item_ids.split_at(item_ids.len() / 2);
        let mut result = self.inner.batch_get(provider, processed).await?;
        result.unprocessed = skipped.to_vec();
        Ok(result)
    }

    async fn put(
        &self,
        record: &SyncRecord,
        expected_previous: Option<SyncStatus>,
    ) -> Result<(), LedgerError> {
        self.inner.put(record, expected_previous).await
    }

    async fn claim(
        &self,
        request: &ClaimRequest<'_>,
        lease: Duration,
    ) -> Result<ClaimResult, LedgerError> {
        self.inner.claim(request, lease).await
    }

    async fn touch(&self, provider: &str, item_id: &str) -> Result<(), LedgerError> {
        self.inner.touch(provider, item_id).await
    }

    async fn mark_completed(
        &self,
        provider: &str,
        item_id: &str,
        completion: &Completion,
    ) -> Result<(), LedgerError> {
        self.inner.mark_completed(provider, item_id, completion).await
    }

    async fn mark_failed(
        &self,
        provider: &str,
        item_id: &str,
        error: &str,
    ) -> Result<u32, LedgerError> {
        self.inner.mark_failed(provider, item_id, error).await
    }

    async fn failed_records(&self) -> Result<Vec<SyncRecord>, LedgerError> {
        self.inner.failed_records().await
    }

    async fn completed_records(&self) -> Result<Vec<SyncRecord>, LedgerError> {
        self.inner.completed_records().await
    }

    async fn summary(&self) -> Result<LedgerSummary, LedgerError> {
        self.inner.summary().await
    }

    async fn start_run(&self, correlation_id: &str) -> Result<i64, LedgerError> {
        self.inner.start_run(correlation_id).await
    }

    async fn complete_run(&self, run_id: i64, stats: &RunStats) -> Result<(), LedgerError> {
        self.inner.complete_run(run_id, stats).await
    }
}
