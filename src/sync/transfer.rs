//! Transfer worker: copies one work item from the catalog into the object
//! store, exactly once, and records the result in the ledger.
//!
//! Ordinary failures never escape [`TransferWorker::transfer`]; they are
//! classified, written to the ledger as FAILED, and returned as a
//! [`TransferOutcome`] so the orchestrator can keep going.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures_util::StreamExt;

use crate::catalog::gopro::SOURCE_VARIANT;
use crate::catalog::{CatalogError, OpenedStream, RemoteCatalog, ResolvedLocator, WorkItem};
use crate::ledger::{ClaimRequest, ClaimResult, Completion, LedgerError, SyncLedger, SyncStatus};
use crate::metrics::{self, MetricsSink, Unit};
use crate::retry::{retry_with_backoff, RetryAction, RetryConfig};
use crate::store::{ObjectAttributes, ObjectStore, PartReceipt, StoreError, UploadSession};

use super::error::TransferError;
use super::keys::{self, Occupant};
use super::types::{TransferOutcome, TransferStatus};

/// Ledger note for items whose source vanished before they were copied.
pub const NOTE_SOURCE_DELETED: &str = "source_deleted";

/// Ledger note for items that were already in the store when we got there.
pub const NOTE_ALREADY_PRESENT: &str = "already_present";

const MIB: u64 = 1024 * 1024;

/// Subset of application config consumed by the transfer worker.
/// Decoupled from CLI parsing so the worker can be tested independently.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Items this size or larger (or of unknown size) use multipart upload.
    pub(crate) multipart_threshold: u64,
    pub(crate) chunk_size: usize,
    /// Variant names in order of preference. Variants not listed are never used.
    pub(crate) preferred_variants: Vec<String>,
    pub(crate) storage_class: String,
    /// How long an IN_PROGRESS record blocks other workers. Renewed before
    /// every store write, so this only needs to outlast one put or part.
    pub(crate) in_progress_lease: Duration,
    pub(crate) retry: RetryConfig,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            multipart_threshold: 100 * MIB,
            chunk_size: (100 * MIB) as usize,
            preferred_variants: vec![
                SOURCE_VARIANT.to_string(),
                "high_res_proxy_mp4".to_string(),
                "edit_proxy".to_string(),
            ],
            storage_class: "STANDARD".to_string(),
            in_progress_lease: Duration::from_secs(2 * 60 * 60),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStrategy {
    SingleShot,
    Multipart,
}

impl UploadStrategy {
    /// Unknown sizes (0) go multipart since they cannot be bounded up front.
    pub fn select(expected_size: u64, threshold: u64) -> Self {
        if expected_size == 0 || expected_size >= threshold {
            Self::Multipart
        } else {
            Self::SingleShot
        }
    }
}

/// Where the idempotency guard says the object should go.
enum KeyChoice {
    Write(String),
    Present { key: String, size: u64 },
}

fn classify_catalog(e: &CatalogError) -> RetryAction {
    if e.is_retryable() {
        RetryAction::Retry
    } else {
        RetryAction::Abort
    }
}

fn classify_store(e: &StoreError) -> RetryAction {
    if e.is_retryable() {
        RetryAction::Retry
    } else {
        RetryAction::Abort
    }
}

/// Keep only the preferred variants, in preference order.
fn order_variants(locators: &[ResolvedLocator], preferred: &[String]) -> Vec<ResolvedLocator> {
    preferred
        .iter()
        .filter_map(|name| locators.iter().find(|l| &l.variant == name).cloned())
        .collect()
}

/// Bytes written must match the advertised size, when there is one.
fn verify_size(expected: u64, content_length: Option<u64>, actual: u64) -> Result<(), TransferError> {
    if expected > 0 && actual != expected {
        return Err(TransferError::SizeMismatch { expected, actual });
    }
    match content_length {
        Some(length) if actual < length => Err(TransferError::Truncated {
            expected: length,
            actual,
        }),
        Some(length) if actual > length => Err(TransferError::SizeMismatch {
            expected: length,
            actual,
        }),
        _ => Ok(()),
    }
}

fn throughput_mbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        (bytes as f64 * 8.0) / 1_000_000.0 / secs
    } else {
        0.0
    }
}

/// Aborts the multipart session when dropped while still armed, so a worker
/// future cancelled mid-upload does not leave staged parts behind.
struct MultipartGuard {
    store: Arc<dyn ObjectStore>,
    session: UploadSession,
    armed: bool,
}

impl MultipartGuard {
    fn new(store: Arc<dyn ObjectStore>, session: UploadSession) -> Self {
        Self {
            store,
            session,
            armed: true,
        }
    }

    fn session(&self) -> &UploadSession {
        &self.session
    }

    fn disarm(mut self) {
        self.armed = false;
    }

    async fn abort(mut self) {
        self.armed = false;
        match self.store.abort_multipart(&self.session).await {
            Ok(()) => tracing::debug!(
                key = %self.session.key,
                upload_id = %self.session.upload_id,
                "Aborted multipart upload"
            ),
            Err(e) => tracing::warn!(
                key = %self.session.key,
                upload_id = %self.session.upload_id,
                "Failed to abort multipart upload: {}",
                e
            ),
        }
    }
}

impl Drop for MultipartGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let store = Arc::clone(&self.store);
        let session = self.session.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = store.abort_multipart(&session).await {
                        tracing::warn!(
                            upload_id = %session.upload_id,
                            "Failed to abort abandoned multipart upload: {}",
                            e
                        );
                    }
                });
            }
            Err(_) => tracing::warn!(
                upload_id = %self.session.upload_id,
                "No runtime to abort abandoned multipart upload"
            ),
        }
    }
}

pub struct TransferWorker {
    catalog: Arc<dyn RemoteCatalog>,
    ledger: Arc<dyn SyncLedger>,
    store: Arc<dyn ObjectStore>,
    metrics: Arc<dyn MetricsSink>,
    config: TransferConfig,
}

impl TransferWorker {
    pub fn new(
        catalog: Arc<dyn RemoteCatalog>,
        ledger: Arc<dyn SyncLedger>,
        store: Arc<dyn ObjectStore>,
        metrics: Arc<dyn MetricsSink>,
        config: TransferConfig,
    ) -> Self {
        Self {
            catalog,
            ledger,
            store,
            metrics,
            config,
        }
    }

    fn provider(&self) -> &str {
        self.catalog.name()
    }

    /// Transfer one item. Never fails; the outcome says what happened.
    pub async fn transfer(&self, item: &WorkItem) -> TransferOutcome {
        let started = Instant::now();
        match self.try_transfer(item, started).await {
            Ok(outcome) => outcome,
            Err(e) => self.record_failure(item, e, started).await,
        }
    }

    async fn try_transfer(
        &self,
        item: &WorkItem,
        started: Instant,
    ) -> Result<TransferOutcome, TransferError> {
        let request = ClaimRequest {
            provider: self.provider(),
            item_id: &item.item_id,
            source_filename: &item.filename,
            expected_size: item.expected_size,
        };
        match self
            .ledger
            .claim(&request, self.config.in_progress_lease)
            .await?
        {
            ClaimResult::Claimed { retry_count } => {
                if retry_count > 0 {
                    tracing::debug!(item_id = %item.item_id, retry_count, "Retrying previously failed item");
                }
            }
            ClaimResult::AlreadyCompleted(record) => {
                tracing::debug!(item_id = %item.item_id, "Already completed by another run");
                let mut outcome = TransferOutcome::new(item, TransferStatus::Skipped, started.elapsed());
                outcome.destination_key = record.destination_key;
                return Ok(outcome);
            }
            ClaimResult::HeldElsewhere { since } => {
                tracing::info!(item_id = %item.item_id, since = %since, "Item is being transferred elsewhere, skipping");
                return Ok(TransferOutcome::new(item, TransferStatus::Skipped, started.elapsed()));
            }
        }

        let key = match self.choose_key(item).await? {
            KeyChoice::Write(key) => key,
            KeyChoice::Present { key, size } => {
                return self.already_present(item, key, size, started).await;
            }
        };

        let locators = match self.resolve(item).await {
            Ok(locators) => locators,
            Err(TransferError::Catalog(e)) if e.is_not_found() => {
                return self.source_deleted(item, started).await;
            }
            Err(e) => return Err(e),
        };

        let Some((locator, opened)) = self.open_preferred(item, locators).await? else {
            return self.source_deleted(item, started).await;
        };
        self.metrics.record(
            metrics::TIME_TO_FIRST_BYTE,
            opened.time_to_first_byte.as_secs_f64() * 1000.0,
            Unit::Milliseconds,
            &[("provider", self.provider())],
        );

        let attributes = keys::object_attributes(self.provider(), item, &self.config.storage_class);
        let strategy = UploadStrategy::select(item.expected_size, self.config.multipart_threshold);
        tracing::debug!(
            item_id = %item.item_id,
            key = %key,
            variant = %locator.variant,
            expected_size = item.expected_size,
            ?strategy,
            "Starting transfer"
        );
        let written = match strategy {
            UploadStrategy::SingleShot => self.upload_single(item, &key, &attributes, opened).await?,
            UploadStrategy::Multipart => self.upload_multipart(item, &key, &attributes, opened).await?,
        };

        let elapsed = started.elapsed();
        let note = (locator.variant != SOURCE_VARIANT).then(|| format!("variant:{}", locator.variant));
        self.ledger
            .mark_completed(
                self.provider(),
                &item.item_id,
                &Completion {
                    destination_key: Some(key.clone()),
                    bytes_transferred: written,
                    duration_secs: elapsed.as_secs_f64(),
                    throughput_mbps: throughput_mbps(written, elapsed),
                    note,
                },
            )
            .await?;

        let dims = [("provider", self.provider()), ("variant", locator.variant.as_str())];
        self.metrics.record(metrics::ITEM_SYNCED, 1.0, Unit::Count, &dims);
        self.metrics.record(metrics::BYTES_TRANSFERRED, written as f64, Unit::Bytes, &dims);
        self.metrics.record(metrics::TRANSFER_DURATION, elapsed.as_secs_f64(), Unit::Seconds, &dims);

        tracing::debug!(
            item_id = %item.item_id,
            key = %key,
            bytes = written,
            elapsed_ms = elapsed.as_millis() as u64,
            "Transfer completed"
        );

        let mut outcome = TransferOutcome::new(item, TransferStatus::Completed, elapsed);
        outcome.destination_key = Some(key);
        outcome.bytes_transferred = written;
        Ok(outcome)
    }

    /// Check the deterministic key, then the disambiguated one, for an
    /// object already carrying this item's identity.
    async fn choose_key(&self, item: &WorkItem) -> Result<KeyChoice, TransferError> {
        let provider = self.provider();
        let primary = keys::destination_key(provider, &item.filename, item.created_at);
        let head = self.store.head_object(&primary).await?;
        match keys::classify_occupant(head.as_ref(), provider, item) {
            Occupant::Vacant => return Ok(KeyChoice::Write(primary)),
            Occupant::Superseded => {
                tracing::info!(item_id = %item.item_id, key = %primary, "Replacing earlier capture of the same item");
                return Ok(KeyChoice::Write(primary));
            }
            Occupant::ThisItem => {
                let size = head.map_or(0, |h| h.size);
                return Ok(KeyChoice::Present { key: primary, size });
            }
            Occupant::Foreign => {}
        }

        let alternate = keys::disambiguated_key(&primary, &item.item_id);
        let head = self.store.head_object(&alternate).await?;
        match keys::classify_occupant(head.as_ref(), provider, item) {
            Occupant::Vacant | Occupant::Superseded => {
                tracing::warn!(
                    item_id = %item.item_id,
                    "{} holds a different item, writing to {}",
                    primary,
                    alternate
                );
                Ok(KeyChoice::Write(alternate))
            }
            Occupant::ThisItem => {
                let size = head.map_or(0, |h| h.size);
                Ok(KeyChoice::Present {
                    key: alternate,
                    size,
                })
            }
            Occupant::Foreign => Err(TransferError::KeyCollision(primary)),
        }
    }

    async fn resolve(&self, item: &WorkItem) -> Result<Vec<ResolvedLocator>, TransferError> {
        let locators = retry_with_backoff(&self.config.retry, "Resolve download URL", classify_catalog, || {
            self.catalog.resolve(&item.source_locator)
        })
        .await?;
        Ok(locators)
    }

    /// Open the first preferred variant that exists. Returns `None` when every
    /// preferred variant is gone upstream.
    async fn open_preferred(
        &self,
        item: &WorkItem,
        locators: Vec<ResolvedLocator>,
    ) -> Result<Option<(ResolvedLocator, OpenedStream)>, TransferError> {
        let mut candidates = order_variants(&locators, &self.config.preferred_variants);
        if candidates.is_empty() {
            return Err(TransferError::NoVariant {
                offered: locators.into_iter().map(|l| l.variant).collect(),
            });
        }

        if candidates.iter().any(|l| l.is_stale(Utc::now())) {
            tracing::debug!(item_id = %item.item_id, "Download URL expired, re-resolving");
            let fresh = self.resolve(item).await?;
            candidates = order_variants(&fresh, &self.config.preferred_variants);
        }

        let mut remaining = candidates.into_iter().peekable();
        while let Some(locator) = remaining.next() {
            let result = retry_with_backoff(&self.config.retry, "Open source stream", classify_catalog, || {
                self.catalog.open_stream(&locator)
            })
            .await;
            match result {
                Ok(opened) => return Ok(Some((locator, opened))),
                Err(e) if e.is_not_found() => match remaining.peek() {
                    Some(next) => tracing::warn!(
                        item_id = %item.item_id,
                        "Variant {} unavailable, falling back to {}",
                        locator.variant,
                        next.variant
                    ),
                    None => tracing::warn!(
                        item_id = %item.item_id,
                        "Variant {} unavailable, no fallback left",
                        locator.variant
                    ),
                },
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    async fn upload_single(
        &self,
        item: &WorkItem,
        key: &str,
        attributes: &ObjectAttributes,
        opened: OpenedStream,
    ) -> Result<u64, TransferError> {
        let OpenedStream {
            mut stream,
            content_length,
            ..
        } = opened;
        let mut body = BytesMut::with_capacity(usize::try_from(item.expected_size).unwrap_or(0));
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk?);
        }
        let written = body.len() as u64;
        verify_size(item.expected_size, content_length, written)?;

        let body = body.freeze();
        self.renew_lease(item).await?;
        retry_with_backoff(&self.config.retry, "Upload object", classify_store, || {
            self.store.put_object(key, body.clone(), attributes)
        })
        .await?;
        Ok(written)
    }

    async fn upload_multipart(
        &self,
        item: &WorkItem,
        key: &str,
        attributes: &ObjectAttributes,
        opened: OpenedStream,
    ) -> Result<u64, TransferError> {
        let session = retry_with_backoff(&self.config.retry, "Start multipart upload", classify_store, || {
            self.store.create_multipart(key, attributes)
        })
        .await?;
        let guard = MultipartGuard::new(Arc::clone(&self.store), session);

        match self.stream_parts(item, guard.session(), opened).await {
            Ok(written) => {
                guard.disarm();
                Ok(written)
            }
            Err(e) => {
                guard.abort().await;
                Err(e)
            }
        }
    }

    /// Cut the byte stream into `chunk_size` parts, upload them in order,
    /// verify the total and assemble the object.
    async fn stream_parts(
        &self,
        item: &WorkItem,
        session: &UploadSession,
        opened: OpenedStream,
    ) -> Result<u64, TransferError> {
        let OpenedStream {
            mut stream,
            content_length,
            ..
        } = opened;
        let chunk_size = self.config.chunk_size.max(1);
        let mut buffer = BytesMut::new();
        let mut parts: Vec<PartReceipt> = Vec::new();

        while let Some(chunk) = stream.next().await {
            let mut chunk = chunk?;
            while !chunk.is_empty() {
                let take = (chunk_size - buffer.len()).min(chunk.len());
                buffer.extend_from_slice(&chunk.split_to(take));
                if buffer.len() == chunk_size {
                    let part = buffer.split().freeze();
                    self.renew_lease(item).await?;
                    parts.push(self.upload_part(session, parts.len() as u32 + 1, part).await?);
                }
            }
        }
        // An empty source still needs one (empty) part to form an object.
        if !buffer.is_empty() || parts.is_empty() {
            let part = buffer.split().freeze();
            self.renew_lease(item).await?;
            parts.push(self.upload_part(session, parts.len() as u32 + 1, part).await?);
        }

        let written: u64 = parts.iter().map(|p| p.size).sum();
        verify_size(item.expected_size, content_length, written)?;

        retry_with_backoff(&self.config.retry, "Complete multipart upload", classify_store, || {
            self.store.complete_multipart(session, &parts)
        })
        .await?;
        tracing::debug!(
            item_id = %item.item_id,
            parts = parts.len(),
            bytes = written,
            "Multipart upload assembled"
        );
        Ok(written)
    }

    /// Push the IN_PROGRESS lease forward so overlapping runs keep skipping
    /// this item. Fails once the record is no longer ours to write.
    async fn renew_lease(&self, item: &WorkItem) -> Result<(), TransferError> {
        self.ledger.touch(self.provider(), &item.item_id).await?;
        Ok(())
    }

    async fn upload_part(
        &self,
        session: &UploadSession,
        part_number: u32,
        body: Bytes,
    ) -> Result<PartReceipt, StoreError> {
        retry_with_backoff(&self.config.retry, "Upload part", classify_store, || {
            self.store.upload_part(session, part_number, body.clone())
        })
        .await
    }

    async fn already_present(
        &self,
        item: &WorkItem,
        key: String,
        size: u64,
        started: Instant,
    ) -> Result<TransferOutcome, TransferError> {
        tracing::info!(item_id = %item.item_id, key = %key, "Already in the store, skipping transfer");
        self.ledger
            .mark_completed(
                self.provider(),
                &item.item_id,
                &Completion {
                    destination_key: Some(key.clone()),
                    bytes_transferred: size,
                    note: Some(NOTE_ALREADY_PRESENT.to_string()),
                    ..Default::default()
                },
            )
            .await?;
        let mut outcome = TransferOutcome::new(item, TransferStatus::AlreadyPresent, started.elapsed());
        outcome.destination_key = Some(key);
        Ok(outcome)
    }

    async fn source_deleted(
        &self,
        item: &WorkItem,
        started: Instant,
    ) -> Result<TransferOutcome, TransferError> {
        tracing::info!(item_id = %item.item_id, filename = %item.filename, "Source item no longer exists, marking done");
        self.ledger
            .mark_completed(
                self.provider(),
                &item.item_id,
                &Completion {
                    note: Some(NOTE_SOURCE_DELETED.to_string()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(TransferOutcome::new(item, TransferStatus::SourceDeleted, started.elapsed()))
    }

    async fn record_failure(
        &self,
        item: &WorkItem,
        error: TransferError,
        started: Instant,
    ) -> TransferOutcome {
        let class = error.class();
        let message = error.to_string();
        match self
            .ledger
            .mark_failed(self.provider(), &item.item_id, &message)
            .await
        {
            Ok(retry_count) => tracing::debug!(
                item_id = %item.item_id,
                retry_count,
                error_class = class.as_str(),
                "Recorded failure: {}",
                message
            ),
            Err(LedgerError::ConditionFailed {
                found: Some(SyncStatus::Completed),
                ..
            }) => {
                tracing::info!(
                    item_id = %item.item_id,
                    "Completed by another run while this attempt was failing: {}",
                    message
                );
                return TransferOutcome::new(item, TransferStatus::Skipped, started.elapsed());
            }
            Err(e) => tracing::warn!(item_id = %item.item_id, "Could not record failure in ledger: {}", e),
        }
        self.metrics.record(
            metrics::SYNC_FAILURE,
            1.0,
            Unit::Count,
            &[("provider", self.provider()), ("error_type", class.as_str())],
        );

        let mut outcome = TransferOutcome::new(item, TransferStatus::Failed, started.elapsed());
        outcome.error = Some(message);
        outcome.error_class = Some(class);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::fake::{raw_item, FakeCatalog};
    use crate::catalog::{GoProAdapter, ItemAdapter};
    use crate::ledger::{SqliteLedger, SyncRecord, SyncStatus};
    use crate::metrics::RecordingMetrics;
    use crate::store::memory::MemoryObjectStore;
    use crate::sync::error::ErrorClass;
    use std::sync::atomic::Ordering;

    struct Harness {
        catalog: Arc<FakeCatalog>,
        ledger: Arc<SqliteLedger>,
        store: Arc<MemoryObjectStore>,
        metrics: Arc<RecordingMetrics>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                catalog: Arc::new(FakeCatalog::new(vec![])),
                ledger: Arc::new(SqliteLedger::open_in_memory().unwrap()),
                store: Arc::new(MemoryObjectStore::new()),
                metrics: Arc::new(RecordingMetrics::default()),
            }
        }

        fn worker(&self, threshold: u64, chunk_size: usize) -> TransferWorker {
            self.worker_with_lease(threshold, chunk_size, TransferConfig::default().in_progress_lease)
        }

        fn worker_with_lease(&self, threshold: u64, chunk_size: usize, lease: Duration) -> TransferWorker {
            TransferWorker::new(
                self.catalog.clone(),
                self.ledger.clone(),
                self.store.clone(),
                self.metrics.clone(),
                TransferConfig {
                    multipart_threshold: threshold,
                    chunk_size,
                    in_progress_lease: lease,
                    retry: RetryConfig::immediate(2),
                    ..TransferConfig::default()
                },
            )
        }

        async fn status(&self, id: &str) -> Option<SyncRecord> {
            self.ledger.get("gopro", id).await.unwrap()
        }
    }

    fn item(id: &str, size: u64) -> WorkItem {
        GoProAdapter::default()
            .parse(&raw_item(id, &format!("GH01{id}.MP4"), size))
            .unwrap()
    }

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_strategy_boundary() {
        assert_eq!(UploadStrategy::select(99, 100), UploadStrategy::SingleShot);
        assert_eq!(UploadStrategy::select(100, 100), UploadStrategy::Multipart);
        assert_eq!(UploadStrategy::select(101, 100), UploadStrategy::Multipart);
        assert_eq!(UploadStrategy::select(0, 100), UploadStrategy::Multipart);
    }

    #[test]
    fn test_verify_size() {
        assert!(verify_size(10, Some(10), 10).is_ok());
        assert!(verify_size(0, None, 7).is_ok());
        assert!(matches!(
            verify_size(10, None, 9),
            Err(TransferError::SizeMismatch { expected: 10, actual: 9 })
        ));
        assert!(matches!(
            verify_size(0, Some(10), 9),
            Err(TransferError::Truncated { expected: 10, actual: 9 })
        ));
    }

    #[test]
    fn test_order_variants() {
        let locator = |v: &str| ResolvedLocator {
            variant: v.into(),
            url: format!("u/{v}"),
            expires_at: None,
        };
        let offered = vec![locator("edit_proxy"), locator("thumbnail"), locator("source")];
        let preferred: Vec<String> = vec!["source".into(), "high_res_proxy_mp4".into(), "edit_proxy".into()];
        let ordered: Vec<String> = order_variants(&offered, &preferred)
            .into_iter()
            .map(|l| l.variant)
            .collect();
        assert_eq!(ordered, vec!["source", "edit_proxy"]);
    }

    #[test]
    fn test_throughput() {
        assert_eq!(throughput_mbps(1_000_000, Duration::from_secs(8)), 1.0);
        assert_eq!(throughput_mbps(10, Duration::ZERO), 0.0);
    }

    #[tokio::test]
    async fn test_single_shot_transfer() {
        let h = Harness::new();
        let body = content(50);
        h.catalog.add_source("a", &body);
        let work = item("a", 50);

        let outcome = h.worker(100, 16).transfer(&work).await;
        assert_eq!(outcome.status, TransferStatus::Completed);
        assert_eq!(outcome.bytes_transferred, 50);
        let key = outcome.destination_key.unwrap();
        assert_eq!(key, "gopro-videos/2024/03/GH01a.MP4");

        let (stored, attributes) = h.store.object(&key).unwrap();
        assert_eq!(stored.as_ref(), body.as_slice());
        assert_eq!(attributes.tags[keys::TAG_ITEM_ID], "a");
        assert_eq!(MemoryObjectStore::count(&h.store.puts), 1);
        assert_eq!(MemoryObjectStore::count(&h.store.multipart_created), 0);

        let record = h.status("a").await.unwrap();
        assert_eq!(record.status, SyncStatus::Completed);
        assert_eq!(record.destination_key.as_deref(), Some(key.as_str()));
        assert_eq!(record.bytes_transferred, Some(50));
        assert_eq!(h.metrics.sum(metrics::ITEM_SYNCED), 1.0);
        assert_eq!(h.metrics.sum(metrics::BYTES_TRANSFERRED), 50.0);
    }

    #[tokio::test]
    async fn test_threshold_minus_one_is_single_shot() {
        let h = Harness::new();
        h.catalog.add_source("a", &content(63));
        let outcome = h.worker(64, 16).transfer(&item("a", 63)).await;
        assert_eq!(outcome.status, TransferStatus::Completed);
        assert_eq!(MemoryObjectStore::count(&h.store.puts), 1);
        assert_eq!(MemoryObjectStore::count(&h.store.multipart_created), 0);
    }

    #[tokio::test]
    async fn test_threshold_is_multipart() {
        let h = Harness::new();
        let body = content(64);
        h.catalog.add_source("a", &body);
        let outcome = h.worker(64, 16).transfer(&item("a", 64)).await;
        assert_eq!(outcome.status, TransferStatus::Completed);
        assert_eq!(MemoryObjectStore::count(&h.store.puts), 0);
        assert_eq!(MemoryObjectStore::count(&h.store.multipart_completed), 1);
        let (stored, _) = h.store.object(&outcome.destination_key.unwrap()).unwrap();
        assert_eq!(stored.as_ref(), body.as_slice());
        assert_eq!(h.store.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_unknown_size_goes_multipart_and_trusts_transport() {
        let h = Harness::new();
        h.catalog.add_source("a", &content(30));
        let outcome = h.worker(1000, 16).transfer(&item("a", 0)).await;
        assert_eq!(outcome.status, TransferStatus::Completed);
        assert_eq!(outcome.bytes_transferred, 30);
        assert_eq!(MemoryObjectStore::count(&h.store.multipart_completed), 1);
        assert_eq!(h.status("a").await.unwrap().bytes_transferred, Some(30));
    }

    #[tokio::test]
    async fn test_empty_unknown_size_item() {
        let h = Harness::new();
        h.catalog.add_source("a", b"");
        let outcome = h.worker(1000, 16).transfer(&item("a", 0)).await;
        assert_eq!(outcome.status, TransferStatus::Completed);
        assert_eq!(outcome.bytes_transferred, 0);
        assert_eq!(h.store.object(&outcome.destination_key.unwrap()).unwrap().0.len(), 0);
    }

    #[tokio::test]
    async fn test_size_mismatch_fails_single_shot() {
        let h = Harness::new();
        h.catalog.add_source("a", &content(15));
        let outcome = h.worker(100, 16).transfer(&item("a", 20)).await;
        assert_eq!(outcome.status, TransferStatus::Failed);
        assert_eq!(outcome.error_class, Some(ErrorClass::Permanent));
        assert!(h.store.keys().is_empty());

        let record = h.status("a").await.unwrap();
        assert_eq!(record.status, SyncStatus::Failed);
        assert_eq!(record.retry_count, 1);
        assert!(record.last_error.unwrap().contains("Size mismatch"));
        assert_eq!(h.metrics.with_dimension(metrics::SYNC_FAILURE, "error_type", "Permanent"), 1);
    }

    #[tokio::test]
    async fn test_size_mismatch_fails_multipart_and_aborts() {
        let h = Harness::new();
        h.catalog.add_source("a", &content(70));
        let outcome = h.worker(64, 16).transfer(&item("a", 64)).await;
        assert_eq!(outcome.status, TransferStatus::Failed);
        assert!(h.store.keys().is_empty());
        assert_eq!(h.store.open_sessions(), 0);
        assert_eq!(MemoryObjectStore::count(&h.store.aborts), 1);
        assert_eq!(h.status("a").await.unwrap().status, SyncStatus::Failed);
    }

    #[tokio::test]
    async fn test_part_failure_aborts_session() {
        let h = Harness::new();
        h.catalog.add_source("a", &content(64));
        h.store.fail_part(2);
        let outcome = h.worker(32, 16).transfer(&item("a", 64)).await;

        assert_eq!(outcome.status, TransferStatus::Failed);
        assert_eq!(MemoryObjectStore::count(&h.store.aborts), 1);
        assert_eq!(h.store.open_sessions(), 0);
        assert_eq!(MemoryObjectStore::count(&h.store.multipart_completed), 0);
        assert!(h.store.keys().is_empty());
        assert_eq!(h.status("a").await.unwrap().status, SyncStatus::Failed);
    }

    #[tokio::test]
    async fn test_throttled_parts_are_retried() {
        let h = Harness::new();
        h.catalog.add_source("a", &content(64));
        h.store.throttle_parts(2);
        let outcome = h.worker(32, 16).transfer(&item("a", 64)).await;
        assert_eq!(outcome.status, TransferStatus::Completed);
        assert_eq!(MemoryObjectStore::count(&h.store.aborts), 0);
    }

    #[tokio::test]
    async fn test_source_deleted_is_completed() {
        let h = Harness::new();
        h.catalog.delete_item("a");
        let outcome = h.worker(100, 16).transfer(&item("a", 10)).await;
        assert_eq!(outcome.status, TransferStatus::SourceDeleted);
        assert!(outcome.destination_key.is_none());

        let record = h.status("a").await.unwrap();
        assert_eq!(record.status, SyncStatus::Completed);
        assert_eq!(record.note.as_deref(), Some(NOTE_SOURCE_DELETED));
        assert!(h.store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_variant_fallback() {
        let h = Harness::new();
        h.catalog.add_variant("a", "source", None);
        h.catalog.add_variant("a", "high_res_proxy_mp4", Some(&content(12)));
        let outcome = h.worker(100, 16).transfer(&item("a", 0)).await;
        assert_eq!(outcome.status, TransferStatus::Completed);
        assert_eq!(outcome.bytes_transferred, 12);
        assert_eq!(h.catalog.open_calls.load(Ordering::SeqCst), 2);
        let record = h.status("a").await.unwrap();
        assert_eq!(record.note.as_deref(), Some("variant:high_res_proxy_mp4"));
    }

    #[tokio::test]
    async fn test_all_variants_missing_is_source_deleted() {
        let h = Harness::new();
        h.catalog.add_variant("a", "source", None);
        let outcome = h.worker(100, 16).transfer(&item("a", 10)).await;
        assert_eq!(outcome.status, TransferStatus::SourceDeleted);
    }

    #[tokio::test]
    async fn test_no_preferred_variant_is_permanent() {
        let h = Harness::new();
        h.catalog.add_variant("a", "thumbnail", Some(b"x"));
        let outcome = h.worker(100, 16).transfer(&item("a", 1)).await;
        assert_eq!(outcome.status, TransferStatus::Failed);
        assert_eq!(outcome.error_class, Some(ErrorClass::Permanent));
        assert!(outcome.error.unwrap().contains("thumbnail"));
    }

    #[tokio::test]
    async fn test_stale_locator_is_re_resolved() {
        let h = Harness::new();
        h.catalog.add_source("a", &content(10));
        h.catalog.stale_once("a");
        let outcome = h.worker(100, 16).transfer(&item("a", 10)).await;
        assert_eq!(outcome.status, TransferStatus::Completed);
        assert_eq!(h.catalog.resolve_calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.catalog.open_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_second_sequential_transfer_is_no_op() {
        let h = Harness::new();
        h.catalog.add_source("a", &content(10));
        let worker = h.worker(100, 16);
        let work = item("a", 10);

        assert_eq!(worker.transfer(&work).await.status, TransferStatus::Completed);
        // The ledger already says COMPLETED.
        assert_eq!(worker.transfer(&work).await.status, TransferStatus::Skipped);
        assert_eq!(MemoryObjectStore::count(&h.store.puts), 1);
    }

    #[tokio::test]
    async fn test_guard_short_circuits_when_ledger_lost_completion() {
        let h = Harness::new();
        h.catalog.add_source("a", &content(10));
        let worker = h.worker(100, 16);
        let work = item("a", 10);
        worker.transfer(&work).await;

        // Simulate a crash between upload and ledger update.
        let mut record = h.status("a").await.unwrap();
        record.status = SyncStatus::Failed;
        h.ledger.put(&record, None).await.unwrap();

        let outcome = worker.transfer(&work).await;
        assert_eq!(outcome.status, TransferStatus::AlreadyPresent);
        assert_eq!(MemoryObjectStore::count(&h.store.puts), 1);
        assert_eq!(h.store.keys().len(), 1);
        let record = h.status("a").await.unwrap();
        assert_eq!(record.status, SyncStatus::Completed);
        assert_eq!(record.note.as_deref(), Some(NOTE_ALREADY_PRESENT));
    }

    #[tokio::test]
    async fn test_concurrent_transfers_complete_once() {
        let h = Harness::new();
        h.catalog.add_source("a", &content(10));
        h.store.set_write_delay(Duration::from_millis(20));
        let worker = h.worker(100, 16);
        let work = item("a", 10);

        let (first, second) = tokio::join!(worker.transfer(&work), worker.transfer(&work));
        let mut statuses = vec![first.status, second.status];
        statuses.sort_by_key(|s| format!("{s:?}"));
        assert_eq!(statuses, vec![TransferStatus::Completed, TransferStatus::Skipped]);
        assert_eq!(MemoryObjectStore::count(&h.store.puts), 1);
        assert_eq!(h.store.keys().len(), 1);
    }

    #[tokio::test]
    async fn test_long_upload_keeps_its_lease() {
        let h = Harness::new();
        h.catalog.add_source("a", &content(64));
        h.store.set_write_delay(Duration::from_millis(100));
        // Four parts take ~400ms, well past the lease.
        let first = h.worker_with_lease(16, 16, Duration::from_millis(150));
        let second = h.worker_with_lease(16, 16, Duration::from_millis(150));
        let work = item("a", 64);

        let (a, b) = tokio::join!(first.transfer(&work), async {
            tokio::time::sleep(Duration::from_millis(250)).await;
            second.transfer(&work).await
        });
        assert_eq!(a.status, TransferStatus::Completed);
        assert_eq!(b.status, TransferStatus::Skipped);
        assert_eq!(MemoryObjectStore::count(&h.store.multipart_created), 1);
        assert_eq!(MemoryObjectStore::count(&h.store.multipart_completed), 1);
    }

    #[tokio::test]
    async fn test_completed_elsewhere_mid_upload_stops_and_keeps_completion() {
        let h = Harness::new();
        h.catalog.add_source("a", &content(64));
        h.store.set_write_delay(Duration::from_millis(50));
        let worker = h.worker(16, 16);
        let work = item("a", 64);

        let (outcome, ()) = tokio::join!(worker.transfer(&work), async {
            tokio::time::sleep(Duration::from_millis(75)).await;
            let completion = Completion {
                destination_key: Some("gopro-videos/2024/03/GH01a.MP4".into()),
                bytes_transferred: 64,
                ..Default::default()
            };
            h.ledger.mark_completed("gopro", "a", &completion).await.unwrap();
        });

        assert_eq!(outcome.status, TransferStatus::Skipped);
        assert_eq!(MemoryObjectStore::count(&h.store.multipart_completed), 0);
        assert_eq!(MemoryObjectStore::count(&h.store.aborts), 1);
        assert_eq!(h.store.open_sessions(), 0);
        assert_eq!(h.metrics.sum(metrics::SYNC_FAILURE), 0.0);

        let record = h.status("a").await.unwrap();
        assert_eq!(record.status, SyncStatus::Completed);
        assert_eq!(record.retry_count, 0);
        assert!(record.last_error.is_none());
    }

    #[tokio::test]
    async fn test_foreign_object_gets_disambiguated_key() {
        let h = Harness::new();
        h.catalog.add_source("a", &content(10));
        let primary = "gopro-videos/2024/03/GH01a.MP4";
        let other = item("zzz", 10);
        h.store.insert(primary, b"other", keys::object_attributes("gopro", &other, "STANDARD"));

        let outcome = h.worker(100, 16).transfer(&item("a", 10)).await;
        assert_eq!(outcome.status, TransferStatus::Completed);
        assert_eq!(outcome.destination_key.as_deref(), Some("gopro-videos/2024/03/GH01a-a.MP4"));
        assert_eq!(h.store.object(primary).unwrap().0.as_ref(), b"other");
    }

    #[tokio::test]
    async fn test_both_keys_foreign_is_collision() {
        let h = Harness::new();
        h.catalog.add_source("a", &content(10));
        h.store.insert("gopro-videos/2024/03/GH01a.MP4", b"x", ObjectAttributes::default());
        h.store.insert("gopro-videos/2024/03/GH01a-a.MP4", b"y", ObjectAttributes::default());

        let outcome = h.worker(100, 16).transfer(&item("a", 10)).await;
        assert_eq!(outcome.status, TransferStatus::Failed);
        assert_eq!(outcome.error_class, Some(ErrorClass::Permanent));
    }

    #[tokio::test]
    async fn test_dropped_worker_aborts_multipart() {
        let h = Harness::new();
        h.catalog.add_source("a", &content(64));
        h.store.set_write_delay(Duration::from_millis(200));
        let worker = h.worker(16, 16);
        let work = item("a", 64);

        let result = tokio::time::timeout(Duration::from_millis(50), worker.transfer(&work)).await;
        assert!(result.is_err());
        // The guard's abort runs on a spawned task.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(MemoryObjectStore::count(&h.store.aborts), 1);
        assert_eq!(h.store.open_sessions(), 0);
    }
}
