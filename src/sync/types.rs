//! Data passed between the discovery walker, transfer worker and orchestrator.

use std::time::Duration;

use crate::catalog::{Pagination, SchemaWarning, WorkItem};

use super::error::ErrorClass;

/// Result of discovering one page.
#[derive(Debug, Clone)]
pub struct DiscoveredPage {
    pub work_items: Vec<WorkItem>,
    /// Verbatim from the catalog; authoritative for loop termination.
    pub pagination: Pagination,
    /// Raw items on the page before any filtering.
    pub listed: usize,
    /// Parsed items dropped by the provider's inclusion filter.
    pub excluded: usize,
    /// Items skipped because the ledger already has them COMPLETED.
    pub already_synced: usize,
    pub warnings: Vec<SchemaWarning>,
}

/// Orchestration cursor. Updated only when a page is advanced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageCursor {
    pub current_page: u32,
    /// Unknown until the first page answers.
    pub total_pages: Option<u32>,
    pub items_dispatched_so_far: u64,
}

impl PageCursor {
    pub fn start() -> Self {
        Self {
            current_page: 1,
            total_pages: None,
            items_dispatched_so_far: 0,
        }
    }

    /// Move past the page just discovered. Returns false when it was the last.
    pub fn advance(&mut self, pagination: &Pagination, dispatched: usize) -> bool {
        self.total_pages = Some(pagination.total_pages);
        self.items_dispatched_so_far += dispatched as u64;
        if self.current_page >= pagination.total_pages {
            return false;
        }
        self.current_page += 1;
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Bytes copied and verified.
    Completed,
    /// The idempotency guard found our object already in place.
    AlreadyPresent,
    /// The source item no longer exists; recorded as completed.
    SourceDeleted,
    /// Another run holds or already finished the item.
    Skipped,
    Failed,
}

/// Structured result of one transfer. Failures are reported here, not raised.
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub item_id: String,
    pub filename: String,
    pub status: TransferStatus,
    pub destination_key: Option<String>,
    pub bytes_transferred: u64,
    pub duration: Duration,
    pub error: Option<String>,
    pub error_class: Option<ErrorClass>,
}

impl TransferOutcome {
    pub fn new(item: &WorkItem, status: TransferStatus, duration: Duration) -> Self {
        Self {
            item_id: item.item_id.clone(),
            filename: item.filename.clone(),
            status,
            destination_key: None,
            bytes_transferred: 0,
            duration,
            error: None,
            error_class: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    /// Some items failed; the run itself is still considered successful.
    PartialFailure,
    /// Discovery, credentials or the ledger failed; the run was aborted.
    CriticalFailure,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::PartialFailure => "PARTIAL_FAILURE",
            Self::CriticalFailure => "CRITICAL_FAILURE",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Success | Self::PartialFailure => 0,
            Self::CriticalFailure => 2,
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedItem {
    pub item_id: String,
    pub filename: String,
    pub reason: String,
}

/// What a run did, for logging, alerts and the run record.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub correlation_id: String,
    pub outcome: RunOutcome,
    pub pages: u32,
    pub items_listed: u64,
    pub items_dispatched: u64,
    pub completed: u64,
    pub already_present: u64,
    pub source_deleted: u64,
    pub skipped: u64,
    pub failed: Vec<FailedItem>,
    pub bytes_transferred: u64,
    pub structural_warnings: u64,
    pub interrupted: bool,
    pub critical_reason: Option<String>,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn new(correlation_id: String) -> Self {
        Self {
            correlation_id,
            outcome: RunOutcome::Success,
            pages: 0,
            items_listed: 0,
            items_dispatched: 0,
            completed: 0,
            already_present: 0,
            source_deleted: 0,
            skipped: 0,
            failed: Vec::new(),
            bytes_transferred: 0,
            structural_warnings: 0,
            interrupted: false,
            critical_reason: None,
            elapsed: Duration::ZERO,
        }
    }

    pub fn record(&mut self, outcome: TransferOutcome) {
        self.bytes_transferred += outcome.bytes_transferred;
        match outcome.status {
            TransferStatus::Completed => self.completed += 1,
            TransferStatus::AlreadyPresent => self.already_present += 1,
            TransferStatus::SourceDeleted => self.source_deleted += 1,
            TransferStatus::Skipped => self.skipped += 1,
            TransferStatus::Failed => self.failed.push(FailedItem {
                item_id: outcome.item_id,
                filename: outcome.filename,
                reason: outcome.error.unwrap_or_else(|| "unknown error".into()),
            }),
        }
    }

    /// Items that reached (or already were in) a terminal successful state.
    pub fn succeeded(&self) -> u64 {
        self.completed + self.already_present + self.source_deleted
    }
}
