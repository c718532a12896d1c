//! Types for the sync ledger.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

/// Transfer status of one remote item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncStatus {
    /// Seen but no transfer started yet.
    Pending,
    /// A worker holds the item.
    InProgress,
    /// Durably copied (or the source was deleted upstream).
    Completed,
    /// Last attempt failed; discovery will offer it again.
    Failed,
}

impl SyncStatus {
    /// Convert to the string stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    /// Parse from the string stored in the database.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "IN_PROGRESS" => Some(Self::InProgress),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record of one item's transfer state.
///
/// Invariant: `status == Completed` implies `destination_key` is set, unless
/// `note` records that the source was deleted before it could be copied.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncRecord {
    pub provider: String,
    pub item_id: String,
    pub source_filename: String,
    /// Object key in the destination store (set on completion).
    pub destination_key: Option<String>,
    pub last_error: Option<String>,
    /// Free-form annotation, e.g. `source_deleted`.
    pub note: Option<String>,

    /// Expected size in bytes; 0 means unknown.
    pub expected_size: u64,
    pub bytes_transferred: Option<u64>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    pub transfer_duration_secs: Option<f64>,
    /// Megabits per second over the whole transfer.
    pub throughput_mbps: Option<f64>,

    pub retry_count: u32,
    pub status: SyncStatus,
}

impl SyncRecord {
    pub fn new(
        provider: impl Into<String>,
        item_id: impl Into<String>,
        source_filename: impl Into<String>,
        expected_size: u64,
        status: SyncStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            provider: provider.into(),
            item_id: item_id.into(),
            source_filename: source_filename.into(),
            destination_key: None,
            last_error: None,
            note: None,
            expected_size,
            bytes_transferred: None,
            created_at: now,
            updated_at: now,
            transfer_duration_secs: None,
            throughput_mbps: None,
            retry_count: 0,
            status,
        }
    }
}

/// Result of a batched status lookup.
#[derive(Debug, Default)]
pub struct BatchGet {
    pub found: HashMap<String, SyncRecord>,
    /// Keys the store looked up and has no record for.
    pub missing: Vec<String>,
    /// Keys the store did not get to (throttling); the caller retries these.
    pub unprocessed: Vec<String>,
}

/// Identity of the item a worker wants to take.
#[derive(Debug, Clone)]
pub struct ClaimRequest<'a> {
    pub provider: &'a str,
    pub item_id: &'a str,
    pub source_filename: &'a str,
    pub expected_size: u64,
}

/// Outcome of trying to move a record to IN_PROGRESS.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimResult {
    /// The caller now owns the item. `retry_count` is the count before this attempt.
    Claimed { retry_count: u32 },
    /// Another transfer already finished this item.
    AlreadyCompleted(Box<SyncRecord>),
    /// Another worker took the item within the lease window.
    HeldElsewhere { since: DateTime<Utc> },
}

/// Fields written when a transfer finishes successfully.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub destination_key: Option<String>,
    pub bytes_transferred: u64,
    pub duration_secs: f64,
    pub throughput_mbps: f64,
    pub note: Option<String>,
}

/// Statistics for a single sync run.
#[derive(Debug, Clone, Default)]
pub struct RunStats {
    pub pages: u64,
    pub items_listed: u64,
    pub items_dispatched: u64,
    pub items_completed: u64,
    pub items_failed: u64,
    pub bytes_transferred: u64,
    /// `SUCCESS`, `PARTIAL_FAILURE` or `CRITICAL_FAILURE`.
    pub outcome: String,
    pub interrupted: bool,
}

/// Summary of the current ledger.
#[derive(Debug, Clone)]
pub struct LedgerSummary {
    pub total: u64,
    pub completed: u64,
    pub pending: u64,
    pub in_progress: u64,
    pub failed: u64,
    pub last_run_started: Option<DateTime<Utc>>,
    pub last_run_completed: Option<DateTime<Utc>>,
    pub last_run_outcome: Option<String>,
}
