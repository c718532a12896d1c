//! Error types for the sync ledger.

use std::path::PathBuf;

use thiserror::Error;

use super::types::SyncStatus;

#[derive(Error, Debug)]
pub enum LedgerError {
    /// Failed to open or create the database file.
    #[error("Failed to open ledger at {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    #[error("Ledger migration failed: {0}")]
    Migration(#[from] rusqlite::Error),

    #[error("Ledger query failed: {0}")]
    Query(String),

    /// A conditional write found a different status than the caller expected.
    #[error("Conditional write on {item_id} failed: expected {expected:?}, found {found:?}")]
    ConditionFailed {
        item_id: String,
        expected: SyncStatus,
        found: Option<SyncStatus>,
    },

    #[error("Ledger record not found: {0}")]
    NotFound(String),

    #[error("Failed to spawn blocking task: {0}")]
    Spawn(#[from] tokio::task::JoinError),

    #[error("Ledger schema version {found} is newer than supported version {expected}")]
    UnsupportedSchemaVersion { found: i32, expected: i32 },
}

impl LedgerError {
    pub fn query(source: rusqlite::Error) -> Self {
        Self::Query(source.to_string())
    }

    /// Busy/locked databases clear up on their own; everything else is a
    /// broken ledger.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Query(msg) => msg.contains("locked") || msg.contains("busy"),
            _ => false,
        }
    }
}
