//! Sync ledger: the durable record of per-item transfer status.
//!
//! One record per `(provider, item_id)`. The ledger is the de-duplication
//! source of truth for discovery and the only shared mutable resource the
//! transfer workers touch. Records are never deleted.

pub mod db;
pub mod error;
pub mod schema;
pub mod types;

pub use db::{SqliteLedger, SyncLedger};
pub use error::LedgerError;
pub use types::{ClaimRequest, ClaimResult, Completion, RunStats, SyncRecord, SyncStatus};
