//! Sync engine: discovery, transfer and orchestration.

pub mod discovery;
pub mod error;
pub mod keys;
pub mod orchestrator;
#[cfg(test)]
pub mod testing;
pub mod transfer;
pub mod types;

pub use discovery::{DiscoveryConfig, DiscoveryWalker};
pub use orchestrator::{OrchestratorConfig, SyncOrchestrator};
pub use transfer::{TransferConfig, TransferWorker};
pub use types::RunOutcome;
