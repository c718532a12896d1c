use thiserror::Error;

use crate::catalog::CatalogError;
use crate::ledger::LedgerError;
use crate::store::StoreError;

/// How a failed transfer should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network blips, throttling, 5xx. Already retried at the point of
    /// failure; the item is retried again on the next run.
    Transient,
    /// Will fail the same way until something changes upstream.
    Permanent,
    /// The source item is gone.
    NotFound,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "Transient",
            Self::Permanent => "Permanent",
            Self::NotFound => "NotFound",
        }
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Size mismatch: expected {expected} bytes, transferred {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// The stream ended before the advertised content length.
    #[error("Stream truncated: content length {expected}, received {actual}")]
    Truncated { expected: u64, actual: u64 },

    #[error("No preferred variant available (offered: {})", offered.join(", "))]
    NoVariant { offered: Vec<String> },

    #[error("Destination key {0} is held by other objects")]
    KeyCollision(String),
}

impl TransferError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Catalog(e) if e.is_not_found() => ErrorClass::NotFound,
            Self::Catalog(e) if e.is_retryable() => ErrorClass::Transient,
            Self::Store(e) if e.is_retryable() => ErrorClass::Transient,
            Self::Ledger(e) if e.is_retryable() => ErrorClass::Transient,
            Self::Truncated { .. } => ErrorClass::Transient,
            Self::Catalog(_)
            | Self::Store(_)
            | Self::Ledger(_)
            | Self::SizeMismatch { .. }
            | Self::NoVariant { .. }
            | Self::KeyCollision(_) => ErrorClass::Permanent,
        }
    }
}

/// Discovery failures. Once retries are exhausted these end the run.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Listing failed: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Ledger lookup failed: {0}")]
    Ledger(#[from] LedgerError),
}

impl DiscoveryError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Catalog(e) => e.is_retryable(),
            Self::Ledger(e) => e.is_retryable(),
        }
    }
}
