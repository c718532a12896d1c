use thiserror::Error;

use crate::credentials::CredentialError;

/// Errors from the remote catalog, classified for the retry loops.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// The item (or the requested variant) no longer exists upstream.
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    #[error("Request to {url} failed: {source}")]
    Transport {
        url: String,
        source: reqwest::Error,
    },

    /// The response parsed as JSON but not in the shape we expect.
    #[error("Unexpected response shape: {0}")]
    Schema(String),

    #[error(transparent)]
    Credentials(#[from] CredentialError),

    #[error("Byte stream interrupted: {0}")]
    Stream(String),
}

impl CatalogError {
    /// Whether this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            Self::Transport { .. } | Self::Stream(_) => true,
            Self::NotFound(_) | Self::Schema(_) | Self::Credentials(_) => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
