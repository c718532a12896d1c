use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {key}: {source}")]
    Io {
        key: String,
        source: std::io::Error,
    },

    #[error("Invalid object key '{0}'")]
    InvalidKey(String),

    #[error("No such multipart upload: {0}")]
    NoSuchUpload(String),

    /// The parts handed to `complete_multipart` do not match what was staged.
    #[error("Invalid part list for upload {upload_id}: {reason}")]
    InvalidParts { upload_id: String, reason: String },

    #[error("Corrupt object metadata for {key}: {source}")]
    Metadata {
        key: String,
        source: serde_json::Error,
    },

    /// The store asked us to slow down. Only the in-memory store injects it.
    #[cfg(test)]
    #[error("Store throttled request for {0}")]
    Throttled(String),

    #[cfg(test)]
    #[error("Store rejected request for {key}: {reason}")]
    Rejected { key: String, reason: String },
}

impl StoreError {
    pub fn io(key: &str, source: std::io::Error) -> Self {
        Self::Io {
            key: key.to_string(),
            source,
        }
    }

    /// Whether this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            #[cfg(test)]
            Self::Throttled(_) => true,
            #[cfg(test)]
            Self::Rejected { .. } => false,
            Self::Io { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
            ),
            Self::InvalidKey(_)
            | Self::NoSuchUpload(_)
            | Self::InvalidParts { .. }
            | Self::Metadata { .. } => false,
        }
    }
}
