//! Credential provider for the remote catalog.
//!
//! Credentials are acquired and refreshed by an external tool; this module
//! only loads what that tool left on disk and refuses to run without it.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::OnceCell;

/// Cookies older than this are likely rejected by the provider soon.
const COOKIE_WARN_AGE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Credentials file {0} not found")]
    Missing(PathBuf),

    #[error("Failed to read credentials from {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed credentials in {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Credentials in {0} contain no cookies")]
    Empty(PathBuf),
}

/// Token material plus the metadata needed to present it.
#[derive(Clone, Deserialize)]
pub struct Credentials {
    pub cookies: String,
    #[serde(rename = "user-agent", alias = "user_agent", default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("cookies", &"<redacted>")
            .field("user_agent", &self.user_agent)
            .field("last_updated", &self.last_updated)
            .finish()
    }
}

impl Credentials {
    /// How long ago the credentials were last refreshed, if tracked.
    pub fn age(&self) -> Option<Duration> {
        let updated = self.last_updated?;
        (Utc::now() - updated).to_std().ok()
    }

    pub fn is_stale(&self) -> bool {
        self.age().is_some_and(|age| age > COOKIE_WARN_AGE)
    }
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Return already-validated credentials. Never attempts a refresh.
    async fn get_valid_credentials(&self) -> Result<Credentials, CredentialError>;
}

/// Reads credentials once from a JSON file and caches them for the process.
pub struct FileCredentialProvider {
    path: PathBuf,
    cached: OnceCell<Credentials>,
}

impl FileCredentialProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: OnceCell::new(),
        }
    }

    async fn load(&self) -> Result<Credentials, CredentialError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CredentialError::Missing(self.path.clone()));
            }
            Err(e) => {
                return Err(CredentialError::Read {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };

        let credentials: Credentials =
            serde_json::from_str(&contents).map_err(|e| CredentialError::Parse {
                path: self.path.clone(),
                source: e,
            })?;

        if credentials.cookies.trim().is_empty() {
            return Err(CredentialError::Empty(self.path.clone()));
        }

        if credentials.is_stale() {
            let days = credentials.age().map(|a| a.as_secs() / 86400).unwrap_or(0);
            tracing::warn!(
                age_days = days,
                "Credentials were last refreshed {} days ago and may be rejected soon",
                days
            );
        }

        Ok(credentials)
    }
}

#[async_trait]
impl CredentialProvider for FileCredentialProvider {
    async fn get_valid_credentials(&self) -> Result<Credentials, CredentialError> {
        self.cached.get_or_try_init(|| self.load()).await.cloned()
    }
}

/// Fixed credentials for tests.
#[cfg(test)]
pub struct StaticCredentials(pub Option<Credentials>);

#[cfg(test)]
impl StaticCredentials {
    pub fn valid() -> Self {
        Self(Some(Credentials {
            cookies: "gp_access_token=abc".into(),
            user_agent: Some("test-agent".into()),
            last_updated: Some(Utc::now()),
        }))
    }

    pub fn absent() -> Self {
        Self(None)
    }
}

#[cfg(test)]
#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn get_valid_credentials(&self) -> Result<Credentials, CredentialError> {
        self.0
            .clone()
            .ok_or_else(|| CredentialError::Missing(PathBuf::from("<static>")))
    }
}
