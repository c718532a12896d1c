//! Remote catalog client: paginated listing, locator resolution and byte
//! streams from the upstream media provider.

pub mod adapter;
pub mod error;
#[cfg(test)]
pub mod fake;
pub mod gopro;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::Stream;
use serde_json::Value;

pub use adapter::{GoProAdapter, ItemAdapter, SchemaWarning};
pub use error::CatalogError;
pub use gopro::GoProCatalog;

/// Locators this close to expiry are treated as already expired.
const LOCATOR_EXPIRY_MARGIN: chrono::Duration = chrono::Duration::seconds(30);

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, CatalogError>> + Send>>;

/// Pagination metadata exactly as the provider reported it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub current_page: u32,
    pub total_pages: u32,
    pub total_items: u64,
}

/// One page of raw, unvalidated items.
#[derive(Debug, Clone)]
pub struct CatalogPage {
    pub items: Vec<Value>,
    pub pagination: Pagination,
}

/// A discovered item that still needs a transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub item_id: String,
    pub filename: String,
    /// Bytes; 0 when the provider does not report a size.
    pub expected_size: u64,
    pub created_at: Option<DateTime<Utc>>,
    /// Opaque handle handed back to [`RemoteCatalog::resolve`].
    pub source_locator: String,
}

/// A short-lived, directly fetchable URL for one quality variant of an item.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedLocator {
    pub variant: String,
    pub url: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ResolvedLocator {
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .is_some_and(|expires| expires <= now + LOCATOR_EXPIRY_MARGIN)
    }
}

/// An open byte stream plus what the transport told us about it.
pub struct OpenedStream {
    pub stream: ByteStream,
    pub content_length: Option<u64>,
    pub time_to_first_byte: Duration,
}

impl std::fmt::Debug for OpenedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedStream")
            .field("content_length", &self.content_length)
            .field("time_to_first_byte", &self.time_to_first_byte)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait RemoteCatalog: Send + Sync {
    /// Provider namespace, used as the ledger partition and in object keys.
    fn name(&self) -> &str;

    /// Fetch one page (1-based) of raw item metadata.
    async fn list_page(&self, page: u32, page_size: u32) -> Result<CatalogPage, CatalogError>;

    /// Ask the provider for every downloadable variant of an item.
    /// Returns `CatalogError::NotFound` if the item itself is gone.
    async fn resolve(&self, source_locator: &str) -> Result<Vec<ResolvedLocator>, CatalogError>;

    async fn open_stream(&self, locator: &ResolvedLocator) -> Result<OpenedStream, CatalogError>;
}
