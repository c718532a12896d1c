//! In-memory catalog for engine tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde_json::{json, Value};

use super::{CatalogError, CatalogPage, OpenedStream, Pagination, RemoteCatalog, ResolvedLocator};

/// Raw item in the GoPro search response shape.
pub fn raw_item(id: &str, filename: &str, size: u64) -> Value {
    json!({
        "id": id,
        "filename": filename,
        "file_size": size,
        "created_at": "2024-03-15T10:30:00Z",
    })
}

pub struct FakeCatalog {
    pages: Vec<Vec<Value>>,
    locators: Mutex<HashMap<String, Vec<ResolvedLocator>>>,
    content: Mutex<HashMap<String, Bytes>>,
    stale_once: Mutex<HashSet<String>>,
    deleted: Mutex<HashSet<String>>,
    /// Size of each chunk yielded by `open_stream`.
    chunk_size: usize,
    list_failures: AtomicU32,
    pub list_calls: AtomicU32,
    pub resolve_calls: AtomicU32,
    pub open_calls: AtomicU32,
}

impl FakeCatalog {
    pub fn new(pages: Vec<Vec<Value>>) -> Self {
        Self {
            pages,
            locators: Mutex::new(HashMap::new()),
            content: Mutex::new(HashMap::new()),
            stale_once: Mutex::new(HashSet::new()),
            deleted: Mutex::new(HashSet::new()),
            chunk_size: 7,
            list_failures: AtomicU32::new(0),
            list_calls: AtomicU32::new(0),
            resolve_calls: AtomicU32::new(0),
            open_calls: AtomicU32::new(0),
        }
    }

    /// Register a downloadable variant. `None` content means the variant URL 404s.
    pub fn add_variant(&self, item_id: &str, variant: &str, content: Option<&[u8]>) {
        let url = format!("fake://{item_id}/{variant}");
        self.locators
            .lock()
            .unwrap()
            .entry(item_id.to_string())
            .or_default()
            .push(ResolvedLocator {
                variant: variant.to_string(),
                url: url.clone(),
                expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
            });
        if let Some(bytes) = content {
            self.content
                .lock()
                .unwrap()
                .insert(url, Bytes::copy_from_slice(bytes));
        }
    }

    pub fn add_source(&self, item_id: &str, content: &[u8]) {
        self.add_variant(item_id, "source", Some(content));
    }

    /// The item's download endpoint answers 404.
    pub fn delete_item(&self, item_id: &str) {
        self.deleted.lock().unwrap().insert(item_id.to_string());
    }

    /// The next `resolve` for this item returns already-expired locators.
    pub fn stale_once(&self, item_id: &str) {
        self.stale_once.lock().unwrap().insert(item_id.to_string());
    }

    /// Fail the next `n` listing calls with a 503.
    pub fn fail_list(&self, n: u32) {
        self.list_failures.store(n, Ordering::SeqCst);
    }

    pub fn list_calls(&self) -> u32 {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteCatalog for FakeCatalog {
    fn name(&self) -> &str {
        "gopro"
    }

    async fn list_page(&self, page: u32, _page_size: u32) -> Result<CatalogPage, CatalogError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.list_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.list_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(CatalogError::Status {
                status: 503,
                url: format!("fake://search?page={page}"),
            });
        }

        let items = self
            .pages
            .get(page.saturating_sub(1) as usize)
            .cloned()
            .unwrap_or_default();
        Ok(CatalogPage {
            items,
            pagination: Pagination {
                current_page: page,
                total_pages: self.pages.len() as u32,
                total_items: self.pages.iter().map(|p| p.len() as u64).sum(),
            },
        })
    }

    async fn resolve(&self, source_locator: &str) -> Result<Vec<ResolvedLocator>, CatalogError> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        if self.deleted.lock().unwrap().contains(source_locator) {
            return Err(CatalogError::NotFound(source_locator.to_string()));
        }
        let mut locators = self
            .locators
            .lock()
            .unwrap()
            .get(source_locator)
            .cloned()
            .unwrap_or_default();
        if self.stale_once.lock().unwrap().remove(source_locator) {
            for locator in &mut locators {
                locator.expires_at = Some(Utc::now() - chrono::Duration::minutes(5));
            }
        }
        Ok(locators)
    }

    async fn open_stream(&self, locator: &ResolvedLocator) -> Result<OpenedStream, CatalogError> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        if locator.is_stale(Utc::now()) {
            return Err(CatalogError::Status {
                status: 403,
                url: locator.url.clone(),
            });
        }
        let content = self
            .content
            .lock()
            .unwrap()
            .get(&locator.url)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(locator.variant.clone()))?;

        let chunks: Vec<Result<Bytes, CatalogError>> = content
            .chunks(self.chunk_size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(OpenedStream {
            content_length: Some(content.len() as u64),
            stream: Box::pin(futures_util::stream::iter(chunks)),
            time_to_first_byte: Duration::from_millis(1),
        })
    }
}
