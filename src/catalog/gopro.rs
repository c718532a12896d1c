//! GoPro cloud media library client.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, COOKIE, USER_AGENT};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;

use super::{CatalogError, CatalogPage, OpenedStream, Pagination, RemoteCatalog, ResolvedLocator};
use crate::credentials::CredentialProvider;

pub const DEFAULT_BASE_URL: &str = "https://api.gopro.com";

const MEDIA_ACCEPT: &str = "application/vnd.gopro.jk.media+json; version=2.0.0";
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/138.0.0.0 Safari/537.36";
/// The search endpoint rejects larger pages.
const MAX_PAGE_SIZE: u32 = 100;
const API_TIMEOUT: Duration = Duration::from_secs(60);

/// Variant name given to the original camera file.
pub const SOURCE_VARIANT: &str = "source";

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(rename = "_embedded", default)]
    embedded: Option<SearchEmbedded>,
    #[serde(rename = "_pages")]
    pages: Option<Pages>,
}

#[derive(Debug, Deserialize)]
struct SearchEmbedded {
    #[serde(default)]
    media: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct Pages {
    current_page: u32,
    total_pages: u32,
    #[serde(default)]
    total_items: u64,
}

#[derive(Debug, Deserialize)]
struct DownloadResponse {
    #[serde(rename = "_embedded", default)]
    embedded: DownloadEmbedded,
}

#[derive(Debug, Default, Deserialize)]
struct DownloadEmbedded {
    #[serde(default)]
    files: Vec<DownloadFile>,
    #[serde(default)]
    variations: Vec<Variation>,
}

#[derive(Debug, Deserialize)]
struct DownloadFile {
    url: String,
    #[serde(default)]
    item_number: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct Variation {
    url: String,
    label: String,
}

fn parse_search_response(value: Value) -> Result<CatalogPage, CatalogError> {
    let response: SearchResponse =
        serde_json::from_value(value).map_err(|e| CatalogError::Schema(e.to_string()))?;
    let pages = response
        .pages
        .ok_or_else(|| CatalogError::Schema("search response has no '_pages'".into()))?;

    Ok(CatalogPage {
        items: response.embedded.map(|e| e.media).unwrap_or_default(),
        pagination: Pagination {
            current_page: pages.current_page,
            total_pages: pages.total_pages,
            total_items: pages.total_items,
        },
    })
}

/// CloudFront signs URLs with an absolute `Expires` epoch.
fn expires_from_url(url: &str) -> Option<DateTime<Utc>> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let (_, value) = parsed.query_pairs().find(|(k, _)| k == "Expires")?;
    let epoch: i64 = value.parse().ok()?;
    Utc.timestamp_opt(epoch, 0).single()
}

fn parse_download_response(value: Value) -> Result<Vec<ResolvedLocator>, CatalogError> {
    let response: DownloadResponse =
        serde_json::from_value(value).map_err(|e| CatalogError::Schema(e.to_string()))?;
    let DownloadEmbedded {
        mut files,
        variations,
    } = response.embedded;

    // Multi-file captures list the primary file first by item number.
    files.sort_by_key(|f| f.item_number.unwrap_or(0));

    let source = files.into_iter().next().map(|f| ResolvedLocator {
        variant: SOURCE_VARIANT.to_string(),
        expires_at: expires_from_url(&f.url),
        url: f.url,
    });

    Ok(source
        .into_iter()
        .chain(variations.into_iter().map(|v| ResolvedLocator {
            variant: v.label,
            expires_at: expires_from_url(&v.url),
            url: v.url,
        }))
        .collect())
}

/// Client for the GoPro cloud media API.
pub struct GoProCatalog {
    client: Client,
    base_url: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl GoProCatalog {
    pub fn new(
        credentials: Arc<dyn CredentialProvider>,
        base_url: impl Into<String>,
    ) -> Result<Self, CatalogError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| CatalogError::Transport {
                url: base_url.clone(),
                source: e,
            })?;
        Ok(Self {
            client,
            base_url,
            credentials,
        })
    }

    async fn get_json(&self, url: &str, not_found: &str) -> Result<Value, CatalogError> {
        let creds = self.credentials.get_valid_credentials().await?;
        let response = self
            .client
            .get(url)
            .header(COOKIE, &creds.cookies)
            .header(
                USER_AGENT,
                creds.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT),
            )
            .header(ACCEPT, MEDIA_ACCEPT)
            .timeout(API_TIMEOUT)
            .send()
            .await
            .map_err(|e| CatalogError::Transport {
                url: url.to_string(),
                source: e,
            })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(CatalogError::NotFound(not_found.to_string()));
        }
        if !status.is_success() {
            return Err(CatalogError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| CatalogError::Schema(format!("invalid JSON from {url}: {e}")))
    }
}

#[async_trait]
impl RemoteCatalog for GoProCatalog {
    fn name(&self) -> &str {
        "gopro"
    }

    async fn list_page(&self, page: u32, page_size: u32) -> Result<CatalogPage, CatalogError> {
        let url = format!(
            "{}/media/search?page={}&per_page={}",
            self.base_url,
            page,
            page_size.clamp(1, MAX_PAGE_SIZE)
        );
        let started = Instant::now();
        let body = self.get_json(&url, &format!("page {page}")).await?;
        tracing::debug!(
            page,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Fetched media search page"
        );
        parse_search_response(body)
    }

    async fn resolve(&self, source_locator: &str) -> Result<Vec<ResolvedLocator>, CatalogError> {
        let url = format!("{}/media/{}/download", self.base_url, source_locator);
        let body = self.get_json(&url, source_locator).await?;
        parse_download_response(body)
    }

    async fn open_stream(&self, locator: &ResolvedLocator) -> Result<OpenedStream, CatalogError> {
        // Pre-signed CDN URLs carry their own authorization.
        let started = Instant::now();
        let response = self
            .client
            .get(&locator.url)
            .send()
            .await
            .map_err(|e| CatalogError::Transport {
                url: locator.variant.clone(),
                source: e,
            })?;
        let time_to_first_byte = started.elapsed();

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(CatalogError::NotFound(locator.variant.clone()));
        }
        if !status.is_success() {
            return Err(CatalogError::Status {
                status: status.as_u16(),
                url: locator.variant.clone(),
            });
        }

        let content_length = response.content_length();
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| CatalogError::Stream(e.to_string())));

        Ok(OpenedStream {
            stream: Box::pin(stream),
            content_length,
            time_to_first_byte,
        })
    }
}
