use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;

use crate::cli::SyncArgs;
use crate::retry::RetryConfig;
use crate::sync::{DiscoveryConfig, OrchestratorConfig, TransferConfig};
use crate::types::Provider;

/// Discovery is attempted this many times per page before the run is
/// declared critical.
const DISCOVERY_ATTEMPTS: u32 = 3;
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);
/// Provider page size ceiling.
const MAX_PAGE_SIZE: u32 = 100;
/// Ledger batch read ceiling.
const MAX_BATCH_SIZE: usize = 100;

/// Application configuration for the `sync` command.
///
/// Fields are ordered for memory layout: heap types first, then
/// primitives by size, booleans last.
pub struct Config {
    pub ledger_path: PathBuf,
    pub store_dir: PathBuf,
    pub credentials_path: PathBuf,
    pub api_base_url: String,
    pub preferred_variants: Vec<String>,
    pub include_prefixes: Vec<String>,
    pub storage_class: String,
    pub alert_webhook: Option<String>,

    pub watch_with_interval: Option<u64>,
    pub multipart_threshold: u64,
    pub retry_delay_secs: u64,
    pub in_progress_lease_hours: u64,
    pub chunk_size: usize,
    pub concurrency: usize,
    pub batch_size: usize,

    pub page_size: u32,
    pub max_retries: u32,

    pub provider: Provider,

    pub no_progress_bar: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("ledger_path", &self.ledger_path)
            .field("store_dir", &self.store_dir)
            .field("credentials_path", &self.credentials_path)
            .field("provider", &self.provider)
            .field(
                "alert_webhook",
                &self.alert_webhook.as_ref().map(|_| "<redacted>"),
            )
            .field("concurrency", &self.concurrency)
            .field("multipart_threshold", &self.multipart_threshold)
            .finish_non_exhaustive()
    }
}

pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

/// Parse a human-friendly byte size.
///
/// Accepts raw bytes (`"1048576"`), decimal units (`"50MB"`, `"1GB"`) and
/// binary units (`"5MiB"`, `"1GiB"`). Units are case-insensitive and may be
/// separated from the number by whitespace.
pub(crate) fn parse_size(s: &str) -> anyhow::Result<u64> {
    let trimmed = s.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);
    if digits.is_empty() {
        anyhow::bail!("Cannot parse '{}' as a size: missing number", s);
    }
    let value: u64 = digits
        .parse()
        .with_context(|| format!("Cannot parse '{}' as a size", s))?;
    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "kb" => 1_000,
        "mb" => 1_000_000,
        "gb" => 1_000_000_000,
        "kib" => 1 << 10,
        "mib" => 1 << 20,
        "gib" => 1 << 30,
        other => anyhow::bail!(
            "Cannot parse '{}' as a size: unknown unit '{}'. \
             Expected B, KB, MB, GB, KiB, MiB or GiB",
            s,
            other
        ),
    };
    value
        .checked_mul(multiplier)
        .with_context(|| format!("Size '{}' is too large", s))
}

impl Config {
    pub fn from_args(args: SyncArgs) -> anyhow::Result<Self> {
        let multipart_threshold = parse_size(&args.multipart_threshold)
            .context("invalid --multipart-threshold")?;
        let chunk_size = parse_size(&args.chunk_size).context("invalid --chunk-size")?;

        if chunk_size == 0 {
            anyhow::bail!("--chunk-size must be greater than zero");
        }
        let chunk_size =
            usize::try_from(chunk_size).context("--chunk-size does not fit in memory")?;
        if args.concurrency == 0 {
            anyhow::bail!("--concurrency must be at least 1");
        }
        if !(1..=MAX_PAGE_SIZE).contains(&args.page_size) {
            anyhow::bail!("--page-size must be between 1 and {}", MAX_PAGE_SIZE);
        }
        if !(1..=MAX_BATCH_SIZE).contains(&args.batch_size) {
            anyhow::bail!("--batch-size must be between 1 and {}", MAX_BATCH_SIZE);
        }
        if args.preferred_variants.iter().all(|v| v.trim().is_empty()) {
            anyhow::bail!("--preferred-variants must name at least one variant");
        }
        if args.watch_with_interval == Some(0) {
            anyhow::bail!("--watch-with-interval must be greater than zero");
        }

        Ok(Self {
            ledger_path: expand_tilde(&args.ledger.ledger),
            store_dir: expand_tilde(&args.store_dir),
            credentials_path: expand_tilde(&args.credentials),
            api_base_url: args.api_base_url,
            preferred_variants: clean_list(args.preferred_variants),
            include_prefixes: clean_list(args.include_prefixes),
            storage_class: args.storage_class,
            alert_webhook: args.alert_webhook.filter(|u| !u.trim().is_empty()),
            watch_with_interval: args.watch_with_interval,
            multipart_threshold,
            retry_delay_secs: args.retry_delay,
            in_progress_lease_hours: args.in_progress_lease_hours,
            chunk_size,
            concurrency: args.concurrency,
            batch_size: args.batch_size,
            page_size: args.page_size,
            max_retries: args.max_retries,
            provider: args.provider,
            no_progress_bar: args.no_progress_bar,
        })
    }

    fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            base_delay: Duration::from_secs(self.retry_delay_secs),
            max_delay: MAX_RETRY_DELAY,
        }
    }

    pub fn discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            page_size: self.page_size,
            batch_size: self.batch_size,
            ledger_retry: self.retry_config(),
        }
    }

    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            multipart_threshold: self.multipart_threshold,
            chunk_size: self.chunk_size,
            preferred_variants: self.preferred_variants.clone(),
            storage_class: self.storage_class.clone(),
            in_progress_lease: Duration::from_secs(self.in_progress_lease_hours * 3600),
            retry: self.retry_config(),
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            concurrency: self.concurrency,
            discovery_retry: RetryConfig {
                max_retries: DISCOVERY_ATTEMPTS - 1,
                ..self.retry_config()
            },
            no_progress_bar: self.no_progress_bar,
        }
    }
}

fn clean_list(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}
