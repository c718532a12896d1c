use clap::{Args, Parser, Subcommand};

use crate::types::{LogLevel, Provider};

#[derive(Parser, Debug)]
#[command(
    name = "mediasync",
    version,
    about = "Copy new media from a cloud library into a durable object store, exactly once"
)]
pub struct Cli {
    /// Log level (RUST_LOG overrides)
    #[arg(long, value_enum, default_value = "info", global = true)]
    pub log_level: LogLevel,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Discover new items and transfer them
    Sync(SyncArgs),
    /// Show ledger status
    Status(StatusArgs),
    /// Check completed items against the object store
    Verify(VerifyArgs),
}

#[derive(Args, Debug, Clone)]
pub struct LedgerArgs {
    /// Path of the sync ledger database
    #[arg(long, default_value = "~/.mediasync/ledger.db")]
    pub ledger: String,
}

#[derive(Args, Debug, Clone)]
pub struct SyncArgs {
    #[command(flatten)]
    pub ledger: LedgerArgs,

    /// Destination object store directory
    #[arg(short = 'd', long)]
    pub store_dir: String,

    /// Credentials file (JSON with cookies and user-agent)
    #[arg(long, env = "MEDIASYNC_CREDENTIALS", default_value = "~/.mediasync/credentials.json")]
    pub credentials: String,

    /// Media provider to sync from
    #[arg(long, value_enum, default_value = "gopro")]
    pub provider: Provider,

    /// Provider API base URL
    #[arg(long, default_value = crate::catalog::gopro::DEFAULT_BASE_URL)]
    pub api_base_url: String,

    /// Items requested per catalog page
    #[arg(long, default_value_t = 100)]
    pub page_size: u32,

    /// Maximum concurrent transfers
    #[arg(long, default_value_t = 5)]
    pub concurrency: usize,

    /// Items this size or larger use multipart upload (e.g. 100MiB, 50MB, 1048576)
    #[arg(long, default_value = "100MiB")]
    pub multipart_threshold: String,

    /// Multipart part size
    #[arg(long, default_value = "100MiB")]
    pub chunk_size: String,

    /// Variants to download, most preferred first
    #[arg(long, value_delimiter = ',', default_value = "source,high_res_proxy_mp4,edit_proxy")]
    pub preferred_variants: Vec<String>,

    /// Filename prefixes that mark genuine camera media
    #[arg(long = "include-prefix", value_delimiter = ',', default_value = "GH,GO")]
    pub include_prefixes: Vec<String>,

    /// Storage class recorded on written objects
    #[arg(long, default_value = "STANDARD")]
    pub storage_class: String,

    /// Maximum keys per ledger batch read
    #[arg(long, default_value_t = 100)]
    pub batch_size: usize,

    /// Max retries per network or store call (0 = no retries)
    #[arg(long, default_value_t = 3)]
    pub max_retries: u32,

    /// Initial retry delay in seconds
    #[arg(long, default_value_t = 2)]
    pub retry_delay: u64,

    /// Hours before an unfinished IN_PROGRESS record may be taken over
    #[arg(long, default_value_t = 2)]
    pub in_progress_lease_hours: u64,

    /// Webhook that receives alert events as JSON
    #[arg(long, env = "MEDIASYNC_ALERT_WEBHOOK")]
    pub alert_webhook: Option<String>,

    /// Run continuously, waiting N seconds between runs
    #[arg(long)]
    pub watch_with_interval: Option<u64>,

    /// Disable progress bar
    #[arg(long)]
    pub no_progress_bar: bool,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[command(flatten)]
    pub ledger: LedgerArgs,

    /// List failed items with their last error
    #[arg(long)]
    pub failed: bool,
}

#[derive(Args, Debug, Clone)]
pub struct VerifyArgs {
    #[command(flatten)]
    pub ledger: LedgerArgs,

    /// Destination object store directory
    #[arg(short = 'd', long)]
    pub store_dir: String,
}
