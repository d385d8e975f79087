use clap::{Args, Parser, Subcommand};

use crate::famly::DEFAULT_API_BASE;
use crate::types::LogLevel;

#[derive(Parser, Debug)]
#[command(
    name = "famly-sync",
    version,
    about = "Incrementally mirror a child's Famly photos, videos and files to local disk"
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
    /// Download new media for every cached child (or the ones selected)
    Sync(SyncArgs),
    /// Show cached children, their watermarks and how many files are on disk
    Status(StatusArgs),
    /// List the children an access token can see
    ListChildren(ListChildrenArgs),
}

/// Where the archive lives and which API to talk to.
#[derive(Args, Debug, Clone)]
pub struct TargetArgs {
    /// Local directory for downloads (also holds the credential cache)
    #[arg(short = 'o', long = "output", default_value = "./famly_photos")]
    pub output: String,

    /// Famly API base URL
    #[arg(long, default_value = DEFAULT_API_BASE)]
    pub api_base: String,
}

#[derive(Args, Debug, Clone)]
pub struct SyncArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Ignore cached credentials and log in again
    #[arg(short = 'l', long)]
    pub login: bool,

    /// Famly access token (if not provided, will prompt).
    /// WARNING: passing via --access-token is visible in process listings.
    /// Prefer the FAMLY_ACCESS_TOKEN environment variable instead.
    #[arg(short = 't', long, env = "FAMLY_ACCESS_TOKEN", hide_env_values = true)]
    pub access_token: Option<String>,

    /// Child id(s) to sync; defaults to every cached or discovered child
    #[arg(short = 'c', long = "child-id", env = "FAMLY_CHILD_ID", value_delimiter = ',')]
    pub child_ids: Vec<String>,

    /// Number of concurrent downloads
    #[arg(short = 'w', long, default_value_t = 4)]
    pub workers: usize,

    /// Records per tagged-images page
    #[arg(long, default_value_t = 100)]
    pub page_size: u64,

    /// Observations per GraphQL page
    #[arg(long, default_value_t = 50)]
    pub observation_page_size: u32,

    /// Retries per request or download after the first attempt
    #[arg(long, default_value_t = 3)]
    pub max_retries: u32,

    /// Base delay between retries in milliseconds (doubles each retry)
    #[arg(long, default_value_t = 500)]
    pub retry_delay_ms: u64,

    /// Stop enumerating after N consecutive items that are already on disk
    #[arg(long)]
    pub until_found: Option<u32>,

    /// Ignore the watermark and re-check the whole history
    #[arg(long)]
    pub full: bool,

    /// Skip media captured before this ISO date or interval (e.g., 2025-01-02 or 20d)
    #[arg(long)]
    pub since: Option<String>,

    /// Show what would be downloaded without writing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Download tagged images at thumbnail resolution
    #[arg(long)]
    pub thumbnail_only: bool,

    /// Also download observation photos, videos and files
    #[arg(long)]
    pub observations: bool,

    /// Only download observation media
    #[arg(long, conflicts_with = "observations")]
    pub observations_only: bool,

    /// Also download images attached to conversation messages
    #[arg(long)]
    pub messages: bool,

    /// Disable progress bar
    #[arg(long)]
    pub no_progress_bar: bool,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[command(flatten)]
    pub target: TargetArgs,
}

#[derive(Args, Debug, Clone)]
pub struct ListChildrenArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Famly access token; falls back to the cached one
    #[arg(short = 't', long, env = "FAMLY_ACCESS_TOKEN", hide_env_values = true)]
    pub access_token: Option<String>,
}
