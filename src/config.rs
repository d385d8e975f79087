use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, Utc};
use url::Url;

use crate::cli::{SyncArgs, TargetArgs};
use crate::famly::Resolution;
use crate::retry::RetryConfig;
use crate::types::SourceSelection;

/// Sync run configuration, resolved from the command line.
pub struct Config {
    pub output_dir: PathBuf,
    pub api_base: Url,
    pub access_token: Option<String>,
    pub child_ids: Vec<String>,

    pub not_before: Option<DateTime<Utc>>,

    pub page_size: u64,
    pub retry: RetryConfig,

    pub observation_page_size: u32,
    pub until_found: Option<u32>,

    pub workers: usize,

    pub resolution: Resolution,
    pub sources: SourceSelection,
    pub messages: bool,

    pub login: bool,
    pub full: bool,
    pub dry_run: bool,
    pub no_progress_bar: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("output_dir", &self.output_dir)
            .field("api_base", &self.api_base.as_str())
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("child_ids", &self.child_ids)
            .field("workers", &self.workers)
            .field("sources", &self.sources)
            .field("messages", &self.messages)
            .field("full", &self.full)
            .field("dry_run", &self.dry_run)
            .finish_non_exhaustive()
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

/// Output directory and API base shared by every subcommand.
pub fn resolve_target(target: &TargetArgs) -> anyhow::Result<(PathBuf, Url)> {
    let output_dir = expand_tilde(&target.output);
    let api_base = Url::parse(&target.api_base)
        .map_err(|e| anyhow::anyhow!("Invalid --api-base '{}': {}", target.api_base, e))?;
    if !matches!(api_base.scheme(), "http" | "https") {
        anyhow::bail!("--api-base must be an http(s) URL, got '{}'", target.api_base);
    }
    Ok((output_dir, api_base))
}

impl Config {
    pub fn from_sync_args(args: SyncArgs) -> anyhow::Result<Self> {
        let (output_dir, api_base) = resolve_target(&args.target)?;

        if args.workers == 0 {
            anyhow::bail!("--workers must be at least 1");
        }
        if args.page_size == 0 || args.observation_page_size == 0 {
            anyhow::bail!("page sizes must be at least 1");
        }
        if args.until_found == Some(0) {
            anyhow::bail!("--until-found must be at least 1");
        }

        let not_before = args
            .since
            .as_deref()
            .map(parse_date_or_interval)
            .transpose()?
            .map(|dt| dt.with_timezone(&Utc));

        let access_token = args
            .access_token
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        let child_ids = args
            .child_ids
            .into_iter()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .collect();

        Ok(Self {
            output_dir,
            api_base,
            access_token,
            child_ids,
            not_before,
            page_size: args.page_size,
            retry: RetryConfig {
                max_retries: args.max_retries,
                base_delay: Duration::from_millis(args.retry_delay_ms),
                ..RetryConfig::default()
            },
            observation_page_size: args.observation_page_size,
            until_found: args.until_found,
            workers: args.workers,
            resolution: if args.thumbnail_only {
                Resolution::Thumbnail
            } else {
                Resolution::Full
            },
            sources: SourceSelection::from_flags(args.observations, args.observations_only),
            messages: args.messages,
            login: args.login,
            full: args.full,
            dry_run: args.dry_run,
            no_progress_bar: args.no_progress_bar,
        })
    }
}

/// Parse a human-friendly date spec into a concrete timestamp.
///
/// - Relative interval: `"20d"` (20 days ago from now)
/// - ISO date: `"2025-01-02"` (midnight local time)
/// - ISO datetime: `"2025-01-02T14:30:00"` (local time)
pub(crate) fn parse_date_or_interval(s: &str) -> anyhow::Result<DateTime<Local>> {
    if let Some(days_str) = s.strip_suffix('d') {
        if let Ok(days) = days_str.parse::<i64>() {
            return Ok(Local::now() - chrono::Duration::days(days));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(naive_dt) = date.and_hms_opt(0, 0, 0) {
            if let Some(dt) = naive_dt.and_local_timezone(Local).single() {
                return Ok(dt);
            }
        }
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        if let Some(local) = dt.and_local_timezone(Local).single() {
            return Ok(local);
        }
    }
    anyhow::bail!(
        "Cannot parse '{}' as a date. Expected ISO date (2025-01-02), \
         datetime (2025-01-02T14:30:00), or interval (20d)",
        s
    )
}
