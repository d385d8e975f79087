//! One sync pass for one child: enumerate, plan, download, then advance the
//! watermark only as far as the archive is known to be complete.

pub mod error;
pub mod planner;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

pub use error::SyncError;
pub use planner::{PlanOptions, SyncPlan, SyncPlanner};

use crate::credentials::{Credential, CredentialStore};
use crate::download::{BatchReport, DownloadEngine, FailedDownload};
use crate::famly::pagination::{
    self, ConversationsSource, MediaSource, ObservationsSource, Paginator, TaggedImagesSource,
};
use crate::famly::{ApiClient, MediaItem, Resolution};
use crate::types::SourceSelection;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub sources: SourceSelection,
    /// Also enumerate image attachments in conversations.
    pub include_messages: bool,
    pub plan: PlanOptions,
    pub resolution: Resolution,
    pub page_size: u64,
    pub observation_page_size: u32,
    pub stall_limit: u32,
    pub stall_delay: Duration,
    pub dry_run: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            sources: SourceSelection::TaggedImages,
            include_messages: false,
            plan: PlanOptions::default(),
            resolution: Resolution::Full,
            page_size: 100,
            observation_page_size: 50,
            stall_limit: 3,
            stall_delay: Duration::from_millis(500),
            dry_run: false,
        }
    }
}

/// Outcome of one child's sync pass.
#[derive(Debug, Default)]
pub struct SyncResult {
    pub succeeded: Vec<MediaItem>,
    pub failed: Vec<FailedDownload>,
    pub not_attempted: Vec<MediaItem>,
    pub skipped_existing: usize,
    pub skipped_older: usize,
    pub duplicates: usize,
    /// Sources that stopped early; the archive may be missing items.
    pub stalls: Vec<SyncError>,
    pub interrupted: bool,
    pub stopped_early: bool,
    pub dry_run: bool,
    /// Watermark persisted by this pass, if it moved.
    pub new_watermark: Option<DateTime<Utc>>,
    pub elapsed: Duration,
}

impl SyncResult {
    fn from_parts(plan_stats: SyncPlan, report: BatchReport, dry_run: bool) -> Self {
        Self {
            succeeded: report.succeeded,
            failed: report.failed,
            not_attempted: report.not_attempted,
            skipped_existing: plan_stats.skipped_existing,
            skipped_older: plan_stats.skipped_older,
            duplicates: plan_stats.duplicates,
            stalls: plan_stats.stalls,
            interrupted: report.interrupted,
            stopped_early: plan_stats.stopped_early,
            dry_run,
            new_watermark: None,
            elapsed: Duration::ZERO,
        }
    }

    /// Newest capture time the archive is complete up to.
    ///
    /// The max over successes, but never past the oldest item that failed or
    /// was not attempted, so that item is not skipped by the next run. Only
    /// items from feeds that follow the watermark count either way.
    pub fn watermark_candidate(&self) -> Option<DateTime<Utc>> {
        let floor = self
            .failed
            .iter()
            .map(|f| &f.item)
            .chain(&self.not_attempted)
            .filter(|i| i.origin.follows_watermark())
            .map(|i| i.captured_at)
            .min();
        self.succeeded
            .iter()
            .filter(|i| i.origin.follows_watermark())
            .map(|i| i.captured_at)
            .filter(|ts| floor.map_or(true, |f| *ts <= f))
            .max()
    }

    /// No failures, no stalls and nothing left undone.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.stalls.is_empty() && self.not_attempted.is_empty()
    }

    pub fn log_summary(&self, child: &str, destination: &Path) {
        if self.dry_run {
            tracing::info!("── Dry Run Summary ({}) ──", child);
            tracing::info!("  {} files would be downloaded", self.not_attempted.len());
        } else {
            tracing::info!("── Summary ({}) ──", child);
            tracing::info!(
                "  {} downloaded, {} failed, {} not attempted",
                self.succeeded.len(),
                self.failed.len(),
                self.not_attempted.len()
            );
        }
        tracing::info!(
            "  {} already on disk, {} older than watermark, {} duplicates",
            self.skipped_existing,
            self.skipped_older,
            self.duplicates
        );
        tracing::info!("  destination: {}", destination.display());
        if let Some(ts) = self.new_watermark {
            tracing::info!("  watermark: {}", ts.to_rfc3339());
        }
        if self.stopped_early {
            tracing::info!("  stopped early after consecutive already-synced items");
        }
        if self.interrupted {
            tracing::info!("  interrupted before all downloads finished");
        }
        tracing::info!("  elapsed: {}", format_duration(self.elapsed));
        for failed in &self.failed {
            tracing::error!(
                "Download failed: {} ({} attempts): {}",
                failed.destination_path.display(),
                failed.attempts,
                failed.error
            );
        }
        for stall in &self.stalls {
            tracing::error!("{}", stall);
        }
    }
}

fn build_paginators(
    client: &ApiClient,
    credential: &Credential,
    options: &SyncOptions,
) -> Vec<Paginator> {
    let mut sources: Vec<Arc<dyn MediaSource>> = Vec::new();
    if options.sources.includes_tagged_images() {
        sources.push(Arc::new(TaggedImagesSource::new(
            client.clone(),
            credential.clone(),
            options.page_size,
            options.resolution,
        )));
    }
    if options.sources.includes_observations() {
        sources.push(Arc::new(ObservationsSource::new(
            client.clone(),
            credential.clone(),
            options.observation_page_size,
        )));
    }
    if options.include_messages {
        sources.push(Arc::new(ConversationsSource::new(
            client.clone(),
            credential.clone(),
        )));
    }
    sources
        .into_iter()
        .map(|s| Paginator::new(s).with_stall_policy(options.stall_limit, options.stall_delay))
        .collect()
}

/// Sync one child into `destination`.
///
/// Errors only for conditions that stop the whole child: auth failures, fatal
/// API errors, an unusable cache. Per-item failures and stalls are reported
/// in the result.
pub async fn sync_child(
    client: &ApiClient,
    engine: &DownloadEngine,
    store: &CredentialStore,
    credential: &Credential,
    destination: &Path,
    options: &SyncOptions,
    shutdown: CancellationToken,
) -> Result<SyncResult, SyncError> {
    let paginators = build_paginators(client, credential, options);
    let names: Vec<&str> = paginators.iter().map(Paginator::source_name).collect();
    tracing::info!(
        "Enumerating {} for {}{}",
        names.join(" + "),
        credential.display_name(),
        match (options.plan.full_refetch, credential.last_sync_timestamp) {
            (false, Some(ts)) => format!(" (incremental since {})", ts.to_rfc3339()),
            _ => " (full)".to_string(),
        }
    );
    sync_with_paginators(
        engine,
        store,
        credential,
        destination,
        options,
        &paginators,
        shutdown,
    )
    .await
}

/// The body of [`sync_child`], with the sources supplied by the caller.
pub async fn sync_with_paginators(
    engine: &DownloadEngine,
    store: &CredentialStore,
    credential: &Credential,
    destination: &Path,
    options: &SyncOptions,
    paginators: &[Paginator],
    shutdown: CancellationToken,
) -> Result<SyncResult, SyncError> {
    let started = Instant::now();

    let mut plan = SyncPlanner::new(destination, options.plan)
        .plan(credential, pagination::merge(paginators))
        .await?;
    tracing::info!(
        "Planned {} downloads ({} already on disk, {} older than watermark)",
        plan.tasks.len(),
        plan.skipped_existing,
        plan.skipped_older
    );

    let tasks = std::mem::take(&mut plan.tasks);
    let report = engine.run(credential, tasks, shutdown).await?;
    let mut result = SyncResult::from_parts(plan, report, options.dry_run);

    if options.dry_run {
        tracing::debug!("Dry run, leaving watermark untouched");
    } else if !result.stalls.is_empty() {
        tracing::warn!("Enumeration incomplete, leaving watermark untouched");
    } else if let Some(ts) = result.watermark_candidate() {
        if store.update_watermark(&credential.child_id, ts)? {
            result.new_watermark = Some(ts);
        }
    }

    result.elapsed = started.elapsed();
    Ok(result)
}

pub fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {:02}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}
