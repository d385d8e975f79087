//! Turns the merged media stream into download tasks, deciding per item
//! whether it is already on disk, older than the watermark, or new.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt};

use super::SyncError;
use crate::credentials::Credential;
use crate::download::{paths, DownloadTask};
use crate::famly::MediaItem;

#[derive(Debug, Clone, Copy, Default)]
pub struct PlanOptions {
    /// Ignore the watermark and drain every source.
    pub full_refetch: bool,
    /// Stop after this many consecutive items that need nothing. Ignored on a
    /// full refetch.
    pub until_found: Option<u32>,
    /// Skip anything captured before this instant.
    pub not_before: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct SyncPlan {
    pub tasks: Vec<DownloadTask>,
    pub skipped_existing: usize,
    pub skipped_older: usize,
    /// Items seen more than once (by id, or by destination path).
    pub duplicates: usize,
    /// Pagination stalls; each ended one source early.
    pub stalls: Vec<SyncError>,
    pub stopped_early: bool,
}

pub struct SyncPlanner {
    destination: PathBuf,
    options: PlanOptions,
}

impl SyncPlanner {
    pub fn new(destination: &Path, options: PlanOptions) -> Self {
        Self {
            destination: destination.to_path_buf(),
            options,
        }
    }

    /// Pull items from `stream` and decide what to download.
    ///
    /// An item is skipped when its own file is already on disk, or, for feeds
    /// that follow the watermark, when it was captured strictly before it
    /// (unless this is a full refetch). Items sharing a capture time with the
    /// watermark are still checked. Stalls are collected; any other error
    /// aborts planning.
    pub async fn plan<S>(&self, credential: &Credential, stream: S) -> Result<SyncPlan, SyncError>
    where
        S: Stream<Item = Result<MediaItem, SyncError>>,
    {
        let existing = paths::ExistingMedia::scan(&self.destination).map_err(|source| {
            SyncError::Scan {
                path: self.destination.display().to_string(),
                source,
            }
        })?;
        let watermark = if self.options.full_refetch {
            None
        } else {
            credential.last_sync_timestamp
        };
        let until_found = if self.options.full_refetch {
            None
        } else {
            self.options.until_found
        };

        let mut plan = SyncPlan::default();
        let mut seen_ids: HashSet<String> = HashSet::new();
        let mut claimed: HashSet<PathBuf> = HashSet::new();
        let mut consecutive_done = 0u32;

        futures_util::pin_mut!(stream);
        while let Some(next) = stream.next().await {
            let item = match next {
                Ok(item) => item,
                Err(e) if e.is_stall() => {
                    tracing::warn!("{}; continuing with the other sources", e);
                    plan.stalls.push(e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            if !seen_ids.insert(item.id.clone()) {
                plan.duplicates += 1;
                continue;
            }

            let file_name = paths::media_file_name(&item);
            let below_watermark = item.origin.follows_watermark()
                && watermark.is_some_and(|wm| item.captured_at < wm);
            let nothing_to_do = if existing.contains_file(&file_name) {
                plan.skipped_existing += 1;
                true
            } else if below_watermark
                || self.options.not_before.is_some_and(|nb| item.captured_at < nb)
            {
                plan.skipped_older += 1;
                true
            } else {
                false
            };

            if nothing_to_do {
                consecutive_done += 1;
                if until_found.is_some_and(|n| consecutive_done >= n) {
                    tracing::info!(
                        "Found {} consecutive items already synced, stopping enumeration",
                        consecutive_done
                    );
                    plan.stopped_early = true;
                    break;
                }
                continue;
            }
            consecutive_done = 0;

            if existing.contains_short_id(paths::short_id(&item.id)) {
                tracing::warn!(
                    id = %item.id,
                    "A different file on disk shares this item's short id, downloading {}",
                    file_name
                );
            }
            let destination_path = self.destination.join(file_name);
            if !claimed.insert(destination_path.clone()) {
                tracing::warn!(
                    id = %item.id,
                    "Another item already maps to {}, skipping",
                    destination_path.display()
                );
                plan.duplicates += 1;
                continue;
            }
            plan.tasks.push(DownloadTask::new(item, destination_path));
        }

        Ok(plan)
    }
}
