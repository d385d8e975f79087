//! Download engine: runs a batch of planned tasks with bounded concurrency,
//! isolating per-item failures and honouring cancellation.

pub mod error;
pub mod file;
pub mod paths;

use std::collections::HashSet;
use std::fs::FileTimes;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use url::Url;

pub use error::DownloadError;

use crate::credentials::Credential;
use crate::famly::MediaItem;
use crate::retry::RetryConfig;
use crate::sync::SyncError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// One file to fetch. `destination_path` is unique within a batch.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub item: MediaItem,
    pub destination_path: PathBuf,
    /// Attempts started so far.
    pub attempt: u32,
}

impl DownloadTask {
    pub fn new(item: MediaItem, destination_path: PathBuf) -> Self {
        Self {
            item,
            destination_path,
            attempt: 0,
        }
    }
}

#[derive(Debug)]
pub struct FailedDownload {
    pub item: MediaItem,
    pub destination_path: PathBuf,
    pub attempts: u32,
    pub error: DownloadError,
}

/// What happened to every task of a batch. Each task lands in exactly one of
/// the three lists.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub succeeded: Vec<MediaItem>,
    pub failed: Vec<FailedDownload>,
    /// Never started, or abandoned by cancellation.
    pub not_attempted: Vec<MediaItem>,
    pub interrupted: bool,
}

/// Subset of application config consumed by the download engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub workers: usize,
    pub retry: RetryConfig,
    pub dry_run: bool,
    pub no_progress_bar: bool,
}

pub struct DownloadEngine {
    client: Client,
    config: EngineConfig,
    /// The access token is only sent to this host, never to CDN URLs.
    api_host: Option<String>,
}

impl DownloadEngine {
    pub fn new(config: EngineConfig, api_base: &Url) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| DownloadError::Http {
                source: e,
                path: String::new(),
            })?;
        Ok(Self::with_client(client, config, api_base))
    }

    pub fn with_client(client: Client, config: EngineConfig, api_base: &Url) -> Self {
        Self {
            client,
            config: EngineConfig {
                workers: config.workers.max(1),
                ..config
            },
            api_host: api_base.host_str().map(str::to_string),
        }
    }

    fn token_for<'a>(&self, url: &str, credential: &'a Credential) -> Option<&'a str> {
        let host = Url::parse(url).ok()?.host_str()?.to_string();
        (Some(host) == self.api_host).then_some(credential.access_token.as_str())
    }

    /// Run every task. Per-item failures are collected, not raised. A 401
    /// halts the batch and returns [`SyncError::DownloadAuth`]; cancelling
    /// `shutdown` stops new tasks and abandons in-flight ones, leaving at most
    /// a `.part` file behind.
    pub async fn run(
        &self,
        credential: &Credential,
        tasks: Vec<DownloadTask>,
        shutdown: CancellationToken,
    ) -> Result<BatchReport, SyncError> {
        let mut report = BatchReport::default();

        if self.config.dry_run {
            for task in tasks {
                tracing::info!("[DRY RUN] Would download {}", task.destination_path.display());
                report.not_attempted.push(task.item);
            }
            return Ok(report);
        }
        if tasks.is_empty() {
            return Ok(report);
        }

        let pb = create_progress_bar(self.config.no_progress_bar, tasks.len() as u64);
        let halt = shutdown.child_token();
        let items: Vec<MediaItem> = tasks.iter().map(|t| t.item.clone()).collect();
        let mut finished: HashSet<usize> = HashSet::with_capacity(tasks.len());
        let mut auth_failure: Option<String> = None;

        let take_halt = halt.clone();
        let download_stream = stream::iter(tasks.into_iter().enumerate())
            .take_while(move |_| std::future::ready(!take_halt.is_cancelled()))
            .map(|(idx, task)| async move {
                let (task, result) = self.download_task(credential, task).await;
                (idx, task, result)
            })
            .buffer_unordered(self.config.workers);
        tokio::pin!(download_stream);

        loop {
            let next = tokio::select! {
                biased;
                _ = halt.cancelled() => break,
                next = download_stream.next() => next,
            };
            let Some((idx, task, result)) = next else {
                break;
            };
            finished.insert(idx);
            let filename = task
                .destination_path
                .file_name()
                .and_then(|f| f.to_str())
                .unwrap_or("")
                .to_string();
            pb.set_message(filename);

            match result {
                Ok(()) => report.succeeded.push(task.item),
                Err(e) => {
                    if e.is_auth() {
                        pb.suspend(|| {
                            tracing::error!(
                                "Access token rejected downloading {}, halting batch",
                                task.destination_path.display()
                            )
                        });
                        auth_failure = Some(task.destination_path.display().to_string());
                        halt.cancel();
                    } else {
                        pb.suspend(|| {
                            tracing::error!(
                                "Download failed: {}: {}",
                                task.destination_path.display(),
                                e
                            )
                        });
                    }
                    report.failed.push(FailedDownload {
                        item: task.item,
                        destination_path: task.destination_path,
                        attempts: task.attempt,
                        error: e,
                    });
                }
            }
            pb.inc(1);
        }
        pb.finish_and_clear();

        report.interrupted = halt.is_cancelled();
        if shutdown.is_cancelled() {
            tracing::info!("Shutdown requested, stopped handing out downloads");
        }
        report.not_attempted = items
            .into_iter()
            .enumerate()
            .filter(|(idx, _)| !finished.contains(idx))
            .map(|(_, item)| item)
            .collect();

        if let Some(path) = auth_failure {
            return Err(SyncError::DownloadAuth { path });
        }
        Ok(report)
    }

    /// Download one task and stamp its mtime with the capture time.
    async fn download_task(
        &self,
        credential: &Credential,
        mut task: DownloadTask,
    ) -> (DownloadTask, Result<(), DownloadError>) {
        let attempts = AtomicU32::new(task.attempt);
        let result = self.fetch(credential, &task, &attempts).await;
        task.attempt = attempts.load(Ordering::Relaxed);
        (task, result)
    }

    async fn fetch(
        &self,
        credential: &Credential,
        task: &DownloadTask,
        attempts: &AtomicU32,
    ) -> Result<(), DownloadError> {
        if let Some(parent) = task.destination_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tracing::debug!(
            id = %task.item.id,
            kind = task.item.kind.as_str(),
            path = %task.destination_path.display(),
            "downloading",
        );

        file::download_file(
            &self.client,
            &task.item.source_url,
            &task.destination_path,
            self.token_for(&task.item.source_url, credential),
            &self.config.retry,
            attempts,
        )
        .await?;

        let mtime_path = task.destination_path.clone();
        let ts = task.item.captured_at;
        match tokio::task::spawn_blocking(move || set_file_mtime(&mtime_path, ts)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(
                "Could not set mtime on {}: {}",
                task.destination_path.display(),
                e
            ),
            Err(e) => tracing::warn!("mtime task panicked: {}", e),
        }

        tracing::debug!("Downloaded {}", task.destination_path.display());
        Ok(())
    }
}

/// Create a progress bar with a consistent template.
///
/// Returns `ProgressBar::hidden()` when the user passed `--no-progress-bar` or
/// stdout is not a TTY.
fn create_progress_bar(no_progress_bar: bool, total: u64) -> ProgressBar {
    if no_progress_bar || !std::io::stdout().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    if let Ok(style) = ProgressStyle::with_template(
        "[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("=> "));
    }
    pb
}

/// Set the modification and access times of a file to the capture time.
/// Dates before 1970 clamp to the Unix epoch.
fn set_file_mtime(path: &Path, ts: DateTime<Utc>) -> std::io::Result<()> {
    let timestamp = ts.timestamp();
    let time = if timestamp >= 0 {
        UNIX_EPOCH + Duration::from_secs(timestamp as u64)
    } else {
        SystemTime::UNIX_EPOCH
    };
    let times = FileTimes::new().set_modified(time).set_accessed(time);
    let file = std::fs::File::options().write(true).open(path)?;
    file.set_times(times)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::famly::pagination::tests::media;
    use chrono::TimeZone;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn engine(server: &MockServer, workers: usize) -> DownloadEngine {
        let api_base = Url::parse(&server.uri()).unwrap();
        DownloadEngine::with_client(
            Client::new(),
            EngineConfig {
                workers,
                retry: RetryConfig::immediate(1),
                dry_run: false,
                no_progress_bar: true,
            },
            &api_base,
        )
    }

    fn task_for(server: &MockServer, dir: &Path, n: usize) -> DownloadTask {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
            + chrono::Duration::hours(n as i64);
        let mut item = media(&format!("item{:04}xyz", n), ts);
        item.source_url = format!("{}/media/{}", server.uri(), n);
        let dest = dir.join(paths::media_file_name(&item));
        DownloadTask::new(item, dest)
    }

    #[tokio::test]
    async fn test_one_failure_does_not_sink_the_batch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/media/5"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"img".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let tasks: Vec<_> = (0..10).map(|n| task_for(&server, dir.path(), n)).collect();
        let report = engine(&server, 3)
            .run(&Credential::new("c", "tok"), tasks, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.succeeded.len(), 9);
        assert_eq!(report.failed.len(), 1);
        assert!(report.not_attempted.is_empty());
        let failed = &report.failed[0];
        assert_eq!(failed.item.id, "item0005xyz");
        assert_eq!(failed.attempts, 1);
        assert!(matches!(failed.error, DownloadError::HttpStatus { status: 403, .. }));
        assert!(!failed.destination_path.exists());
        assert!(!paths::part_path(&failed.destination_path).exists());

        let on_disk = paths::ExistingMedia::scan(dir.path()).unwrap();
        assert_eq!(on_disk.len(), 9);
    }

    #[tokio::test]
    async fn test_unauthorized_halts_batch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/media/0"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"img".to_vec())
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let tasks: Vec<_> = (0..6).map(|n| task_for(&server, dir.path(), n)).collect();
        let err = engine(&server, 1)
            .run(&Credential::new("c", "tok"), tasks, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_auth());
        assert!(paths::ExistingMedia::scan(dir.path()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_leaves_no_partial_final_files() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"slow".to_vec())
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let tasks: Vec<_> = (0..4).map(|n| task_for(&server, dir.path(), n)).collect();
        let shutdown = CancellationToken::new();
        let canceller = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            canceller.cancel();
        });

        let report = engine(&server, 2)
            .run(&Credential::new("c", "tok"), tasks, shutdown)
            .await
            .unwrap();
        assert!(report.interrupted);
        assert!(report.succeeded.is_empty());
        assert_eq!(report.not_attempted.len(), 4);
        assert!(paths::ExistingMedia::scan(dir.path()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_token_only_sent_to_api_host() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/media/0"))
            .and(header(file::ACCESS_TOKEN_HEADER, "tok"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"x".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&server, 1);
        let cred = Credential::new("c", "tok");
        assert_eq!(engine.token_for("https://cdn.example/x.jpg", &cred), None);

        let report = engine
            .run(&cred, vec![task_for(&server, dir.path(), 0)], CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.succeeded.len(), 1);
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let api_base = Url::parse(&server.uri()).unwrap();
        let engine = DownloadEngine::with_client(
            Client::new(),
            EngineConfig {
                workers: 2,
                retry: RetryConfig::immediate(0),
                dry_run: true,
                no_progress_bar: true,
            },
            &api_base,
        );
        let tasks: Vec<_> = (0..3).map(|n| task_for(&server, dir.path(), n)).collect();
        let report = engine
            .run(&Credential::new("c", "tok"), tasks, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.not_attempted.len(), 3);
        assert!(report.succeeded.is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_mtime_matches_capture_time() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"x".to_vec()))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let task = task_for(&server, dir.path(), 3);
        let expected = task.item.captured_at.timestamp();
        let dest = task.destination_path.clone();
        engine(&server, 1)
            .run(&Credential::new("c", "tok"), vec![task], CancellationToken::new())
            .await
            .unwrap();
        let mtime = std::fs::metadata(&dest)
            .unwrap()
            .modified()
            .unwrap()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        assert_eq!(mtime, expected);
    }
}
