use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use futures_util::StreamExt;
use reqwest::Client;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use super::error::DownloadError;
use super::paths;
use crate::retry::{self, RetryAction, RetryConfig};

/// Header carrying the Famly access token.
pub(crate) const ACCESS_TOKEN_HEADER: &str = "x-famly-accesstoken";

/// Download a file from URL using a `.part` temp file.
///
/// Each attempt deletes any stale `.part` file and downloads from scratch. On
/// completion the `.part` file is fsynced and renamed onto `download_path`, so
/// the final name only ever holds a complete file. `attempts` is updated with
/// the number of attempts started.
pub async fn download_file(
    client: &Client,
    url: &str,
    download_path: &Path,
    access_token: Option<&str>,
    retry_config: &RetryConfig,
    attempts: &AtomicU32,
) -> Result<(), DownloadError> {
    let part_path = paths::part_path(download_path);
    let label = format!("download {}", download_path.display());

    let result = retry::retry_with_backoff(
        retry_config,
        &label,
        |e: &DownloadError| {
            if e.is_retryable() {
                RetryAction::Retry
            } else {
                RetryAction::Abort
            }
        },
        |attempt| {
            attempts.store(attempt + 1, Ordering::Relaxed);
            let part_path = &part_path;
            async move {
                let _ = fs::remove_file(part_path).await;
                attempt_download(client, url, download_path, part_path, access_token).await
            }
        },
    )
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&part_path).await;
    }
    result
}

/// Single download attempt.
async fn attempt_download(
    client: &Client,
    url: &str,
    download_path: &Path,
    part_path: &Path,
    access_token: Option<&str>,
) -> Result<(), DownloadError> {
    let path_str = download_path.display().to_string();
    let mut request = client.get(url);
    if let Some(token) = access_token {
        request = request.header(ACCESS_TOKEN_HEADER, token);
    }
    let response = request.send().await.map_err(|e| DownloadError::Http {
        source: e,
        path: path_str.clone(),
    })?;

    if !response.status().is_success() {
        return Err(DownloadError::HttpStatus {
            status: response.status().as_u16(),
            path: path_str,
        });
    }

    let content_length = response.content_length();

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(part_path)
        .await?;

    let mut bytes_written: u64 = 0;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| {
            tracing::warn!(
                "Body error for {} (content_length={:?}, bytes_so_far={}): {}",
                path_str,
                content_length,
                bytes_written,
                e
            );
            DownloadError::Http {
                source: e,
                path: path_str.clone(),
            }
        })?;
        file.write_all(&chunk).await?;
        bytes_written += chunk.len() as u64;
    }
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(part_path, download_path).await?;

    tracing::debug!(bytes = bytes_written, path = %path_str, "download complete");
    Ok(())
}
