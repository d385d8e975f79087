use thiserror::Error;

/// Per-item download failure. Recorded against the item and never aborts the
/// batch, except that a 401 halts it (see [`DownloadError::is_auth`]).
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("HTTP error {status} downloading {path}")]
    HttpStatus { status: u16, path: String },

    #[error("HTTP error downloading {path}: {source}")]
    Http {
        source: reqwest::Error,
        path: String,
    },

    #[error("Disk error: {0}")]
    Disk(#[from] std::io::Error),
}

impl DownloadError {
    /// Whether this error is transient and worth retrying.
    ///
    /// 403/404/410 usually mean the pre-signed URL expired or the item was
    /// removed; the next run fetches a fresh URL, so retrying now is pointless.
    pub fn is_retryable(&self) -> bool {
        match self {
            DownloadError::HttpStatus { status, .. } => {
                *status == 408 || *status == 429 || *status >= 500
            }
            DownloadError::Http { .. } => true,
            DownloadError::Disk(_) => false,
        }
    }

    /// A 401 on a media URL means the access token itself is no longer valid.
    pub fn is_auth(&self) -> bool {
        matches!(self, DownloadError::HttpStatus { status: 401, .. })
    }
}
