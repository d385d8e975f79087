use thiserror::Error;

use crate::credentials::CredentialError;
use crate::famly::ApiError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Api(#[from] ApiError),

    /// A source kept answering with empty, non-final pages. Ends that source
    /// only; the archive may be incomplete.
    #[error("Pagination stalled on {source_name} at {cursor} after {attempts} empty pages")]
    PaginationStall {
        source_name: &'static str,
        cursor: String,
        attempts: u32,
    },

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("Access token rejected while downloading {path} (HTTP 401)")]
    DownloadAuth { path: String },

    #[error("Cannot scan {path}: {source}")]
    Scan {
        path: String,
        source: std::io::Error,
    },
}

impl SyncError {
    /// The access token is no longer accepted; the run must stop and the user
    /// must log in again.
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            SyncError::Api(ApiError::Auth { .. }) | SyncError::DownloadAuth { .. }
        )
    }

    pub fn is_stall(&self) -> bool {
        matches!(self, SyncError::PaginationStall { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_classification() {
        let api = SyncError::from(ApiError::Auth {
            endpoint: "/x".into(),
        });
        assert!(api.is_auth());
        assert!(SyncError::DownloadAuth { path: "p".into() }.is_auth());
        let stall = SyncError::PaginationStall {
            source_name: "tagged-images",
            cursor: "offset 100".into(),
            attempts: 4,
        };
        assert!(!stall.is_auth());
        assert!(stall.is_stall());
        assert!(stall.to_string().contains("tagged-images"));
    }
}
