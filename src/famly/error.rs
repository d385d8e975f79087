use thiserror::Error;

/// Failure talking to the Famly API, classified for the retry loop.
#[derive(Error, Debug)]
pub enum ApiError {
    /// Token rejected. Never retried; the run must stop and ask for a fresh login.
    #[error("Access token rejected by {endpoint} (HTTP 401)")]
    Auth { endpoint: String },

    /// Timeouts, connection failures, 429 and 5xx. Retried with backoff.
    #[error("Transient error from {endpoint}: {reason}")]
    Transient { endpoint: String, reason: String },

    /// Anything else: unexpected status, undecodable body, GraphQL errors.
    #[error("Request to {endpoint} failed: {reason}")]
    Fatal { endpoint: String, reason: String },
}

impl ApiError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transient { .. })
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, ApiError::Auth { .. })
    }

    pub(crate) fn from_status(endpoint: &str, status: u16, body: &str) -> Self {
        let endpoint = endpoint.to_string();
        let reason = format!("HTTP {}: {}", status, truncate(body, 200));
        match status {
            401 => ApiError::Auth { endpoint },
            429 | 500..=599 => ApiError::Transient { endpoint, reason },
            _ => ApiError::Fatal { endpoint, reason },
        }
    }

    pub(crate) fn from_transport(endpoint: &str, err: &reqwest::Error) -> Self {
        let endpoint = endpoint.to_string();
        let reason = err.to_string();
        if err.is_builder() {
            ApiError::Fatal { endpoint, reason }
        } else {
            ApiError::Transient { endpoint, reason }
        }
    }

    pub(crate) fn fatal(endpoint: &str, reason: impl Into<String>) -> Self {
        ApiError::Fatal {
            endpoint: endpoint.to_string(),
            reason: reason.into(),
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
