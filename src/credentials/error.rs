use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CredentialError {
    /// The cache exists but cannot be trusted. Never silently overwritten.
    #[error(
        "Credential cache {path} is corrupt ({reason}); fix or delete it, then run with --login"
    )]
    CorruptCache { path: PathBuf, reason: String },

    #[error("No cached credential for child {0}")]
    UnknownProfile(String),

    #[error(
        "Credential cache holds several children ({}); pick one with --child-id",
        .0.join(", ")
    )]
    AmbiguousProfile(Vec<String>),

    #[error("Credential cache I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}
