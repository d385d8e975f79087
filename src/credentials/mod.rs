//! Credential cache: one JSON file in the output directory holding, per child,
//! the access token and the sync watermark.
//!
//! Writes go to a temp file that is renamed into place, so a crash leaves
//! either the old or the new cache and never a truncated one.

pub mod error;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rand::Rng as _;
use serde::{Deserialize, Serialize};

pub use error::CredentialError;

/// Cache file name inside the output directory.
pub const CACHE_FILE_NAME: &str = ".famly-sync.json";

const CACHE_VERSION: u32 = 1;

/// Access token and sync state for one child.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub child_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_name: Option<String>,
    pub access_token: String,
    /// `capturedAt` of the newest item known to be safely on disk.
    #[serde(default)]
    pub last_sync_timestamp: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("child_id", &self.child_id)
            .field("child_name", &self.child_name)
            .field("access_token", &"<redacted>")
            .field("last_sync_timestamp", &self.last_sync_timestamp)
            .finish()
    }
}

impl Credential {
    pub fn new(child_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            child_id: child_id.into(),
            child_name: None,
            access_token: access_token.into(),
            last_sync_timestamp: None,
        }
    }

    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.child_name = name;
        self
    }

    /// Name for log lines: the child's name if known, else the id.
    pub fn display_name(&self) -> &str {
        self.child_name.as_deref().unwrap_or(&self.child_id)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheFile {
    version: u32,
    #[serde(default)]
    saved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    profiles: BTreeMap<String, Credential>,
}

/// Reads and writes the credential cache file.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// Store for the cache file inside `output_dir`.
    pub fn new(output_dir: &Path) -> Self {
        Self {
            path: output_dir.join(CACHE_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load one profile.
    ///
    /// With a hint, returns that child's profile (or `None`). Without one the
    /// cache must hold at most one profile, otherwise the choice is ambiguous.
    /// A missing cache is `Ok(None)`; an unreadable one is `CorruptCache`.
    pub fn load(&self, profile_hint: Option<&str>) -> Result<Option<Credential>, CredentialError> {
        let Some(cache) = self.read()? else {
            return Ok(None);
        };
        match profile_hint {
            Some(child_id) => Ok(cache.profiles.get(child_id).cloned()),
            None => match cache.profiles.len() {
                0 => Ok(None),
                1 => Ok(cache.profiles.into_values().next()),
                _ => Err(CredentialError::AmbiguousProfile(
                    cache.profiles.into_keys().collect(),
                )),
            },
        }
    }

    /// Every cached profile, ordered by child id.
    pub fn load_all(&self) -> Result<Vec<Credential>, CredentialError> {
        Ok(self
            .read()?
            .map(|cache| cache.profiles.into_values().collect())
            .unwrap_or_default())
    }

    /// Insert or replace a profile.
    ///
    /// The stored watermark never moves backwards: if the cache already holds
    /// a later `last_sync_timestamp` for this child, it is kept. A corrupt
    /// existing cache is reported, not overwritten.
    pub fn save(&self, credential: &Credential) -> Result<(), CredentialError> {
        let mut cache = self.read()?.unwrap_or_default();
        let mut incoming = credential.clone();
        if let Some(existing) = cache.profiles.get(&credential.child_id) {
            incoming.last_sync_timestamp =
                incoming.last_sync_timestamp.max(existing.last_sync_timestamp);
            if incoming.child_name.is_none() {
                incoming.child_name = existing.child_name.clone();
            }
        }
        cache.profiles.insert(incoming.child_id.clone(), incoming);
        self.write(cache)
    }

    /// Advance a child's watermark. Returns `false` without writing when `ts`
    /// is not later than the stored value.
    pub fn update_watermark(
        &self,
        child_id: &str,
        ts: DateTime<Utc>,
    ) -> Result<bool, CredentialError> {
        let mut cache = self.read()?.unwrap_or_default();
        let profile = cache
            .profiles
            .get_mut(child_id)
            .ok_or_else(|| CredentialError::UnknownProfile(child_id.to_string()))?;
        if profile.last_sync_timestamp.is_some_and(|current| current >= ts) {
            tracing::debug!(
                child_id,
                "Watermark {} not ahead of stored value, keeping it",
                ts.to_rfc3339()
            );
            return Ok(false);
        }
        profile.last_sync_timestamp = Some(ts);
        self.write(cache)?;
        Ok(true)
    }

    fn read(&self) -> Result<Option<CacheFile>, CredentialError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CredentialError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let cache: CacheFile = serde_json::from_str(&contents).map_err(|e| self.corrupt(e))?;
        if cache.version != CACHE_VERSION {
            return Err(self.corrupt(format!("unsupported version {}", cache.version)));
        }
        for (key, profile) in &cache.profiles {
            if profile.child_id.trim().is_empty() || profile.access_token.trim().is_empty() {
                return Err(self.corrupt(format!("profile {key} has an empty id or token")));
            }
            if *key != profile.child_id {
                return Err(self.corrupt(format!(
                    "profile key {key} does not match child id {}",
                    profile.child_id
                )));
            }
        }
        Ok(Some(cache))
    }

    fn write(&self, mut cache: CacheFile) -> Result<(), CredentialError> {
        cache.version = CACHE_VERSION;
        cache.saved_at = Some(Utc::now());
        let json = serde_json::to_vec_pretty(&cache).map_err(|e| self.corrupt(e))?;
        self.write_atomic(&json).map_err(|source| CredentialError::Io {
            path: self.path.clone(),
            source,
        })
    }

    fn write_atomic(&self, content: &[u8]) -> std::io::Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;

        let random: u32 = rand::thread_rng().gen();
        let tmp_path = dir.join(format!("{}.{:x}.tmp", CACHE_FILE_NAME, random));
        fs::write(&tmp_path, content)?;

        // The cache holds access tokens; restrict to owner only.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))?;
        }

        if let Err(e) = fs::rename(&tmp_path, &self.path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }
        Ok(())
    }

    fn corrupt(&self, reason: impl std::fmt::Display) -> CredentialError {
        CredentialError::CorruptCache {
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }
}
