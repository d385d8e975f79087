use std::path::{Path, PathBuf};

use anyhow::Context;
use fs4::fs_std::FileExt;

/// Lock file name inside the output directory.
pub const LOCK_FILE_NAME: &str = ".famly-sync.lock";

/// Exclusive advisory lock on an output directory, held for the lifetime of
/// the value. Two runs against the same directory would race on the same
/// destination paths and on the credential cache.
#[derive(Debug)]
pub struct SyncLock {
    _file: std::fs::File,
    path: PathBuf,
}

impl SyncLock {
    pub async fn acquire(dir: &Path) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create output directory: {}", dir.display()))?;

        let lock_path = dir.join(LOCK_FILE_NAME);
        tokio::task::spawn_blocking(move || {
            let file = std::fs::File::create(&lock_path).with_context(|| {
                format!("Failed to create lock file: {}", lock_path.display())
            })?;
            file.try_lock_exclusive().map_err(|_| {
                anyhow::anyhow!(
                    "Another famly-sync run is using this output directory (lock: {})",
                    lock_path.display()
                )
            })?;
            Ok(SyncLock {
                _file: file,
                path: lock_path,
            })
        })
        .await?
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
