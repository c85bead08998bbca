//! Durable single-file primitive: temp file + atomic rename, plus quarantine
//! of corrupt files.

use crate::core::{DurabilityMode, PersistError, Result};
use crate::storage::sibling_path;
use chrono::Utc;
use log::{error, info};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

pub const TEMP_SUFFIX: &str = ".tmp";
pub const QUARANTINE_MARKER: &str = ".CORRUPT_";

#[derive(Debug, Clone, Copy, Default)]
pub struct AtomicFileStore {
    durability: DurabilityMode,
}

impl AtomicFileStore {
    pub fn new(durability: DurabilityMode) -> Self {
        Self { durability }
    }

    pub fn durability(&self) -> DurabilityMode {
        self.durability
    }

    /// Path of the transient file used while writing `path`.
    pub fn temp_path(path: &Path) -> PathBuf {
        sibling_path(path, TEMP_SUFFIX)
    }

    /// Writes `bytes` to `path` so that readers see either the old content or
    /// the new content, never a partial file.
    ///
    /// 1. Creates the parent directory.
    /// 2. Writes and flushes `path.tmp` (and `fsync`s it in `Sync` mode).
    /// 3. Renames `path.tmp` over `path`.
    ///
    /// If any step fails the rename never happens, so an existing `path` is
    /// left untouched. The temp file is removed on a best-effort basis.
    pub async fn write(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.map_err(|err| {
                    PersistError::io("Failed to create parent directory", parent, err)
                })?;
            }
        }

        let tmp = Self::temp_path(path);
        let result = self.write_and_rename(&tmp, path, bytes).await;
        if result.is_err() {
            let _ = fs::remove_file(&tmp).await;
        }
        result
    }

    async fn write_and_rename(&self, tmp: &Path, path: &Path, bytes: &[u8]) -> Result<()> {
        let mut file = fs::File::create(tmp)
            .await
            .map_err(|err| PersistError::io("Failed to create temp file", tmp, err))?;
        file.write_all(bytes)
            .await
            .map_err(|err| PersistError::io("Failed to write temp file", tmp, err))?;
        file.flush()
            .await
            .map_err(|err| PersistError::io("Failed to flush temp file", tmp, err))?;
        if self.durability == DurabilityMode::Sync {
            file.sync_all()
                .await
                .map_err(|err| PersistError::io("Failed to sync temp file", tmp, err))?;
        }
        drop(file);

        fs::rename(tmp, path).await.map_err(|err| {
            PersistError::IoError(format!(
                "Failed to rename temp file '{}' -> '{}': {}",
                tmp.display(),
                path.display(),
                err
            ))
        })?;

        #[cfg(unix)]
        if self.durability == DurabilityMode::Sync {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                if let Ok(dir) = fs::File::open(parent).await {
                    let _ = dir.sync_all().await;
                }
            }
        }

        Ok(())
    }

    /// Reads the raw bytes of `path`.
    ///
    /// Fails with `NotFound` when the file is absent and with `Corrupted`
    /// when it is empty.
    pub async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let bytes = fs::read(path)
            .await
            .map_err(|err| PersistError::io("Failed to read", path, err))?;
        if bytes.is_empty() {
            return Err(PersistError::Corrupted {
                path: path.to_path_buf(),
                reason: "file is empty".to_string(),
            });
        }
        Ok(bytes)
    }

    /// Reads `path` and decodes it. Decoder serialization failures are
    /// reported as `Corrupted` for this path.
    pub async fn read_decoded<T, F>(&self, path: &Path, decode: F) -> Result<T>
    where
        F: FnOnce(&[u8]) -> Result<T>,
    {
        let bytes = self.read(path).await?;
        decode(&bytes).map_err(|err| match err {
            PersistError::Serialization(reason) => PersistError::Corrupted {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })
    }

    /// Copies `path` to `path.CORRUPT_<epoch-millis>` before the caller resets
    /// or overwrites it. Returns the quarantine path, or `None` when there was
    /// nothing to copy or the copy failed (failures are logged only).
    pub async fn quarantine(&self, path: &Path) -> Option<PathBuf> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            return None;
        }

        let mut millis = Utc::now().timestamp_millis();
        let mut target = sibling_path(path, &format!("{}{}", QUARANTINE_MARKER, millis));
        while fs::try_exists(&target).await.unwrap_or(false) {
            millis += 1;
            target = sibling_path(path, &format!("{}{}", QUARANTINE_MARKER, millis));
        }

        match fs::copy(path, &target).await {
            Ok(_) => {
                info!(
                    "Quarantined corrupt file '{}' as '{}'",
                    path.display(),
                    target.display()
                );
                Some(target)
            }
            Err(err) => {
                error!(
                    "Failed to quarantine corrupt file '{}': {}",
                    path.display(),
                    err
                );
                None
            }
        }
    }
}
