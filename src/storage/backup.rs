//! Timestamped backup copies with newest-K retention.
//!
//! Backups live next to their source as `<file>.backup_<yyyy-MM-dd_HH-mm-ss>`.
//! Ordering is by modification time, with the file name as tiebreak.

use crate::core::{BackupPolicy, PersistError, Result};
use crate::storage::retry::retry_with_backoff;
use crate::storage::{file_name_of, sibling_path};
use chrono::{Local, NaiveDateTime};
use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;

pub const BACKUP_MARKER: &str = ".backup_";
pub const BACKUP_TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// One retained snapshot of a source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupEntry {
    pub path: PathBuf,
    /// File name of the source this backup belongs to.
    pub source_name: String,
    /// Timestamp encoded in the backup name, if it parses.
    pub created_at: Option<NaiveDateTime>,
    pub modified: SystemTime,
    /// Position in the newest-first listing (0 = newest).
    pub age: usize,
}

impl BackupEntry {
    pub fn file_name(&self) -> String {
        file_name_of(&self.path)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackupRotation {
    policy: BackupPolicy,
}

impl BackupRotation {
    pub fn new(policy: BackupPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &BackupPolicy {
        &self.policy
    }

    /// Number of backups retained per source (never below 1).
    pub fn max_backups(&self) -> usize {
        self.policy.max_backups.max(1)
    }

    /// Backs up `path` using the current local time.
    pub async fn create(&self, path: &Path) -> Result<BackupEntry> {
        self.create_at(path, Local::now().naive_local()).await
    }

    /// Copies `path` to `path.backup_<at>` and then applies retention.
    ///
    /// Fails with `NotFound` if the source does not exist. Two backups taken
    /// within the same second share a name; the later one replaces the earlier.
    pub async fn create_at(&self, path: &Path, at: NaiveDateTime) -> Result<BackupEntry> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Err(PersistError::NotFound(path.to_path_buf()));
        }

        let target = sibling_path(
            path,
            &format!("{}{}", BACKUP_MARKER, at.format(BACKUP_TIMESTAMP_FORMAT)),
        );
        let operation = format!("backup of '{}'", path.display());
        retry_with_backoff(&self.policy.retry, &operation, || {
            let source = path.to_path_buf();
            let target = target.clone();
            async move {
                fs::copy(&source, &target)
                    .await
                    .map_err(|err| PersistError::io("Failed to copy backup from", &source, err))
            }
        })
        .await?;

        let modified = fs::metadata(&target)
            .await
            .and_then(|meta| meta.modified())
            .unwrap_or_else(|_| SystemTime::now());
        debug!("Created backup '{}'", target.display());

        self.cleanup(path).await;

        Ok(BackupEntry {
            path: target,
            source_name: file_name_of(path),
            created_at: Some(at),
            modified,
            age: 0,
        })
    }

    /// Deletes the oldest backups of `path` beyond the retention limit.
    ///
    /// Returns how many were removed. Errors are logged and skipped.
    pub async fn cleanup(&self, path: &Path) -> usize {
        let backups = match self.list(path).await {
            Ok(backups) => backups,
            Err(err) => {
                warn!("Failed to list backups of '{}': {}", path.display(), err);
                return 0;
            }
        };

        let keep = self.max_backups();
        if backups.len() <= keep {
            return 0;
        }

        let mut removed = 0;
        for entry in backups.iter().skip(keep).rev() {
            match fs::remove_file(&entry.path).await {
                Ok(()) => {
                    removed += 1;
                    debug!("Deleted old backup '{}'", entry.path.display());
                }
                Err(err) => warn!(
                    "Failed to delete old backup '{}': {}",
                    entry.path.display(),
                    err
                ),
            }
        }
        removed
    }

    /// Copies the newest backup over `path`.
    ///
    /// Returns `Ok(false)` when no backup exists. The copy goes through a
    /// temp file and a rename, so `path` is replaced atomically.
    pub async fn restore(&self, path: &Path) -> Result<bool> {
        let Some(latest) = self.latest(path).await? else {
            return Ok(false);
        };

        let operation = format!("restore of '{}'", path.display());
        retry_with_backoff(&self.policy.retry, &operation, || {
            let source = latest.path.clone();
            let target = path.to_path_buf();
            async move { copy_atomically(&source, &target).await }
        })
        .await?;

        warn!(
            "Restored '{}' from backup '{}'",
            path.display(),
            latest.file_name()
        );
        Ok(true)
    }

    pub async fn latest(&self, path: &Path) -> Result<Option<BackupEntry>> {
        Ok(self.list(path).await?.into_iter().next())
    }

    /// Lists backups of `path`, newest first.
    pub async fn list(&self, path: &Path) -> Result<Vec<BackupEntry>> {
        let source_name = file_name_of(path);
        let prefix = format!("{}{}", source_name, BACKUP_MARKER);
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let mut reader = match fs::read_dir(&dir).await {
            Ok(reader) => reader,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(PersistError::io("Failed to list directory", &dir, err)),
        };

        let mut backups = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|err| PersistError::io("Failed to list directory", &dir, err))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(stamp) = name.strip_prefix(&prefix) else {
                continue;
            };
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            backups.push(BackupEntry {
                path: entry.path(),
                source_name: source_name.clone(),
                created_at: NaiveDateTime::parse_from_str(stamp, BACKUP_TIMESTAMP_FORMAT).ok(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                age: 0,
            });
        }

        backups.sort_by(|a, b| {
            b.modified
                .cmp(&a.modified)
                .then_with(|| b.path.cmp(&a.path))
        });
        for (age, entry) in backups.iter_mut().enumerate() {
            entry.age = age;
        }
        Ok(backups)
    }

    /// Number of backups of `path`; listing errors count as zero.
    pub async fn count(&self, path: &Path) -> usize {
        self.list(path).await.map(|list| list.len()).unwrap_or(0)
    }
}

async fn copy_atomically(source: &Path, target: &Path) -> Result<()> {
    let tmp = sibling_path(target, ".restore.tmp");
    fs::copy(source, &tmp)
        .await
        .map_err(|err| PersistError::io("Failed to copy backup", source, err))?;
    if let Err(err) = fs::rename(&tmp, target).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(PersistError::io("Failed to replace", target, err));
    }
    Ok(())
}
