//! The dataset engine: one payload bound to one file, with dirty tracking,
//! backup-before-write saves and self-healing loads.

use crate::core::{PersistError, PersistPolicy, Result, RetryPolicy};
use crate::persist::codec::{Decoded, PayloadCodec};
use crate::persist::health::{DatasetHealth, RECOVERED_FROM_BACKUP, SystemHealth};
use crate::scheduler::Saveable;
use crate::storage::{AtomicFileStore, BackupRotation, retry_with_backoff};
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::fs;
use tracing::{Instrument, Level, event, info_span};

pub const DEFAULT_PRIORITY: u8 = 5;
pub const MAX_PRIORITY: u8 = 10;

type PayloadHook<P> = Arc<dyn Fn(&mut P) + Send + Sync>;
type LoadedHook<P> = Arc<dyn Fn(&P) + Send + Sync>;
type DetailsHook<P> = Arc<dyn Fn(&P) -> String + Send + Sync>;

/// Callbacks a dataset owner plugs into the engine.
pub struct DatasetHooks<P> {
    on_loaded: Option<LoadedHook<P>>,
    on_no_file_found: Option<PayloadHook<P>>,
    on_critical_failure: Option<PayloadHook<P>>,
    details: Option<DetailsHook<P>>,
}

impl<P> Default for DatasetHooks<P> {
    fn default() -> Self {
        Self {
            on_loaded: None,
            on_no_file_found: None,
            on_critical_failure: None,
            details: None,
        }
    }
}

impl<P> DatasetHooks<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with the payload after a successful load or backup recovery.
    pub fn on_loaded<F>(mut self, hook: F) -> Self
    where
        F: Fn(&P) + Send + Sync + 'static,
    {
        self.on_loaded = Some(Arc::new(hook));
        self
    }

    /// Called with the fresh empty payload when no file exists yet.
    pub fn on_no_file_found<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut P) + Send + Sync + 'static,
    {
        self.on_no_file_found = Some(Arc::new(hook));
        self
    }

    /// Called with the empty payload after the dataset was reset because
    /// neither the file nor any backup could be read.
    pub fn on_critical_failure<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut P) + Send + Sync + 'static,
    {
        self.on_critical_failure = Some(Arc::new(hook));
        self
    }

    /// Produces the human-readable detail line of the health report.
    pub fn details<F>(mut self, hook: F) -> Self
    where
        F: Fn(&P) -> String + Send + Sync + 'static,
    {
        self.details = Some(Arc::new(hook));
        self
    }
}

impl<P> fmt::Debug for DatasetHooks<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatasetHooks")
            .field("on_loaded", &self.on_loaded.is_some())
            .field("on_no_file_found", &self.on_no_file_found.is_some())
            .field("on_critical_failure", &self.on_critical_failure.is_some())
            .field("details", &self.details.is_some())
            .finish()
    }
}

/// What `load()` ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// No file on disk; the dataset starts empty.
    NoFile,
    Loaded { migrated: bool },
    /// The file was unreadable and the newest backup replaced it.
    RecoveredFromBackup,
    /// Neither the file nor a backup was usable; the payload was reset.
    Reset,
    /// The file was written by a newer runtime. It is left untouched and the
    /// dataset refuses to save until a later load succeeds.
    IncompatibleVersion { stored: u32, current: u32 },
}

#[derive(Debug, Default)]
struct HealthState {
    unhealthy: bool,
    last_error: Option<String>,
}

/// One named payload persisted to one file.
pub struct PersistentDataset<C: PayloadCodec> {
    name: String,
    path: PathBuf,
    priority: u8,
    codec: C,
    hooks: DatasetHooks<C::Payload>,
    store: AtomicFileStore,
    backups: BackupRotation,
    write_retry: RetryPolicy,
    load_retry: RetryPolicy,
    payload: RwLock<C::Payload>,
    // Bumped by every mark; the dataset is dirty while it is ahead of the
    // generation captured by the last durable write.
    dirty_generation: AtomicU64,
    clean_generation: AtomicU64,
    // Set when the stored file belongs to a newer runtime.
    write_blocked: AtomicBool,
    // Set after a critical reset whose corrupt file was quarantined; the next
    // save skips the backup so that file does not push a good backup out of
    // rotation.
    disk_corrupt: AtomicBool,
    health: Mutex<HealthState>,
    save_guard: tokio::sync::Mutex<()>,
    writes: AtomicU64,
}

impl<C: PayloadCodec> PersistentDataset<C> {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, codec: C) -> Self {
        let policy = PersistPolicy::default();
        let payload = codec.empty();
        Self {
            name: name.into(),
            path: path.into(),
            priority: DEFAULT_PRIORITY,
            codec,
            hooks: DatasetHooks::default(),
            store: AtomicFileStore::new(policy.durability),
            backups: BackupRotation::new(policy.backup),
            write_retry: policy.write_retry,
            load_retry: policy.load_retry,
            payload: RwLock::new(payload),
            dirty_generation: AtomicU64::new(0),
            clean_generation: AtomicU64::new(0),
            write_blocked: AtomicBool::new(false),
            disk_corrupt: AtomicBool::new(false),
            health: Mutex::new(HealthState::default()),
            save_guard: tokio::sync::Mutex::new(()),
            writes: AtomicU64::new(0),
        }
    }

    /// Lower values save first; clamped to `0..=10`.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(MAX_PRIORITY);
        self
    }

    pub fn with_hooks(mut self, hooks: DatasetHooks<C::Payload>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_policy(mut self, policy: PersistPolicy) -> Self {
        self.store = AtomicFileStore::new(policy.durability);
        self.backups = BackupRotation::new(policy.backup);
        self.write_retry = policy.write_retry;
        self.load_retry = policy.load_retry;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn backups(&self) -> &BackupRotation {
        &self.backups
    }

    // ========================================================================
    // Payload access
    // ========================================================================

    pub fn read<R>(&self, f: impl FnOnce(&C::Payload) -> R) -> Result<R> {
        let payload = self.payload.read()?;
        Ok(f(&payload))
    }

    /// Mutates the payload and marks the dataset dirty.
    pub fn update<R>(&self, f: impl FnOnce(&mut C::Payload) -> R) -> Result<R> {
        let result = {
            let mut payload = self.payload.write()?;
            f(&mut payload)
        };
        self.mark_dirty();
        Ok(result)
    }

    pub fn replace(&self, payload: C::Payload) -> Result<()> {
        *self.payload.write()? = payload;
        self.mark_dirty();
        Ok(())
    }

    // ========================================================================
    // Dirty tracking and health
    // ========================================================================

    pub fn mark_dirty(&self) {
        self.dirty_generation.fetch_add(1, Ordering::SeqCst);
    }

    /// True until a write that started after the latest mark has succeeded.
    pub fn is_dirty(&self) -> bool {
        self.dirty_generation.load(Ordering::SeqCst) != self.clean_generation.load(Ordering::SeqCst)
    }

    fn mark_clean(&self) {
        let generation = self.dirty_generation.load(Ordering::SeqCst);
        self.clean_generation.store(generation, Ordering::SeqCst);
    }

    pub fn needs_save(&self) -> bool {
        self.is_dirty()
    }

    pub fn is_healthy(&self) -> bool {
        self.health
            .lock()
            .map(|state| !state.unhealthy)
            .unwrap_or(false)
    }

    pub fn is_write_blocked(&self) -> bool {
        self.write_blocked.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<String> {
        self.health
            .lock()
            .ok()
            .and_then(|state| state.last_error.clone())
    }

    /// Owner-provided detail line, or an empty string.
    pub fn health_details(&self) -> String {
        let Some(details) = &self.hooks.details else {
            return String::new();
        };
        match self.payload.read() {
            Ok(payload) => details(&payload),
            Err(err) => format!("payload unavailable: {}", err),
        }
    }

    /// Number of successful writes since construction.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn health(&self) -> DatasetHealth {
        let healthy = self.is_healthy();
        let last_error = self.last_error();
        DatasetHealth {
            name: self.name.clone(),
            healthy,
            status: SystemHealth::classify(healthy, last_error.as_deref()),
            last_error,
            health_details: self.health_details(),
            backup_count: self.backups.count(&self.path).await,
        }
    }

    fn set_health(&self, healthy: bool, last_error: Option<String>) -> Result<()> {
        let mut state = self.health.lock()?;
        state.unhealthy = !healthy;
        state.last_error = last_error;
        Ok(())
    }

    // ========================================================================
    // Load
    // ========================================================================

    /// Loads the payload from disk, falling back to the newest backup and
    /// finally to an empty payload.
    ///
    /// Only lock poisoning is returned as an error; every disk problem is
    /// reported through the outcome and the health state.
    pub async fn load(&self) -> Result<LoadOutcome> {
        let span = info_span!("dataset.load", dataset = %self.name, path = %self.path.display());
        async {
            let _guard = self.save_guard.lock().await;
            self.load_locked().await
        }
        .instrument(span)
        .await
    }

    async fn load_locked(&self) -> Result<LoadOutcome> {
        // Only a definite NotFound means "no file"; any other stat error is a
        // read failure and goes through recovery.
        let first_read = match fs::try_exists(&self.path).await {
            Ok(false) => return self.start_empty(),
            Ok(true) => self.read_from_disk().await,
            Err(err) => Err(PersistError::io("Failed to stat", &self.path, err)),
        };

        let first_error = match first_read {
            Ok(decoded) => {
                let migrated = decoded.migrated;
                self.install(decoded)?;
                self.set_health(true, None)?;
                event!(Level::INFO, migrated, "dataset loaded");
                return Ok(LoadOutcome::Loaded { migrated });
            }
            Err(PersistError::UnsupportedVersion { stored, current }) => {
                return self.block_incompatible(stored, current);
            }
            Err(err) => err,
        };
        event!(Level::ERROR, error = %first_error, "dataset load failed, trying backups");

        let has_backup = matches!(self.backups.latest(&self.path).await, Ok(Some(_)));
        if !has_backup {
            return self
                .critical_failure(format!("Load failed and no backup available: {}", first_error))
                .await;
        }

        self.store.quarantine(&self.path).await;
        match self.backups.restore(&self.path).await {
            Ok(true) => {}
            Ok(false) => {
                return self
                    .critical_failure(format!("Load failed and no backup available: {}", first_error))
                    .await;
            }
            Err(err) => {
                return self
                    .critical_failure(format!(
                        "Backup restore failed: {} (load error: {})",
                        err, first_error
                    ))
                    .await;
            }
        }

        match self.read_from_disk().await {
            Ok(decoded) => {
                self.install(decoded)?;
                self.set_health(true, Some(RECOVERED_FROM_BACKUP.to_string()))?;
                event!(Level::WARN, error = %first_error, "dataset recovered from backup");
                Ok(LoadOutcome::RecoveredFromBackup)
            }
            Err(PersistError::UnsupportedVersion { stored, current }) => {
                self.block_incompatible(stored, current)
            }
            Err(err) => {
                self.critical_failure(format!(
                    "Backup is unreadable too: {} (load error: {})",
                    err, first_error
                ))
                .await
            }
        }
    }

    fn start_empty(&self) -> Result<LoadOutcome> {
        let mut payload = self.codec.empty();
        if let Some(hook) = &self.hooks.on_no_file_found {
            hook(&mut payload);
        }
        *self.payload.write()? = payload;
        self.mark_clean();
        self.clear_blocks();
        self.set_health(true, None)?;
        event!(Level::INFO, "no data file found, starting empty");
        Ok(LoadOutcome::NoFile)
    }

    async fn read_from_disk(&self) -> Result<Decoded<C::Payload>> {
        let store = &self.store;
        let path = self.path.as_path();
        let codec = &self.codec;
        let operation = format!("load of '{}'", self.name);
        let retried = retry_with_backoff(&self.load_retry, &operation, move || {
            store.read_decoded(path, move |bytes| codec.decode(bytes))
        })
        .await?;
        Ok(retried.value)
    }

    fn install(&self, decoded: Decoded<C::Payload>) -> Result<()> {
        if let Some(hook) = &self.hooks.on_loaded {
            hook(&decoded.payload);
        }
        *self.payload.write()? = decoded.payload;
        // A migrated payload is rewritten in the current format on next save.
        if decoded.migrated {
            self.mark_dirty();
        } else {
            self.mark_clean();
        }
        self.clear_blocks();
        Ok(())
    }

    fn clear_blocks(&self) {
        self.write_blocked.store(false, Ordering::SeqCst);
        self.disk_corrupt.store(false, Ordering::SeqCst);
    }

    fn reset_payload(&self) -> Result<()> {
        let mut payload = self.codec.empty();
        if let Some(hook) = &self.hooks.on_critical_failure {
            hook(&mut payload);
        }
        *self.payload.write()? = payload;
        self.mark_clean();
        Ok(())
    }

    async fn critical_failure(&self, reason: String) -> Result<LoadOutcome> {
        self.reset_payload()?;
        self.write_blocked.store(false, Ordering::SeqCst);
        let message = format!("Critical load failure, running with empty data: {}", reason);
        event!(Level::ERROR, error = %message, "dataset reset");
        self.set_health(false, Some(message))?;
        // Without a quarantined copy the next save must back the file up.
        let quarantined = self.store.quarantine(&self.path).await;
        self.disk_corrupt.store(quarantined.is_some(), Ordering::SeqCst);
        Ok(LoadOutcome::Reset)
    }

    fn block_incompatible(&self, stored: u32, current: u32) -> Result<LoadOutcome> {
        self.reset_payload()?;
        self.write_blocked.store(true, Ordering::SeqCst);
        let message = format!(
            "Stored schema version {} is newer than runtime version {}; file left untouched and saves blocked",
            stored, current
        );
        event!(Level::ERROR, stored, current, "incompatible dataset version");
        self.set_health(false, Some(message))?;
        Ok(LoadOutcome::IncompatibleVersion { stored, current })
    }

    // ========================================================================
    // Save
    // ========================================================================

    /// Writes the payload: backs up the current file, encodes, then replaces
    /// the file atomically. On failure the dataset stays dirty and unhealthy.
    pub async fn save(&self) -> Result<()> {
        let span = info_span!("dataset.save", dataset = %self.name);
        async {
            let _guard = self.save_guard.lock().await;
            self.save_locked().await
        }
        .instrument(span)
        .await
    }

    /// Saves only if dirty. Returns whether a write happened.
    pub async fn save_if_needed(&self) -> Result<bool> {
        if !self.is_dirty() {
            return Ok(false);
        }
        self.save().await?;
        Ok(true)
    }

    async fn save_locked(&self) -> Result<()> {
        if self.write_blocked.load(Ordering::SeqCst) {
            let err = PersistError::WriteBlocked(self.name.clone());
            event!(Level::WARN, error = %err, "save refused");
            return Err(err);
        }

        // Captured before the payload is read, so a mark made after this point
        // keeps the dataset dirty once the write lands.
        let generation = self.dirty_generation.load(Ordering::SeqCst);
        let mut attempt = SaveAttempt {
            health: &self.health,
            finished: false,
        };

        let written = self.write_to_disk().await;
        attempt.finished = true;
        match written {
            Ok(attempts) => {
                self.clean_generation.fetch_max(generation, Ordering::SeqCst);
                self.disk_corrupt.store(false, Ordering::SeqCst);
                self.writes.fetch_add(1, Ordering::SeqCst);
                self.set_health(true, None)?;
                event!(Level::DEBUG, attempts, "dataset saved");
                Ok(())
            }
            Err(err) => {
                self.set_health(false, Some(format!("Save failed: {}", err)))?;
                event!(Level::ERROR, error = %err, "dataset save failed");
                Err(err)
            }
        }
    }

    async fn write_to_disk(&self) -> Result<u32> {
        if !self.disk_corrupt.load(Ordering::SeqCst) {
            let has_content = fs::metadata(&self.path)
                .await
                .map(|meta| meta.is_file() && meta.len() > 0)
                .unwrap_or(false);
            if has_content {
                if let Err(err) = self.backups.create(&self.path).await {
                    event!(Level::WARN, error = %err, "backup before save failed");
                }
            }
        }

        let bytes = {
            let payload = self.payload.read()?;
            self.codec.encode(&payload)?
        };

        let store = &self.store;
        let path = self.path.as_path();
        let bytes = bytes.as_slice();
        let operation = format!("save of '{}'", self.name);
        let retried = retry_with_backoff(&self.write_retry, &operation, move || {
            store.write(path, bytes)
        })
        .await?;
        Ok(retried.attempts)
    }
}

/// Marks the dataset unhealthy when a save unwinds or is dropped before it
/// reaches an outcome. The dirty generation is untouched, so the data is
/// picked up again by the next save.
struct SaveAttempt<'a> {
    health: &'a Mutex<HealthState>,
    finished: bool,
}

impl Drop for SaveAttempt<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Ok(mut state) = self.health.lock() {
            state.unhealthy = true;
            state.last_error = Some("Save interrupted before completion".to_string());
        }
    }
}

impl<C: PayloadCodec> fmt::Debug for PersistentDataset<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentDataset")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("priority", &self.priority)
            .field("format", &self.codec.format_name())
            .field("dirty", &self.is_dirty())
            .field("healthy", &self.is_healthy())
            .finish()
    }
}

#[async_trait]
impl<C: PayloadCodec> Saveable for PersistentDataset<C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> u8 {
        self.priority
    }

    fn is_dirty(&self) -> bool {
        PersistentDataset::is_dirty(self)
    }

    async fn save(&self) -> Result<()> {
        PersistentDataset::save(self).await
    }

    async fn health(&self) -> Option<DatasetHealth> {
        Some(PersistentDataset::health(self).await)
    }
}
