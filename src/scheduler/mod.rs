//! Priority-ordered registry of saveable datasets with a periodic,
//! batch-limited background save pass.

pub mod stats;
mod worker;

pub use stats::{PassReport, SaveStatistics};

use crate::core::{PersistError, Result, SchedulerPolicy};
use crate::persist::dataset::{DEFAULT_PRIORITY, MAX_PRIORITY};
use crate::persist::health::{DatasetHealth, HealthReport};
use async_trait::async_trait;
use futures::FutureExt;
use stats::SaveCounters;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{Instrument, Level, event, info_span};
use worker::{SchedulerWorker, spawn_scheduler_worker};

/// Lower bound for the pass interval.
pub const MIN_INTERVAL_MS: u64 = 10;

const SLOW_SAVE: Duration = Duration::from_millis(50);

/// Something the scheduler can persist.
#[async_trait]
pub trait Saveable: Send + Sync {
    fn name(&self) -> &str;

    /// 0 saves first, 10 last.
    fn priority(&self) -> u8 {
        DEFAULT_PRIORITY
    }

    fn is_dirty(&self) -> bool;

    /// Persists the current state and clears the dirty flag on success.
    async fn save(&self) -> Result<()>;

    async fn health(&self) -> Option<DatasetHealth> {
        None
    }
}

#[derive(Clone)]
struct Registered {
    priority: u8,
    saveable: Arc<dyn Saveable>,
}

/// State shared between the scheduler handle and its worker task.
pub(crate) struct SchedulerCore {
    registry: RwLock<Vec<Registered>>,
    counters: SaveCounters,
    interval_ms: AtomicU64,
    batch_size: AtomicUsize,
    running: AtomicBool,
}

impl SchedulerCore {
    fn new(policy: &SchedulerPolicy) -> Self {
        Self {
            registry: RwLock::new(Vec::new()),
            counters: SaveCounters::default(),
            interval_ms: AtomicU64::new(policy.interval_ms.max(MIN_INTERVAL_MS)),
            batch_size: AtomicUsize::new(policy.effective_batch_size()),
            running: AtomicBool::new(false),
        }
    }

    pub(crate) fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::Relaxed))
    }

    fn batch_size(&self) -> usize {
        self.batch_size.load(Ordering::Relaxed)
    }

    /// Copy of the registry in priority order. Passes iterate the copy, so
    /// registration never waits on a running save.
    fn snapshot(&self) -> Result<Vec<Registered>> {
        Ok(self.registry.read()?.clone())
    }

    pub(crate) async fn run_incremental_pass(&self) -> Result<PassReport> {
        let entries = self.snapshot()?;
        let limit = self.batch_size();
        let mut report = PassReport::default();

        for entry in &entries {
            if report.attempted() >= limit || !entry.saveable.is_dirty() {
                report.skipped += 1;
                continue;
            }
            self.save_entry(entry, &mut report).await;
        }

        if report.attempted() > 0 {
            self.counters.record_incremental_pass();
            event!(
                Level::DEBUG,
                saved = report.saved,
                failed = report.failed,
                skipped = report.skipped,
                "incremental save pass"
            );
        }
        Ok(report)
    }

    async fn run_full_pass(&self, force: bool) -> Result<PassReport> {
        let entries = self.snapshot()?;
        let started = Instant::now();
        let mut report = PassReport::default();

        for entry in &entries {
            if !force && !entry.saveable.is_dirty() {
                report.skipped += 1;
                continue;
            }
            self.save_entry(entry, &mut report).await;
        }

        self.counters.record_full_save();
        event!(
            Level::INFO,
            force,
            saved = report.saved,
            failed = report.failed,
            skipped = report.skipped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "full save completed"
        );
        Ok(report)
    }

    /// Saves one entry. Errors and panics are logged and counted; they never
    /// abort the surrounding pass.
    async fn save_entry(&self, entry: &Registered, report: &mut PassReport) {
        let name = entry.saveable.name().to_string();
        let _saving = self.counters.saving();
        let started = Instant::now();

        let outcome = AssertUnwindSafe(entry.saveable.save())
            .catch_unwind()
            .instrument(info_span!("scheduler.save", dataset = %name))
            .await;

        match outcome {
            Ok(Ok(())) => {
                self.counters.record_save();
                report.saved += 1;
                let elapsed = started.elapsed();
                if elapsed > SLOW_SAVE {
                    event!(
                        Level::DEBUG,
                        dataset = %name,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "slow save"
                    );
                }
            }
            Ok(Err(err)) => {
                self.counters.record_failure();
                report.failed += 1;
                event!(Level::ERROR, dataset = %name, error = %err, "error saving dataset");
            }
            Err(panic) => {
                self.counters.record_failure();
                report.failed += 1;
                event!(
                    Level::ERROR,
                    dataset = %name,
                    panic = %panic_message(panic.as_ref()),
                    "dataset save panicked"
                );
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Owns the registry and the background save worker.
///
/// Share it through an `Arc`. `stop()` does not flush: call `save_all()` or
/// `force_save_all()` during shutdown.
pub struct SaveScheduler {
    core: Arc<SchedulerCore>,
    worker: Mutex<Option<SchedulerWorker>>,
}

impl Default for SaveScheduler {
    fn default() -> Self {
        Self::new(SchedulerPolicy::default())
    }
}

impl SaveScheduler {
    pub fn new(policy: SchedulerPolicy) -> Self {
        Self {
            core: Arc::new(SchedulerCore::new(&policy)),
            worker: Mutex::new(None),
        }
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Registers `saveable` at its own priority.
    pub fn register(&self, saveable: Arc<dyn Saveable>) -> Result<()> {
        let priority = saveable.priority();
        self.register_with_priority(saveable, priority)
    }

    /// Registers `saveable` after every entry with a priority at or below
    /// `priority` (clamped to `0..=10`). Names must be unique.
    pub fn register_with_priority(&self, saveable: Arc<dyn Saveable>, priority: u8) -> Result<()> {
        let priority = priority.min(MAX_PRIORITY);
        let name = saveable.name().to_string();
        {
            let mut registry = self.core.registry.write()?;
            if registry.iter().any(|entry| entry.saveable.name() == name) {
                return Err(PersistError::ExecutionError(format!(
                    "Dataset '{}' is already registered",
                    name
                )));
            }
            let index = registry.partition_point(|entry| entry.priority <= priority);
            registry.insert(index, Registered { priority, saveable });
        }
        event!(Level::INFO, dataset = %name, priority, "registered dataset");
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Result<bool> {
        let removed = {
            let mut registry = self.core.registry.write()?;
            let before = registry.len();
            registry.retain(|entry| entry.saveable.name() != name);
            registry.len() != before
        };
        if removed {
            event!(Level::INFO, dataset = %name, "unregistered dataset");
        }
        Ok(removed)
    }

    /// Registered names in save order.
    pub fn registered_names(&self) -> Result<Vec<String>> {
        Ok(self
            .core
            .snapshot()?
            .iter()
            .map(|entry| entry.saveable.name().to_string())
            .collect())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Starts the periodic worker. Returns `false` if it was already running.
    pub fn start(&self) -> Result<bool> {
        let mut slot = self.worker.lock()?;
        if slot.is_some() {
            return Ok(false);
        }
        *slot = Some(spawn_scheduler_worker(self.core.clone())?);
        self.core.running.store(true, Ordering::SeqCst);
        event!(
            Level::INFO,
            interval_ms = self.core.interval().as_millis() as u64,
            batch_size = self.core.batch_size(),
            "incremental saving started"
        );
        Ok(true)
    }

    /// Stops the worker, letting an in-flight pass finish. Returns `false` if
    /// it was not running.
    pub async fn stop(&self) -> Result<bool> {
        let worker = {
            let mut slot = self.worker.lock()?;
            slot.take()
        };
        let Some(worker) = worker else {
            return Ok(false);
        };
        self.core.running.store(false, Ordering::SeqCst);
        worker.stop().await?;
        event!(Level::INFO, "incremental saving stopped");
        Ok(true)
    }

    pub fn is_running(&self) -> bool {
        self.core.running.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Passes
    // ========================================================================

    /// Runs one incremental pass now: up to `batch_size` dirty entries in
    /// priority order.
    pub async fn tick(&self) -> Result<PassReport> {
        self.core.run_incremental_pass().await
    }

    /// Saves every dirty entry, ignoring the batch limit.
    pub async fn save_all(&self) -> Result<PassReport> {
        self.core.run_full_pass(false).await
    }

    /// Saves every registered entry, dirty or not.
    pub async fn force_save_all(&self) -> Result<PassReport> {
        event!(Level::WARN, "force saving all datasets, ignoring dirty flags");
        self.core.run_full_pass(true).await
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    /// Sets the batch limit, clamped to `1..=20`, and returns the applied value.
    pub fn set_batch_size(&self, batch_size: usize) -> usize {
        let policy = SchedulerPolicy {
            batch_size,
            ..SchedulerPolicy::default()
        };
        let applied = policy.effective_batch_size();
        self.core.batch_size.store(applied, Ordering::Relaxed);
        event!(Level::INFO, batch_size = applied, "batch size set");
        applied
    }

    pub fn batch_size(&self) -> usize {
        self.core.batch_size()
    }

    /// Sets the pass interval. A running worker picks it up after its
    /// current wait.
    pub fn set_interval(&self, interval: Duration) {
        let millis = u64::try_from(interval.as_millis())
            .unwrap_or(u64::MAX)
            .max(MIN_INTERVAL_MS);
        self.core.interval_ms.store(millis, Ordering::Relaxed);
        event!(Level::INFO, interval_ms = millis, "save interval set");
    }

    pub fn interval(&self) -> Duration {
        self.core.interval()
    }

    // ========================================================================
    // Statistics and health
    // ========================================================================

    pub fn statistics(&self) -> Result<SaveStatistics> {
        let entries = self.core.snapshot()?;
        let dirty = entries
            .iter()
            .filter(|entry| entry.saveable.is_dirty())
            .count();
        Ok(self
            .core
            .counters
            .snapshot(entries.len(), dirty, self.is_running()))
    }

    pub fn reset_statistics(&self) {
        self.core.counters.reset();
    }

    pub async fn health_report(&self) -> Result<HealthReport> {
        let entries = self.core.snapshot()?;
        let mut datasets = Vec::with_capacity(entries.len());
        for entry in &entries {
            if let Some(health) = entry.saveable.health().await {
                datasets.push(health);
            }
        }
        Ok(HealthReport::new(datasets, self.statistics()?))
    }
}
