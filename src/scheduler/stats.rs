use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Snapshot of scheduler counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveStatistics {
    /// Successful individual saves, from ticks and full saves alike.
    pub total_saves: u64,
    pub failed_saves: u64,
    /// Ticks that saved at least one dataset.
    pub incremental_passes: u64,
    /// Calls to `save_all` or `force_save_all`.
    pub full_saves: u64,
    pub currently_saving: usize,
    pub registered: usize,
    pub dirty: usize,
    pub running: bool,
}

/// Outcome of one pass over the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassReport {
    pub saved: usize,
    pub failed: usize,
    /// Entries left for a later pass: clean ones, or dirty ones beyond the
    /// batch limit.
    pub skipped: usize,
}

impl PassReport {
    pub fn attempted(&self) -> usize {
        self.saved + self.failed
    }
}

#[derive(Debug, Default)]
pub(crate) struct SaveCounters {
    total_saves: AtomicU64,
    failed_saves: AtomicU64,
    incremental_passes: AtomicU64,
    full_saves: AtomicU64,
    currently_saving: AtomicUsize,
}

impl SaveCounters {
    pub(crate) fn record_save(&self) {
        self.total_saves.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failed_saves.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_incremental_pass(&self) {
        self.incremental_passes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_full_save(&self) {
        self.full_saves.fetch_add(1, Ordering::Relaxed);
    }

    /// Marks one save as in progress until the returned guard drops.
    pub(crate) fn saving(&self) -> SavingGuard<'_> {
        self.currently_saving.fetch_add(1, Ordering::SeqCst);
        SavingGuard { counters: self }
    }

    /// Resets the cumulative counters. `currently_saving` tracks live work
    /// and is left alone.
    pub(crate) fn reset(&self) {
        self.total_saves.store(0, Ordering::Relaxed);
        self.failed_saves.store(0, Ordering::Relaxed);
        self.incremental_passes.store(0, Ordering::Relaxed);
        self.full_saves.store(0, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, registered: usize, dirty: usize, running: bool) -> SaveStatistics {
        SaveStatistics {
            total_saves: self.total_saves.load(Ordering::Relaxed),
            failed_saves: self.failed_saves.load(Ordering::Relaxed),
            incremental_passes: self.incremental_passes.load(Ordering::Relaxed),
            full_saves: self.full_saves.load(Ordering::Relaxed),
            currently_saving: self.currently_saving.load(Ordering::SeqCst),
            registered,
            dirty,
            running,
        }
    }
}

pub(crate) struct SavingGuard<'a> {
    counters: &'a SaveCounters,
}

impl Drop for SavingGuard<'_> {
    fn drop(&mut self) {
        self.counters.currently_saving.fetch_sub(1, Ordering::SeqCst);
    }
}
