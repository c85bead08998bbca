// ============================================================================
// datakeep Library
// ============================================================================

//! Resilient persistence for long-running servers.
//!
//! Each [`PersistentDataset`] binds an in-memory payload to one file. Saves
//! back the previous file up and replace it atomically; loads fall back to
//! the newest backup and, failing that, to an empty payload with the corrupt
//! file quarantined. A [`SaveScheduler`] saves dirty datasets in priority
//! order, a bounded batch per tick.
//!
//! ```no_run
//! use datakeep::{JsonCodec, PersistentDataset, SaveScheduler};
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//!
//! # async fn run() -> datakeep::Result<()> {
//! let balances = Arc::new(PersistentDataset::new(
//!     "economy",
//!     "data/economy.json",
//!     JsonCodec::<BTreeMap<String, i64>>::new(),
//! ));
//! balances.load().await?;
//!
//! let scheduler = SaveScheduler::default();
//! scheduler.register(balances.clone())?;
//! scheduler.start()?;
//!
//! balances.update(|map| *map.entry("alice".to_string()).or_insert(0) += 10)?;
//!
//! scheduler.stop().await?;
//! scheduler.save_all().await?;
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod persist;
pub mod prelude;
pub mod scheduler;
pub mod storage;

pub use core::{
    BackupPolicy, DurabilityMode, PersistError, PersistPolicy, Result, RetryPolicy,
    SchedulerPolicy,
};
pub use persist::{
    DatasetHealth, DatasetHooks, HealthReport, JsonCodec, LoadOutcome, MigrationPlan,
    MsgPackCodec, PayloadCodec, PersistentDataset, SystemHealth, VersionedEnvelope,
    VersionedJsonCodec,
};
pub use scheduler::{PassReport, SaveScheduler, SaveStatistics, Saveable};
pub use storage::{AtomicFileStore, BackupEntry, BackupRotation};
