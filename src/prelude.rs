//! Recommended API entrypoints grouped by abstraction level.
//!
//! `dx` covers what an application needs to own datasets and schedule their
//! saves. `advanced` exposes the storage primitives underneath.

pub mod dx {
    //! Stable high-level surface.
    //!
    //! Intended usage in app code:
    //! - one `PersistentDataset` per data file, with a codec and hooks,
    //! - one shared `SaveScheduler` that the datasets are registered with,
    //! - `load()` at startup, `save_all()` at shutdown.
    pub use crate::{
        DatasetHooks, JsonCodec, LoadOutcome, PersistError, PersistPolicy, PersistentDataset,
        Result, SaveScheduler, Saveable, VersionedJsonCodec,
    };
}

pub mod advanced {
    //! Escape hatch for the storage layer and custom codecs.
    pub use crate::persist::{
        Decoded, MigrationPlan, MsgPackCodec, PayloadCodec, PayloadMigrator, VersionedEnvelope,
    };
    pub use crate::storage::{
        AtomicFileStore, BackupEntry, BackupRotation, Retried, retry_with_backoff,
    };
}
