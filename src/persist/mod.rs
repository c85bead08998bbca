pub mod codec;
pub mod dataset;
pub mod envelope;
pub mod health;

pub use codec::{Decoded, JsonCodec, MsgPackCodec, PayloadCodec, VersionedJsonCodec};
pub use dataset::{DatasetHooks, LoadOutcome, PersistentDataset};
pub use envelope::{
    LEGACY_VERSION, MigrationPlan, MigrationStep, PayloadMigrator, UnwrappedPayload,
    VersionedEnvelope,
};
pub use health::{DatasetHealth, HealthReport, RECOVERED_FROM_BACKUP, SystemHealth};
