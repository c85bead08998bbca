pub mod error;
pub mod policy;

pub use error::{PersistError, Result};
pub use policy::{BackupPolicy, DurabilityMode, PersistPolicy, RetryPolicy, SchedulerPolicy};
