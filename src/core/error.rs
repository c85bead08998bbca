use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("File '{0}' not found")]
    NotFound(PathBuf),

    #[error("Corrupted data in '{path}': {reason}")]
    Corrupted { path: PathBuf, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unsupported schema version {stored} (runtime supports up to {current})")]
    UnsupportedVersion { stored: u32, current: u32 },

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Dataset '{0}' is write-blocked until it loads successfully")]
    WriteBlocked(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("I/O error: {0}")]
    IoError(String),
}

pub type Result<T> = std::result::Result<T, PersistError>;

impl PersistError {
    /// Wraps an `std::io::Error`, keeping the operation and path in the message.
    pub fn io(context: &str, path: &std::path::Path, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            return Self::NotFound(path.to_path_buf());
        }
        Self::IoError(format!("{} '{}': {}", context, path.display(), err))
    }

    /// Returns `true` for failures that may succeed when retried.
    ///
    /// Corruption, serialization and version errors are deterministic and
    /// never retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::IoError(_))
    }
}

impl<T> From<std::sync::PoisonError<T>> for PersistError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<serde_json::Error> for PersistError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
