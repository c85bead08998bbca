pub mod atomic;
pub mod backup;
pub mod retry;

pub use atomic::AtomicFileStore;
pub use backup::{BackupEntry, BackupRotation};
pub use retry::{Retried, retry_with_backoff};

use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Appends `suffix` to the full file name of `path` (`a.json` + `.tmp` -> `a.json.tmp`).
pub(crate) fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut raw: OsString = path.as_os_str().to_owned();
    raw.push(suffix);
    PathBuf::from(raw)
}

/// Returns the file name of `path` as UTF-8, or an empty string.
pub(crate) fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}
