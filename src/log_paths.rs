//! Purpose: Shared driver-directory and log-file path resolution helpers.
//! Exports: `default_log_dir` and `log_file_path`.
//! Role: Keep driver and embedding-tool path semantics aligned from one source.
//! Invariants: Default log directory remains `~/.rillite/logs`.
//! Invariants: Log files are named by registration id with a fixed extension.
use std::path::{Path, PathBuf};

pub const LOG_FILE_EXTENSION: &str = "logbuffer";

pub fn default_log_dir() -> PathBuf {
    let home = std::env::var_os("HOME").unwrap_or_default();
    PathBuf::from(home).join(".rillite").join("logs")
}

pub fn log_file_path(log_dir: &Path, registration_id: i64) -> PathBuf {
    log_dir.join(format!("{registration_id}.{LOG_FILE_EXTENSION}"))
}
