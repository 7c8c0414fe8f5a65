//! Path utilities for recordsafe data directories

use std::path::PathBuf;
use std::sync::OnceLock;

/// Global storage for custom data directory path
static DATA_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Initialize the data directory with an optional custom path.
/// Must be called early in main() before any other path functions are used.
/// If custom_path is None, uses the default ~/.recordsafe location.
pub fn init_data_dir(custom_path: Option<PathBuf>) {
    let path = custom_path.unwrap_or_else(default_data_dir);
    if DATA_DIR.set(path.clone()).is_err() {
        let existing = DATA_DIR
            .get()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<unknown>".to_string());
        tracing::debug!(
            path = %path.display(),
            existing = %existing,
            "Data directory already initialized"
        );
    }
}

/// Get the default data directory path (~/.recordsafe)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".recordsafe"))
        .unwrap_or_else(|| PathBuf::from(".recordsafe"))
}

/// Get the base data directory.
/// Returns the custom path if set via init_data_dir(), otherwise ~/.recordsafe
pub fn data_dir() -> PathBuf {
    DATA_DIR.get().cloned().unwrap_or_else(default_data_dir)
}

/// Get the config file path (~/.recordsafe/config.toml)
pub fn config_path() -> PathBuf {
    data_dir().join("config.toml")
}

/// Get the logs directory (~/.recordsafe/logs)
pub fn logs_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Get the default log file path (~/.recordsafe/logs/recordsafe.log)
pub fn log_file_path() -> PathBuf {
    logs_dir().join("recordsafe.log")
}

/// Shared status area holding agent records and the global lock
/// (~/.recordsafe/shared)
pub fn shared_dir() -> PathBuf {
    data_dir().join("shared")
}

/// Snapshot store root (~/.recordsafe/backups)
pub fn backups_dir() -> PathBuf {
    data_dir().join("backups")
}

/// Operation log file (~/.recordsafe/operations.json)
pub fn operation_log_path() -> PathBuf {
    data_dir().join("operations.json")
}

/// Directory where rolled-back datasets are materialized
/// (~/.recordsafe/rollbacks)
pub fn rollbacks_dir() -> PathBuf {
    data_dir().join("rollbacks")
}
