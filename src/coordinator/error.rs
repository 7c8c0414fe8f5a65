use std::path::PathBuf;

use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Global lock held by {holder} ({label}) until {expires_at}")]
    LockContention {
        holder: String,
        label: String,
        expires_at: DateTime<Utc>,
    },
    #[error("Corrupt status record {path}: {message}")]
    CorruptRecord { path: PathBuf, message: String },
    #[error("Coordinator has been shut down")]
    ShutDown,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
