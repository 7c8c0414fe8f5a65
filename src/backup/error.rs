use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Backup creation failed: {0}")]
    CreationFailure(String),
    #[error("Snapshot {id} failed integrity check: {reason}")]
    IntegrityFailure { id: String, reason: String },
    #[error("Snapshot not found: {0}")]
    NotFound(String),
    #[error("Invalid snapshot id: {0}")]
    InvalidId(String),
    #[error("Incremental chain for {id} is broken: {reason}")]
    BrokenChain { id: String, reason: String },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
