use std::time::Duration;

use thiserror::Error;

use crate::backup::BackupError;
use crate::coordinator::CoordinatorError;
use crate::records::ClientError;

#[derive(Error, Debug)]
pub enum SafetyError {
    #[error("Operation '{operation}' is destructive and requires explicit confirmation")]
    ConfirmationRequired { operation: String },

    #[error("Pre-operation checks failed for '{operation}': {}", failures.join("; "))]
    PreflightFailed {
        operation: String,
        failures: Vec<String>,
    },

    #[error("Record store unreachable: {0}")]
    ConnectivityFailure(String),

    #[error("Conflicting agents active: {}", conflicts.join("; "))]
    CompatibilityConflict { conflicts: Vec<String> },

    #[error(transparent)]
    LockContention(CoordinatorError),

    #[error("Backup creation failed: {0}")]
    BackupCreationFailure(#[source] BackupError),

    #[error("Operation '{operation}' failed: {source}")]
    OperationExecution {
        operation: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Operation '{operation}' exceeded its deadline of {timeout:?}")]
    OperationTimedOut { operation: String, timeout: Duration },

    #[error("Post-operation checks failed for '{operation}': {}", failures.join("; "))]
    PostCheckFailed {
        operation: String,
        failures: Vec<String>,
    },

    #[error("Emergency rollback to {snapshot_id} failed: {source}")]
    EmergencyRollbackFailure {
        snapshot_id: String,
        #[source]
        source: BackupError,
    },

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SafetyError {
    /// The error returned by the caller's operation, if that is what failed
    pub fn operation_error(&self) -> Option<&anyhow::Error> {
        match self {
            SafetyError::OperationExecution { source, .. } => Some(source),
            _ => None,
        }
    }
}
