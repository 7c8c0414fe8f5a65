use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Per-call knobs for `SafetyManager::execute_with_safety`.
///
/// `dry_run` and `backup_before` fall back to the manager's configuration
/// when left unset.
#[derive(Debug, Clone, Default)]
pub struct OperationOptions {
    /// The operation rewrites or deletes records
    pub destructive: bool,
    /// The caller explicitly confirmed a destructive operation
    pub confirmed: bool,
    /// Hold the global lock while the operation runs
    pub exclusive: bool,
    pub dry_run: Option<bool>,
    pub backup_before: Option<bool>,
    /// Overrides the configured deadline for this call
    pub timeout: Option<Duration>,
    /// Published with the agent status while the operation runs
    pub metadata: BTreeMap<String, Value>,
}

impl OperationOptions {
    pub fn read_only() -> Self {
        Self::default()
    }

    pub fn destructive() -> Self {
        Self {
            destructive: true,
            ..Self::default()
        }
    }

    pub fn confirmed(mut self) -> Self {
        self.confirmed = true;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = Some(dry_run);
        self
    }

    pub fn backup_before(mut self, backup: bool) -> Self {
        self.backup_before = Some(backup);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// What the running operation knows about its own invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationContext {
    pub operation_id: Uuid,
    pub name: String,
    pub destructive: bool,
    /// The operation must only report its scope, not change anything
    pub dry_run: bool,
    pub confirmed: bool,
    pub backup_required: bool,
    /// Safety snapshot taken before execution
    pub pre_backup_id: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// Lifecycle of one `execute_with_safety` call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationPhase {
    Pending,
    Checked,
    DryRun,
    Executing,
    Succeeded,
    Failed,
    RolledBack,
}

impl OperationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationPhase::Pending => "pending",
            OperationPhase::Checked => "checked",
            OperationPhase::DryRun => "dry_run",
            OperationPhase::Executing => "executing",
            OperationPhase::Succeeded => "succeeded",
            OperationPhase::Failed => "failed",
            OperationPhase::RolledBack => "rolled_back",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationPhase::Succeeded | OperationPhase::Failed | OperationPhase::RolledBack
        )
    }
}

impl std::fmt::Display for OperationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Terminal outcome recorded in the operation log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationStatus {
    Succeeded,
    Failed,
    FailedAndRolledBack,
    /// Refused before execution (confirmation, pre-checks, lock, backup)
    Rejected,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Succeeded => "succeeded",
            OperationStatus::Failed => "failed",
            OperationStatus::FailedAndRolledBack => "failed-and-rolled-back",
            OperationStatus::Rejected => "rejected",
        }
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self, OperationStatus::Succeeded)
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Successful result of `execute_with_safety`
#[derive(Debug, Clone)]
pub struct OperationReport<T> {
    pub operation_id: Uuid,
    pub result: T,
    pub dry_run: bool,
    /// Safety snapshot taken before execution
    pub backup_id: Option<String>,
    pub duration: Duration,
    /// Advisory problems found by the pre and post checks
    pub warnings: Vec<String>,
}
