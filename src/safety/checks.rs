//! Pre- and post-operation checks
//!
//! Checks only report problems. Whether a problem aborts the operation is
//! decided by the safety manager from the operation's destructiveness and
//! the configured policy.

use std::path::Path;

use serde_json::Value;

use crate::coordinator::{AgentCoordinator, AgentState, Conflict};
use crate::records::RecordStoreClient;
use crate::util::fs::{remove_if_exists, write_atomic};

const STORAGE_PROBE: &str = ".write-probe";

/// A single failed check
#[derive(Debug, Clone, PartialEq)]
pub enum CheckFailure {
    /// Too many operations since the last backup
    BackupOverdue { since: u32, limit: u32 },
    /// Sibling agents are doing conflicting work
    Conflicts(Vec<Conflict>),
    /// The record store did not answer
    Unreachable(String),
    /// Snapshots cannot be written
    Storage(String),
    /// A live sibling reports an error state
    SiblingError { agent_id: String, message: String },
    /// The status area could not be read
    Coordination(String),
    /// The operation result reports failure or cannot be serialized
    ResultShape(String),
}

impl std::fmt::Display for CheckFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckFailure::BackupOverdue { since, limit } => write!(
                f,
                "{} operations since the last backup (limit {})",
                since, limit
            ),
            CheckFailure::Conflicts(conflicts) => {
                let parts: Vec<String> = conflicts
                    .iter()
                    .map(|c| format!("{}: {}", c.agent_id, c.reason))
                    .collect();
                write!(f, "conflicting agents: {}", parts.join(", "))
            }
            CheckFailure::Unreachable(e) => write!(f, "record store unreachable: {}", e),
            CheckFailure::Storage(e) => write!(f, "backup storage not writable: {}", e),
            CheckFailure::SiblingError { agent_id, message } => {
                write!(f, "agent {} reports error: {}", agent_id, message)
            }
            CheckFailure::Coordination(e) => write!(f, "status area unreadable: {}", e),
            CheckFailure::ResultShape(e) => write!(f, "unexpected result: {}", e),
        }
    }
}

pub struct PreCheckInput<'a> {
    pub coordinator: &'a AgentCoordinator,
    pub client: &'a dyn RecordStoreClient,
    pub backup_root: &'a Path,
    pub operations_since_backup: u32,
    pub max_operations_without_backup: u32,
    /// A snapshot will be taken before this operation runs
    pub backup_planned: bool,
}

pub async fn run_pre_checks(input: PreCheckInput<'_>) -> Vec<CheckFailure> {
    let mut failures = Vec::new();

    if !input.backup_planned
        && input.max_operations_without_backup > 0
        && input.operations_since_backup >= input.max_operations_without_backup
    {
        failures.push(CheckFailure::BackupOverdue {
            since: input.operations_since_backup,
            limit: input.max_operations_without_backup,
        });
    }

    match input.coordinator.check_compatibility().await {
        Ok(report) if !report.compatible => failures.push(CheckFailure::Conflicts(report.conflicts)),
        Ok(_) => {}
        Err(e) => {
            tracing::warn!(error = %e, "Compatibility check failed, continuing");
        }
    }

    let status = input.client.test_connection().await;
    if !status.success {
        failures.push(CheckFailure::Unreachable(
            status.error.unwrap_or_else(|| "unknown error".to_string()),
        ));
    }

    if let Err(e) = probe_storage(input.backup_root).await {
        failures.push(CheckFailure::Storage(e.to_string()));
    }

    failures
}

/// Confirm snapshots can be written under `root`
async fn probe_storage(root: &Path) -> std::io::Result<()> {
    let probe = root.join(STORAGE_PROBE);
    write_atomic(&probe, b"ok").await?;
    remove_if_exists(&probe).await?;
    Ok(())
}

pub async fn run_post_checks(
    coordinator: &AgentCoordinator,
    client: &dyn RecordStoreClient,
    result: &Value,
) -> Vec<CheckFailure> {
    let mut failures = Vec::new();

    let status = client.test_connection().await;
    if !status.success {
        failures.push(CheckFailure::Unreachable(
            status.error.unwrap_or_else(|| "unknown error".to_string()),
        ));
    }

    match coordinator.get_active_agents().await {
        Ok(agents) => {
            failures.extend(
                agents
                    .into_iter()
                    .filter(|agent| agent.state == AgentState::Error)
                    .map(|agent| CheckFailure::SiblingError {
                        agent_id: agent.agent_id,
                        message: agent.message,
                    }),
            );
        }
        Err(e) => failures.push(CheckFailure::Coordination(e.to_string())),
    }

    if let Some(problem) = result_problem(result) {
        failures.push(CheckFailure::ResultShape(problem));
    }

    failures
}

/// Results shaped like `{"success": false, "error": ...}` report failure
fn result_problem(result: &Value) -> Option<String> {
    let object = result.as_object()?;
    match object.get("success") {
        Some(Value::Bool(false)) => Some(
            object
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("result reports success = false")
                .to_string(),
        ),
        _ => None,
    }
}
