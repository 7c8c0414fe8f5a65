//! The single entry point for operations against the record store
//!
//! `execute_with_safety` walks every operation through
//! `pending -> checked -> {dry_run | executing} -> {succeeded | failed}`,
//! taking a safety snapshot before destructive work and restoring it when
//! that work fails.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use crate::backup::{BackupEngine, BackupError, SnapshotKind, SnapshotMetadata};
use crate::config::{Config, SafetyConfig};
use crate::coordinator::{
    AgentCoordinator, AgentMetadata, AgentState, CoordinatorError, LockRecord, StatusArea,
};
use crate::records::{capture_dataset, Dataset, RecordStoreClient};
use crate::safety::checks::{run_post_checks, run_pre_checks, CheckFailure, PreCheckInput};
use crate::safety::context::{
    OperationContext, OperationOptions, OperationPhase, OperationReport, OperationStatus,
};
use crate::safety::error::SafetyError;
use crate::safety::log::{OperationLog, OperationLogEntry};
use crate::safety::monitor::OperationMonitor;
use crate::util::paths;

/// Where the manager keeps its own files
#[derive(Debug, Clone)]
pub struct SafetyPaths {
    pub operation_log: PathBuf,
    /// Restored datasets are written here
    pub rollbacks: PathBuf,
}

impl SafetyPaths {
    pub fn under(root: &Path) -> Self {
        Self {
            operation_log: root.join("operations.json"),
            rollbacks: root.join("rollbacks"),
        }
    }
}

impl Default for SafetyPaths {
    fn default() -> Self {
        Self {
            operation_log: paths::operation_log_path(),
            rollbacks: paths::rollbacks_dir(),
        }
    }
}

/// An operation currently inside `execute_with_safety`
#[derive(Debug, Clone, Serialize)]
pub struct ActiveOperation {
    pub operation_id: Uuid,
    pub name: String,
    pub phase: OperationPhase,
    pub started_at: DateTime<Utc>,
}

/// Result of a restore performed by the manager
#[derive(Debug, Clone, Serialize)]
pub struct RollbackOutcome {
    pub snapshot_id: String,
    pub rolled_back_data: Dataset,
    /// File the restored dataset was written to
    pub restored_to: PathBuf,
    /// Snapshot of the state that was replaced, when one was taken
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_rollback_snapshot: Option<String>,
}

/// Overview returned by `get_safety_status`
#[derive(Debug, Clone, Serialize)]
pub struct SafetyStatus {
    pub agent_id: String,
    pub agent_state: AgentState,
    pub active_agents: Option<usize>,
    pub compatible: Option<bool>,
    pub current_lock: Option<LockRecord>,
    pub operations_since_backup: u32,
    pub max_operations_without_backup: u32,
    pub last_backup_id: Option<String>,
    pub last_backup_at: Option<DateTime<Utc>>,
    pub backups_available: Option<usize>,
    pub active_operations: Vec<ActiveOperation>,
    pub auto_backup_before_changes: bool,
    pub dry_run_by_default: bool,
    pub emergency_rollback_enabled: bool,
}

#[derive(Debug, Default)]
struct BackupCounters {
    operations_since_backup: u32,
    last_backup: Option<(String, DateTime<Utc>)>,
}

/// Outcome of the checks that run before an operation
struct Preflight {
    warnings: Vec<String>,
    holds_lock: bool,
}

pub struct SafetyManager {
    config: SafetyConfig,
    backups: Arc<BackupEngine>,
    coordinator: Arc<AgentCoordinator>,
    client: Arc<dyn RecordStoreClient>,
    log: OperationLog,
    rollbacks_dir: PathBuf,
    counters: Mutex<BackupCounters>,
    active: Mutex<HashMap<Uuid, ActiveOperation>>,
    lock_timeout: Duration,
}

impl SafetyManager {
    pub fn new(
        config: SafetyConfig,
        backups: Arc<BackupEngine>,
        coordinator: Arc<AgentCoordinator>,
        client: Arc<dyn RecordStoreClient>,
        paths: SafetyPaths,
    ) -> Self {
        let lock_timeout = coordinator.config().lock_timeout;
        Self {
            log: OperationLog::new(paths.operation_log, config.max_log_entries),
            rollbacks_dir: paths.rollbacks,
            config,
            backups,
            coordinator,
            client,
            counters: Mutex::new(BackupCounters::default()),
            active: Mutex::new(HashMap::new()),
            lock_timeout,
        }
    }

    /// Wire a manager over the standard layout under `data_dir`: status area
    /// in `shared/`, snapshots in `backups/`. The coordinator is initialized
    /// and its heartbeat started; both are advisory, so failures only warn.
    /// Must be called from within a tokio runtime.
    pub async fn open(config: &Config, client: Arc<dyn RecordStoreClient>, data_dir: &Path) -> Self {
        let coordinator = AgentCoordinator::new(
            StatusArea::new(data_dir.join("shared")),
            config.coordinator.clone(),
        );
        match coordinator.initialize().await {
            Ok(()) => coordinator.start_heartbeat(config.coordinator.heartbeat_interval),
            Err(e) => {
                tracing::warn!(agent_id = %coordinator.agent_id(), error = %e, "Coordinator unavailable, continuing without presence");
            }
        }

        Self::new(
            config.safety.clone(),
            Arc::new(BackupEngine::new(data_dir.join("backups"), config.backup.clone())),
            Arc::new(coordinator),
            client,
            SafetyPaths::under(data_dir),
        )
    }

    /// Stop the heartbeat and release coordination state
    pub async fn shutdown(&self) {
        self.coordinator.safe_shutdown().await;
    }

    pub fn config(&self) -> &SafetyConfig {
        &self.config
    }

    pub fn backups(&self) -> &BackupEngine {
        &self.backups
    }

    pub fn coordinator(&self) -> &AgentCoordinator {
        &self.coordinator
    }

    pub fn operations_since_backup(&self) -> u32 {
        self.counters.lock().operations_since_backup
    }

    /// Run `operation` under the full safety protocol.
    ///
    /// Destructive operations are refused without confirmation, refused when
    /// pre-checks fail, and get a safety snapshot first. If the operation
    /// fails, a failure snapshot is taken, the pre-operation snapshot is
    /// restored when rollback is enabled, and the original error is returned
    /// after everything is logged.
    pub async fn execute_with_safety<F, Fut, T>(
        &self,
        name: &str,
        options: OperationOptions,
        operation: F,
    ) -> Result<OperationReport<T>, SafetyError>
    where
        F: FnOnce(OperationContext) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
        T: Serialize,
    {
        let started = Instant::now();
        let dry_run = options.dry_run.unwrap_or(self.config.dry_run_by_default);
        let mut ctx = OperationContext {
            operation_id: Uuid::new_v4(),
            name: name.to_string(),
            destructive: options.destructive,
            dry_run,
            confirmed: options.confirmed,
            backup_required: options.destructive
                && !dry_run
                && options
                    .backup_before
                    .unwrap_or(self.config.auto_backup_before_changes),
            pre_backup_id: None,
            started_at: Utc::now(),
        };
        self.track(&ctx, OperationPhase::Pending);
        tracing::info!(
            operation_id = %ctx.operation_id,
            operation = %name,
            destructive = ctx.destructive,
            dry_run,
            "Operation requested"
        );

        let preflight = match self.preflight(&mut ctx, &options).await {
            Ok(preflight) => preflight,
            Err(e) => {
                tracing::warn!(operation_id = %ctx.operation_id, operation = %name, error = %e, "Operation refused");
                self.finish(&ctx, OperationStatus::Rejected, started, Some(&e), false)
                    .await;
                return Err(e);
            }
        };
        let mut warnings = preflight.warnings;

        let mut metadata = AgentMetadata::for_operation(name, ctx.destructive);
        metadata.exclusive = options.exclusive;
        metadata.extra = options.metadata.clone();
        self.coordinator
            .update_status(AgentState::Working, &format!("running {}", name), metadata)
            .await;

        let phase = if dry_run {
            OperationPhase::DryRun
        } else {
            OperationPhase::Executing
        };
        self.track(&ctx, phase);

        let outcome = self.run_monitored(&ctx, options.timeout, operation).await;

        let outcome = match outcome {
            Ok(result) => match self.verify(&ctx, &result).await {
                Ok(post_warnings) => {
                    warnings.extend(post_warnings);
                    Ok(result)
                }
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        match outcome {
            Ok(result) => {
                if !dry_run {
                    self.counters.lock().operations_since_backup += 1;
                }
                self.track(&ctx, OperationPhase::Succeeded);
                self.coordinator
                    .update_status(
                        AgentState::Active,
                        &format!("completed {}", name),
                        AgentMetadata::default(),
                    )
                    .await;
                self.finish(&ctx, OperationStatus::Succeeded, started, None, preflight.holds_lock)
                    .await;
                tracing::info!(
                    operation_id = %ctx.operation_id,
                    operation = %name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Operation succeeded"
                );
                Ok(OperationReport {
                    operation_id: ctx.operation_id,
                    result,
                    dry_run,
                    backup_id: ctx.pre_backup_id.clone(),
                    duration: started.elapsed(),
                    warnings,
                })
            }
            Err(error) => {
                self.track(&ctx, OperationPhase::Failed);
                let status = self.handle_failure(&ctx, &error).await;
                self.finish(&ctx, status, started, Some(&error), preflight.holds_lock)
                    .await;
                Err(error)
            }
        }
    }

    /// Confirmation, lock, pre-checks and the pre-operation snapshot.
    async fn preflight(
        &self,
        ctx: &mut OperationContext,
        options: &OperationOptions,
    ) -> Result<Preflight, SafetyError> {
        if ctx.destructive && self.config.require_confirmation_for_destructive && !ctx.confirmed {
            return Err(SafetyError::ConfirmationRequired {
                operation: ctx.name.clone(),
            });
        }

        let mut holds_lock = false;
        if options.exclusive {
            match self
                .coordinator
                .acquire_global_lock(&ctx.name, self.lock_timeout)
                .await
            {
                Ok(_) => holds_lock = true,
                Err(e @ CoordinatorError::LockContention { .. }) => {
                    return Err(SafetyError::LockContention(e));
                }
                Err(e) => {
                    tracing::warn!(operation = %ctx.name, error = %e, "Could not take global lock, continuing");
                }
            }
        }

        let result = self.pre_check(ctx).await;
        let result = match result {
            Ok(warnings) => self.pre_backup(ctx).await.map(|()| warnings),
            Err(e) => Err(e),
        };

        match result {
            Ok(warnings) => {
                self.track(ctx, OperationPhase::Checked);
                Ok(Preflight {
                    warnings,
                    holds_lock,
                })
            }
            Err(e) => {
                if holds_lock {
                    self.release_lock().await;
                }
                Err(e)
            }
        }
    }

    /// Run the checks and decide which failures block. Returns the
    /// non-blocking ones as warnings.
    async fn pre_check(&self, ctx: &OperationContext) -> Result<Vec<String>, SafetyError> {
        let operations_since_backup = self.operations_since_backup();
        let failures = run_pre_checks(PreCheckInput {
            coordinator: &self.coordinator,
            client: self.client.as_ref(),
            backup_root: self.backups.store().root(),
            operations_since_backup,
            max_operations_without_backup: self.config.max_operations_without_backup,
            backup_planned: ctx.backup_required,
        })
        .await;

        if !ctx.destructive {
            let warnings: Vec<String> = failures.iter().map(ToString::to_string).collect();
            for warning in &warnings {
                tracing::warn!(operation = %ctx.name, %warning, "Pre-operation check failed");
            }
            return Ok(warnings);
        }

        let (blocking, advisory): (Vec<CheckFailure>, Vec<CheckFailure>) =
            failures.into_iter().partition(|failure| match failure {
                CheckFailure::Conflicts(_) => self.config.require_compatibility,
                _ => true,
            });

        let warnings: Vec<String> = advisory.iter().map(ToString::to_string).collect();
        for warning in &warnings {
            tracing::warn!(operation = %ctx.name, %warning, "Pre-operation check failed");
        }

        if blocking.is_empty() {
            return Ok(warnings);
        }

        if let [CheckFailure::Conflicts(conflicts)] = blocking.as_slice() {
            return Err(SafetyError::CompatibilityConflict {
                conflicts: conflicts
                    .iter()
                    .map(|c| format!("{}: {}", c.agent_id, c.reason))
                    .collect(),
            });
        }
        if let [CheckFailure::Unreachable(e)] = blocking.as_slice() {
            return Err(SafetyError::ConnectivityFailure(e.clone()));
        }
        Err(SafetyError::PreflightFailed {
            operation: ctx.name.clone(),
            failures: blocking.iter().map(ToString::to_string).collect(),
        })
    }

    async fn pre_backup(&self, ctx: &mut OperationContext) -> Result<(), SafetyError> {
        if !ctx.backup_required {
            return Ok(());
        }

        let metadata = SnapshotMetadata::described(format!("pre-operation backup for {}", ctx.name))
            .with_operation(ctx.name.clone())
            .with_extra("operation_id", ctx.operation_id.to_string());
        let id = self
            .snapshot_current(metadata)
            .await
            .map_err(SafetyError::BackupCreationFailure)?;
        ctx.pre_backup_id = Some(id);
        Ok(())
    }

    async fn run_monitored<F, Fut, T>(
        &self,
        ctx: &OperationContext,
        timeout: Option<Duration>,
        operation: F,
    ) -> Result<T, SafetyError>
    where
        F: FnOnce(OperationContext) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let monitor = OperationMonitor::spawn(
            ctx.name.clone(),
            self.client.clone(),
            self.config.monitor_interval,
            self.config.long_running_warning,
        );

        let future = operation(ctx.clone());
        let result = match timeout.or(self.config.operation_timeout) {
            Some(deadline) => match tokio::time::timeout(deadline, future).await {
                Ok(result) => result.map_err(|source| SafetyError::OperationExecution {
                    operation: ctx.name.clone(),
                    source,
                }),
                Err(_) => Err(SafetyError::OperationTimedOut {
                    operation: ctx.name.clone(),
                    timeout: deadline,
                }),
            },
            None => future.await.map_err(|source| SafetyError::OperationExecution {
                operation: ctx.name.clone(),
                source,
            }),
        };

        let summary = monitor.stop().await;
        tracing::debug!(
            operation_id = %ctx.operation_id,
            ticks = summary.ticks,
            long_running_warnings = summary.long_running_warnings,
            connectivity_failures = summary.connectivity_failures,
            "Operation monitor stopped"
        );
        result
    }

    /// Post-operation verification. Returns warnings, or an error in strict mode.
    async fn verify<T: Serialize>(
        &self,
        ctx: &OperationContext,
        result: &T,
    ) -> Result<Vec<String>, SafetyError> {
        let failures = match serde_json::to_value(result) {
            Ok(value) => run_post_checks(&self.coordinator, self.client.as_ref(), &value).await,
            Err(e) => vec![CheckFailure::ResultShape(e.to_string())],
        };
        if failures.is_empty() {
            return Ok(Vec::new());
        }

        let failures: Vec<String> = failures.iter().map(ToString::to_string).collect();
        if self.config.strict_post_checks {
            return Err(SafetyError::PostCheckFailed {
                operation: ctx.name.clone(),
                failures,
            });
        }
        for failure in &failures {
            tracing::warn!(operation = %ctx.name, %failure, "Post-operation check failed");
        }
        Ok(failures)
    }

    /// Failure snapshot, rollback and error broadcast. Never fails itself.
    async fn handle_failure(&self, ctx: &OperationContext, error: &SafetyError) -> OperationStatus {
        tracing::error!(
            operation_id = %ctx.operation_id,
            operation = %ctx.name,
            error = %error,
            "Operation failed"
        );

        if !ctx.dry_run {
            let agent = self.coordinator.status();
            let mut metadata = SnapshotMetadata::described(format!("failure snapshot for {}", ctx.name))
                .with_operation(ctx.name.clone())
                .with_error(error.to_string())
                .with_extra("operation_id", ctx.operation_id.to_string())
                .with_extra("agent_id", agent.agent_id.clone())
                .with_extra("agent_state", agent.state.as_str());
            if let Some(pre) = &ctx.pre_backup_id {
                metadata = metadata.with_extra("pre_backup_id", pre.clone());
            }
            match self.snapshot_current(metadata).await {
                Ok(id) => {
                    tracing::info!(operation = %ctx.name, snapshot_id = %id, "Failure snapshot created");
                }
                Err(e) => {
                    tracing::warn!(operation = %ctx.name, error = %e, "Failure snapshot could not be created");
                }
            }
        }

        let mut status = OperationStatus::Failed;
        if let Some(pre) = &ctx.pre_backup_id {
            if self.config.emergency_rollback_enabled {
                match self.perform_emergency_rollback(pre, None).await {
                    Ok(outcome) => {
                        status = OperationStatus::FailedAndRolledBack;
                        self.track(ctx, OperationPhase::RolledBack);
                        tracing::warn!(
                            operation = %ctx.name,
                            snapshot_id = %pre,
                            restored_to = %outcome.restored_to.display(),
                            "Rolled back to pre-operation snapshot"
                        );
                    }
                    Err(e) => {
                        tracing::error!(operation = %ctx.name, snapshot_id = %pre, error = %e, "Emergency rollback failed");
                    }
                }
            }
        }

        self.coordinator
            .update_status(
                AgentState::Error,
                &format!("{} failed: {}", ctx.name, error),
                AgentMetadata::for_operation(ctx.name.clone(), ctx.destructive),
            )
            .await;

        status
    }

    /// Log the outcome, release the lock and forget the operation.
    async fn finish(
        &self,
        ctx: &OperationContext,
        status: OperationStatus,
        started: Instant,
        error: Option<&SafetyError>,
        holds_lock: bool,
    ) {
        if holds_lock {
            self.release_lock().await;
        }

        let entry = OperationLogEntry {
            id: ctx.operation_id,
            name: ctx.name.clone(),
            timestamp: Utc::now(),
            status,
            duration_ms: started.elapsed().as_millis() as u64,
            destructive: ctx.destructive,
            dry_run: ctx.dry_run,
            backup_created: ctx.pre_backup_id.is_some(),
            backup_id: ctx.pre_backup_id.clone(),
            error: error.map(ToString::to_string),
        };
        if let Err(e) = self.log.append(entry).await {
            tracing::warn!(operation = %ctx.name, error = %e, "Failed to append operation log");
        }

        self.active.lock().remove(&ctx.operation_id);
    }

    async fn release_lock(&self) {
        if let Err(e) = self.coordinator.release_global_lock().await {
            tracing::warn!(error = %e, "Failed to release global lock");
        }
    }

    fn track(&self, ctx: &OperationContext, phase: OperationPhase) {
        tracing::debug!(operation_id = %ctx.operation_id, %phase, "Operation phase");
        let mut active = self.active.lock();
        if phase.is_terminal() {
            active.remove(&ctx.operation_id);
            return;
        }
        active
            .entry(ctx.operation_id)
            .and_modify(|op| op.phase = phase)
            .or_insert_with(|| ActiveOperation {
                operation_id: ctx.operation_id,
                name: ctx.name.clone(),
                phase,
                started_at: ctx.started_at,
            });
    }

    /// Capture the configured collections and store them as a safety snapshot
    async fn snapshot_current(&self, metadata: SnapshotMetadata) -> Result<String, BackupError> {
        let dataset = capture_dataset(self.client.as_ref(), &self.config.collections)
            .await
            .map_err(|e| BackupError::CreationFailure(format!("capturing record store: {}", e)))?;
        let id = self.backups.create_safety_snapshot(&dataset, metadata).await?;
        self.note_backup(&id);
        Ok(id)
    }

    fn note_backup(&self, id: &str) {
        let mut counters = self.counters.lock();
        counters.operations_since_backup = 0;
        counters.last_backup = Some((id.to_string(), Utc::now()));
    }

    /// Restore `snapshot_id` outside the execute flow.
    ///
    /// When `current` is given it is saved as a safety snapshot first so the
    /// rollback itself can be undone.
    pub async fn perform_emergency_rollback(
        &self,
        snapshot_id: &str,
        current: Option<&Dataset>,
    ) -> Result<RollbackOutcome, SafetyError> {
        check_snapshot_id(snapshot_id).map_err(|source| SafetyError::EmergencyRollbackFailure {
            snapshot_id: snapshot_id.to_string(),
            source,
        })?;
        let pre_rollback_snapshot = match current {
            Some(current) => {
                let metadata = SnapshotMetadata::described(format!("state before rollback to {}", snapshot_id))
                    .with_operation("emergency_rollback");
                match self.backups.create_safety_snapshot(current, metadata).await {
                    Ok(id) => Some(id),
                    Err(e) => {
                        tracing::warn!(snapshot_id = %snapshot_id, error = %e, "Could not save state before rollback");
                        None
                    }
                }
            }
            None => None,
        };

        let target = self
            .rollbacks_dir
            .join(format!("{}-{}.json", snapshot_id, Utc::now().format("%Y%m%dT%H%M%S%.3fZ")));
        let rolled_back_data = self
            .backups
            .restore(snapshot_id, Some(&target))
            .await
            .map_err(|source| SafetyError::EmergencyRollbackFailure {
                snapshot_id: snapshot_id.to_string(),
                source,
            })?;

        tracing::warn!(
            snapshot_id = %snapshot_id,
            records = rolled_back_data.record_count(),
            target = %target.display(),
            "Emergency rollback completed"
        );
        Ok(RollbackOutcome {
            snapshot_id: snapshot_id.to_string(),
            rolled_back_data,
            restored_to: target,
            pre_rollback_snapshot,
        })
    }

    /// Take a full backup of the configured collections.
    pub async fn create_backup(&self, description: &str) -> Result<String, SafetyError> {
        let report = self
            .execute_with_safety("create_backup", OperationOptions::read_only(), |_ctx| async move {
                let dataset = capture_dataset(self.client.as_ref(), &self.config.collections).await?;
                let id = self
                    .backups
                    .create_full_backup(&dataset, SnapshotMetadata::described(description))
                    .await?;
                self.note_backup(&id);
                Ok::<_, anyhow::Error>(id)
            })
            .await?;
        Ok(report.result)
    }

    /// Take a safety snapshot of the configured collections.
    pub async fn create_snapshot(&self, description: &str) -> Result<String, SafetyError> {
        let report = self
            .execute_with_safety("create_snapshot", OperationOptions::read_only(), |_ctx| async move {
                let dataset = capture_dataset(self.client.as_ref(), &self.config.collections).await?;
                let id = self
                    .backups
                    .create_safety_snapshot(&dataset, SnapshotMetadata::described(description))
                    .await?;
                self.note_backup(&id);
                Ok::<_, anyhow::Error>(id)
            })
            .await?;
        Ok(report.result)
    }

    /// Restore a backup. Destructive: requires confirmation and snapshots
    /// the current state first.
    pub async fn restore_backup(
        &self,
        backup_id: &str,
        confirmed: bool,
    ) -> Result<OperationReport<RollbackOutcome>, SafetyError> {
        check_snapshot_id(backup_id)?;
        let mut options = OperationOptions::destructive().with_metadata("backup_id", backup_id);
        options.confirmed = confirmed;
        self.execute_with_safety("restore_backup", options, |ctx| async move {
            Ok::<_, anyhow::Error>(self.restore_for(&ctx, backup_id).await?)
        })
        .await
    }

    /// Return to a safety snapshot. Destructive and confirmed, but takes no
    /// pre-operation backup since it is itself the recovery path.
    pub async fn rollback_to_snapshot(
        &self,
        snapshot_id: &str,
        confirmed: bool,
    ) -> Result<OperationReport<RollbackOutcome>, SafetyError> {
        check_snapshot_id(snapshot_id)?;
        let mut options = OperationOptions::destructive()
            .backup_before(false)
            .with_metadata("snapshot_id", snapshot_id);
        options.confirmed = confirmed;
        self.execute_with_safety("rollback_to_snapshot", options, |ctx| async move {
            Ok::<_, anyhow::Error>(self.restore_for(&ctx, snapshot_id).await?)
        })
        .await
    }

    async fn restore_for(
        &self,
        ctx: &OperationContext,
        snapshot_id: &str,
    ) -> Result<RollbackOutcome, SafetyError> {
        if ctx.dry_run {
            let snapshot = self.backups.load_snapshot(snapshot_id).await?;
            tracing::info!(
                snapshot_id = %snapshot_id,
                records = snapshot.manifest.record_count,
                "Dry run: restore not applied"
            );
            return Ok(RollbackOutcome {
                snapshot_id: snapshot_id.to_string(),
                rolled_back_data: Dataset::new(),
                restored_to: PathBuf::new(),
                pre_rollback_snapshot: ctx.pre_backup_id.clone(),
            });
        }

        let target = self.rollbacks_dir.join(format!("{}-{}.json", snapshot_id, ctx.operation_id.simple()));
        let rolled_back_data = self.backups.restore(snapshot_id, Some(&target)).await?;
        Ok(RollbackOutcome {
            snapshot_id: snapshot_id.to_string(),
            rolled_back_data,
            restored_to: target,
            pre_rollback_snapshot: ctx.pre_backup_id.clone(),
        })
    }

    /// Up to `limit` log entries, newest first
    pub async fn get_operation_history(&self, limit: usize) -> Vec<OperationLogEntry> {
        self.log.recent(limit).await
    }

    pub async fn get_safety_status(&self) -> SafetyStatus {
        let agent = self.coordinator.status();

        let active_agents = match self.coordinator.get_active_agents().await {
            Ok(agents) => Some(agents.len()),
            Err(e) => {
                tracing::warn!(error = %e, "Could not list active agents");
                None
            }
        };
        let compatible = self
            .coordinator
            .check_compatibility()
            .await
            .ok()
            .map(|report| report.compatible);
        let current_lock = self.coordinator.current_lock().await.ok().flatten();
        let backups_available = match self.backups.get_backup_catalog().await {
            Ok(entries) => Some(entries.len()),
            Err(e) => {
                tracing::warn!(error = %e, "Could not read backup catalog");
                None
            }
        };

        let (operations_since_backup, last_backup) = {
            let counters = self.counters.lock();
            (counters.operations_since_backup, counters.last_backup.clone())
        };
        let mut active_operations: Vec<ActiveOperation> = self.active.lock().values().cloned().collect();
        active_operations.sort_by_key(|op| op.started_at);

        SafetyStatus {
            agent_id: agent.agent_id,
            agent_state: agent.state,
            active_agents,
            compatible,
            current_lock,
            operations_since_backup,
            max_operations_without_backup: self.config.max_operations_without_backup,
            last_backup_id: last_backup.as_ref().map(|(id, _)| id.clone()),
            last_backup_at: last_backup.map(|(_, at)| at),
            backups_available,
            active_operations,
            auto_backup_before_changes: self.config.auto_backup_before_changes,
            dry_run_by_default: self.config.dry_run_by_default,
            emergency_rollback_enabled: self.config.emergency_rollback_enabled,
        }
    }
}

/// Snapshot ids end up in file names; only accept ids the engine generates.
fn check_snapshot_id(id: &str) -> Result<(), BackupError> {
    match SnapshotKind::of_id(id) {
        Some(_) => Ok(()),
        None => Err(BackupError::InvalidId(id.to_string())),
    }
}
