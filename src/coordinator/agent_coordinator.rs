//! Cross-process presence, heartbeat and global locking
//!
//! Every agent process owns one `AgentCoordinator`. It publishes the agent's
//! record to the shared status area, keeps it fresh with a background
//! heartbeat, and arbitrates the global lock. Coordination is advisory: I/O
//! problems are logged and degrade guarantees, they never abort callers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::CoordinatorConfig;
use crate::coordinator::error::CoordinatorError;
use crate::coordinator::record::{AgentMetadata, AgentRecord, AgentState, LockRecord};
use crate::coordinator::status_area::{LockRemoval, StatusArea};

/// A sibling agent whose activity conflicts with ours
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub agent_id: String,
    pub reason: String,
}

/// Result of `check_compatibility`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompatibilityReport {
    pub compatible: bool,
    pub conflicts: Vec<Conflict>,
}

impl CompatibilityReport {
    fn from_conflicts(conflicts: Vec<Conflict>) -> Self {
        Self {
            compatible: conflicts.is_empty(),
            conflicts,
        }
    }
}

struct Heartbeat {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// State shared with the heartbeat task
struct Shared {
    area: StatusArea,
    record: Mutex<AgentRecord>,
    /// Held from clone to rename so writes land in the order they were taken
    writing: tokio::sync::Mutex<()>,
}

impl Shared {
    async fn publish(&self) -> Result<(), CoordinatorError> {
        let _writing = self.writing.lock().await;
        let record = self.record.lock().clone();
        self.area.write_agent(&record).await
    }
}

pub struct AgentCoordinator {
    agent_id: String,
    config: CoordinatorConfig,
    shared: Arc<Shared>,
    heartbeat: Mutex<Option<Heartbeat>>,
    held_lock: Mutex<Option<LockRecord>>,
    initialized: AtomicBool,
    shut_down: AtomicBool,
}

impl AgentCoordinator {
    /// Create a coordinator over the status area at `area`. Nothing is
    /// written until `initialize`.
    pub fn new(area: StatusArea, config: CoordinatorConfig) -> Self {
        let agent_id = config.agent_id.clone().unwrap_or_else(default_agent_id);
        let record = AgentRecord::new(agent_id.clone(), Utc::now());
        Self {
            agent_id,
            config,
            shared: Arc::new(Shared {
                area,
                record: Mutex::new(record),
                writing: tokio::sync::Mutex::new(()),
            }),
            heartbeat: Mutex::new(None),
            held_lock: Mutex::new(None),
            initialized: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn status_area(&self) -> &StatusArea {
        &self.shared.area
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// This agent's record as last set locally
    pub fn status(&self) -> AgentRecord {
        self.shared.record.lock().clone()
    }

    /// The lock this coordinator believes it holds
    pub fn held_lock(&self) -> Option<LockRecord> {
        self.held_lock.lock().clone()
    }

    /// Publish this agent's record. Calling it again is a no-op.
    pub async fn initialize(&self) -> Result<(), CoordinatorError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(CoordinatorError::ShutDown);
        }
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        {
            let now = Utc::now();
            let mut record = self.shared.record.lock();
            record.state = AgentState::Active;
            record.message = "initialized".to_string();
            record.started_at = now;
            record.last_heartbeat = now;
        }

        if let Err(e) = self.shared.publish().await {
            self.initialized.store(false, Ordering::SeqCst);
            return Err(e);
        }
        tracing::info!(agent_id = %self.agent_id, "Agent coordinator initialized");
        Ok(())
    }

    /// Start the background heartbeat. A second call while one is running
    /// does nothing. Must be called from within a tokio runtime.
    pub fn start_heartbeat(&self, interval: Duration) {
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }

        let mut heartbeat = self.heartbeat.lock();
        if heartbeat.as_ref().is_some_and(|h| !h.task.is_finished()) {
            tracing::debug!(agent_id = %self.agent_id, "Heartbeat already running");
            return;
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_heartbeat(
            self.shared.clone(),
            interval,
            cancel.clone(),
        ));
        *heartbeat = Some(Heartbeat { cancel, task });
        tracing::debug!(agent_id = %self.agent_id, ?interval, "Heartbeat started");
    }

    pub fn is_heartbeat_running(&self) -> bool {
        self.heartbeat
            .lock()
            .as_ref()
            .is_some_and(|h| !h.task.is_finished())
    }

    /// Overwrite this agent's status. Persistence is best-effort.
    pub async fn update_status(&self, state: AgentState, message: &str, metadata: AgentMetadata) {
        {
            let mut record = self.shared.record.lock();
            record.state = state;
            record.message = message.to_string();
            record.metadata = metadata;
            record.last_heartbeat = Utc::now();
        }

        if let Err(e) = self.shared.publish().await {
            tracing::warn!(
                agent_id = %self.agent_id,
                state = %state,
                error = %e,
                "Failed to persist agent status"
            );
        }
    }

    /// Live sibling agents. Records past the liveness threshold are left on
    /// disk but excluded.
    pub async fn get_active_agents(&self) -> Result<Vec<AgentRecord>, CoordinatorError> {
        let live = self
            .shared
            .area
            .live_agents(Utc::now(), self.config.liveness_threshold)
            .await?;
        Ok(live
            .into_iter()
            .filter(|record| record.agent_id != self.agent_id)
            .collect())
    }

    /// Look for siblings doing destructive or exclusive work, or holding the
    /// global lock. Read-only.
    pub async fn check_compatibility(&self) -> Result<CompatibilityReport, CoordinatorError> {
        let now = Utc::now();
        let agents = self.get_active_agents().await?;
        let lock = match self.shared.area.read_lock().await {
            Ok(lock) => lock.filter(|lock| !lock.is_expired(now)),
            Err(CoordinatorError::CorruptRecord { path, message }) => {
                tracing::warn!(path = %path.display(), %message, "Ignoring unreadable lock");
                None
            }
            Err(e) => return Err(e),
        };

        let mut conflicts = Vec::new();
        for agent in &agents {
            if agent.state == AgentState::Working
                && (agent.metadata.destructive || agent.metadata.exclusive)
            {
                let kind = if agent.metadata.exclusive {
                    "exclusive"
                } else {
                    "destructive"
                };
                conflicts.push(Conflict {
                    agent_id: agent.agent_id.clone(),
                    reason: format!(
                        "running {} operation '{}'",
                        kind,
                        agent.metadata.operation.as_deref().unwrap_or("unknown")
                    ),
                });
            }
        }

        if let Some(lock) = lock {
            if lock.holder != self.agent_id {
                conflicts.push(Conflict {
                    agent_id: lock.holder.clone(),
                    reason: format!("holds global lock '{}'", lock.label),
                });
            }
        }

        Ok(CompatibilityReport::from_conflicts(conflicts))
    }

    /// Poll `check_compatibility` until it reports compatible or `timeout`
    /// elapses. Errors count as compatible since coordination is advisory.
    pub async fn wait_for_compatibility(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.check_compatibility().await {
                Ok(report) if report.compatible => return true,
                Ok(report) => {
                    tracing::debug!(
                        agent_id = %self.agent_id,
                        conflicts = report.conflicts.len(),
                        "Waiting for conflicting agents"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        agent_id = %self.agent_id,
                        error = %e,
                        "Compatibility check failed, proceeding"
                    );
                    return true;
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let remaining = deadline - now;
            tokio::time::sleep(self.config.compatibility_poll.min(remaining)).await;
        }
    }

    /// Try once to take the global lock for `timeout`.
    ///
    /// An expired lock is treated as abandoned and taken over. If this agent
    /// already holds a live lock it is returned unchanged.
    pub async fn acquire_global_lock(
        &self,
        label: &str,
        timeout: Duration,
    ) -> Result<LockRecord, CoordinatorError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(CoordinatorError::ShutDown);
        }

        let area = &self.shared.area;
        let candidate = LockRecord::new(self.agent_id.clone(), label, Utc::now(), timeout);

        if area.try_create_lock(&candidate).await? {
            return Ok(self.record_acquired(candidate));
        }

        let now = Utc::now();
        let existing = match area.read_lock().await {
            Ok(existing) => existing,
            Err(CoordinatorError::CorruptRecord { path, message }) => {
                tracing::warn!(path = %path.display(), %message, "Replacing unreadable lock");
                area.remove_unreadable_lock().await?;
                None
            }
            Err(e) => return Err(e),
        };

        match existing {
            // Released between our attempt and the read
            None => {}
            Some(existing) if existing.holder == self.agent_id && !existing.is_expired(now) => {
                *self.held_lock.lock() = Some(existing.clone());
                return Ok(existing);
            }
            Some(existing) if existing.is_expired(now) => {
                if area.remove_lock_matching(existing.lock_id).await?
                    == LockRemoval::Removed
                {
                    tracing::warn!(
                        agent_id = %self.agent_id,
                        previous_holder = %existing.holder,
                        expired_at = %existing.expires_at,
                        "Taking over stale global lock"
                    );
                }
            }
            Some(existing) => {
                return Err(CoordinatorError::LockContention {
                    holder: existing.holder,
                    label: existing.label,
                    expires_at: existing.expires_at,
                });
            }
        }

        let candidate = LockRecord::new(self.agent_id.clone(), label, Utc::now(), timeout);
        if area.try_create_lock(&candidate).await? {
            return Ok(self.record_acquired(candidate));
        }

        // Lost the race to another contender
        match area.read_lock().await {
            Ok(Some(winner)) => Err(CoordinatorError::LockContention {
                holder: winner.holder,
                label: winner.label,
                expires_at: winner.expires_at,
            }),
            Ok(None) | Err(_) => Err(CoordinatorError::LockContention {
                holder: "unknown".to_string(),
                label: label.to_string(),
                expires_at: Utc::now(),
            }),
        }
    }

    /// Retry `acquire_global_lock` until it succeeds or `wait` elapses.
    pub async fn acquire_global_lock_within(
        &self,
        label: &str,
        timeout: Duration,
        wait: Duration,
    ) -> Result<LockRecord, CoordinatorError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            match self.acquire_global_lock(label, timeout).await {
                Err(CoordinatorError::LockContention { .. })
                    if tokio::time::Instant::now() < deadline =>
                {
                    let remaining = deadline - tokio::time::Instant::now();
                    tokio::time::sleep(self.config.compatibility_poll.min(remaining)).await;
                }
                other => return other,
            }
        }
    }

    fn record_acquired(&self, lock: LockRecord) -> LockRecord {
        tracing::info!(
            agent_id = %self.agent_id,
            label = %lock.label,
            expires_at = %lock.expires_at,
            "Acquired global lock"
        );
        *self.held_lock.lock() = Some(lock.clone());
        lock
    }

    /// Release the global lock if this agent holds it; otherwise a no-op.
    pub async fn release_global_lock(&self) -> Result<(), CoordinatorError> {
        let held = self.held_lock.lock().take();
        let area = &self.shared.area;

        let lock_id = match held {
            Some(held) => held.lock_id,
            None => match area.read_lock().await {
                Ok(Some(current)) if current.holder == self.agent_id => current.lock_id,
                _ => return Ok(()),
            },
        };

        match area.remove_lock_matching(lock_id).await? {
            LockRemoval::Removed => {
                tracing::info!(agent_id = %self.agent_id, "Released global lock");
            }
            LockRemoval::Mismatch => {
                tracing::warn!(
                    agent_id = %self.agent_id,
                    "Global lock was taken over before release"
                );
            }
            LockRemoval::Absent => {}
        }
        Ok(())
    }

    /// The lock currently in force, if any
    pub async fn current_lock(&self) -> Result<Option<LockRecord>, CoordinatorError> {
        let now = Utc::now();
        Ok(self
            .shared
            .area
            .read_lock()
            .await?
            .filter(|lock| !lock.is_expired(now)))
    }

    /// Stop the heartbeat, release the lock and mark this agent inactive.
    /// Safe to call more than once and from failure paths.
    pub async fn safe_shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let heartbeat = self.heartbeat.lock().take();
        if let Some(heartbeat) = heartbeat {
            heartbeat.cancel.cancel();
            let _ = heartbeat.task.await;
        }

        if let Err(e) = self.release_global_lock().await {
            tracing::warn!(agent_id = %self.agent_id, error = %e, "Failed to release lock on shutdown");
        }

        {
            let mut record = self.shared.record.lock();
            record.state = AgentState::Inactive;
            record.message = "shut down".to_string();
            record.metadata = AgentMetadata::default();
            record.last_heartbeat = Utc::now();
        }
        if let Err(e) = self.shared.publish().await {
            tracing::warn!(agent_id = %self.agent_id, error = %e, "Failed to mark agent inactive");
        }

        tracing::info!(agent_id = %self.agent_id, "Agent coordinator shut down");
    }
}

impl Drop for AgentCoordinator {
    fn drop(&mut self) {
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }

        if let Some(heartbeat) = self.heartbeat.get_mut().take() {
            heartbeat.cancel.cancel();
        }

        if let Some(lock) = self.held_lock.get_mut().take() {
            match self
                .shared
                .area
                .remove_lock_matching_blocking(lock.lock_id)
            {
                Ok(LockRemoval::Removed) => {
                    tracing::debug!(agent_id = %self.agent_id, "Released global lock on drop");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(agent_id = %self.agent_id, error = %e, "Failed to release lock on drop");
                }
            }
        }
    }
}

async fn run_heartbeat(shared: Arc<Shared>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    // Skip the first immediate tick
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                shared.record.lock().last_heartbeat = Utc::now();
                if let Err(e) = shared.publish().await {
                    let agent_id = shared.record.lock().agent_id.clone();
                    tracing::warn!(agent_id = %agent_id, error = %e, "Heartbeat write failed");
                }
            }
        }
    }
}

fn default_agent_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "agent".to_string());
    format!("{}-{}", host, std::process::id())
}
