use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Lifecycle state of an agent as published in the status area
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    #[default]
    Idle,
    Active,
    Working,
    Error,
    /// Written by `safe_shutdown`; the record stays on disk but the agent is gone
    Inactive,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Idle => "idle",
            AgentState::Active => "active",
            AgentState::Working => "working",
            AgentState::Error => "error",
            AgentState::Inactive => "inactive",
        }
    }

    /// Parse from string, unknown values map to Idle
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "active" => AgentState::Active,
            "working" => AgentState::Working,
            "error" => AgentState::Error,
            "inactive" => AgentState::Inactive,
            _ => AgentState::Idle,
        }
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Structured status metadata.
///
/// The fields the coordinator reasons about are first-class; anything else a
/// caller wants to publish goes into `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMetadata {
    /// Name of the operation currently running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    /// The running operation rewrites or deletes records
    #[serde(default)]
    pub destructive: bool,
    /// The running operation needs the store to itself
    #[serde(default)]
    pub exclusive: bool,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl AgentMetadata {
    pub fn for_operation(name: impl Into<String>, destructive: bool) -> Self {
        Self {
            operation: Some(name.into()),
            destructive,
            ..Self::default()
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// One agent's liveness record in the shared status area
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub state: AgentState,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub metadata: AgentMetadata,
    pub last_heartbeat: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub pid: u32,
}

impl AgentRecord {
    pub fn new(agent_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            agent_id: agent_id.into(),
            state: AgentState::Active,
            message: "initialized".to_string(),
            metadata: AgentMetadata::default(),
            last_heartbeat: now,
            started_at: now,
            pid: std::process::id(),
        }
    }

    /// Heartbeat age at `now` (zero if the heartbeat lies in the future)
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_heartbeat).to_std().unwrap_or(Duration::ZERO)
    }

    /// Alive means not shut down and heartbeat younger than the threshold
    pub fn is_live(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.state != AgentState::Inactive && self.heartbeat_age(now) <= threshold
    }
}

/// The single global lock token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Distinguishes successive acquisitions by the same holder
    pub lock_id: Uuid,
    pub holder: String,
    pub label: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub pid: u32,
}

impl LockRecord {
    pub fn new(
        holder: impl Into<String>,
        label: impl Into<String>,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Self {
        Self {
            lock_id: Uuid::new_v4(),
            holder: holder.into(),
            label: label.into(),
            acquired_at: now,
            expires_at: now + to_chrono(timeout),
            pid: std::process::id(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Remaining lifetime, None once expired
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        if self.is_expired(now) {
            None
        } else {
            (self.expires_at - now).to_std().ok()
        }
    }
}

/// Convert a std duration, saturating at one year
pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}
