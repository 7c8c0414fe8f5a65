//! Shared status area
//!
//! A directory visible to every agent process. Each agent owns
//! `agents/<id>.json`; `global.lock` holds at most one lock record.
//!
//! Agent records are replaced atomically (write to a temp sibling, rename).
//! The lock is created with a hard link from a fully written temp file, so
//! creation is exclusive and readers never see a half-written lock. Removal
//! and stale takeover check the lock id while holding `global.lock.guard`;
//! the lock file stays in place unless it is the one being removed.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::coordinator::error::CoordinatorError;
use crate::coordinator::record::{AgentRecord, LockRecord};
use crate::util::fs::{read_json_opt, remove_if_exists, write_json_atomic, FileGuard};

const AGENTS_DIR: &str = "agents";
const LOCK_FILE: &str = "global.lock";
const GUARD_FILE: &str = "global.lock.guard";
const GUARD_WAIT: Duration = Duration::from_secs(5);
/// A guard this old belongs to a process that died mid-removal
const GUARD_STALE: Duration = Duration::from_secs(30);

/// Outcome of removing a lock by identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockRemoval {
    Removed,
    /// No lock file existed
    Absent,
    /// A different lock is in place; it was left untouched
    Mismatch,
}

#[derive(Debug, Clone)]
pub struct StatusArea {
    root: PathBuf,
}

impl StatusArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn agents_dir(&self) -> PathBuf {
        self.root.join(AGENTS_DIR)
    }

    fn agent_path(&self, agent_id: &str) -> PathBuf {
        self.agents_dir().join(format!("{}.json", sanitize_id(agent_id)))
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    fn guard_path(&self) -> PathBuf {
        self.root.join(GUARD_FILE)
    }

    pub async fn write_agent(&self, record: &AgentRecord) -> Result<(), CoordinatorError> {
        write_json_atomic(&self.agent_path(&record.agent_id), record).await?;
        Ok(())
    }

    pub async fn read_agent(&self, agent_id: &str) -> Result<Option<AgentRecord>, CoordinatorError> {
        let path = self.agent_path(agent_id);
        read_json_opt(&path).await.map_err(|e| corrupt_or_io(path, e))
    }

    /// Every agent record on disk, live or not. Unreadable files are skipped.
    pub async fn list_agents(&self) -> Result<Vec<AgentRecord>, CoordinatorError> {
        let mut entries = match tokio::fs::read_dir(self.agents_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json_opt::<AgentRecord>(&path).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable agent record");
                }
            }
        }

        records.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        Ok(records)
    }

    /// Records whose heartbeat is younger than `threshold` and that are not
    /// shut down. Stale records stay on disk.
    pub async fn live_agents(
        &self,
        now: DateTime<Utc>,
        threshold: std::time::Duration,
    ) -> Result<Vec<AgentRecord>, CoordinatorError> {
        Ok(self
            .list_agents()
            .await?
            .into_iter()
            .filter(|record| record.is_live(now, threshold))
            .collect())
    }

    pub async fn read_lock(&self) -> Result<Option<LockRecord>, CoordinatorError> {
        let path = self.lock_path();
        read_json_opt(&path).await.map_err(|e| corrupt_or_io(path, e))
    }

    /// Create the lock file if none exists. Returns false when a lock is
    /// already in place.
    pub async fn try_create_lock(&self, lock: &LockRecord) -> Result<bool, CoordinatorError> {
        tokio::fs::create_dir_all(&self.root).await?;

        let tmp = self
            .root
            .join(format!(".{}.{}.tmp", LOCK_FILE, lock.lock_id.simple()));
        let bytes = serde_json::to_vec_pretty(lock).map_err(io::Error::other)?;
        tokio::fs::write(&tmp, &bytes).await?;

        let linked = tokio::fs::hard_link(&tmp, self.lock_path()).await;
        let _ = tokio::fs::remove_file(&tmp).await;

        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn removal_guard(&self) -> Result<FileGuard, CoordinatorError> {
        Ok(FileGuard::acquire(&self.guard_path(), GUARD_WAIT, GUARD_STALE).await?)
    }

    /// Remove the lock only if it is still the one identified by `lock_id`.
    ///
    /// Removals are serialized through the guard file, so the lock read here
    /// is the one deleted. A lock taken since the caller last looked is never
    /// touched.
    pub async fn remove_lock_matching(&self, lock_id: Uuid) -> Result<LockRemoval, CoordinatorError> {
        let _guard = self.removal_guard().await?;
        match self.read_lock().await {
            Ok(Some(found)) if found.lock_id == lock_id => {}
            Ok(Some(_)) | Err(CoordinatorError::CorruptRecord { .. }) => {
                return Ok(LockRemoval::Mismatch)
            }
            Ok(None) => return Ok(LockRemoval::Absent),
            Err(e) => return Err(e),
        }

        if remove_if_exists(&self.lock_path()).await? {
            Ok(LockRemoval::Removed)
        } else {
            Ok(LockRemoval::Absent)
        }
    }

    /// Remove a lock file that does not parse. A readable lock is left alone.
    pub async fn remove_unreadable_lock(&self) -> Result<LockRemoval, CoordinatorError> {
        let _guard = self.removal_guard().await?;
        match self.read_lock().await {
            Err(CoordinatorError::CorruptRecord { .. }) => {
                remove_if_exists(&self.lock_path()).await?;
                Ok(LockRemoval::Removed)
            }
            Ok(Some(_)) => Ok(LockRemoval::Mismatch),
            Ok(None) => Ok(LockRemoval::Absent),
            Err(e) => Err(e),
        }
    }

    /// Blocking variant of `remove_lock_matching` for use from `Drop`.
    pub fn remove_lock_matching_blocking(&self, lock_id: Uuid) -> io::Result<LockRemoval> {
        let _guard = FileGuard::acquire_blocking(&self.guard_path(), GUARD_WAIT, GUARD_STALE)?;
        let found = match std::fs::read(self.lock_path()) {
            Ok(bytes) => serde_json::from_slice::<LockRecord>(&bytes).ok(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(LockRemoval::Absent),
            Err(e) => return Err(e),
        };
        if !found.is_some_and(|found| found.lock_id == lock_id) {
            return Ok(LockRemoval::Mismatch);
        }

        match std::fs::remove_file(self.lock_path()) {
            Ok(()) => Ok(LockRemoval::Removed),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(LockRemoval::Absent),
            Err(e) => Err(e),
        }
    }
}

/// Agent ids become file names; keep them to a safe character set.
fn sanitize_id(agent_id: &str) -> String {
    agent_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn corrupt_or_io(path: PathBuf, e: io::Error) -> CoordinatorError {
    if e.kind() == io::ErrorKind::InvalidData {
        CoordinatorError::CorruptRecord {
            path,
            message: e.to_string(),
        }
    } else {
        CoordinatorError::Io(e)
    }
}
