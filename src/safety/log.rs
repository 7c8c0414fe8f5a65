//! Bounded, durable operation log

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::safety::context::OperationStatus;
use crate::util::fs::{read_json_opt, write_json_atomic};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationLogEntry {
    pub id: Uuid,
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub status: OperationStatus,
    pub duration_ms: u64,
    #[serde(default)]
    pub destructive: bool,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub backup_created: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OperationLogEntry {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// JSON file holding the most recent entries, oldest first.
pub struct OperationLog {
    path: PathBuf,
    max_entries: usize,
    guard: tokio::sync::Mutex<()>,
}

impl OperationLog {
    pub fn new(path: impl Into<PathBuf>, max_entries: usize) -> Self {
        Self {
            path: path.into(),
            max_entries: max_entries.max(1),
            guard: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, entry: OperationLogEntry) -> std::io::Result<()> {
        let _guard = self.guard.lock().await;
        let mut entries = self.read_or_reset().await;
        entries.push(entry);
        if entries.len() > self.max_entries {
            let excess = entries.len() - self.max_entries;
            entries.drain(..excess);
        }
        write_json_atomic(&self.path, &entries).await
    }

    /// Up to `limit` entries, newest first
    pub async fn recent(&self, limit: usize) -> Vec<OperationLogEntry> {
        let _guard = self.guard.lock().await;
        self.read_or_reset()
            .await
            .into_iter()
            .rev()
            .take(limit)
            .collect()
    }

    async fn read_or_reset(&self) -> Vec<OperationLogEntry> {
        match read_json_opt::<Vec<OperationLogEntry>>(&self.path).await {
            Ok(entries) => entries.unwrap_or_default(),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Operation log unreadable, starting fresh");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(name: &str, status: OperationStatus) -> OperationLogEntry {
        OperationLogEntry {
            id: Uuid::new_v4(),
            name: name.to_string(),
            timestamp: Utc::now(),
            status,
            duration_ms: 5,
            destructive: false,
            dry_run: false,
            backup_created: false,
            backup_id: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn test_log_is_bounded_and_newest_first() {
        let dir = TempDir::new().unwrap();
        let log = OperationLog::new(dir.path().join("operations.json"), 3);

        for i in 0..5 {
            log.append(entry(&format!("op-{}", i), OperationStatus::Succeeded))
                .await
                .unwrap();
        }

        let recent = log.recent(10).await;
        let names: Vec<_> = recent.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["op-4", "op-3", "op-2"]);
    }

    #[tokio::test]
    async fn test_corrupt_log_is_replaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("operations.json");
        std::fs::write(&path, "not json").unwrap();

        let log = OperationLog::new(&path, 10);
        assert!(log.recent(10).await.is_empty());

        log.append(entry("op", OperationStatus::Failed)).await.unwrap();
        assert_eq!(log.recent(10).await[0].status, OperationStatus::Failed);
    }
}
