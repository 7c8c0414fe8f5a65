//! Snapshot lifecycle: create, verify, enumerate, restore, retire

use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, Utc};

use crate::backup::diff::{apply_changes, compute_changes};
use crate::backup::error::BackupError;
use crate::backup::store::{NewSnapshot, SnapshotStore};
use crate::backup::types::{
    CatalogEntry, CleanupReport, Snapshot, SnapshotKind, SnapshotManifest, SnapshotMetadata,
    SnapshotPayload,
};
use crate::config::BackupConfig;
use crate::records::Dataset;
use crate::util::fs::write_json_atomic;

/// Longest incremental chain `restore` will follow
const MAX_CHAIN_DEPTH: usize = 1024;

pub struct BackupEngine {
    store: SnapshotStore,
    config: BackupConfig,
}

impl BackupEngine {
    pub fn new(root: impl Into<std::path::PathBuf>, config: BackupConfig) -> Self {
        Self {
            store: SnapshotStore::new(root, config.compress),
            config,
        }
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    /// Persist a complete copy of `dataset`.
    pub async fn create_full_backup(
        &self,
        dataset: &Dataset,
        metadata: SnapshotMetadata,
    ) -> Result<String, BackupError> {
        let payload = SnapshotPayload::Dataset(dataset.clone());
        self.create(SnapshotKind::Full, None, metadata, &payload)
            .await
    }

    /// Persist only what changed between `previous` and `current`, linked to
    /// `base_snapshot_id`. An unchanged dataset still yields a snapshot.
    pub async fn create_incremental_backup(
        &self,
        current: &Dataset,
        previous: &Dataset,
        base_snapshot_id: &str,
        metadata: SnapshotMetadata,
    ) -> Result<String, BackupError> {
        match self.store.find_manifest(base_snapshot_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                return Err(BackupError::CreationFailure(format!(
                    "base snapshot {} does not exist",
                    base_snapshot_id
                )));
            }
            Err(e) => {
                return Err(BackupError::CreationFailure(format!(
                    "base snapshot {} unreadable: {}",
                    base_snapshot_id, e
                )));
            }
        }

        let changes = compute_changes(current, previous);
        tracing::debug!(
            base = %base_snapshot_id,
            changes = changes.change_count(),
            "Computed incremental change-set"
        );
        let payload = SnapshotPayload::Changes(changes);
        self.create(
            SnapshotKind::Incremental,
            Some(base_snapshot_id.to_string()),
            metadata,
            &payload,
        )
        .await
    }

    /// Persist a full copy tagged for pre-operation protection.
    pub async fn create_safety_snapshot(
        &self,
        dataset: &Dataset,
        metadata: SnapshotMetadata,
    ) -> Result<String, BackupError> {
        let payload = SnapshotPayload::Dataset(dataset.clone());
        self.create(SnapshotKind::Safety, None, metadata, &payload)
            .await
    }

    async fn create(
        &self,
        kind: SnapshotKind,
        base_snapshot: Option<String>,
        metadata: SnapshotMetadata,
        payload: &SnapshotPayload,
    ) -> Result<String, BackupError> {
        let id = kind.new_id();
        let manifest = self
            .store
            .write(NewSnapshot {
                id: id.clone(),
                kind,
                timestamp: Utc::now(),
                base_snapshot,
                metadata,
                payload,
            })
            .await
            .map_err(|e| {
                tracing::error!(snapshot_id = %id, kind = %kind, error = %e, "Snapshot write failed");
                BackupError::CreationFailure(format!("{} snapshot {}: {}", kind, id, e))
            })?;

        tracing::info!(
            snapshot_id = %manifest.id,
            kind = %kind,
            records = manifest.record_count,
            bytes = manifest.size_bytes,
            "Snapshot created"
        );
        Ok(manifest.id)
    }

    /// True when the snapshot exists and its payload reads back intact.
    /// Never mutates state.
    pub async fn verify_backup(&self, id: &str) -> bool {
        match self.store.load(id).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(snapshot_id = %id, error = %e, "Snapshot verification failed");
                false
            }
        }
    }

    /// All snapshots, newest first.
    pub async fn get_backup_catalog(&self) -> Result<Vec<CatalogEntry>, BackupError> {
        match self.store.read_catalog().await {
            Ok(Some(entries)) => Ok(entries),
            Ok(None) => self.store.rebuild_catalog().await,
            Err(e) => {
                tracing::warn!(error = %e, "Catalog unreadable, rebuilding");
                self.store.rebuild_catalog().await
            }
        }
    }

    pub async fn rebuild_catalog(&self) -> Result<Vec<CatalogEntry>, BackupError> {
        self.store.rebuild_catalog().await
    }

    /// Most recent snapshot of `kind`
    pub async fn latest(&self, kind: SnapshotKind) -> Result<Option<CatalogEntry>, BackupError> {
        Ok(self
            .get_backup_catalog()
            .await?
            .into_iter()
            .find(|entry| entry.kind == kind))
    }

    pub async fn load_snapshot(&self, id: &str) -> Result<Snapshot, BackupError> {
        self.store.load(id).await
    }

    /// Materialize the dataset a snapshot represents. Incremental snapshots
    /// are resolved through their base chain. When `target` is given the
    /// dataset is also written there as JSON.
    pub async fn restore(&self, id: &str, target: Option<&Path>) -> Result<Dataset, BackupError> {
        let dataset = self.materialize(id).await?;

        if let Some(target) = target {
            write_json_atomic(target, &dataset).await?;
            tracing::info!(snapshot_id = %id, target = %target.display(), "Restored snapshot to file");
        }
        Ok(dataset)
    }

    async fn materialize(&self, id: &str) -> Result<Dataset, BackupError> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut next = id.to_string();

        let base = loop {
            if !seen.insert(next.clone()) {
                return Err(BackupError::BrokenChain {
                    id: id.to_string(),
                    reason: format!("cycle at {}", next),
                });
            }
            if chain.len() >= MAX_CHAIN_DEPTH {
                return Err(BackupError::BrokenChain {
                    id: id.to_string(),
                    reason: "chain too long".to_string(),
                });
            }

            let snapshot = match self.store.load(&next).await {
                Ok(snapshot) => snapshot,
                Err(BackupError::NotFound(missing)) if missing != id => {
                    return Err(BackupError::BrokenChain {
                        id: id.to_string(),
                        reason: format!("base snapshot {} is missing", missing),
                    });
                }
                Err(BackupError::InvalidId(bad)) if bad != id => {
                    return Err(BackupError::BrokenChain {
                        id: id.to_string(),
                        reason: format!("base snapshot id {} is malformed", bad),
                    });
                }
                Err(e) => return Err(e),
            };

            match snapshot.payload {
                SnapshotPayload::Dataset(dataset) => break dataset,
                SnapshotPayload::Changes(changes) => {
                    let base = snapshot.manifest.base_snapshot.clone().ok_or_else(|| {
                        BackupError::BrokenChain {
                            id: id.to_string(),
                            reason: format!("{} has no base snapshot", snapshot.manifest.id),
                        }
                    })?;
                    chain.push(changes);
                    next = base;
                }
            }
        };

        let mut dataset = base;
        for changes in chain.iter().rev() {
            apply_changes(&mut dataset, changes);
        }
        Ok(dataset)
    }

    /// Delete one snapshot and its catalog entry
    pub async fn delete_backup(&self, id: &str) -> Result<bool, BackupError> {
        let Some(manifest) = self.store.find_manifest(id).await? else {
            return Ok(false);
        };
        self.store.delete_files(&manifest).await?;
        self.store
            .catalog_remove(&HashSet::from([id.to_string()]))
            .await?;
        tracing::info!(snapshot_id = %id, "Snapshot deleted");
        Ok(true)
    }

    /// Remove snapshots older than `retention_days`; zero removes everything.
    pub async fn cleanup_old_backups(&self, retention_days: u32) -> Result<CleanupReport, BackupError> {
        let cutoff = cutoff(retention_days);
        self.cleanup_where(|manifest| is_expired(manifest, cutoff))
            .await
    }

    /// Retention with separate windows for safety snapshots
    pub async fn apply_retention_policy(&self) -> Result<CleanupReport, BackupError> {
        let regular = cutoff(self.config.retention_days);
        let safety = cutoff(self.config.safety_retention_days);
        self.cleanup_where(|manifest| match manifest.kind {
            SnapshotKind::Safety => is_expired(manifest, safety),
            _ => is_expired(manifest, regular),
        })
        .await
    }

    async fn cleanup_where<F>(&self, expired: F) -> Result<CleanupReport, BackupError>
    where
        F: Fn(&SnapshotManifest) -> bool,
    {
        let manifests = self.store.list_manifests().await?;
        let mut doomed: HashSet<String> = manifests
            .iter()
            .filter(|m| expired(m))
            .map(|m| m.id.clone())
            .collect();

        // Incrementals cannot be restored without their base
        loop {
            let orphans: Vec<String> = manifests
                .iter()
                .filter(|m| !doomed.contains(&m.id))
                .filter(|m| m.base_snapshot.as_ref().is_some_and(|b| doomed.contains(b)))
                .map(|m| m.id.clone())
                .collect();
            if orphans.is_empty() {
                break;
            }
            doomed.extend(orphans);
        }

        let mut cleaned = Vec::new();
        for manifest in manifests.iter().filter(|m| doomed.contains(&m.id)) {
            match self.store.delete_files(manifest).await {
                Ok(()) => cleaned.push(manifest.id.clone()),
                Err(e) => {
                    tracing::warn!(snapshot_id = %manifest.id, error = %e, "Failed to remove snapshot");
                }
            }
        }

        let removed: HashSet<String> = cleaned.iter().cloned().collect();
        if removed.is_empty() {
            // Drop stale catalog entries whose files are already gone
            let on_disk: HashSet<String> = manifests.iter().map(|m| m.id.clone()).collect();
            let stale: HashSet<String> = self
                .get_backup_catalog()
                .await?
                .into_iter()
                .filter(|entry| !on_disk.contains(&entry.id))
                .map(|entry| entry.id)
                .collect();
            if !stale.is_empty() {
                self.store.catalog_remove(&stale).await?;
            }
        } else {
            self.store.catalog_remove(&removed).await?;
        }

        if !cleaned.is_empty() {
            tracing::info!(count = cleaned.len(), "Old snapshots cleaned up");
        }
        Ok(CleanupReport { cleaned })
    }
}

/// Time-ordered unique id, prefixed with the kind
/// None means "everything is expired"
fn cutoff(retention_days: u32) -> Option<DateTime<Utc>> {
    if retention_days == 0 {
        None
    } else {
        Some(Utc::now() - chrono::Duration::days(i64::from(retention_days)))
    }
}

fn is_expired(manifest: &SnapshotManifest, cutoff: Option<DateTime<Utc>>) -> bool {
    match cutoff {
        None => true,
        Some(cutoff) => manifest.timestamp < cutoff,
    }
}
