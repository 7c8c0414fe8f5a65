//! On-disk snapshot store
//!
//! Layout under the store root:
//!
//! ```text
//! full/<id>.json[.zst]          payload
//! full/<id>.meta.json           manifest
//! incremental/...
//! safety/...
//! catalog.json                  newest-first index of every snapshot
//! catalog.json.lock             held while any process rewrites the catalog
//! ```

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::backup::error::BackupError;
use crate::backup::types::{
    CatalogEntry, Snapshot, SnapshotKind, SnapshotManifest, SnapshotMetadata, SnapshotPayload,
};
use crate::util::fs::{read_json_opt, remove_if_exists, write_atomic, write_json_atomic, FileGuard};

const CATALOG_FILE: &str = "catalog.json";
const CATALOG_LOCK_FILE: &str = "catalog.json.lock";
const CATALOG_LOCK_WAIT: Duration = Duration::from_secs(10);
const CATALOG_LOCK_STALE: Duration = Duration::from_secs(60);
const MANIFEST_SUFFIX: &str = ".meta.json";
const ZSTD_LEVEL: i32 = 3;

/// Everything needed to persist one snapshot
pub struct NewSnapshot<'a> {
    pub id: String,
    pub kind: SnapshotKind,
    pub timestamp: DateTime<Utc>,
    pub base_snapshot: Option<String>,
    pub metadata: SnapshotMetadata,
    pub payload: &'a SnapshotPayload,
}

pub struct SnapshotStore {
    root: PathBuf,
    compress: bool,
    /// Keeps tasks of this process from polling the catalog lock file
    catalog_guard: tokio::sync::Mutex<()>,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>, compress: bool) -> Self {
        Self {
            root: root.into(),
            compress,
            catalog_guard: tokio::sync::Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn kind_dir(&self, kind: SnapshotKind) -> PathBuf {
        self.root.join(kind.as_str())
    }

    fn manifest_path(&self, kind: SnapshotKind, id: &str) -> PathBuf {
        self.kind_dir(kind).join(format!("{}{}", id, MANIFEST_SUFFIX))
    }

    pub fn payload_path(&self, manifest: &SnapshotManifest) -> PathBuf {
        self.kind_dir(manifest.kind).join(&manifest.payload_file)
    }

    fn catalog_path(&self) -> PathBuf {
        self.root.join(CATALOG_FILE)
    }

    /// Exclusive access to the catalog across every process sharing the root
    async fn lock_catalog(&self) -> Result<(FileGuard, tokio::sync::MutexGuard<'_, ()>), BackupError> {
        let local = self.catalog_guard.lock().await;
        let shared = FileGuard::acquire(
            &self.root.join(CATALOG_LOCK_FILE),
            CATALOG_LOCK_WAIT,
            CATALOG_LOCK_STALE,
        )
        .await?;
        Ok((shared, local))
    }

    /// Persist payload, manifest and catalog entry. The payload is written
    /// before the manifest so a visible manifest always has its payload.
    pub async fn write(&self, snapshot: NewSnapshot<'_>) -> Result<SnapshotManifest, BackupError> {
        let raw = match snapshot.payload {
            SnapshotPayload::Dataset(dataset) => serde_json::to_vec(dataset)?,
            SnapshotPayload::Changes(changes) => serde_json::to_vec(changes)?,
        };
        let compress = self.compress;
        let (stored, checksum) =
            tokio::task::spawn_blocking(move || encode_payload(raw, compress)).await??;

        let payload_file = if compress {
            format!("{}.json.zst", snapshot.id)
        } else {
            format!("{}.json", snapshot.id)
        };

        let manifest = SnapshotManifest {
            id: snapshot.id,
            kind: snapshot.kind,
            timestamp: snapshot.timestamp,
            base_snapshot: snapshot.base_snapshot,
            checksum: Some(checksum),
            compressed: compress,
            payload_file,
            size_bytes: stored.len() as u64,
            collection_count: snapshot.payload.collection_count(),
            record_count: snapshot.payload.record_count(),
            metadata: snapshot.metadata,
        };

        let payload_path = self.payload_path(&manifest);
        write_atomic(&payload_path, &stored).await?;
        write_json_atomic(&self.manifest_path(manifest.kind, &manifest.id), &manifest).await?;
        self.catalog_insert(CatalogEntry::from_manifest(&manifest, payload_path))
            .await?;

        Ok(manifest)
    }

    /// Locate the manifest for `id` in the directory its kind prefix names.
    /// Ids that are not of the form `<kind>-<32 hex digits>` are rejected.
    pub async fn find_manifest(&self, id: &str) -> Result<Option<SnapshotManifest>, BackupError> {
        let kind = SnapshotKind::of_id(id).ok_or_else(|| BackupError::InvalidId(id.to_string()))?;
        match read_json_opt::<SnapshotManifest>(&self.manifest_path(kind, id)).await {
            Ok(Some(manifest)) if is_well_formed(&manifest, kind) && manifest.id == id => Ok(Some(manifest)),
            Ok(Some(_)) => Err(BackupError::IntegrityFailure {
                id: id.to_string(),
                reason: "manifest does not describe this snapshot".to_string(),
            }),
            Ok(None) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => Err(BackupError::IntegrityFailure {
                id: id.to_string(),
                reason: format!("unreadable manifest: {}", e),
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn load(&self, id: &str) -> Result<Snapshot, BackupError> {
        let manifest = self
            .find_manifest(id)
            .await?
            .ok_or_else(|| BackupError::NotFound(id.to_string()))?;
        self.read_snapshot(manifest).await
    }

    /// Read back and validate a payload: decompression, checksum and shape.
    pub async fn read_snapshot(&self, manifest: SnapshotManifest) -> Result<Snapshot, BackupError> {
        let integrity = |reason: String| BackupError::IntegrityFailure {
            id: manifest.id.clone(),
            reason,
        };

        let stored = match tokio::fs::read(self.payload_path(&manifest)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(integrity("payload file missing".to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let compressed = manifest.compressed;
        let raw = tokio::task::spawn_blocking(move || decode_payload(stored, compressed))
            .await?
            .map_err(|e| integrity(format!("payload could not be decompressed: {}", e)))?;

        if let Some(expected) = &manifest.checksum {
            let actual = sha256_hex(&raw);
            if &actual != expected {
                return Err(integrity(format!(
                    "checksum mismatch (expected {}, found {})",
                    expected, actual
                )));
            }
        }

        let payload = if manifest.kind.is_self_contained() {
            serde_json::from_slice(&raw).map(SnapshotPayload::Dataset)
        } else {
            serde_json::from_slice(&raw).map(SnapshotPayload::Changes)
        }
        .map_err(|e| integrity(format!("payload is not a valid {} snapshot: {}", manifest.kind, e)))?;

        Ok(Snapshot { manifest, payload })
    }

    /// Remove payload and manifest. Catalog entries are handled separately.
    pub async fn delete_files(&self, manifest: &SnapshotManifest) -> Result<(), BackupError> {
        remove_if_exists(&self.payload_path(manifest)).await?;
        remove_if_exists(&self.manifest_path(manifest.kind, &manifest.id)).await?;
        Ok(())
    }

    /// Every manifest on disk, newest first. Unreadable manifests are skipped.
    pub async fn list_manifests(&self) -> Result<Vec<SnapshotManifest>, BackupError> {
        let mut manifests = Vec::new();
        for kind in SnapshotKind::ALL {
            let mut entries = match tokio::fs::read_dir(self.kind_dir(kind)).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let is_manifest = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(MANIFEST_SUFFIX) && !n.starts_with('.'));
                if !is_manifest {
                    continue;
                }
                match read_json_opt::<SnapshotManifest>(&path).await {
                    Ok(Some(manifest)) if is_well_formed(&manifest, kind) => manifests.push(manifest),
                    Ok(Some(manifest)) => {
                        tracing::warn!(path = %path.display(), snapshot_id = %manifest.id, "Skipping malformed manifest");
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable manifest");
                    }
                }
            }
        }
        manifests.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));
        Ok(manifests)
    }

    pub async fn read_catalog(&self) -> Result<Option<Vec<CatalogEntry>>, BackupError> {
        read_json_opt(&self.catalog_path()).await.map_err(|e| {
            if e.kind() == io::ErrorKind::InvalidData {
                BackupError::IntegrityFailure {
                    id: CATALOG_FILE.to_string(),
                    reason: e.to_string(),
                }
            } else {
                BackupError::Io(e)
            }
        })
    }

    async fn write_catalog(&self, mut entries: Vec<CatalogEntry>) -> Result<Vec<CatalogEntry>, BackupError> {
        sort_catalog(&mut entries);
        write_json_atomic(&self.catalog_path(), &entries).await?;
        Ok(entries)
    }

    /// Catalog contents for a read-modify-write; a missing or unreadable
    /// index is regenerated from the manifests.
    async fn current_entries(&self) -> Result<Vec<CatalogEntry>, BackupError> {
        match self.read_catalog().await {
            Ok(Some(entries)) => return Ok(entries),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Catalog unreadable, rebuilding from manifests");
            }
        }
        Ok(self
            .list_manifests()
            .await?
            .iter()
            .map(|manifest| CatalogEntry::from_manifest(manifest, self.payload_path(manifest)))
            .collect())
    }

    async fn catalog_insert(&self, entry: CatalogEntry) -> Result<(), BackupError> {
        let _guard = self.lock_catalog().await?;
        let mut entries = self.current_entries().await?;
        entries.retain(|e| e.id != entry.id);
        entries.push(entry);
        self.write_catalog(entries).await?;
        Ok(())
    }

    pub async fn catalog_remove(&self, ids: &HashSet<String>) -> Result<(), BackupError> {
        let _guard = self.lock_catalog().await?;
        let mut entries = self.current_entries().await?;
        entries.retain(|e| !ids.contains(&e.id));
        self.write_catalog(entries).await?;
        Ok(())
    }

    /// Regenerate the catalog from the manifests on disk
    pub async fn rebuild_catalog(&self) -> Result<Vec<CatalogEntry>, BackupError> {
        let _guard = self.lock_catalog().await?;
        let entries = self
            .list_manifests()
            .await?
            .iter()
            .map(|manifest| CatalogEntry::from_manifest(manifest, self.payload_path(manifest)))
            .collect();
        self.write_catalog(entries).await
    }
}

/// The manifest's id and payload file stay inside its kind directory
fn is_well_formed(manifest: &SnapshotManifest, kind: SnapshotKind) -> bool {
    manifest.kind == kind
        && SnapshotKind::of_id(&manifest.id) == Some(kind)
        && (manifest.payload_file == format!("{}.json", manifest.id)
            || manifest.payload_file == format!("{}.json.zst", manifest.id))
}

fn sort_catalog(entries: &mut [CatalogEntry]) {
    entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));
}

fn encode_payload(raw: Vec<u8>, compress: bool) -> io::Result<(Vec<u8>, String)> {
    let checksum = sha256_hex(&raw);
    let stored = if compress {
        zstd::encode_all(raw.as_slice(), ZSTD_LEVEL)?
    } else {
        raw
    };
    Ok((stored, checksum))
}

fn decode_payload(stored: Vec<u8>, compressed: bool) -> io::Result<Vec<u8>> {
    if compressed {
        zstd::decode_all(stored.as_slice())
    } else {
        Ok(stored)
    }
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{Dataset, Record};
    use tempfile::TempDir;

    fn new_snapshot<'a>(id: &str, payload: &'a SnapshotPayload) -> NewSnapshot<'a> {
        NewSnapshot {
            id: id.to_string(),
            kind: SnapshotKind::Full,
            timestamp: Utc::now(),
            base_snapshot: None,
            metadata: SnapshotMetadata::described("test"),
            payload,
        }
    }

    fn payload() -> SnapshotPayload {
        SnapshotPayload::Dataset(
            Dataset::new().with_collection("T", vec![Record::new("1").with_field("n", "A")]),
        )
    }

    #[tokio::test]
    async fn test_write_and_load_compressed() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path(), true);
        let payload = payload();

        let id = SnapshotKind::Full.new_id();

        let manifest = store.write(new_snapshot(&id, &payload)).await.unwrap();
        assert!(manifest.compressed);
        assert!(manifest.payload_file.ends_with(".json.zst"));

        let snapshot = store.load(&id).await.unwrap();
        assert_eq!(snapshot.payload, payload);
    }

    #[tokio::test]
    async fn test_tampered_payload_fails_checksum() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path(), false);
        let payload = payload();
        let id = SnapshotKind::Full.new_id();
        let manifest = store.write(new_snapshot(&id, &payload)).await.unwrap();

        let tampered = br#"{"T":[{"id":"1","fields":{"n":"B"}}]}"#;
        std::fs::write(store.payload_path(&manifest), tampered).unwrap();

        let err = store.load(&id).await.unwrap_err();
        assert!(matches!(err, BackupError::IntegrityFailure { reason, .. } if reason.contains("checksum")));
    }

    #[tokio::test]
    async fn test_rebuild_catalog_from_manifests() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path(), false);
        let payload = payload();
        store.write(new_snapshot(&SnapshotKind::Full.new_id(), &payload)).await.unwrap();
        store.write(new_snapshot(&SnapshotKind::Full.new_id(), &payload)).await.unwrap();

        std::fs::remove_file(dir.path().join(CATALOG_FILE)).unwrap();
        assert!(store.read_catalog().await.unwrap().is_none());

        let rebuilt = store.rebuild_catalog().await.unwrap();
        assert_eq!(rebuilt.len(), 2);
        assert!(rebuilt[0].timestamp >= rebuilt[1].timestamp);
    }

    #[tokio::test]
    async fn test_ids_outside_the_store_are_rejected() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path().join("backups"), false);
        std::fs::write(dir.path().join("secret.meta.json"), b"{}").unwrap();

        for id in ["../secret", "full-../../secret", "full-1", "FULL-0123456789abcdef0123456789abcdef"] {
            let err = store.find_manifest(id).await.unwrap_err();
            assert!(matches!(err, BackupError::InvalidId(_)), "{id} should be rejected");
        }
    }

    #[tokio::test]
    async fn test_manifest_pointing_outside_kind_dir_is_skipped() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path(), false);
        let payload = payload();
        let id = SnapshotKind::Full.new_id();
        let mut manifest = store.write(new_snapshot(&id, &payload)).await.unwrap();

        manifest.payload_file = "../../elsewhere.json".to_string();
        write_json_atomic(&store.manifest_path(SnapshotKind::Full, &id), &manifest)
            .await
            .unwrap();

        assert!(store.list_manifests().await.unwrap().is_empty());
        assert!(matches!(
            store.find_manifest(&id).await,
            Err(BackupError::IntegrityFailure { .. })
        ));
    }
}
