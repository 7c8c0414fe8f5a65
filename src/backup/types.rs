use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::records::{Dataset, Record};

/// Snapshot category. Each kind lives in its own directory and may be
/// retained under a different policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    Full,
    Incremental,
    Safety,
}

impl SnapshotKind {
    pub const ALL: [SnapshotKind; 3] = [
        SnapshotKind::Full,
        SnapshotKind::Incremental,
        SnapshotKind::Safety,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotKind::Full => "full",
            SnapshotKind::Incremental => "incremental",
            SnapshotKind::Safety => "safety",
        }
    }

    /// Full and safety snapshots carry a complete dataset
    pub fn is_self_contained(&self) -> bool {
        !matches!(self, SnapshotKind::Incremental)
    }

    /// Fresh time-ordered id, `<kind>-<32 hex digits>`
    pub fn new_id(&self) -> String {
        format!("{}-{}", self.as_str(), Uuid::now_v7().simple())
    }

    /// Kind named by a well-formed snapshot id. Anything else, including ids
    /// that would escape the store directory, yields `None`.
    pub fn of_id(id: &str) -> Option<SnapshotKind> {
        let (prefix, suffix) = id.split_once('-')?;
        let kind = SnapshotKind::ALL.into_iter().find(|kind| kind.as_str() == prefix)?;
        let hex = suffix.len() == 32 && suffix.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        hex.then_some(kind)
    }
}

impl std::fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Caller-supplied context stored with a snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Error that triggered a failure snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl SnapshotMetadata {
    pub fn described(description: impl Into<String>) -> Self {
        Self {
            description: Some(description.into()),
            ..Self::default()
        }
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// Added, modified and deleted records of one collection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionChanges {
    #[serde(default)]
    pub added: Vec<Record>,
    /// New contents of records present before and after
    #[serde(default)]
    pub modified: Vec<Record>,
    /// Previous contents of records that disappeared
    #[serde(default)]
    pub deleted: Vec<Record>,
    /// Record ids in their current order, present only when replaying the
    /// other fields would not reproduce it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<Vec<String>>,
}

impl CollectionChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.modified.is_empty()
            && self.deleted.is_empty()
            && self.order.is_none()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len()
    }
}

/// Difference between two datasets, keyed by collection name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    #[serde(default)]
    pub collections: BTreeMap<String, CollectionChanges>,
    /// Collections that appeared since the previous dataset
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub created_collections: BTreeSet<String>,
    /// Collections that disappeared since the previous dataset
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub dropped_collections: BTreeSet<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
            && self.created_collections.is_empty()
            && self.dropped_collections.is_empty()
    }

    /// Total number of changed records
    pub fn change_count(&self) -> usize {
        self.collections.values().map(CollectionChanges::len).sum()
    }

    pub fn collection(&self, name: &str) -> Option<&CollectionChanges> {
        self.collections.get(name)
    }
}

/// Snapshot contents
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotPayload {
    Dataset(Dataset),
    Changes(ChangeSet),
}

impl SnapshotPayload {
    pub fn collection_count(&self) -> usize {
        match self {
            SnapshotPayload::Dataset(dataset) => dataset.collection_count(),
            SnapshotPayload::Changes(changes) => changes.collections.len(),
        }
    }

    pub fn record_count(&self) -> usize {
        match self {
            SnapshotPayload::Dataset(dataset) => dataset.record_count(),
            SnapshotPayload::Changes(changes) => changes.change_count(),
        }
    }
}

/// Sidecar metadata written next to every payload file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub id: String,
    pub kind: SnapshotKind,
    pub timestamp: DateTime<Utc>,
    /// Snapshot an incremental change-set applies to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_snapshot: Option<String>,
    /// Hex SHA-256 of the uncompressed payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default)]
    pub compressed: bool,
    /// Payload file name within the kind directory
    pub payload_file: String,
    /// Size of the payload file on disk
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub collection_count: usize,
    #[serde(default)]
    pub record_count: usize,
    #[serde(default)]
    pub metadata: SnapshotMetadata,
}

/// A fully loaded snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub manifest: SnapshotManifest,
    pub payload: SnapshotPayload,
}

impl Snapshot {
    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn kind(&self) -> SnapshotKind {
        self.manifest.kind
    }
}

/// Catalog summary used for discovery without loading payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: SnapshotKind,
    pub location: PathBuf,
    pub size_bytes: u64,
    pub collection_count: usize,
    pub record_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_snapshot: Option<String>,
}

impl CatalogEntry {
    pub fn from_manifest(manifest: &SnapshotManifest, location: PathBuf) -> Self {
        Self {
            id: manifest.id.clone(),
            timestamp: manifest.timestamp,
            kind: manifest.kind,
            location,
            size_bytes: manifest.size_bytes,
            collection_count: manifest.collection_count,
            record_count: manifest.record_count,
            base_snapshot: manifest.base_snapshot.clone(),
        }
    }
}

/// Result of a retention run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub cleaned: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_id_shape() {
        for kind in SnapshotKind::ALL {
            let id = kind.new_id();
            assert_eq!(SnapshotKind::of_id(&id), Some(kind));
        }
        assert_eq!(SnapshotKind::of_id("full-../../etc/passwd"), None);
        assert_eq!(SnapshotKind::of_id("backup-0123456789abcdef0123456789abcdef"), None);
        assert_eq!(SnapshotKind::of_id("safety-0123456789ABCDEF0123456789ABCDEF"), None);
        assert_eq!(
            SnapshotKind::of_id("safety-0123456789abcdef0123456789abcdef"),
            Some(SnapshotKind::Safety)
        );
    }
}
