//! Snapshot lifecycle
//!
//! Full, incremental and safety snapshots are persisted by `SnapshotStore`
//! and orchestrated by `BackupEngine`.

mod diff;
mod engine;
mod error;
mod store;
mod types;

pub use diff::{apply_changes, compute_changes};
pub use engine::BackupEngine;
pub use error::BackupError;
pub use store::{NewSnapshot, SnapshotStore};
pub use types::{
    CatalogEntry, ChangeSet, CleanupReport, CollectionChanges, Snapshot, SnapshotKind,
    SnapshotManifest, SnapshotMetadata, SnapshotPayload,
};
