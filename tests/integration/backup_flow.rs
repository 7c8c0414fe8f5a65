//! Integration tests for the snapshot lifecycle
//!
//! Captures data through the record-store contract, then creates, verifies,
//! restores and retires snapshots on disk.

use recordsafe::backup::{SnapshotKind, SnapshotPayload};
use recordsafe::config::BackupConfig;
use recordsafe::records::capture_dataset;
use recordsafe::{BackupEngine, BackupError, Dataset, SnapshotMetadata};

use super::common::fixtures::{record, sample_dataset, TestEnv, CONTACTS, DEALS};

fn collections() -> Vec<String> {
    vec![CONTACTS.to_string(), DEALS.to_string()]
}

#[tokio::test]
async fn test_captured_dataset_round_trips_through_full_backup() {
    let env = TestEnv::new();
    let engine = env.backup_engine();

    let captured = capture_dataset(&env.store, &collections()).await.unwrap();
    assert_eq!(captured, sample_dataset());

    let id = engine
        .create_full_backup(&captured, SnapshotMetadata::described("nightly"))
        .await
        .unwrap();

    assert!(engine.verify_backup(&id).await);
    assert_eq!(engine.restore(&id, None).await.unwrap(), captured);
}

#[tokio::test]
async fn test_compressed_snapshots_round_trip() {
    let env = TestEnv::new();
    let engine = BackupEngine::new(
        env.backups_dir(),
        BackupConfig {
            compress: true,
            ..BackupConfig::default()
        },
    );

    let id = engine
        .create_safety_snapshot(&sample_dataset(), SnapshotMetadata::default())
        .await
        .unwrap();

    let snapshot = engine.load_snapshot(&id).await.unwrap();
    assert!(snapshot.manifest.compressed);
    assert!(snapshot.manifest.checksum.is_some());
    assert_eq!(snapshot.payload, SnapshotPayload::Dataset(sample_dataset()));
}

#[tokio::test]
async fn test_every_created_snapshot_verifies() {
    let env = TestEnv::new();
    let engine = env.backup_engine();
    let before = sample_dataset();
    let mut after = before.clone();
    after.insert_collection(CONTACTS, vec![record("rec2", "Grace Hopper"), record("rec3", "Linus")]);

    let full = engine
        .create_full_backup(&before, SnapshotMetadata::default())
        .await
        .unwrap();
    let inc = engine
        .create_incremental_backup(&after, &before, &full, SnapshotMetadata::default())
        .await
        .unwrap();
    let safety = engine
        .create_safety_snapshot(&after, SnapshotMetadata::described("pre-op"))
        .await
        .unwrap();

    for id in [&full, &inc, &safety] {
        assert!(engine.verify_backup(id).await, "{id} should verify");
    }
    assert_eq!(engine.restore(&inc, None).await.unwrap(), after);
}

#[tokio::test]
async fn test_incremental_change_set_by_collection() {
    let env = TestEnv::new();
    let engine = env.backup_engine();
    let d1 = Dataset::new().with_collection("T", vec![record("1", "A")]);
    let d2 = Dataset::new().with_collection("T", vec![record("1", "A2"), record("2", "B")]);

    let base = engine
        .create_full_backup(&d1, SnapshotMetadata::default())
        .await
        .unwrap();
    let inc = engine
        .create_incremental_backup(&d2, &d1, &base, SnapshotMetadata::default())
        .await
        .unwrap();

    let snapshot = engine.load_snapshot(&inc).await.unwrap();
    assert_eq!(snapshot.kind(), SnapshotKind::Incremental);
    let SnapshotPayload::Changes(changes) = snapshot.payload else {
        panic!("incremental snapshot should carry a change-set");
    };
    let t = changes.collection("T").unwrap();
    assert_eq!(t.added, vec![record("2", "B")]);
    assert_eq!(t.modified, vec![record("1", "A2")]);
    assert!(t.deleted.is_empty());
}

#[tokio::test]
async fn test_corrupted_payload_fails_verification_and_restore() {
    let env = TestEnv::new();
    let engine = env.backup_engine();
    let id = engine
        .create_full_backup(&sample_dataset(), SnapshotMetadata::default())
        .await
        .unwrap();

    let manifest = engine.store().find_manifest(&id).await.unwrap().unwrap();
    std::fs::write(engine.store().payload_path(&manifest), b"{\"truncated\":").unwrap();

    assert!(!engine.verify_backup(&id).await);
    let err = engine.restore(&id, None).await.unwrap_err();
    assert!(matches!(err, BackupError::IntegrityFailure { .. }));
}

#[tokio::test]
async fn test_catalog_survives_loss_of_index() {
    let env = TestEnv::new();
    let engine = env.backup_engine();
    engine
        .create_full_backup(&sample_dataset(), SnapshotMetadata::default())
        .await
        .unwrap();
    engine
        .create_safety_snapshot(&sample_dataset(), SnapshotMetadata::default())
        .await
        .unwrap();

    std::fs::write(env.backups_dir().join("catalog.json"), b"garbage").unwrap();

    let catalog = engine.get_backup_catalog().await.unwrap();
    assert_eq!(catalog.len(), 2);
    assert!(catalog[0].timestamp >= catalog[1].timestamp);
}

#[tokio::test]
async fn test_purge_cascades_and_empties_catalog() {
    let env = TestEnv::new();
    let engine = env.backup_engine();
    let data = sample_dataset();
    let full = engine
        .create_full_backup(&data, SnapshotMetadata::default())
        .await
        .unwrap();
    engine
        .create_incremental_backup(&data, &data, &full, SnapshotMetadata::default())
        .await
        .unwrap();

    let report = engine.cleanup_old_backups(0).await.unwrap();
    assert_eq!(report.cleaned.len(), 2);
    assert!(engine.get_backup_catalog().await.unwrap().is_empty());
    assert!(engine.store().list_manifests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_retention_policy_keeps_fresh_snapshots() {
    let env = TestEnv::new();
    let engine = env.backup_engine();
    engine
        .create_safety_snapshot(&sample_dataset(), SnapshotMetadata::default())
        .await
        .unwrap();

    let report = engine.apply_retention_policy().await.unwrap();
    assert!(report.cleaned.is_empty());
    assert_eq!(engine.get_backup_catalog().await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_agents_sharing_snapshot_area_keep_every_catalog_entry() {
    let env = TestEnv::new();
    let engines = [
        std::sync::Arc::new(env.backup_engine()),
        std::sync::Arc::new(env.backup_engine()),
    ];

    let writers: Vec<_> = engines
        .iter()
        .cloned()
        .map(|engine| {
            tokio::spawn(async move {
                let mut ids = Vec::new();
                for i in 0..10 {
                    let id = engine
                        .create_full_backup(&sample_dataset(), SnapshotMetadata::described(format!("run {i}")))
                        .await
                        .unwrap();
                    ids.push(id);
                }
                ids
            })
        })
        .collect();

    let mut created: Vec<String> = Vec::new();
    for writer in writers {
        created.extend(writer.await.unwrap());
    }
    assert_eq!(created.len(), 20);

    let catalog = engines[0].get_backup_catalog().await.unwrap();
    let mut catalogued: Vec<String> = catalog.into_iter().map(|entry| entry.id).collect();
    catalogued.sort();
    created.sort();
    assert_eq!(catalogued, created);
    assert!(!env.backups_dir().join("catalog.json.lock").exists());
}

#[tokio::test]
async fn test_incremental_restore_reproduces_record_order() {
    let env = TestEnv::new();
    let engine = env.backup_engine();
    let d1 = Dataset::new().with_collection(CONTACTS, vec![record("1", "A"), record("3", "C")]);
    let d2 = Dataset::new().with_collection(
        CONTACTS,
        vec![record("1", "A"), record("2", "B"), record("3", "C")],
    );
    let d3 = Dataset::new().with_collection(
        CONTACTS,
        vec![record("3", "C2"), record("2", "B"), record("1", "A")],
    );

    let base = engine
        .create_full_backup(&d1, SnapshotMetadata::default())
        .await
        .unwrap();
    let inc1 = engine
        .create_incremental_backup(&d2, &d1, &base, SnapshotMetadata::default())
        .await
        .unwrap();
    let inc2 = engine
        .create_incremental_backup(&d3, &d2, &inc1, SnapshotMetadata::default())
        .await
        .unwrap();

    assert_eq!(engine.restore(&inc1, None).await.unwrap(), d2);
    assert_eq!(engine.restore(&inc2, None).await.unwrap(), d3);
}

#[tokio::test]
async fn test_path_like_ids_are_rejected() {
    let env = TestEnv::new();
    let engine = env.backup_engine();

    assert!(!engine.verify_backup("../../etc/passwd").await);
    assert!(matches!(
        engine.restore("full-../../catalog", None).await,
        Err(BackupError::InvalidId(_))
    ));
    assert!(matches!(
        engine.delete_backup("safety-/tmp/x").await,
        Err(BackupError::InvalidId(_))
    ));
}
