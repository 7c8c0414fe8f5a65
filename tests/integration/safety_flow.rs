//! Integration tests for the safety protocol
//!
//! Operations run through `SafetyManager` against the mock record store,
//! with sibling agents sharing the same status area.

use std::time::Duration;

use recordsafe::coordinator::AgentMetadata;
use recordsafe::{AgentState, OperationOptions, OperationStatus, SafetyError};

use super::common::fixtures::{record, sample_dataset, TestEnv, CONTACTS};

#[tokio::test]
async fn test_failed_destructive_operation_full_protocol() {
    let env = TestEnv::new();
    let manager = env.manager("agent-a", env.safety_config()).await;
    let store = env.store.clone();

    let err = manager
        .execute_with_safety(
            "merge_duplicates",
            OperationOptions::destructive().confirmed(),
            |_ctx| async move {
                store.upsert(CONTACTS, record("rec1", "Ada (merged)"));
                Err::<(), _>(anyhow::anyhow!("record store rejected batch"))
            },
        )
        .await
        .unwrap_err();

    // The original error comes back untouched
    assert_eq!(
        err.operation_error().unwrap().to_string(),
        "record store rejected batch"
    );

    let entry = &manager.get_operation_history(1).await[0];
    assert_eq!(entry.name, "merge_duplicates");
    assert_eq!(entry.status, OperationStatus::FailedAndRolledBack);
    assert!(entry.backup_created);
    assert!(entry.error.as_deref().unwrap().contains("rejected batch"));

    let pre_backup = entry.backup_id.clone().unwrap();
    assert!(manager.backups().verify_backup(&pre_backup).await);
    assert_eq!(
        manager.backups().restore(&pre_backup, None).await.unwrap(),
        sample_dataset()
    );

    let rollbacks: Vec<_> = std::fs::read_dir(env.root().join("rollbacks"))
        .unwrap()
        .collect();
    assert_eq!(rollbacks.len(), 1);
}

#[tokio::test]
async fn test_sibling_conflict_blocks_destructive_only() {
    let env = TestEnv::new();
    let manager = env.manager("agent-a", env.safety_config()).await;
    let sibling = env.coordinator("agent-b");
    sibling.initialize().await.unwrap();
    sibling
        .update_status(
            AgentState::Working,
            "bulk import",
            AgentMetadata::for_operation("import", true),
        )
        .await;

    let err = manager
        .execute_with_safety(
            "cleanup",
            OperationOptions::destructive().confirmed(),
            |_ctx| async { Ok(()) },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SafetyError::CompatibilityConflict { .. }));
    assert!(manager.backups().get_backup_catalog().await.unwrap().is_empty());

    let report = manager
        .execute_with_safety("audit", OperationOptions::read_only(), |_ctx| async {
            Ok(3usize)
        })
        .await
        .unwrap();
    assert_eq!(report.result, 3);
    assert!(report.warnings.iter().any(|w| w.contains("agent-b")));
}

#[tokio::test]
async fn test_conflicts_are_advisory_without_require_compatibility() {
    let env = TestEnv::new();
    let mut config = env.safety_config();
    config.require_compatibility = false;
    let manager = env.manager("agent-a", config).await;
    let sibling = env.coordinator("agent-b");
    sibling.initialize().await.unwrap();
    sibling
        .update_status(
            AgentState::Working,
            "bulk import",
            AgentMetadata::for_operation("import", true),
        )
        .await;

    let report = manager
        .execute_with_safety(
            "cleanup",
            OperationOptions::destructive().confirmed(),
            |_ctx| async { Ok(()) },
        )
        .await
        .unwrap();
    assert!(report.backup_id.is_some());
    assert!(!report.warnings.is_empty());
}

#[tokio::test]
async fn test_exclusive_operation_holds_global_lock() {
    let env = TestEnv::new();
    let manager = env.manager("agent-a", env.safety_config()).await;
    let observer = env.coordinator("agent-b");
    let watcher = &observer;

    let report = manager
        .execute_with_safety(
            "reindex",
            OperationOptions::read_only().exclusive(),
            |_ctx| async move {
                let lock = watcher.current_lock().await?.expect("lock held during operation");
                Ok::<_, anyhow::Error>(lock.holder)
            },
        )
        .await
        .unwrap();

    assert_eq!(report.result, "agent-a");
    assert!(observer.current_lock().await.unwrap().is_none());
}

#[tokio::test]
async fn test_exclusive_operation_refused_while_lock_held_elsewhere() {
    let env = TestEnv::new();
    let manager = env.manager("agent-a", env.safety_config()).await;
    let other = env.coordinator("agent-b");
    other
        .acquire_global_lock("migration", Duration::from_secs(60))
        .await
        .unwrap();

    let err = manager
        .execute_with_safety(
            "reindex",
            OperationOptions::read_only().exclusive(),
            |_ctx| async { Ok(()) },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, SafetyError::LockContention(_)));
    assert_eq!(
        manager.get_operation_history(1).await[0].status,
        OperationStatus::Rejected
    );
}

#[tokio::test]
async fn test_backup_ceiling_blocks_unprotected_destructive_work() {
    let env = TestEnv::new();
    let mut config = env.safety_config();
    config.max_operations_without_backup = 2;
    let manager = env.manager("agent-a", config).await;

    for _ in 0..2 {
        manager
            .execute_with_safety("touch", OperationOptions::read_only(), |_ctx| async { Ok(()) })
            .await
            .unwrap();
    }

    let err = manager
        .execute_with_safety(
            "edit",
            OperationOptions::destructive().confirmed().backup_before(false),
            |_ctx| async { Ok(()) },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SafetyError::PreflightFailed { .. }));

    // Taking the backup resets the counter
    manager
        .execute_with_safety("edit", OperationOptions::destructive().confirmed(), |_ctx| async { Ok(()) })
        .await
        .unwrap();
    assert_eq!(manager.operations_since_backup(), 1);
}

#[tokio::test]
async fn test_status_reports_siblings_and_backups() {
    let env = TestEnv::new();
    let manager = env.manager("agent-a", env.safety_config()).await;
    let sibling = env.coordinator("agent-b");
    sibling.initialize().await.unwrap();

    manager.create_backup("baseline").await.unwrap();

    let status = manager.get_safety_status().await;
    assert_eq!(status.agent_id, "agent-a");
    assert_eq!(status.active_agents, Some(1));
    assert_eq!(status.compatible, Some(true));
    assert_eq!(status.backups_available, Some(1));
    assert!(status.last_backup_id.unwrap().starts_with("full-"));
    assert!(status.current_lock.is_none());
}
