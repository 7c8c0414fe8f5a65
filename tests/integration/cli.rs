//! Smoke tests for the reporting CLI

use assert_cmd::Command;
use predicates::prelude::*;
use recordsafe::{OperationOptions, SnapshotMetadata};

use super::common::fixtures::{sample_dataset, TestEnv};

fn recordsafe(env: &TestEnv) -> Command {
    let mut cmd = Command::cargo_bin("recordsafe").expect("binary built");
    cmd.arg("--data-dir").arg(env.root());
    cmd
}

#[test]
fn test_empty_data_dir() {
    let env = TestEnv::new();

    recordsafe(&env)
        .arg("backups")
        .assert()
        .success()
        .stdout(predicate::str::contains("No snapshots"));

    recordsafe(&env)
        .arg("agents")
        .assert()
        .success()
        .stdout(predicate::str::contains("No active agents"));

    recordsafe(&env)
        .arg("history")
        .assert()
        .success()
        .stdout(predicate::str::contains("No operations recorded"));
}

#[tokio::test]
async fn test_backups_verify_and_cleanup() {
    let env = TestEnv::new();
    let id = env
        .backup_engine()
        .create_full_backup(&sample_dataset(), SnapshotMetadata::described("cli"))
        .await
        .unwrap();

    recordsafe(&env)
        .arg("backups")
        .assert()
        .success()
        .stdout(predicate::str::contains(id.as_str()));

    recordsafe(&env)
        .args(["verify", id.as_str()])
        .assert()
        .success()
        .stdout(predicate::str::contains("ok"));

    recordsafe(&env)
        .args(["verify", "full-does-not-exist"])
        .assert()
        .failure();

    recordsafe(&env)
        .args(["cleanup", "--days", "0"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed 1 snapshot(s)"));
}

#[tokio::test]
async fn test_status_shows_lock_holder() {
    let env = TestEnv::new();
    let coordinator = env.coordinator("agent-a");
    coordinator.initialize().await.unwrap();
    coordinator
        .acquire_global_lock("migration", std::time::Duration::from_secs(60))
        .await
        .unwrap();
    let full = env
        .backup_engine()
        .create_full_backup(&sample_dataset(), SnapshotMetadata::default())
        .await
        .unwrap();

    recordsafe(&env)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Active agents: 1"))
        .stdout(predicate::str::contains("held by agent-a (migration)"))
        .stdout(predicate::str::contains(format!("Last full:     {}", full)))
        .stdout(predicate::str::contains("Last safety:").not());

    coordinator.safe_shutdown().await;
}

#[tokio::test]
async fn test_history_can_show_only_failures() {
    let env = TestEnv::new();
    let manager = env.manager("agent-a", env.safety_config()).await;
    manager.create_backup("baseline").await.unwrap();
    let refused = manager
        .execute_with_safety("purge", OperationOptions::destructive(), |_ctx| async { Ok(()) })
        .await;
    assert!(refused.is_err());

    recordsafe(&env)
        .arg("history")
        .assert()
        .success()
        .stdout(predicate::str::contains("create_backup"))
        .stdout(predicate::str::contains("purge"));

    recordsafe(&env)
        .args(["history", "--failures"])
        .assert()
        .success()
        .stdout(predicate::str::contains("purge"))
        .stdout(predicate::str::contains("rejected"))
        .stdout(predicate::str::contains("create_backup").not());
}
