//! Integration tests for agent coordination
//!
//! Several coordinators share one status area, the way separate agent
//! processes share a directory.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use recordsafe::coordinator::{AgentMetadata, AgentRecord, LockRecord, LockRemoval};
use recordsafe::{AgentState, CoordinatorError, StatusArea};

use super::common::fixtures::TestEnv;

#[tokio::test]
async fn test_lock_is_mutually_exclusive() {
    let env = TestEnv::new();
    let a = env.coordinator("agent-a");
    let b = env.coordinator("agent-b");
    a.initialize().await.unwrap();
    b.initialize().await.unwrap();

    a.acquire_global_lock("migration", Duration::from_secs(60))
        .await
        .unwrap();

    let err = b
        .acquire_global_lock("cleanup", Duration::from_secs(60))
        .await
        .unwrap_err();
    match err {
        CoordinatorError::LockContention { holder, label, .. } => {
            assert_eq!(holder, "agent-a");
            assert_eq!(label, "migration");
        }
        other => panic!("expected lock contention, got {other:?}"),
    }

    a.release_global_lock().await.unwrap();
    let lock = b
        .acquire_global_lock("cleanup", Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(lock.holder, "agent-b");
}

#[tokio::test]
async fn test_concurrent_acquire_has_single_winner() {
    let env = TestEnv::new();
    let coordinators: Vec<_> = (0..6)
        .map(|i| env.coordinator(&format!("agent-{i}")))
        .collect();

    let attempts = coordinators
        .iter()
        .map(|c| c.acquire_global_lock("race", Duration::from_secs(60)));
    let results = futures::future::join_all(attempts).await;

    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, CoordinatorError::LockContention { .. })));
}

#[tokio::test]
async fn test_stale_lock_takeover() {
    let env = TestEnv::new();
    let area = StatusArea::new(env.shared_dir());

    // A holder that crashed ten minutes ago with a five minute lock
    let crashed = LockRecord::new(
        "crashed-agent",
        "import",
        Utc::now() - chrono::Duration::minutes(10),
        Duration::from_secs(300),
    );
    assert!(area.try_create_lock(&crashed).await.unwrap());

    let b = env.coordinator("agent-b");
    let lock = b
        .acquire_global_lock("recovery", Duration::from_secs(60))
        .await
        .unwrap();

    assert_eq!(lock.holder, "agent-b");
    let current = b.current_lock().await.unwrap().unwrap();
    assert_eq!(current.lock_id, lock.lock_id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_takeovers_of_stale_lock_leave_one_live_lock() {
    let env = TestEnv::new();
    let area = StatusArea::new(env.shared_dir());
    let crashed = LockRecord::new(
        "crashed-agent",
        "import",
        Utc::now() - chrono::Duration::minutes(10),
        Duration::from_secs(60),
    );
    assert!(area.try_create_lock(&crashed).await.unwrap());

    let contenders: Vec<_> = (0..8)
        .map(|i| Arc::new(env.coordinator(&format!("agent-{i}"))))
        .collect();
    let attempts: Vec<_> = contenders
        .iter()
        .cloned()
        .map(|c| {
            tokio::spawn(async move { c.acquire_global_lock("recovery", Duration::from_secs(600)).await })
        })
        .collect();
    let results: Vec<_> = futures::future::join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    let current = area.read_lock().await.unwrap().unwrap();
    assert_eq!(current.lock_id, winners[0].lock_id);

    // A contender still acting on its earlier read of the stale lock
    assert_eq!(
        area.remove_lock_matching(crashed.lock_id).await.unwrap(),
        LockRemoval::Mismatch
    );
    assert_eq!(area.read_lock().await.unwrap().unwrap().lock_id, current.lock_id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_live_lock_never_vacated_by_mismatched_removals() {
    let env = TestEnv::new();
    let a = env.coordinator("agent-a");
    let held = a
        .acquire_global_lock("migration", Duration::from_secs(600))
        .await
        .unwrap();

    let remover = {
        let area = StatusArea::new(env.shared_dir());
        tokio::spawn(async move {
            for _ in 0..200 {
                let outcome = area.remove_lock_matching(uuid::Uuid::new_v4()).await.unwrap();
                assert_eq!(outcome, LockRemoval::Mismatch);
            }
        })
    };
    let creator = {
        let area = StatusArea::new(env.shared_dir());
        tokio::spawn(async move {
            let mut acquired = 0;
            for _ in 0..200 {
                let lock = LockRecord::new("agent-c", "sneak", Utc::now(), Duration::from_secs(600));
                if area.try_create_lock(&lock).await.unwrap() {
                    acquired += 1;
                }
                tokio::task::yield_now().await;
            }
            acquired
        })
    };

    remover.await.unwrap();
    assert_eq!(creator.await.unwrap(), 0);
    assert_eq!(a.current_lock().await.unwrap().unwrap().lock_id, held.lock_id);
}

#[tokio::test]
async fn test_release_twice_is_noop() {
    let env = TestEnv::new();
    let a = env.coordinator("agent-a");
    a.acquire_global_lock("job", Duration::from_secs(60))
        .await
        .unwrap();

    a.release_global_lock().await.unwrap();
    a.release_global_lock().await.unwrap();
    assert!(a.current_lock().await.unwrap().is_none());
}

#[tokio::test]
async fn test_release_leaves_foreign_lock_alone() {
    let env = TestEnv::new();
    let a = env.coordinator("agent-a");
    let b = env.coordinator("agent-b");
    a.acquire_global_lock("job", Duration::from_secs(60))
        .await
        .unwrap();

    b.release_global_lock().await.unwrap();
    assert_eq!(b.current_lock().await.unwrap().unwrap().holder, "agent-a");
}

#[tokio::test]
async fn test_stale_agents_excluded_but_kept_on_disk() {
    let env = TestEnv::new();
    let area = StatusArea::new(env.shared_dir());

    let mut stale = AgentRecord::new("ghost", Utc::now() - chrono::Duration::minutes(30));
    stale.state = AgentState::Working;
    stale.metadata = AgentMetadata::for_operation("purge", true);
    area.write_agent(&stale).await.unwrap();

    let a = env.coordinator("agent-a");
    let b = env.coordinator("agent-b");
    a.initialize().await.unwrap();
    b.initialize().await.unwrap();

    let active = a.get_active_agents().await.unwrap();
    let ids: Vec<_> = active.iter().map(|r| r.agent_id.as_str()).collect();
    assert_eq!(ids, vec!["agent-b"]);

    // The dead destructive agent does not block anyone
    assert!(a.check_compatibility().await.unwrap().compatible);
    assert!(area.read_agent("ghost").await.unwrap().is_some());
}

#[tokio::test]
async fn test_compatibility_tracks_sibling_work() {
    let env = TestEnv::new();
    let a = env.coordinator("agent-a");
    let b = env.coordinator("agent-b");
    a.initialize().await.unwrap();
    b.initialize().await.unwrap();

    b.update_status(
        AgentState::Working,
        "deduplicating",
        AgentMetadata::for_operation("dedupe", true),
    )
    .await;

    let report = a.check_compatibility().await.unwrap();
    assert!(!report.compatible);
    assert_eq!(report.conflicts[0].agent_id, "agent-b");
    assert!(!a.wait_for_compatibility(Duration::from_millis(50)).await);

    b.update_status(AgentState::Active, "idle", AgentMetadata::default())
        .await;
    assert!(a.wait_for_compatibility(Duration::from_millis(50)).await);
}

#[tokio::test]
async fn test_shutdown_releases_lock_and_goes_inactive() {
    let env = TestEnv::new();
    let a = env.coordinator("agent-a");
    let b = env.coordinator("agent-b");
    a.initialize().await.unwrap();
    b.initialize().await.unwrap();
    a.start_heartbeat(Duration::from_millis(20));
    a.acquire_global_lock("job", Duration::from_secs(60))
        .await
        .unwrap();

    a.safe_shutdown().await;
    a.safe_shutdown().await;

    assert!(!a.is_heartbeat_running());
    assert!(b.current_lock().await.unwrap().is_none());
    assert!(b.get_active_agents().await.unwrap().is_empty());

    let record = StatusArea::new(env.shared_dir())
        .read_agent("agent-a")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.state, AgentState::Inactive);
}

#[tokio::test]
async fn test_dropping_coordinator_releases_lock() {
    let env = TestEnv::new();
    {
        let a = env.coordinator("agent-a");
        a.acquire_global_lock("job", Duration::from_secs(60))
            .await
            .unwrap();
    }

    let b = env.coordinator("agent-b");
    assert!(b
        .acquire_global_lock("next", Duration::from_secs(60))
        .await
        .is_ok());
}
