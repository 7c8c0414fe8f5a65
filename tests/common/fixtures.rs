//! Test environment wiring

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use recordsafe::config::{BackupConfig, CoordinatorConfig, SafetyConfig};
use recordsafe::records::MockRecordStore;
use recordsafe::{
    AgentCoordinator, BackupEngine, Dataset, Record, SafetyManager, SafetyPaths, StatusArea,
};
use tempfile::TempDir;

pub const CONTACTS: &str = "Contacts";
pub const DEALS: &str = "Deals";

pub fn record(id: &str, name: &str) -> Record {
    Record::new(id).with_field("name", name)
}

/// Two small collections
pub fn sample_dataset() -> Dataset {
    Dataset::new()
        .with_collection(
            CONTACTS,
            vec![record("rec1", "Ada"), record("rec2", "Grace")],
        )
        .with_collection(DEALS, vec![record("deal1", "Renewal")])
}

/// A temporary data directory shared by any number of agents
pub struct TestEnv {
    dir: TempDir,
    pub store: MockRecordStore,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp dir"),
            store: MockRecordStore::new(sample_dataset()),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn shared_dir(&self) -> PathBuf {
        self.root().join("shared")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root().join("backups")
    }

    pub fn coordinator_config(&self, agent_id: &str) -> CoordinatorConfig {
        CoordinatorConfig {
            agent_id: Some(agent_id.to_string()),
            compatibility_poll: Duration::from_millis(10),
            ..CoordinatorConfig::default()
        }
    }

    pub fn coordinator(&self, agent_id: &str) -> AgentCoordinator {
        AgentCoordinator::new(
            StatusArea::new(self.shared_dir()),
            self.coordinator_config(agent_id),
        )
    }

    pub fn backup_engine(&self) -> BackupEngine {
        BackupEngine::new(self.backups_dir(), BackupConfig::default())
    }

    pub fn safety_config(&self) -> SafetyConfig {
        SafetyConfig {
            collections: vec![CONTACTS.to_string(), DEALS.to_string()],
            ..SafetyConfig::default()
        }
    }

    /// A manager for `agent_id` with its coordinator already initialized
    pub async fn manager(&self, agent_id: &str, config: SafetyConfig) -> SafetyManager {
        let coordinator = self.coordinator(agent_id);
        coordinator
            .initialize()
            .await
            .expect("Failed to initialize coordinator");
        SafetyManager::new(
            config,
            Arc::new(self.backup_engine()),
            Arc::new(coordinator),
            Arc::new(self.store.clone()),
            SafetyPaths::under(self.root()),
        )
    }
}
