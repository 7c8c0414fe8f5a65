pub mod backup;
pub mod config;
pub mod coordinator;
pub mod records;
pub mod safety;
pub mod util;

pub use backup::{BackupEngine, BackupError, CatalogEntry, SnapshotKind, SnapshotMetadata};
pub use config::Config;
pub use coordinator::{AgentCoordinator, AgentState, CompatibilityReport, CoordinatorError, StatusArea};
pub use records::{Dataset, Record, RecordStoreClient};
pub use safety::{OperationOptions, OperationStatus, SafetyError, SafetyManager, SafetyPaths};
