//! Safety layer around record-store operations
//!
//! Every risky operation goes through `SafetyManager::execute_with_safety`:
//! checks, a safety snapshot, monitored execution, verification, and
//! rollback on failure.

mod checks;
mod context;
mod error;
mod log;
mod manager;
mod monitor;

pub use checks::CheckFailure;
pub use context::{
    OperationContext, OperationOptions, OperationPhase, OperationReport, OperationStatus,
};
pub use error::SafetyError;
pub use log::{OperationLog, OperationLogEntry};
pub use manager::{ActiveOperation, RollbackOutcome, SafetyManager, SafetyPaths, SafetyStatus};
pub use monitor::{MonitorSummary, OperationMonitor};
