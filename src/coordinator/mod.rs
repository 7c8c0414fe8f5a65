//! Agent coordination across independent processes
//!
//! Presence (agent records + heartbeat), compatibility checks between
//! siblings, and the single advisory global lock.

mod agent_coordinator;
mod error;
mod record;
mod status_area;

pub use agent_coordinator::{AgentCoordinator, CompatibilityReport, Conflict};
pub use error::CoordinatorError;
pub use record::{AgentMetadata, AgentRecord, AgentState, LockRecord};
pub use status_area::{LockRemoval, StatusArea};
