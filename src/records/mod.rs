//! Record-store collaborator contract
//!
//! The safety layer never talks to the remote store's API directly; it goes
//! through `RecordStoreClient` for connectivity probes and full reads.

mod client;
pub mod mock;
mod model;

pub use client::{capture_dataset, ClientError, ConnectionStatus, RecordStoreClient};
pub use mock::MockRecordStore;
pub use model::{Dataset, Fields, Record};
