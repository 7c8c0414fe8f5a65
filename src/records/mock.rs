//! Mock record store for deterministic testing
//!
//! Implements `RecordStoreClient` over an in-memory dataset so the
//! coordinator, backup engine and safety manager can be exercised without
//! a remote service. Connectivity and fetch failures can be injected, and
//! every call is captured for later assertions.
//!
//! # Example
//! ```no_run
//! use recordsafe::records::{Dataset, MockRecordStore, Record};
//!
//! let store = MockRecordStore::new(
//!     Dataset::new().with_collection("Contacts", vec![Record::new("rec1")]),
//! )
//! .offline();
//! assert_eq!(store.fetch_count(), 0);
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::records::client::{ClientError, ConnectionStatus, RecordStoreClient};
use crate::records::model::{Dataset, Record};

/// Failure modes the mock can simulate
#[derive(Debug, Clone, Default)]
pub struct MockFailures {
    /// `test_connection` reports failure
    pub offline: bool,
    /// `fetch_all` returns an error
    pub fail_fetch: bool,
}

/// In-memory record store. Clones share state.
#[derive(Clone, Default)]
pub struct MockRecordStore {
    data: Arc<Mutex<Dataset>>,
    failures: Arc<Mutex<MockFailures>>,
    /// Collections passed to fetch_all, in call order
    captured_fetches: Arc<Mutex<Vec<String>>>,
    connection_checks: Arc<Mutex<usize>>,
}

impl MockRecordStore {
    pub fn new(data: Dataset) -> Self {
        Self {
            data: Arc::new(Mutex::new(data)),
            ..Self::default()
        }
    }

    /// Report the store as unreachable
    pub fn offline(self) -> Self {
        self.failures.lock().offline = true;
        self
    }

    /// Make every fetch fail
    pub fn failing_fetches(self) -> Self {
        self.failures.lock().fail_fetch = true;
        self
    }

    pub fn set_offline(&self, offline: bool) {
        self.failures.lock().offline = offline;
    }

    pub fn set_failing_fetches(&self, fail: bool) {
        self.failures.lock().fail_fetch = fail;
    }

    /// Replace the whole dataset, as a destructive operation would
    pub fn replace_data(&self, data: Dataset) {
        *self.data.lock() = data;
    }

    /// Insert or replace a record in a collection
    pub fn upsert(&self, collection: &str, record: Record) {
        let mut data = self.data.lock();
        match data.collection_mut(collection) {
            Some(records) => match records.iter_mut().find(|r| r.id == record.id) {
                Some(existing) => *existing = record,
                None => records.push(record),
            },
            None => data.insert_collection(collection, vec![record]),
        }
    }

    /// Current contents
    pub fn snapshot(&self) -> Dataset {
        self.data.lock().clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.captured_fetches.lock().len()
    }

    pub fn captured_fetches(&self) -> Vec<String> {
        self.captured_fetches.lock().clone()
    }

    pub fn connection_checks(&self) -> usize {
        *self.connection_checks.lock()
    }
}

#[async_trait]
impl RecordStoreClient for MockRecordStore {
    async fn test_connection(&self) -> ConnectionStatus {
        *self.connection_checks.lock() += 1;
        if self.failures.lock().offline {
            ConnectionStatus::failed("mock store offline")
        } else {
            ConnectionStatus::ok()
        }
    }

    async fn fetch_all(&self, collection: &str) -> Result<Vec<Record>, ClientError> {
        self.captured_fetches.lock().push(collection.to_string());

        let failures = self.failures.lock().clone();
        if failures.offline {
            return Err(ClientError::Unreachable("mock store offline".into()));
        }
        if failures.fail_fetch {
            return Err(ClientError::Request(format!(
                "mock fetch failure for {}",
                collection
            )));
        }

        self.data
            .lock()
            .collection(collection)
            .map(<[Record]>::to_vec)
            .ok_or_else(|| ClientError::CollectionNotFound(collection.to_string()))
    }
}
