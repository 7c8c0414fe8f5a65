use async_trait::async_trait;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::records::model::{Dataset, Record};

#[derive(Error, Debug, Clone)]
pub enum ClientError {
    #[error("Record store unreachable: {0}")]
    Unreachable(String),
    #[error("Collection not found: {0}")]
    CollectionNotFound(String),
    #[error("Rate limited, retry after {0}ms")]
    RateLimited(u64),
    #[error("Record store request failed: {0}")]
    Request(String),
}

/// Result of a connectivity probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConnectionStatus {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Access to the remote record store.
///
/// Implementations own the wire protocol, authentication and rate limiting;
/// the safety layer only needs connectivity probes and full collection reads.
#[async_trait]
pub trait RecordStoreClient: Send + Sync {
    /// Probe the remote store. Never fails; problems are reported in the status.
    async fn test_connection(&self) -> ConnectionStatus;

    /// Fetch every record of a collection
    async fn fetch_all(&self, collection: &str) -> Result<Vec<Record>, ClientError>;
}

/// Fetch the given collections concurrently and assemble a dataset.
pub async fn capture_dataset(
    client: &dyn RecordStoreClient,
    collections: &[String],
) -> Result<Dataset, ClientError> {
    let fetches = collections.iter().map(|name| async move {
        let records = client.fetch_all(name).await?;
        Ok::<_, ClientError>((name.clone(), records))
    });

    let fetched = try_join_all(fetches).await?;
    tracing::debug!(
        collections = fetched.len(),
        "Captured dataset from record store"
    );
    Ok(fetched.into_iter().collect())
}
