//! Protected key/value store holding encrypted token-cache blobs.
//!
//! Backends never inspect or transform the bytes they hold.

pub mod memory;
pub mod vault;

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

pub use memory::MemoryStore;
pub use vault::VaultStore;

#[async_trait]
pub trait ProtectedStore: Send + Sync + fmt::Debug {
    /// Fetch the blob stored under `key`, `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write `value` under `key`, replacing any previous blob.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Remove `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Run a store operation under a deadline, mapping expiry to [`StoreError::Timeout`].
pub async fn bounded<T, F>(limit: Duration, op: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, op).await {
        Ok(res) => res,
        Err(_) => Err(StoreError::Timeout(limit.as_millis() as u64)),
    }
}
