use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::trace;

use super::ProtectedStore;
use crate::error::StoreError;

#[derive(Debug, Clone)]
struct Slot {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// Process-local store. Clones share the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    slots: Arc<RwLock<HashMap<String, Slot>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let slots = self.slots.read().await;
        slots.values().filter(|s| s.is_live(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn contains(&self, key: &str) -> bool {
        let slots = self.slots.read().await;
        slots.get(key).is_some_and(|s| s.is_live(Instant::now()))
    }
}

#[async_trait]
impl ProtectedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let now = Instant::now();
        let slots = self.slots.read().await;
        Ok(slots
            .get(key)
            .filter(|s| s.is_live(now))
            .map(|s| s.value.clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut slots = self.slots.write().await;
        // purge expired
        slots.retain(|_, s| s.is_live(now));
        slots.insert(
            key.to_string(),
            Slot {
                value,
                expires_at: ttl.map(|t| now + t),
            },
        );
        trace!(cache_key = %key, "memory store write");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut slots = self.slots.write().await;
        slots.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_get_set_delete() {
        let store = MemoryStore::new();
        assert!(store.get("k").await.unwrap().is_none());

        store.set("k", b"blob".to_vec(), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"blob".to_vec()));

        store.set("k", b"other".to_vec(), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"other".to_vec()));

        store.delete("k").await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
        // Deleting again is fine
        store.delete("k").await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_store_ttl_expiry() {
        let store = MemoryStore::new();
        store
            .set("short", b"x".to_vec(), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        store.set("long", b"y".to_vec(), None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(store.get("short").await.unwrap().is_none());
        assert!(!store.contains("short").await);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_memory_store_clones_share_state() {
        let store = MemoryStore::new();
        let other = store.clone();
        store.set("k", b"v".to_vec(), None).await.unwrap();
        assert!(other.contains("k").await);
    }
}
