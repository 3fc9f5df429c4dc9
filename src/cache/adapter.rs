use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::{CacheKey, TokenCachePayload, UserIdentity};
use crate::error::BrokerError;
use crate::security::audit_log::AuditLogger;
use crate::security::protection::DataProtector;
use crate::store::{self, ProtectedStore};

/// Binds a user to one blob in the protected store.
///
/// Reads degrade to an empty payload when the blob is missing, fails to decrypt
/// or fails to parse. Only store failures are reported.
#[derive(Debug, Clone)]
pub struct TokenCacheAdapter {
    store: Arc<dyn ProtectedStore>,
    protector: Arc<DataProtector>,
    namespace: String,
    store_timeout: Duration,
    entry_ttl: Option<Duration>,
    audit: AuditLogger,
}

impl TokenCacheAdapter {
    pub fn new(
        store: Arc<dyn ProtectedStore>,
        protector: Arc<DataProtector>,
        namespace: &str,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            protector,
            namespace: namespace.to_string(),
            store_timeout,
            entry_ttl: None,
            audit: AuditLogger::new(),
        }
    }

    /// Expire stored blobs after `ttl` in backends that support it.
    pub fn with_entry_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.entry_ttl = ttl;
        self
    }

    pub fn cache_key(&self, identity: &UserIdentity) -> CacheKey {
        CacheKey::derive(&self.namespace, identity)
    }

    pub async fn load(&self, identity: &UserIdentity) -> Result<TokenCachePayload, BrokerError> {
        let key = self.cache_key(identity);

        let blob = match store::bounded(self.store_timeout, self.store.get(key.as_str())).await {
            Ok(blob) => blob,
            Err(e) => {
                self.audit.store_unavailable(key.as_str(), &e.to_string());
                return Err(e.into());
            }
        };

        let Some(blob) = blob else {
            debug!(cache_key = %key, "no token cache stored, starting empty");
            return Ok(TokenCachePayload::new());
        };

        let plaintext = match self.protector.unprotect(&blob) {
            Ok(p) => p,
            Err(e) => {
                warn!(cache_key = %key, error = %e, "discarding unreadable token cache");
                self.audit.cache_discarded(key.as_str(), &e.to_string());
                return Ok(TokenCachePayload::new());
            }
        };

        match TokenCachePayload::from_bytes(&plaintext) {
            Ok(payload) => {
                debug!(cache_key = %key, entries = payload.len(), "token cache loaded");
                Ok(payload)
            }
            Err(e) => {
                warn!(cache_key = %key, error = %e, "discarding undecodable token cache");
                self.audit.cache_discarded(key.as_str(), &e.to_string());
                Ok(TokenCachePayload::new())
            }
        }
    }

    /// Persist `payload` after a mutation. An empty payload deletes the blob.
    pub async fn on_payload_changed(
        &self,
        identity: &UserIdentity,
        payload: &TokenCachePayload,
    ) -> Result<(), BrokerError> {
        let key = self.cache_key(identity);

        if payload.is_empty() {
            return self.delete(&key).await;
        }

        let plaintext = payload
            .to_bytes()
            .map_err(|e| BrokerError::StoreUnavailable(format!("serializing token cache: {e}")))?;
        let blob = self
            .protector
            .protect(&plaintext)
            .map_err(|e| BrokerError::StoreUnavailable(format!("protecting token cache: {e}")))?;

        let write = self.store.set(key.as_str(), blob, self.entry_ttl);
        if let Err(e) = store::bounded(self.store_timeout, write).await {
            self.audit.store_unavailable(key.as_str(), &e.to_string());
            return Err(e.into());
        }
        debug!(cache_key = %key, entries = payload.len(), "token cache persisted");
        Ok(())
    }

    /// Drop everything cached for the user.
    pub async fn clear(&self, identity: &UserIdentity) -> Result<(), BrokerError> {
        let key = self.cache_key(identity);
        self.delete(&key).await?;
        self.audit.cache_cleared(key.as_str());
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), BrokerError> {
        if let Err(e) = store::bounded(self.store_timeout, self.store.delete(key.as_str())).await {
            self.audit.store_unavailable(key.as_str(), &e.to_string());
            return Err(e.into());
        }
        debug!(cache_key = %key, "token cache deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TokenEntry;
    use crate::error::StoreError;
    use crate::security::protection::{Keyring, ProtectionKey};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::Utc;

    fn protector(purpose: &str) -> Arc<DataProtector> {
        let key = ProtectionKey::new("k1", [3u8; 32]).unwrap();
        Arc::new(Keyring::new(key).protector(purpose).unwrap())
    }

    fn adapter(store: &MemoryStore) -> TokenCacheAdapter {
        TokenCacheAdapter::new(
            Arc::new(store.clone()),
            protector("token-cache"),
            "TokenCache",
            Duration::from_secs(1),
        )
    }

    fn sample_payload() -> TokenCachePayload {
        let mut payload = TokenCachePayload::new();
        payload.upsert(TokenEntry {
            resource: "https://graph.example.com".to_string(),
            client_id: "client".to_string(),
            authority: "https://login.example.com/tenant".to_string(),
            access_token: "AT1".to_string(),
            refresh_token: Some("RT1".to_string()),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        });
        payload
    }

    #[tokio::test]
    async fn test_load_missing_is_empty() {
        let store = MemoryStore::new();
        let payload = adapter(&store).load(&"U1".into()).await.unwrap();
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn test_persist_then_load() {
        let store = MemoryStore::new();
        let adapter = adapter(&store);
        let user = UserIdentity::from("U1");

        adapter.on_payload_changed(&user, &sample_payload()).await.unwrap();
        let loaded = adapter.load(&user).await.unwrap();
        assert_eq!(loaded, sample_payload());
    }

    #[tokio::test]
    async fn test_stored_blob_is_encrypted() {
        let store = MemoryStore::new();
        let adapter = adapter(&store);
        let user = UserIdentity::from("U1");
        adapter.on_payload_changed(&user, &sample_payload()).await.unwrap();

        let raw = store
            .get(adapter.cache_key(&user).as_str())
            .await
            .unwrap()
            .unwrap();
        let text = String::from_utf8_lossy(&raw);
        assert!(!text.contains("RT1"));
        assert!(!text.contains("graph.example.com"));

        let plaintext = protector("token-cache").unprotect(&raw).unwrap();
        assert_eq!(plaintext, sample_payload().to_bytes().unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_blob_loads_empty() {
        let store = MemoryStore::new();
        let adapter = adapter(&store);
        let user = UserIdentity::from("U1");
        store
            .set(adapter.cache_key(&user).as_str(), b"\x00garbage".to_vec(), None)
            .await
            .unwrap();

        assert!(adapter.load(&user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_foreign_purpose_blob_loads_empty() {
        let store = MemoryStore::new();
        let adapter = adapter(&store);
        let user = UserIdentity::from("U1");
        let foreign = protector("other-purpose")
            .protect(&sample_payload().to_bytes().unwrap())
            .unwrap();
        store
            .set(adapter.cache_key(&user).as_str(), foreign, None)
            .await
            .unwrap();

        assert!(adapter.load(&user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_plaintext_loads_empty() {
        let store = MemoryStore::new();
        let adapter = adapter(&store);
        let user = UserIdentity::from("U1");
        let blob = protector("token-cache").protect(b"{\"version\":99}").unwrap();
        store
            .set(adapter.cache_key(&user).as_str(), blob, None)
            .await
            .unwrap();

        assert!(adapter.load(&user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_payload_deletes_and_clear_removes() {
        let store = MemoryStore::new();
        let adapter = adapter(&store);
        let user = UserIdentity::from("U1");

        adapter.on_payload_changed(&user, &sample_payload()).await.unwrap();
        assert_eq!(store.len().await, 1);
        adapter
            .on_payload_changed(&user, &TokenCachePayload::new())
            .await
            .unwrap();
        assert!(store.is_empty().await);

        adapter.on_payload_changed(&user, &sample_payload()).await.unwrap();
        adapter.clear(&user).await.unwrap();
        assert!(store.is_empty().await);
    }

    #[derive(Debug)]
    struct SlowStore;

    #[async_trait]
    impl ProtectedStore for SlowStore {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(None)
        }
        async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Option<Duration>) -> Result<(), StoreError> {
            Err(StoreError::Backend("connection refused".to_string()))
        }
        async fn delete(&self, _key: &str) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_store_failures_surface_as_unavailable() {
        let adapter = TokenCacheAdapter::new(
            Arc::new(SlowStore),
            protector("token-cache"),
            "TokenCache",
            Duration::from_millis(50),
        );
        let user = UserIdentity::from("U1");

        let err = adapter.load(&user).await.unwrap_err();
        assert!(matches!(err, BrokerError::StoreUnavailable(_)));

        let err = adapter
            .on_payload_changed(&user, &sample_payload())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
