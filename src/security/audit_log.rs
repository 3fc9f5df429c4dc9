use tracing::{error, info, warn};

/// Audit trail for token lifecycle transitions.
///
/// Users appear only through their hashed cache key; token material is never passed in.
#[derive(Debug, Clone, Default)]
pub struct AuditLogger;

impl AuditLogger {
    pub fn new() -> Self {
        Self
    }

    pub fn cache_hit(&self, cache_key: &str, resource: &str, correlation_id: &str) {
        info!(target: "audit", event = "cache_hit", cache_key, resource, correlation_id);
    }

    pub fn token_refreshed(&self, cache_key: &str, resource: &str, correlation_id: &str, rotated: bool) {
        info!(target: "audit", event = "token_refreshed", cache_key, resource, correlation_id, rotated);
    }

    pub fn token_stored(&self, cache_key: &str, resource: &str) {
        info!(target: "audit", event = "token_stored", cache_key, resource);
    }

    pub fn refresh_rejected(&self, cache_key: &str, resource: &str, correlation_id: &str, reason: &str) {
        warn!(target: "audit", event = "refresh_rejected", cache_key, resource, correlation_id, reason);
    }

    pub fn entry_removed(&self, cache_key: &str, resource: &str, correlation_id: &str) {
        warn!(target: "audit", event = "entry_removed", cache_key, resource, correlation_id);
    }

    pub fn cache_cleared(&self, cache_key: &str) {
        info!(target: "audit", event = "cache_cleared", cache_key);
    }

    pub fn cache_discarded(&self, cache_key: &str, reason: &str) {
        warn!(target: "audit", event = "cache_discarded", cache_key, reason);
    }

    pub fn store_unavailable(&self, cache_key: &str, error_msg: &str) {
        error!(target: "audit", event = "store_unavailable", cache_key, error = error_msg);
    }

    pub fn token_service_unavailable(
        &self,
        cache_key: &str,
        resource: &str,
        correlation_id: &str,
        error_msg: &str,
    ) {
        error!(target: "audit", event = "token_service_unavailable", cache_key, resource, correlation_id, error = error_msg);
    }
}
