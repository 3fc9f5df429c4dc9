//! Per-user token cache: data model, cache-key binding and the persistence adapter.

pub mod adapter;
pub mod entry;

use std::fmt;

use sha2::{Digest, Sha256};

pub use adapter::TokenCacheAdapter;
pub use entry::{EntryKey, EntrySummary, PayloadError, TokenCachePayload, TokenEntry};

/// Stable identifier of the signed-in user, e.g. the provider's object id claim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserIdentity(String);

impl UserIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UserIdentity {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for UserIdentity {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Store key of a user's blob: `{namespace}:{sha256(identity) hex}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn derive(namespace: &str, identity: &UserIdentity) -> Self {
        let digest = Sha256::digest(identity.as_str().as_bytes());
        Self(format!("{namespace}:{digest:x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
