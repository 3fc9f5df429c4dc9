use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Current on-disk payload version.
pub const PAYLOAD_VERSION: u32 = 1;

/// Identifies one cached token pair inside a user's payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryKey {
    pub resource: String,
    pub client_id: String,
    pub authority: String,
}

impl EntryKey {
    pub fn new(resource: &str, client_id: &str, authority: &str) -> Self {
        Self {
            resource: resource.to_string(),
            client_id: client_id.to_string(),
            authority: normalize_authority(authority),
        }
    }
}

/// Authorities compare case-insensitively and without a trailing slash.
pub fn normalize_authority(authority: &str) -> String {
    authority.trim().trim_end_matches('/').to_ascii_lowercase()
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEntry {
    pub resource: String,
    pub client_id: String,
    pub authority: String,
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl TokenEntry {
    pub fn key(&self) -> EntryKey {
        EntryKey::new(&self.resource, &self.client_id, &self.authority)
    }

    /// True when the token expires within `margin` of `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        self.expires_at <= now + margin
    }

    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|rt| !rt.is_empty())
    }
}

impl fmt::Debug for TokenEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenEntry")
            .field("resource", &self.resource)
            .field("client_id", &self.client_id)
            .field("authority", &self.authority)
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.has_refresh_token())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Token-free view of an entry for inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntrySummary {
    pub resource: String,
    pub client_id: String,
    pub authority: String,
    pub expires_at: DateTime<Utc>,
    pub has_refresh_token: bool,
}

impl From<&TokenEntry> for EntrySummary {
    fn from(entry: &TokenEntry) -> Self {
        Self {
            resource: entry.resource.clone(),
            client_id: entry.client_id.clone(),
            authority: entry.authority.clone(),
            expires_at: entry.expires_at,
            has_refresh_token: entry.has_refresh_token(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("malformed token cache payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unsupported token cache payload version {0}")]
    UnsupportedVersion(u32),
}

#[derive(Serialize, Deserialize)]
struct PersistedPayload {
    version: u32,
    #[serde(default)]
    entries: Vec<TokenEntry>,
}

/// All cached tokens of one user, at most one entry per [`EntryKey`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenCachePayload {
    entries: HashMap<EntryKey, TokenEntry>,
}

impl TokenCachePayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &EntryKey) -> Option<&TokenEntry> {
        self.entries.get(key)
    }

    /// Insert or replace the entry for its key, returning the replaced one.
    pub fn upsert(&mut self, entry: TokenEntry) -> Option<TokenEntry> {
        self.entries.insert(entry.key(), entry)
    }

    pub fn remove(&mut self, key: &EntryKey) -> Option<TokenEntry> {
        self.entries.remove(key)
    }

    pub fn entries(&self) -> impl Iterator<Item = &TokenEntry> {
        self.entries.values()
    }

    /// Entry of the same client and authority holding a refresh token usable
    /// for another resource. Latest expiry wins.
    pub fn refresh_source(&self, client_id: &str, authority: &str) -> Option<&TokenEntry> {
        let authority = normalize_authority(authority);
        self.entries
            .iter()
            .filter(|(k, e)| {
                k.client_id == client_id && k.authority == authority && e.has_refresh_token()
            })
            .map(|(_, e)| e)
            .max_by_key(|e| e.expires_at)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, PayloadError> {
        let mut entries: Vec<TokenEntry> = self.entries.values().cloned().collect();
        entries.sort_by_key(|e| e.key());
        let doc = PersistedPayload {
            version: PAYLOAD_VERSION,
            entries,
        };
        Ok(serde_json::to_vec(&doc)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PayloadError> {
        let doc: PersistedPayload = serde_json::from_slice(bytes)?;
        if doc.version != PAYLOAD_VERSION {
            return Err(PayloadError::UnsupportedVersion(doc.version));
        }
        let mut payload = Self::new();
        for entry in doc.entries {
            payload.upsert(entry);
        }
        Ok(payload)
    }
}
