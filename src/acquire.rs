//! Silent token acquisition.
//!
//! Every call runs `load -> decide -> (refresh) -> persist -> return` against
//! freshly loaded state. Nothing is shared between calls except the injected
//! collaborators, so concurrent calls for the same user may both refresh; the
//! last write wins in the store.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{
    EntryKey, EntrySummary, TokenCacheAdapter, TokenCachePayload, TokenEntry, UserIdentity,
};
use crate::config::{BrokerConfig, RefreshTokenPolicy};
use crate::error::{AcquisitionFailure, BrokerError, RefreshError};
use crate::security::audit_log::AuditLogger;
use crate::security::protection::Keyring;
use crate::store::ProtectedStore;
use crate::token_endpoint::{HttpTokenEndpoint, RefreshRequest, TokenEndpoint, TokenResponse};

/// An access token validated as unexpired when it was handed out.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Application identity used for refresh exchanges.
#[derive(Clone)]
pub struct ClientCredential {
    pub client_id: String,
    pub client_secret: String,
}

impl fmt::Debug for ClientCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredential")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// Outcome of inspecting the cached payload for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Usable cached token, no network call needed.
    Hit(TokenEntry),
    /// Redeem `refresh_token` held by the entry at `source`.
    Refresh {
        source: EntryKey,
        refresh_token: String,
    },
    Fail(AcquisitionFailure),
}

/// Pick what to do for `key` given the cached state at `now`.
pub fn decide(
    payload: &TokenCachePayload,
    key: &EntryKey,
    now: DateTime<Utc>,
    margin: Duration,
    multi_resource_refresh: bool,
) -> Decision {
    match payload.get(key) {
        Some(entry) if !entry.is_expired_at(now, margin) => Decision::Hit(entry.clone()),
        Some(entry) => match entry.refresh_token.as_deref() {
            Some(rt) if !rt.is_empty() => Decision::Refresh {
                source: key.clone(),
                refresh_token: rt.to_string(),
            },
            _ => Decision::Fail(AcquisitionFailure::NoRefreshToken),
        },
        None if multi_resource_refresh => {
            match payload.refresh_source(&key.client_id, &key.authority) {
                Some(source) => Decision::Refresh {
                    source: source.key(),
                    refresh_token: source.refresh_token.clone().unwrap_or_default(),
                },
                None => Decision::Fail(AcquisitionFailure::NoCachedToken),
            }
        }
        None => Decision::Fail(AcquisitionFailure::NoCachedToken),
    }
}

/// Build the replacement entry for a successful exchange.
pub fn entry_from_response(
    key: &EntryKey,
    response: &TokenResponse,
    previous_refresh_token: Option<&str>,
    policy: RefreshTokenPolicy,
    now: DateTime<Utc>,
) -> TokenEntry {
    let refresh_token = match policy {
        RefreshTokenPolicy::ReuseIfAbsent => response
            .refresh_token
            .clone()
            .filter(|rt| !rt.is_empty())
            .or_else(|| previous_refresh_token.map(str::to_string)),
        RefreshTokenPolicy::Rotate => response.refresh_token.clone().filter(|rt| !rt.is_empty()),
    };
    TokenEntry {
        resource: key.resource.clone(),
        client_id: key.client_id.clone(),
        authority: key.authority.clone(),
        access_token: response.access_token.clone(),
        refresh_token,
        expires_at: response.expires_at(now),
    }
}

/// Hands out bearer tokens for signed-in users without interaction.
#[derive(Debug, Clone)]
pub struct TokenBroker {
    cache: TokenCacheAdapter,
    endpoint: Arc<dyn TokenEndpoint>,
    credential: ClientCredential,
    authority: String,
    token_endpoint_url: String,
    expiry_margin: Duration,
    refresh_token_policy: RefreshTokenPolicy,
    multi_resource_refresh: bool,
    audit: AuditLogger,
}

impl TokenBroker {
    pub fn new(
        config: &BrokerConfig,
        store: Arc<dyn ProtectedStore>,
        keyring: &Keyring,
        endpoint: Arc<dyn TokenEndpoint>,
    ) -> Result<Self, BrokerError> {
        let protector = keyring
            .protector(&config.purpose)
            .map_err(|e| BrokerError::Configuration(e.to_string()))?;
        let protector = Arc::new(protector);
        let cache = TokenCacheAdapter::new(store, protector, &config.namespace, config.store_timeout())
            .with_entry_ttl(config.entry_ttl());

        Ok(Self {
            cache,
            endpoint,
            credential: ClientCredential {
                client_id: config.client_id.clone(),
                client_secret: config.client_secret.clone(),
            },
            authority: config.authority.clone(),
            token_endpoint_url: config.token_endpoint(),
            expiry_margin: config.expiry_margin(),
            refresh_token_policy: config.refresh_token_policy,
            multi_resource_refresh: config.multi_resource_refresh,
            audit: AuditLogger::new(),
        })
    }

    /// Broker talking to the configured token endpoint over HTTPS.
    pub fn with_http_endpoint(
        config: &BrokerConfig,
        store: Arc<dyn ProtectedStore>,
        keyring: &Keyring,
    ) -> Result<Self, BrokerError> {
        config
            .validate()
            .map_err(|e| BrokerError::Configuration(e.to_string()))?;
        let endpoint = HttpTokenEndpoint::new(config.token_endpoint_timeout())
            .map_err(|e| BrokerError::Configuration(e.to_string()))?;
        Self::new(config, store, keyring, Arc::new(endpoint))
    }

    pub fn cache(&self) -> &TokenCacheAdapter {
        &self.cache
    }

    fn entry_key(&self, resource: &str) -> EntryKey {
        EntryKey::new(resource, &self.credential.client_id, &self.authority)
    }

    /// A valid bearer token for `identity` against `resource`, refreshing if needed.
    pub async fn acquire_token(
        &self,
        identity: &UserIdentity,
        resource: &str,
    ) -> Result<AccessToken, BrokerError> {
        let correlation_id = Uuid::new_v4().to_string();
        let cache_key = self.cache.cache_key(identity);
        let key = self.entry_key(resource);

        let mut payload = self.cache.load(identity).await?;
        let now = Utc::now();

        match decide(&payload, &key, now, self.expiry_margin, self.multi_resource_refresh) {
            Decision::Hit(entry) => {
                self.audit.cache_hit(cache_key.as_str(), resource, &correlation_id);
                Ok(AccessToken {
                    token: entry.access_token,
                    expires_at: entry.expires_at,
                })
            }
            Decision::Fail(reason) => {
                debug!(
                    cache_key = %cache_key,
                    resource = %resource,
                    correlation_id = %correlation_id,
                    %reason,
                    "silent acquisition not possible"
                );
                Err(BrokerError::silent(reason))
            }
            Decision::Refresh {
                source,
                refresh_token,
            } => {
                let request = RefreshRequest {
                    token_endpoint: &self.token_endpoint_url,
                    resource,
                    client_id: &self.credential.client_id,
                    client_secret: &self.credential.client_secret,
                    refresh_token: &refresh_token,
                    correlation_id: &correlation_id,
                };

                match self.endpoint.redeem_refresh_token(&request).await {
                    Ok(response) if response.access_token.trim().is_empty() => {
                        let msg = "token endpoint returned an empty access token".to_string();
                        self.audit.token_service_unavailable(
                            cache_key.as_str(),
                            resource,
                            &correlation_id,
                            &msg,
                        );
                        Err(BrokerError::TokenServiceUnavailable(msg))
                    }
                    Ok(response) => {
                        let issued_at = Utc::now();
                        let entry = entry_from_response(
                            &key,
                            &response,
                            Some(refresh_token.as_str()),
                            self.refresh_token_policy,
                            issued_at,
                        );
                        if entry.expires_at <= issued_at {
                            return Err(BrokerError::TokenServiceUnavailable(
                                "token endpoint issued an already expired token".to_string(),
                            ));
                        }

                        let rotated = entry.refresh_token.as_deref() != Some(refresh_token.as_str());
                        if source != key && rotated {
                            // The redeemed token belongs to another entry; keep that entry on the new family.
                            if let Some(mut origin) = payload.get(&source).cloned() {
                                origin.refresh_token = entry.refresh_token.clone();
                                payload.upsert(origin);
                            }
                        }
                        let token = AccessToken {
                            token: entry.access_token.clone(),
                            expires_at: entry.expires_at,
                        };
                        payload.upsert(entry);
                        self.cache.on_payload_changed(identity, &payload).await?;

                        self.audit
                            .token_refreshed(cache_key.as_str(), resource, &correlation_id, rotated);
                        Ok(token)
                    }
                    Err(RefreshError::InvalidGrant(code)) => {
                        self.audit
                            .refresh_rejected(cache_key.as_str(), resource, &correlation_id, &code);
                        payload.remove(&source);
                        match self.cache.on_payload_changed(identity, &payload).await {
                            Ok(()) => self.audit.entry_removed(
                                cache_key.as_str(),
                                &source.resource,
                                &correlation_id,
                            ),
                            Err(e) => warn!(
                                cache_key = %cache_key,
                                correlation_id = %correlation_id,
                                error = %e,
                                "could not remove revoked entry, it will be retried on next use"
                            ),
                        }
                        Err(BrokerError::silent(AcquisitionFailure::InvalidGrant))
                    }
                    Err(RefreshError::Rejected(code)) => {
                        self.audit
                            .refresh_rejected(cache_key.as_str(), resource, &correlation_id, &code);
                        Err(BrokerError::silent(AcquisitionFailure::Rejected))
                    }
                    Err(RefreshError::Unavailable(msg)) => {
                        self.audit.token_service_unavailable(
                            cache_key.as_str(),
                            resource,
                            &correlation_id,
                            &msg,
                        );
                        Err(BrokerError::TokenServiceUnavailable(msg))
                    }
                }
            }
        }
    }

    /// Record a token pair obtained by an interactive flow elsewhere.
    pub async fn store_token(
        &self,
        identity: &UserIdentity,
        resource: &str,
        response: &TokenResponse,
    ) -> Result<(), BrokerError> {
        if response.access_token.is_empty() {
            return Err(BrokerError::Configuration(
                "token response has an empty access token".to_string(),
            ));
        }
        let key = self.entry_key(resource);
        let mut payload = self.cache.load(identity).await?;
        let entry = entry_from_response(
            &key,
            response,
            None,
            self.refresh_token_policy,
            Utc::now(),
        );
        payload.upsert(entry);
        self.cache.on_payload_changed(identity, &payload).await?;

        let cache_key = self.cache.cache_key(identity);
        self.audit.token_stored(cache_key.as_str(), resource);
        Ok(())
    }

    /// Forget every token cached for `identity`.
    pub async fn sign_out(&self, identity: &UserIdentity) -> Result<(), BrokerError> {
        self.cache.clear(identity).await?;
        info!(cache_key = %self.cache.cache_key(identity), "user signed out of token cache");
        Ok(())
    }

    /// Token-free listing of what is cached for `identity`.
    pub async fn cached_entries(
        &self,
        identity: &UserIdentity,
    ) -> Result<Vec<EntrySummary>, BrokerError> {
        let payload = self.cache.load(identity).await?;
        let mut entries: Vec<EntrySummary> = payload.entries().map(EntrySummary::from).collect();
        entries.sort_by(|a, b| a.resource.cmp(&b.resource));
        Ok(entries)
    }
}
