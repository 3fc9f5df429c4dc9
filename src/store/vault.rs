use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine};
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use super::ProtectedStore;
use crate::error::StoreError;

/// Vault KV response envelope for a cached blob.
#[derive(Debug, Deserialize)]
struct VaultKvResponse {
    #[serde(default)]
    data: VaultKvData,
}

#[derive(Debug, Deserialize, Default)]
struct VaultKvData {
    #[serde(default)]
    data: VaultBlobData,
}

#[derive(Debug, Deserialize, Default)]
struct VaultBlobData {
    blob: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

/// Vault KV backed store for token-cache blobs.
///
/// Each cache key is one secret at `{prefix}/{key}` holding the blob base64 encoded.
/// Vault KV has no per-secret TTL, so the expiry is written next to the blob
/// and enforced on read.
#[derive(Debug, Clone)]
pub struct VaultStore {
    base_url: String,
    token: String,
    prefix: String,
    http_client: Client,
}

impl VaultStore {
    pub fn new(base_url: &str, token: &str, prefix: &str, timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .context("creating HTTP client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            prefix: prefix.trim_matches('/').to_string(),
            http_client,
        })
    }

    /// Create a Vault store from environment variables.
    ///
    /// Environment variables:
    /// - `VAULT_ADDRESS`: Base URL (e.g., http://127.0.0.1:8200)
    /// - `VAULT_TOKEN`: Authentication token
    /// - `VAULT_TOKEN_CACHE_PREFIX`: KV mount/prefix (e.g., secret/data/token_cache)
    pub fn from_env(timeout: Duration) -> Result<Option<Self>> {
        let base_url = std::env::var("VAULT_ADDRESS").ok();
        let token = std::env::var("VAULT_TOKEN").ok();
        let prefix = std::env::var("VAULT_TOKEN_CACHE_PREFIX").ok();

        match (base_url, token, prefix) {
            (Some(base), Some(tok), Some(pref)) => {
                debug!("Vault store initialized with base_url={}", base);
                Ok(Some(Self::new(&base, &tok, &pref, timeout)?))
            }
            _ => {
                debug!("Vault not configured (missing VAULT_ADDRESS, VAULT_TOKEN, or VAULT_TOKEN_CACHE_PREFIX)");
                Ok(None)
            }
        }
    }

    fn secret_url(&self, key: &str) -> String {
        format!("{}/v1/{}/{}", self.base_url, self.prefix, key)
    }
}

fn transport_error(err: reqwest::Error, timeout_hint: &str) -> StoreError {
    if err.is_timeout() {
        StoreError::Backend(format!("{timeout_hint}: request timed out"))
    } else {
        StoreError::Backend(format!("{timeout_hint}: {err}"))
    }
}

async fn status_error(action: &str, response: reqwest::Response) -> StoreError {
    let status = response.status();
    // Body may echo request data; keep only the status in the error.
    let body_len = response.text().await.map(|b| b.len()).unwrap_or_default();
    StoreError::Backend(format!(
        "Vault {action} failed with status {status} ({body_len} byte body)"
    ))
}

#[async_trait]
impl ProtectedStore for VaultStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let url = self.secret_url(key);
        debug!(cache_key = %key, "Fetching token cache from Vault");

        let response = self
            .http_client
            .get(&url)
            .header("X-Vault-Token", &self.token)
            .send()
            .await
            .map_err(|e| transport_error(e, "sending Vault request"))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(status_error("fetch", response).await);
        }

        let vault_resp: VaultKvResponse = response
            .json()
            .await
            .map_err(|e| StoreError::Backend(format!("parsing Vault response: {e}")))?;

        let data = vault_resp.data.data;
        if data.expires_at.is_some_and(|at| at <= Utc::now()) {
            debug!(cache_key = %key, "Vault entry past its TTL, treating as absent");
            return Ok(None);
        }

        match data.blob {
            Some(encoded) => match general_purpose::STANDARD.decode(&encoded) {
                Ok(bytes) => Ok(Some(bytes)),
                Err(_) => {
                    // Hand the raw bytes up so the cache layer applies its corrupt-blob policy.
                    warn!(cache_key = %key, "Vault blob is not valid base64");
                    Ok(Some(encoded.into_bytes()))
                }
            },
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), StoreError> {
        let url = self.secret_url(key);
        debug!(cache_key = %key, "Storing token cache in Vault");

        let expires_at = ttl
            .and_then(|t| chrono::Duration::from_std(t).ok())
            .map(|t| Utc::now() + t);

        let payload = serde_json::json!({
            "data": {
                "blob": general_purpose::STANDARD.encode(&value),
                "expires_at": expires_at,
            }
        });

        let response = self
            .http_client
            .post(&url)
            .header("X-Vault-Token", &self.token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| transport_error(e, "sending Vault store request"))?;

        if !response.status().is_success() {
            return Err(status_error("store", response).await);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let url = self.secret_url(key);
        debug!(cache_key = %key, "Deleting token cache from Vault");

        let response = self
            .http_client
            .delete(&url)
            .header("X-Vault-Token", &self.token)
            .send()
            .await
            .map_err(|e| transport_error(e, "sending Vault delete request"))?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(status_error("delete", response).await)
    }
}
