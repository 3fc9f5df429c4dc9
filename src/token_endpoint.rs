//! Refresh-token grant against the identity provider's token endpoint.

use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Deserializer};
use tracing::{debug, warn};

use crate::error::RefreshError;

/// Lifetime assumed when the provider reports no expiry.
const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

/// Upper bound applied to reported lifetimes (one year).
const MAX_EXPIRES_IN_SECS: u64 = 365 * 24 * 3600;

/// Maximum length for error response body to log
const MAX_ERROR_BODY_LOG_LENGTH: usize = 500;

/// OAuth error codes meaning the refresh token can never succeed again.
const INVALID_GRANT_CODES: &[&str] = &["invalid_grant", "interaction_required", "consent_required"];

pub struct RefreshRequest<'a> {
    pub token_endpoint: &'a str,
    pub resource: &'a str,
    pub client_id: &'a str,
    pub client_secret: &'a str,
    pub refresh_token: &'a str,
    pub correlation_id: &'a str,
}

impl fmt::Debug for RefreshRequest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshRequest")
            .field("token_endpoint", &self.token_endpoint)
            .field("resource", &self.resource)
            .field("client_id", &self.client_id)
            .field("correlation_id", &self.correlation_id)
            .finish_non_exhaustive()
    }
}

/// Successful token endpoint response.
#[derive(Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub expires_in: Option<u64>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub expires_on: Option<u64>,
    #[serde(default)]
    pub token_type: Option<String>,
}

impl TokenResponse {
    pub fn new(access_token: &str, refresh_token: Option<&str>, expires_in: u64) -> Self {
        Self {
            access_token: access_token.to_string(),
            refresh_token: refresh_token.map(str::to_string),
            expires_in: Some(expires_in),
            expires_on: None,
            token_type: Some("Bearer".to_string()),
        }
    }

    /// Absolute expiry: `expires_in` relative to `now`, else `expires_on`, else one hour.
    pub fn expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        if let Some(secs) = self.expires_in {
            return now + chrono::Duration::seconds(secs.min(MAX_EXPIRES_IN_SECS) as i64);
        }
        if let Some(Some(at)) = self
            .expires_on
            .map(|epoch| Utc.timestamp_opt(epoch as i64, 0).single())
        {
            return at;
        }
        now + chrono::Duration::seconds(DEFAULT_EXPIRES_IN_SECS as i64)
    }
}

impl fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenResponse")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_in", &self.expires_in)
            .field("expires_on", &self.expires_on)
            .field("token_type", &self.token_type)
            .finish()
    }
}

/// Accepts `3600` as well as `"3600"`; some providers quote numeric fields.
fn lenient_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrString {
        Num(u64),
        Str(String),
    }

    match Option::<NumOrString>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumOrString::Num(n)) => Ok(Some(n)),
        Some(NumOrString::Str(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Deserialize, Default)]
struct OAuthErrorBody {
    #[serde(default)]
    error: Option<String>,
}

#[async_trait]
pub trait TokenEndpoint: Send + Sync + fmt::Debug {
    async fn redeem_refresh_token(
        &self,
        request: &RefreshRequest<'_>,
    ) -> Result<TokenResponse, RefreshError>;
}

/// Fields whose values must never reach the logs.
const SECRET_FIELDS: &[&str] = &["access_token", "refresh_token", "id_token", "client_secret"];

/// Redact token fields, then truncate, before a provider body reaches the logs.
fn sanitize_response_for_logging(body: &str) -> String {
    let redacted = match serde_json::from_str::<serde_json::Value>(body) {
        Ok(mut json) => {
            redact_json(&mut json);
            json.to_string()
        }
        Err(_) => redact_text(body),
    };

    if redacted.len() <= MAX_ERROR_BODY_LOG_LENGTH {
        return redacted;
    }
    let cut = (0..=MAX_ERROR_BODY_LOG_LENGTH)
        .rev()
        .find(|i| redacted.is_char_boundary(*i))
        .unwrap_or(0);
    format!(
        "{}... [truncated, {} total bytes]",
        &redacted[..cut],
        body.len()
    )
}

fn redact_json(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (name, field) in map.iter_mut() {
                if SECRET_FIELDS.contains(&name.as_str()) {
                    *field = serde_json::json!("[REDACTED]");
                } else {
                    redact_json(field);
                }
            }
        }
        serde_json::Value::Array(items) => items.iter_mut().for_each(redact_json),
        _ => {}
    }
}

/// Masks `"access_token":"..."` and `access_token=...` shapes in bodies that are not JSON.
fn redact_text(body: &str) -> String {
    static SECRET_RE: OnceLock<Option<Regex>> = OnceLock::new();
    let regex = SECRET_RE.get_or_init(|| {
        Regex::new(
            r#"(?i)("?(?:access_token|refresh_token|id_token|client_secret)"?)(\s*[=:]\s*)("[^"]*"?|[^\s&,}"]+)"#,
        )
        .ok()
    });

    match regex {
        Some(regex) => regex
            .replace_all(body, |caps: &regex::Captures| {
                format!("{}{}[REDACTED]", &caps[1], &caps[2])
            })
            .into_owned(),
        None => format!("[{} byte body withheld]", body.len()),
    }
}

fn classify_failure(status: StatusCode, body: &str) -> RefreshError {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        return RefreshError::Unavailable(format!("HTTP {status}"));
    }

    let code = serde_json::from_str::<OAuthErrorBody>(body)
        .unwrap_or_default()
        .error
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));

    if INVALID_GRANT_CODES.contains(&code.as_str()) {
        RefreshError::InvalidGrant(code)
    } else {
        RefreshError::Rejected(code)
    }
}

/// Form-encoded refresh-token grant over HTTPS.
#[derive(Debug, Clone)]
pub struct HttpTokenEndpoint {
    http_client: Client,
    timeout: Duration,
}

impl HttpTokenEndpoint {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .context("building token endpoint http client")?;
        Ok(Self {
            http_client,
            timeout,
        })
    }
}

#[async_trait]
impl TokenEndpoint for HttpTokenEndpoint {
    async fn redeem_refresh_token(
        &self,
        request: &RefreshRequest<'_>,
    ) -> Result<TokenResponse, RefreshError> {
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", request.refresh_token),
            ("client_id", request.client_id),
            ("resource", request.resource),
        ];
        if !request.client_secret.is_empty() {
            form.push(("client_secret", request.client_secret));
        }

        debug!(
            url = %request.token_endpoint,
            resource = %request.resource,
            correlation_id = %request.correlation_id,
            "redeeming refresh token"
        );

        let send = self
            .http_client
            .post(request.token_endpoint)
            .header("client-request-id", request.correlation_id)
            .header("return-client-request-id", "true")
            .form(&form)
            .send();

        let response = match tokio::time::timeout(self.timeout, send).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) if e.is_timeout() => {
                return Err(RefreshError::Unavailable("request timed out".to_string()))
            }
            Ok(Err(e)) => return Err(RefreshError::Unavailable(e.to_string())),
            Err(_) => return Err(RefreshError::Unavailable("request timed out".to_string())),
        };

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RefreshError::Unavailable(format!("reading token response: {e}")))?;

        if !status.is_success() {
            let sanitized_body = sanitize_response_for_logging(&body);
            warn!(
                status = %status,
                body = %sanitized_body,
                correlation_id = %request.correlation_id,
                "Token refresh failed"
            );
            return Err(classify_failure(status, &body));
        }

        let token = serde_json::from_str::<TokenResponse>(&body).map_err(|e| {
            warn!(
                error = %e,
                body = %sanitize_response_for_logging(&body),
                correlation_id = %request.correlation_id,
                "Failed to parse refresh token response"
            );
            RefreshError::Unavailable(format!("malformed token response: {e}"))
        })?;

        if token.access_token.trim().is_empty() {
            warn!(
                correlation_id = %request.correlation_id,
                "Token endpoint returned an empty access token"
            );
            return Err(RefreshError::Unavailable(
                "malformed token response: empty access_token".to_string(),
            ));
        }
        Ok(token)
    }
}
