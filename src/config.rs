use std::fs;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::security::protection::Keyring;

pub const AUTHORITY_ENV: &str = "TOKEN_BROKER_AUTHORITY";
pub const CLIENT_ID_ENV: &str = "TOKEN_BROKER_CLIENT_ID";
pub const CLIENT_SECRET_ENV: &str = "TOKEN_BROKER_CLIENT_SECRET";
pub const PROTECTION_KEYS_ENV: &str = "TOKEN_BROKER_PROTECTION_KEYS";

/// What happens to the cached refresh token when a refresh response omits one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshTokenPolicy {
    /// Keep the previous refresh token.
    #[default]
    ReuseIfAbsent,
    /// The provider rotates on every exchange; an omitted token leaves none.
    Rotate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Issuer base URL, e.g. `https://login.microsoftonline.com/<tenant>`
    #[serde(default)]
    pub authority: String,
    #[serde(default)]
    pub client_id: String,
    /// Usually supplied through the environment rather than the file.
    #[serde(default, skip_serializing)]
    pub client_secret: String,
    /// Overrides `{authority}/oauth2/token`.
    #[serde(default)]
    pub token_endpoint: Option<String>,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_purpose")]
    pub purpose: String,
    /// Tokens expiring within this window are treated as expired.
    #[serde(default = "default_expiry_margin")]
    pub expiry_margin_secs: u64,
    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,
    #[serde(default = "default_token_endpoint_timeout")]
    pub token_endpoint_timeout_ms: u64,
    #[serde(default)]
    pub entry_ttl_secs: Option<u64>,
    #[serde(default)]
    pub refresh_token_policy: RefreshTokenPolicy,
    /// Redeem another resource's refresh token when the requested one has no entry.
    #[serde(default)]
    pub multi_resource_refresh: bool,
}

fn default_namespace() -> String {
    "TokenCache".to_string()
}
fn default_purpose() -> String {
    "token-broker.token-cache.v1".to_string()
}
fn default_expiry_margin() -> u64 {
    300
}
fn default_store_timeout() -> u64 {
    5_000
}
fn default_token_endpoint_timeout() -> u64 {
    10_000
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            authority: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            token_endpoint: None,
            namespace: default_namespace(),
            purpose: default_purpose(),
            expiry_margin_secs: default_expiry_margin(),
            store_timeout_ms: default_store_timeout(),
            token_endpoint_timeout_ms: default_token_endpoint_timeout(),
            entry_ttl_secs: None,
            refresh_token_policy: RefreshTokenPolicy::default(),
            multi_resource_refresh: false,
        }
    }
}

impl BrokerConfig {
    pub fn new(authority: &str, client_id: &str, client_secret: &str) -> Self {
        Self {
            authority: authority.to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            ..Self::default()
        }
    }

    /// Load from a JSON file, apply environment overrides and validate.
    pub fn from_file(path: &str) -> Result<Self> {
        let raw = fs::read_to_string(path).context("reading config file")?;
        let mut cfg: BrokerConfig = serde_json::from_str(&raw).context("parsing JSON")?;
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var(AUTHORITY_ENV) {
            self.authority = v;
        }
        if let Ok(v) = std::env::var(CLIENT_ID_ENV) {
            self.client_id = v;
        }
        if let Ok(v) = std::env::var(CLIENT_SECRET_ENV) {
            self.client_secret = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.authority.trim().is_empty() {
            bail!("authority is required");
        }
        if !self.authority.starts_with("https://") && !self.authority.starts_with("http://") {
            bail!("authority must be an http(s) URL");
        }
        if self.client_id.trim().is_empty() {
            bail!("client_id is required");
        }
        if self.namespace.is_empty() || self.purpose.is_empty() {
            bail!("namespace and purpose must not be empty");
        }
        if self.store_timeout_ms == 0 || self.token_endpoint_timeout_ms == 0 {
            bail!("timeouts must be positive");
        }
        Ok(())
    }

    pub fn token_endpoint(&self) -> String {
        match &self.token_endpoint {
            Some(url) => url.clone(),
            None => format!("{}/oauth2/token", self.authority.trim_end_matches('/')),
        }
    }

    pub fn expiry_margin(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.expiry_margin_secs.min(i32::MAX as u64) as i64)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn token_endpoint_timeout(&self) -> Duration {
        Duration::from_millis(self.token_endpoint_timeout_ms)
    }

    pub fn entry_ttl(&self) -> Option<Duration> {
        self.entry_ttl_secs.map(Duration::from_secs)
    }
}

/// Protection keyring from `TOKEN_BROKER_PROTECTION_KEYS`.
pub fn keyring_from_env() -> Result<Keyring> {
    let keys = std::env::var(PROTECTION_KEYS_ENV)
        .with_context(|| format!("{PROTECTION_KEYS_ENV} is not set"))?;
    Keyring::parse(&keys).context("parsing protection keys")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Mutex, OnceLock};
    use tempfile::NamedTempFile;

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        match ENV_LOCK.get_or_init(|| Mutex::new(())).lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        }
    }

    fn clear_env() {
        for var in [AUTHORITY_ENV, CLIENT_ID_ENV, CLIENT_SECRET_ENV, PROTECTION_KEYS_ENV] {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_config_parsing_with_defaults() {
        let _g = lock_env();
        clear_env();
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{
                "authority": "https://login.example.com/tenant/",
                "client_id": "client-1",
                "client_secret": "from-file"
            }}"#
        )
        .unwrap();

        let config = BrokerConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.client_id, "client-1");
        assert_eq!(config.client_secret, "from-file");
        assert_eq!(config.namespace, "TokenCache");
        assert_eq!(config.expiry_margin_secs, 300);
        assert_eq!(config.refresh_token_policy, RefreshTokenPolicy::ReuseIfAbsent);
        assert!(!config.multi_resource_refresh);
        assert_eq!(
            config.token_endpoint(),
            "https://login.example.com/tenant/oauth2/token"
        );
    }

    #[test]
    fn test_config_env_overrides() {
        let _g = lock_env();
        clear_env();
        std::env::set_var(CLIENT_SECRET_ENV, "from-env");
        std::env::set_var(AUTHORITY_ENV, "https://idp.example.org");

        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{
                "authority": "https://login.example.com/tenant",
                "client_id": "client-1",
                "refresh_token_policy": "rotate",
                "token_endpoint": "https://idp.example.org/token",
                "entry_ttl_secs": 86400
            }}"#
        )
        .unwrap();

        let config = BrokerConfig::from_file(file.path().to_str().unwrap()).unwrap();
        clear_env();

        assert_eq!(config.client_secret, "from-env");
        assert_eq!(config.authority, "https://idp.example.org");
        assert_eq!(config.refresh_token_policy, RefreshTokenPolicy::Rotate);
        assert_eq!(config.token_endpoint(), "https://idp.example.org/token");
        assert_eq!(config.entry_ttl(), Some(Duration::from_secs(86400)));
    }

    #[test]
    fn test_config_missing_file() {
        let result = BrokerConfig::from_file("/nonexistent/path/broker.json");
        assert!(result.is_err());
    }

    #[test]
    fn test_config_invalid_json() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{{invalid json").unwrap();
        let result = BrokerConfig::from_file(file.path().to_str().unwrap());
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_incomplete_config() {
        assert!(BrokerConfig::default().validate().is_err());
        assert!(BrokerConfig::new("login.example.com", "c", "").validate().is_err());
        assert!(BrokerConfig::new("https://login.example.com", "", "").validate().is_err());
        assert!(BrokerConfig::new("https://login.example.com", "c", "").validate().is_ok());
    }

    #[test]
    fn test_secret_not_serialized() {
        let config = BrokerConfig::new("https://login.example.com", "c", "hunter2");
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("hunter2"));
    }

    #[test]
    fn test_keyring_from_env() {
        let _g = lock_env();
        clear_env();
        assert!(keyring_from_env().is_err());

        let key = crate::security::protection::generate_key().unwrap();
        std::env::set_var(PROTECTION_KEYS_ENV, format!("primary:{key}"));
        let ring = keyring_from_env().unwrap();
        clear_env();
        assert_eq!(ring.current_key_id(), "primary");
    }
}
