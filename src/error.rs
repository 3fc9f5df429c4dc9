use std::fmt;

use thiserror::Error;

/// Why a token could not be obtained without user interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionFailure {
    /// Nothing cached for the requested resource.
    NoCachedToken,
    /// An entry exists but it is expired and carries no refresh token.
    NoRefreshToken,
    /// The provider rejected the refresh token as invalid, expired or revoked.
    InvalidGrant,
    /// The provider refused the exchange for another reason (e.g. `invalid_client`).
    Rejected,
}

impl fmt::Display for AcquisitionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AcquisitionFailure::NoCachedToken => "no cached token",
            AcquisitionFailure::NoRefreshToken => "expired token has no refresh token",
            AcquisitionFailure::InvalidGrant => "refresh token rejected as invalid grant",
            AcquisitionFailure::Rejected => "token endpoint rejected the request",
        };
        f.write_str(s)
    }
}

/// Errors surfaced to callers of the broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("token store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("silent token acquisition failed: {reason}")]
    SilentAcquisitionFailed { reason: AcquisitionFailure },

    #[error("token service unavailable: {0}")]
    TokenServiceUnavailable(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),
}

impl BrokerError {
    pub fn silent(reason: AcquisitionFailure) -> Self {
        BrokerError::SilentAcquisitionFailed { reason }
    }

    /// Transient failures the caller may retry without forcing a new login.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrokerError::StoreUnavailable(_) | BrokerError::TokenServiceUnavailable(_)
        )
    }

    /// Failures that can only be resolved by an interactive sign-in.
    pub fn requires_interaction(&self) -> bool {
        matches!(self, BrokerError::SilentAcquisitionFailed { .. })
    }
}

impl From<StoreError> for BrokerError {
    fn from(err: StoreError) -> Self {
        BrokerError::StoreUnavailable(err.to_string())
    }
}

/// Failures of the protected key/value store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store operation timed out after {0}ms")]
    Timeout(u64),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Failures of the encryption boundary.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtectionError {
    #[error("decryption failed: {0}")]
    DecryptionFailed(&'static str),

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("invalid protection key: {0}")]
    InvalidKey(String),
}

/// Outcome classes of a refresh-token exchange that did not succeed.
#[derive(Debug, Error)]
pub enum RefreshError {
    /// `invalid_grant` and equivalents; the refresh token is unusable.
    #[error("invalid grant: {0}")]
    InvalidGrant(String),

    /// The provider refused the request for a reason not tied to the grant.
    #[error("rejected by token endpoint: {0}")]
    Rejected(String),

    /// Network failure, timeout, throttling or a 5xx response.
    #[error("token endpoint unavailable: {0}")]
    Unavailable(String),
}
