//! Rate engine error types.

use ratekeeper_common::{PersistenceError, ProviderId, TenantId};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors surfaced to callers of the rate engine.
#[derive(Debug, Error)]
pub enum FxError {
    /// No provider produced a rate and no cached rate was ever recorded.
    #[error("No exchange rate available for tenant {tenant}")]
    RateUnavailable { tenant: TenantId },

    /// A rate was zero, negative or otherwise unusable.
    #[error("Invalid rate: {0}")]
    InvalidRate(String),

    /// Provider configuration violates an invariant.
    #[error("Invalid provider configuration: {0}")]
    InvalidProvider(String),

    /// Tenant setting change rejected.
    #[error("Invalid setting: {0}")]
    InvalidSetting(String),

    /// Provider not found in the registry.
    #[error("Provider not found: {0}")]
    ProviderNotFound(ProviderId),

    /// A read the acquisition run depends on failed.
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

impl FxError {
    /// Get error code for logs and API payloads.
    pub fn error_code(&self) -> &'static str {
        match self {
            FxError::RateUnavailable { .. } => "RATE_UNAVAILABLE",
            FxError::InvalidRate(_) => "INVALID_RATE",
            FxError::InvalidProvider(_) => "INVALID_PROVIDER",
            FxError::InvalidSetting(_) => "INVALID_SETTING",
            FxError::ProviderNotFound(_) => "PROVIDER_NOT_FOUND",
            FxError::Persistence(_) => "PERSISTENCE_ERROR",
        }
    }
}

/// Result type for rate engine operations.
pub type FxResult<T> = Result<T, FxError>;

/// Classification of a failed provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    NetworkTimeout,
    InvalidJson,
    RateLimit,
    Authentication,
    InvalidResponse,
    ConnectionFailed,
}

impl FetchErrorKind {
    /// Only transient failures are retried against the same provider;
    /// everything else moves straight on to failover.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchErrorKind::NetworkTimeout
                | FetchErrorKind::ConnectionFailed
                | FetchErrorKind::RateLimit
        )
    }

    /// Whether the request got as far as the provider.
    ///
    /// A refused or unreachable connection never hits the provider's meter.
    pub fn reached_provider(&self) -> bool {
        !matches!(self, FetchErrorKind::ConnectionFailed)
    }

    /// Stable code, used as the provider switch reason.
    pub fn code(&self) -> &'static str {
        match self {
            FetchErrorKind::NetworkTimeout => "network_timeout",
            FetchErrorKind::InvalidJson => "invalid_json",
            FetchErrorKind::RateLimit => "rate_limit",
            FetchErrorKind::Authentication => "authentication",
            FetchErrorKind::InvalidResponse => "invalid_response",
            FetchErrorKind::ConnectionFailed => "connection_failed",
        }
    }
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A failed call to a rate provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} from provider {provider}: {message}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub provider: String,
    pub message: String,
}

impl FetchError {
    /// Create a new fetch error.
    pub fn new(kind: FetchErrorKind, provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Invalid configuration value.
#[derive(Debug, Clone, Error)]
#[error("Invalid configuration: {0}")]
pub struct ConfigError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(FetchErrorKind::NetworkTimeout.is_retryable());
        assert!(FetchErrorKind::ConnectionFailed.is_retryable());
        assert!(FetchErrorKind::RateLimit.is_retryable());
        assert!(!FetchErrorKind::InvalidJson.is_retryable());
        assert!(!FetchErrorKind::Authentication.is_retryable());
        assert!(!FetchErrorKind::InvalidResponse.is_retryable());
    }

    #[test]
    fn test_connection_failure_never_reaches_provider() {
        assert!(!FetchErrorKind::ConnectionFailed.reached_provider());
        assert!(FetchErrorKind::Authentication.reached_provider());
        assert!(FetchErrorKind::NetworkTimeout.reached_provider());
    }

    #[test]
    fn test_fetch_error_display() {
        let error = FetchError::new(FetchErrorKind::RateLimit, "OPENRATES", "HTTP 429");
        assert_eq!(error.to_string(), "rate_limit from provider OPENRATES: HTTP 429");
    }

    #[test]
    fn test_persistence_error_converts() {
        let error: FxError = PersistenceError::Deadlock("quota row".into()).into();
        assert_eq!(error.error_code(), "PERSISTENCE_ERROR");
    }
}
