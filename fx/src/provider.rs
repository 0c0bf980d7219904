//! Rate provider configuration.

use ratekeeper_common::{ProviderId, TenantId};
use serde::{Deserialize, Serialize};

use crate::error::{FxError, FxResult};

/// How the rate is laid out in a provider's JSON response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseFormat {
    /// `{"rates": {"EUR": 0.92, ...}}`, keyed by quote currency.
    #[default]
    RatesMap,
    /// `{"conversion_rate": 0.92}`.
    ConversionRate,
    /// Any other layout, addressed by an RFC 6901 pointer.
    JsonPointer { pointer: String },
}

/// An external exchange-rate source configured for a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    pub id: ProviderId,
    pub tenant_id: TenantId,
    /// Short stable code, e.g. `OPENRATES`.
    pub code: String,
    pub name: String,
    pub api_url: String,
    pub api_key: Option<String>,
    pub requires_api_key: bool,
    pub is_unlimited: bool,
    /// Calls allowed per calendar month; `None` iff unlimited.
    pub monthly_quota: Option<i64>,
    /// Lower values are tried first.
    pub priority: i32,
    pub is_enabled: bool,
    pub warning_threshold: i64,
    pub critical_threshold: i64,
    #[serde(default)]
    pub response_format: ResponseFormat,
}

impl Provider {
    /// Create an enabled provider with a 1000-call monthly quota.
    pub fn new(tenant_id: TenantId, code: impl Into<String>, api_url: impl Into<String>) -> Self {
        let code = code.into();
        Self {
            id: ProviderId::new(),
            tenant_id,
            name: code.clone(),
            code,
            api_url: api_url.into(),
            api_key: None,
            requires_api_key: false,
            is_unlimited: false,
            monthly_quota: Some(1000),
            priority: 1,
            is_enabled: true,
            warning_threshold: 50,
            critical_threshold: 10,
            response_format: ResponseFormat::default(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the API key and mark it as required.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self.requires_api_key = true;
        self
    }

    pub fn with_quota(mut self, monthly_quota: i64) -> Self {
        self.is_unlimited = false;
        self.monthly_quota = Some(monthly_quota);
        self
    }

    pub fn unlimited(mut self) -> Self {
        self.is_unlimited = true;
        self.monthly_quota = None;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_thresholds(mut self, warning: i64, critical: i64) -> Self {
        self.warning_threshold = warning;
        self.critical_threshold = critical;
        self
    }

    pub fn with_response_format(mut self, format: ResponseFormat) -> Self {
        self.response_format = format;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.is_enabled = false;
        self
    }

    /// Check the configuration invariants.
    pub fn validate(&self) -> FxResult<()> {
        if self.code.trim().is_empty() {
            return Err(FxError::InvalidProvider("provider code is empty".to_string()));
        }

        if self.requires_api_key && self.api_key.as_deref().map_or(true, str::is_empty) {
            return Err(FxError::InvalidProvider(format!(
                "{} requires an API key but none is configured",
                self.code
            )));
        }

        match (self.is_unlimited, self.monthly_quota) {
            (true, Some(_)) => {
                return Err(FxError::InvalidProvider(format!(
                    "{} is unlimited but has a monthly quota",
                    self.code
                )))
            }
            (false, None) => {
                return Err(FxError::InvalidProvider(format!(
                    "{} is metered but has no monthly quota",
                    self.code
                )))
            }
            (false, Some(quota)) if quota <= 0 => {
                return Err(FxError::InvalidProvider(format!(
                    "{} monthly quota must be positive, got {}",
                    self.code, quota
                )))
            }
            _ => {}
        }

        if self.critical_threshold < 0 || self.warning_threshold <= self.critical_threshold {
            return Err(FxError::InvalidProvider(format!(
                "{} thresholds must satisfy warning > critical >= 0 (warning={}, critical={})",
                self.code, self.warning_threshold, self.critical_threshold
            )));
        }

        if let ResponseFormat::JsonPointer { pointer } = &self.response_format {
            if !pointer.is_empty() && !pointer.starts_with('/') {
                return Err(FxError::InvalidProvider(format!(
                    "{} response pointer must start with '/'",
                    self.code
                )));
            }
        }

        Ok(())
    }

    /// Total selection order: priority first, then code, then id, so equal
    /// priorities still resolve the same way on every run.
    pub fn sort_key(&self) -> (i32, &str, ProviderId) {
        (self.priority, self.code.as_str(), self.id)
    }
}

/// Sort providers into selection order.
pub fn order_providers(providers: &mut [Provider]) {
    providers.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant() -> TenantId {
        TenantId::new("shop_eu")
    }

    #[test]
    fn test_default_provider_is_valid() {
        let provider = Provider::new(tenant(), "OPENRATES", "https://api.example.com/latest");
        assert!(provider.validate().is_ok());
    }

    #[test]
    fn test_missing_api_key_rejected() {
        let mut provider = Provider::new(tenant(), "FIXER", "https://fixer.example.com");
        provider.requires_api_key = true;
        assert!(matches!(provider.validate(), Err(FxError::InvalidProvider(_))));

        let provider = provider.with_api_key("secret");
        assert!(provider.validate().is_ok());
    }

    #[test]
    fn test_quota_invariants() {
        let metered = Provider::new(tenant(), "A", "https://a").with_quota(0);
        assert!(metered.validate().is_err());

        let mut unlimited = Provider::new(tenant(), "B", "https://b").unlimited();
        assert!(unlimited.validate().is_ok());
        unlimited.monthly_quota = Some(10);
        assert!(unlimited.validate().is_err());
    }

    #[test]
    fn test_threshold_invariants() {
        let provider = Provider::new(tenant(), "A", "https://a").with_thresholds(10, 10);
        assert!(provider.validate().is_err());

        let provider = Provider::new(tenant(), "A", "https://a").with_thresholds(5, -1);
        assert!(provider.validate().is_err());

        let provider = Provider::new(tenant(), "A", "https://a").with_thresholds(5, 0);
        assert!(provider.validate().is_ok());
    }

    #[test]
    fn test_ordering_breaks_priority_ties_by_code() {
        let mut providers = vec![
            Provider::new(tenant(), "ZETA", "https://z").with_priority(1),
            Provider::new(tenant(), "BETA", "https://b").with_priority(2),
            Provider::new(tenant(), "ALPHA", "https://a").with_priority(1),
        ];
        order_providers(&mut providers);

        let codes: Vec<&str> = providers.iter().map(|p| p.code.as_str()).collect();
        assert_eq!(codes, vec!["ALPHA", "ZETA", "BETA"]);
    }
}
