//! JSON catalog of tenants and their providers, loaded at startup.
//!
//! ```json
//! {
//!   "tenants": [{
//!     "tenant_id": "shop_eu",
//!     "base": "USD",
//!     "quote": "EUR",
//!     "providers": [{
//!       "code": "OPENRATES",
//!       "api_url": "https://api.openrates.example/latest?base={base}&symbols={quote}",
//!       "monthly_quota": 1000,
//!       "priority": 1
//!     }]
//!   }]
//! }
//! ```

use std::collections::{HashMap, HashSet};
use std::path::Path;

use ratekeeper_common::{Currency, CurrencyPair, ProviderId, TenantId};
use ratekeeper_fx::{
    ConfigError, FailoverOrchestrator, FxResult, Provider, RateMode, ResponseFormat,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

fn default_true() -> bool {
    true
}

fn default_priority() -> i32 {
    1
}

fn default_warning() -> i64 {
    50
}

fn default_critical() -> i64 {
    10
}

/// A provider as written in the catalog file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    /// Stable id. When absent, the id of an already registered provider
    /// with the same code is reused, otherwise a new one is assigned.
    #[serde(default)]
    pub id: Option<ProviderId>,
    pub code: String,
    #[serde(default)]
    pub name: Option<String>,
    pub api_url: String,
    /// Literal API key. Prefer `api_key_env` outside of local setups.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Calls per month; absent means unlimited.
    #[serde(default)]
    pub monthly_quota: Option<i64>,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_warning")]
    pub warning_threshold: i64,
    #[serde(default = "default_critical")]
    pub critical_threshold: i64,
    #[serde(default)]
    pub response_format: ResponseFormat,
}

impl ProviderEntry {
    /// Build the provider, resolving the API key through `lookup_env`.
    pub fn to_provider(
        &self,
        tenant: &TenantId,
        existing: Option<ProviderId>,
        lookup_env: impl Fn(&str) -> Option<String>,
    ) -> Provider {
        let mut provider = Provider::new(tenant.clone(), self.code.clone(), self.api_url.clone())
            .with_priority(self.priority)
            .with_thresholds(self.warning_threshold, self.critical_threshold)
            .with_response_format(self.response_format.clone());

        if let Some(id) = self.id.or(existing) {
            provider.id = id;
        }
        if let Some(name) = &self.name {
            provider = provider.with_name(name.clone());
        }

        provider = match self.monthly_quota {
            Some(quota) => provider.with_quota(quota),
            None => provider.unlimited(),
        };

        let key = self
            .api_key
            .clone()
            .or_else(|| self.api_key_env.as_deref().and_then(&lookup_env));
        match key {
            Some(key) => provider = provider.with_api_key(key),
            None if self.api_key_env.is_some() => {
                // Leave the key unset so validation names the provider.
                provider.requires_api_key = true;
            }
            None => {}
        }

        if !self.enabled {
            provider = provider.disabled();
        }

        provider
    }
}

/// One tenant's currency pair, optional manual rate and providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantEntry {
    pub tenant_id: TenantId,
    #[serde(default)]
    pub base: Option<String>,
    #[serde(default)]
    pub quote: Option<String>,
    /// Pins the tenant to manual mode with this rate.
    #[serde(default)]
    pub manual_rate: Option<Decimal>,
    #[serde(default)]
    pub providers: Vec<ProviderEntry>,
}

impl TenantEntry {
    fn pair(&self) -> Option<CurrencyPair> {
        match (&self.base, &self.quote) {
            (None, None) => None,
            (base, quote) => {
                let default = CurrencyPair::default();
                Some(CurrencyPair::new(
                    base.as_deref().map(Currency::new).unwrap_or(default.base),
                    quote.as_deref().map(Currency::new).unwrap_or(default.quote),
                ))
            }
        }
    }
}

/// Startup catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub tenants: Vec<TenantEntry>,
}

impl Catalog {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let catalog: Catalog = serde_json::from_str(raw)
            .map_err(|e| ConfigError(format!("invalid catalog: {}", e)))?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError(format!("cannot read catalog {}: {}", path.display(), e)))?;
        Self::from_json(&raw)
    }

    /// Structural checks that don't need the registry.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for tenant in &self.tenants {
            if !tenant.tenant_id.is_valid() {
                return Err(ConfigError(format!(
                    "invalid tenant id {:?}",
                    tenant.tenant_id.as_str()
                )));
            }
            if !seen.insert(&tenant.tenant_id) {
                return Err(ConfigError(format!(
                    "tenant {} listed twice",
                    tenant.tenant_id
                )));
            }

            let mut codes = HashSet::new();
            for provider in &tenant.providers {
                if !codes.insert(provider.code.as_str()) {
                    return Err(ConfigError(format!(
                        "provider {} listed twice for tenant {}",
                        provider.code, tenant.tenant_id
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn tenant_ids(&self) -> Vec<TenantId> {
        self.tenants.iter().map(|t| t.tenant_id.clone()).collect()
    }

    /// Register every provider and apply tenant settings.
    pub async fn apply(&self, orchestrator: &FailoverOrchestrator) -> FxResult<Vec<TenantId>> {
        self.apply_with_env(orchestrator, |name| std::env::var(name).ok())
            .await
    }

    pub async fn apply_with_env(
        &self,
        orchestrator: &FailoverOrchestrator,
        lookup_env: impl Fn(&str) -> Option<String>,
    ) -> FxResult<Vec<TenantId>> {
        let registry = orchestrator.registry();

        for tenant in &self.tenants {
            let existing: HashMap<String, ProviderId> = registry
                .all_providers(&tenant.tenant_id)
                .await?
                .into_iter()
                .map(|p| (p.code, p.id))
                .collect();

            for entry in &tenant.providers {
                let provider = entry.to_provider(
                    &tenant.tenant_id,
                    existing.get(&entry.code).copied(),
                    &lookup_env,
                );
                if provider.requires_api_key && provider.api_key.is_none() {
                    warn!(
                        tenant = %tenant.tenant_id,
                        provider = %entry.code,
                        env = ?entry.api_key_env,
                        "API key environment variable not set"
                    );
                }
                registry.register(provider).await?;
            }

            if let Some(pair) = tenant.pair() {
                orchestrator.set_pair(&tenant.tenant_id, pair).await?;
            }

            if let Some(rate) = tenant.manual_rate {
                let setting = orchestrator.setting(&tenant.tenant_id).await?;
                if setting.mode == RateMode::Manual && setting.manual_rate == Some(rate) {
                    debug!(tenant = %tenant.tenant_id, rate = %rate, "Manual rate unchanged");
                } else {
                    orchestrator.set_manual_rate(&tenant.tenant_id, rate).await?;
                }
            }

            info!(
                tenant = %tenant.tenant_id,
                providers = tenant.providers.len(),
                "Tenant catalog applied"
            );
        }

        Ok(self.tenant_ids())
    }
}
