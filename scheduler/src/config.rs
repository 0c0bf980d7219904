//! Scheduler configuration.

use std::path::PathBuf;
use std::time::Duration;

use ratekeeper_common::TenantId;
use ratekeeper_fx::{ConfigError, OrchestratorConfig, RateCacheConfig};

/// Main scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Time between refresh passes over all tenants.
    pub tick_interval: Duration,
    /// JSON provider catalog to load at startup.
    pub catalog_path: Option<PathBuf>,
    /// Postgres URL; the in-memory store is used when absent.
    pub database_url: Option<String>,
    /// Tenants to refresh. Empty means every tenant in the catalog.
    pub tenants: Vec<TenantId>,
    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Acquisition settings.
    pub orchestrator: OrchestratorConfig,
    /// Rate cache settings.
    pub cache: RateCacheConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(900),
            catalog_path: None,
            database_url: None,
            tenants: Vec::new(),
            log_level: "info".to_string(),
            orchestrator: OrchestratorConfig::default(),
            cache: RateCacheConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self {
            orchestrator: OrchestratorConfig::from_env(),
            cache: RateCacheConfig::from_env(),
            ..Self::default()
        };

        if let Ok(secs) = std::env::var("RATEKEEPER_TICK_SECS") {
            if let Ok(secs) = secs.parse() {
                config.tick_interval = Duration::from_secs(secs);
            }
        }

        if let Ok(path) = std::env::var("RATEKEEPER_CATALOG") {
            config.catalog_path = Some(PathBuf::from(path));
        }

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = Some(url);
        }

        if let Ok(tenants) = std::env::var("RATEKEEPER_TENANTS") {
            config.tenants = parse_tenant_list(&tenants);
        }

        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.log_level = level;
        }

        config
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval.is_zero() {
            return Err(ConfigError("tick interval cannot be 0".into()));
        }

        if self.database_url.as_deref() == Some("") {
            return Err(ConfigError("database URL cannot be empty".into()));
        }

        if let Some(bad) = self.tenants.iter().find(|t| !t.is_valid()) {
            return Err(ConfigError(format!("invalid tenant id {:?}", bad.as_str())));
        }

        self.orchestrator.validate()?;

        if self.cache.default_ttl <= chrono::Duration::zero() {
            return Err(ConfigError("cache TTL must be positive".into()));
        }

        Ok(())
    }
}

/// Split a comma-separated tenant list, ignoring blanks.
pub fn parse_tenant_list(raw: &str) -> Vec<TenantId> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(TenantId::new)
        .collect()
}
