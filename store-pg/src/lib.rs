//! RateKeeper PostgreSQL Store
//!
//! sqlx-backed adapters for the rate engine's persistence ports.
//!
//! # Example
//!
//! ```rust,ignore
//! use ratekeeper_store_pg::PgStore;
//!
//! let store = PgStore::connect("postgres://localhost/ratekeeper").await?;
//! store.migrate().await?;
//! let ports = store.ports();
//! ```

pub mod error;
pub mod history;
pub mod providers;
pub mod quotas;
pub mod settings;

use std::sync::Arc;
use std::time::Duration;

use ratekeeper_common::{PersistenceError, PersistenceResult};
use ratekeeper_fx::StorePorts;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

pub use error::map_sqlx_error;
pub use history::PgHistoryRepository;
pub use providers::PgProviderRepository;
pub use quotas::PgQuotaRepository;
pub use settings::PgSettingsRepository;

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PgStoreConfig {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PgStoreConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// Postgres-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> PersistenceResult<Self> {
        Self::connect_with(database_url, PgStoreConfig::default()).await
    }

    pub async fn connect_with(database_url: &str, config: PgStoreConfig) -> PersistenceResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(database_url)
            .await
            .map_err(map_sqlx_error)?;

        info!(max_connections = config.max_connections, "Connected to Postgres");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations.
    pub async fn migrate(&self) -> PersistenceResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| PersistenceError::TransactionFailed(format!("migration failed: {}", e)))?;

        info!("Database migrations applied");
        Ok(())
    }

    /// Persistence ports backed by this pool.
    pub fn ports(&self) -> StorePorts {
        StorePorts {
            providers: Arc::new(PgProviderRepository::new(self.pool.clone())),
            quotas: Arc::new(PgQuotaRepository::new(self.pool.clone())),
            history: Arc::new(PgHistoryRepository::new(self.pool.clone())),
            settings: Arc::new(PgSettingsRepository::new(self.pool.clone())),
        }
    }
}
