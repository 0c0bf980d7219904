//! Persistence ports.
//!
//! The engine only talks to storage through these traits. `memory` holds the
//! DashMap-backed adapters used by default and in tests; the Postgres
//! adapters live in `ratekeeper-store-pg`.

pub mod memory;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ratekeeper_common::{CurrencyPair, PersistenceResult, ProviderId, TenantId, Timestamp};
use tracing::warn;

use crate::model::{
    ExchangeRateHistory, ExchangeRateSetting, ProviderSwitchEvent, QuotaKey, QuotaTracking,
};
use crate::provider::Provider;
use crate::rate::RateSource;

/// Provider catalog.
#[async_trait]
pub trait ProviderRepository: Send + Sync {
    /// All providers configured for a tenant, enabled or not.
    async fn list_for_tenant(&self, tenant: &TenantId) -> PersistenceResult<Vec<Provider>>;

    async fn get(&self, id: ProviderId) -> PersistenceResult<Option<Provider>>;

    /// Insert or replace by id.
    async fn upsert(&self, provider: Provider) -> PersistenceResult<()>;

    /// Returns false when the provider does not exist.
    async fn set_enabled(&self, id: ProviderId, enabled: bool) -> PersistenceResult<bool>;

    /// Returns false when the provider does not exist.
    async fn set_priority(&self, id: ProviderId, priority: i32) -> PersistenceResult<bool>;
}

/// Monthly quota counters.
///
/// `increment` must be atomic per key: concurrent callers may never observe
/// the same pre-increment value.
#[async_trait]
pub trait QuotaTrackingRepository: Send + Sync {
    async fn get(&self, key: &QuotaKey) -> PersistenceResult<Option<QuotaTracking>>;

    /// Fetch the counter, creating it at zero with `quota_limit` if absent.
    async fn get_or_create(
        &self,
        key: &QuotaKey,
        quota_limit: Option<i64>,
        now: Timestamp,
    ) -> PersistenceResult<QuotaTracking>;

    /// Add one request and return the counter after the increment.
    async fn increment(
        &self,
        key: &QuotaKey,
        quota_limit: Option<i64>,
        now: Timestamp,
    ) -> PersistenceResult<QuotaTracking>;

    /// Zero the counter, refresh its limit and stamp `last_reset_at`.
    async fn reset(
        &self,
        key: &QuotaKey,
        quota_limit: Option<i64>,
        now: Timestamp,
    ) -> PersistenceResult<QuotaTracking>;
}

/// Append-only rate history and provider switch audit.
#[async_trait]
pub trait HistoryRepository: Send + Sync {
    async fn append(&self, entry: ExchangeRateHistory) -> PersistenceResult<()>;

    /// Most recent row for `pair` from `source`, by `created_at`.
    async fn latest_by_source(
        &self,
        tenant: &TenantId,
        pair: &CurrencyPair,
        source: RateSource,
    ) -> PersistenceResult<Option<ExchangeRateHistory>>;

    /// Newest first.
    async fn recent(
        &self,
        tenant: &TenantId,
        limit: usize,
    ) -> PersistenceResult<Vec<ExchangeRateHistory>>;

    async fn append_switch(&self, event: ProviderSwitchEvent) -> PersistenceResult<()>;

    /// Newest first.
    async fn recent_switches(
        &self,
        tenant: &TenantId,
        limit: usize,
    ) -> PersistenceResult<Vec<ProviderSwitchEvent>>;
}

/// One settings row per tenant.
#[async_trait]
pub trait SettingsRepository: Send + Sync {
    async fn get(&self, tenant: &TenantId) -> PersistenceResult<Option<ExchangeRateSetting>>;

    async fn save(&self, setting: ExchangeRateSetting) -> PersistenceResult<()>;
}

/// The full set of ports the engine is built from.
#[derive(Clone)]
pub struct StorePorts {
    pub providers: Arc<dyn ProviderRepository>,
    pub quotas: Arc<dyn QuotaTrackingRepository>,
    pub history: Arc<dyn HistoryRepository>,
    pub settings: Arc<dyn SettingsRepository>,
}

impl StorePorts {
    /// Ports backed by the in-process memory adapters.
    pub fn in_memory() -> Self {
        Self {
            providers: Arc::new(memory::MemoryProviderRepository::new()),
            quotas: Arc::new(memory::MemoryQuotaRepository::new()),
            history: Arc::new(memory::MemoryHistoryRepository::new()),
            settings: Arc::new(memory::MemorySettingsRepository::new()),
        }
    }
}

/// Attempts made for a retryable persistence failure.
pub const PERSISTENCE_MAX_ATTEMPTS: u32 = 3;

/// First delay between persistence retries; doubles per attempt.
pub const PERSISTENCE_RETRY_BASE: Duration = Duration::from_millis(50);

/// Run `op`, retrying deadlocks, timeouts and connection failures.
///
/// Non-retryable errors (constraint violations, failed transactions) are
/// returned on the first occurrence.
pub async fn with_persistence_retry<T, F, Fut>(operation: &str, mut op: F) -> PersistenceResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PersistenceResult<T>>,
{
    let mut attempt = 1;
    let mut delay = PERSISTENCE_RETRY_BASE;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < PERSISTENCE_MAX_ATTEMPTS => {
                warn!(
                    operation,
                    attempt,
                    error = %e,
                    "Retrying persistence operation"
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ratekeeper_common::PersistenceError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_errors() {
        let calls = AtomicU32::new(0);

        let result = with_persistence_retry("test.op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(PersistenceError::Deadlock("row".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);

        let result: PersistenceResult<()> = with_persistence_retry("test.op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(PersistenceError::Timeout("slow".into())) }
        })
        .await;

        assert!(matches!(result, Err(PersistenceError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), PERSISTENCE_MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_constraint_violation_not_retried() {
        let calls = AtomicU32::new(0);

        let result: PersistenceResult<()> = with_persistence_retry("test.op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(PersistenceError::ConstraintViolation("dup".into())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
