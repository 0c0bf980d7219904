//! In-process adapters for the persistence ports.

use std::collections::VecDeque;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use ratekeeper_common::{
    CurrencyPair, PersistenceError, PersistenceResult, ProviderId, TenantId, Timestamp,
};

use super::{HistoryRepository, ProviderRepository, QuotaTrackingRepository, SettingsRepository};
use crate::model::{
    ExchangeRateHistory, ExchangeRateSetting, ProviderSwitchEvent, QuotaKey, QuotaTracking,
};
use crate::provider::Provider;
use crate::rate::RateSource;

/// Provider catalog held in a DashMap.
#[derive(Default)]
pub struct MemoryProviderRepository {
    providers: DashMap<ProviderId, Provider>,
}

impl MemoryProviderRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProviderRepository for MemoryProviderRepository {
    async fn list_for_tenant(&self, tenant: &TenantId) -> PersistenceResult<Vec<Provider>> {
        Ok(self
            .providers
            .iter()
            .filter(|p| &p.tenant_id == tenant)
            .map(|p| p.clone())
            .collect())
    }

    async fn get(&self, id: ProviderId) -> PersistenceResult<Option<Provider>> {
        Ok(self.providers.get(&id).map(|p| p.clone()))
    }

    async fn upsert(&self, provider: Provider) -> PersistenceResult<()> {
        self.providers.insert(provider.id, provider);
        Ok(())
    }

    async fn set_enabled(&self, id: ProviderId, enabled: bool) -> PersistenceResult<bool> {
        Ok(self
            .providers
            .get_mut(&id)
            .map(|mut p| p.is_enabled = enabled)
            .is_some())
    }

    async fn set_priority(&self, id: ProviderId, priority: i32) -> PersistenceResult<bool> {
        Ok(self
            .providers
            .get_mut(&id)
            .map(|mut p| p.priority = priority)
            .is_some())
    }
}

/// Quota counters. Each operation runs under the DashMap shard lock for its
/// key, which serializes increments per (tenant, provider, month).
#[derive(Default)]
pub struct MemoryQuotaRepository {
    rows: DashMap<QuotaKey, QuotaTracking>,
}

impl MemoryQuotaRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
impl QuotaTrackingRepository for MemoryQuotaRepository {
    async fn get(&self, key: &QuotaKey) -> PersistenceResult<Option<QuotaTracking>> {
        Ok(self.rows.get(key).map(|r| r.clone()))
    }

    async fn get_or_create(
        &self,
        key: &QuotaKey,
        quota_limit: Option<i64>,
        now: Timestamp,
    ) -> PersistenceResult<QuotaTracking> {
        let row = self
            .rows
            .entry(key.clone())
            .or_insert_with(|| QuotaTracking::new(key.clone(), quota_limit, now));
        Ok(row.clone())
    }

    async fn increment(
        &self,
        key: &QuotaKey,
        quota_limit: Option<i64>,
        now: Timestamp,
    ) -> PersistenceResult<QuotaTracking> {
        let mut row = self
            .rows
            .entry(key.clone())
            .or_insert_with(|| QuotaTracking::new(key.clone(), quota_limit, now));
        row.requests_made += 1;
        Ok(row.clone())
    }

    async fn reset(
        &self,
        key: &QuotaKey,
        quota_limit: Option<i64>,
        now: Timestamp,
    ) -> PersistenceResult<QuotaTracking> {
        let mut row = self
            .rows
            .entry(key.clone())
            .or_insert_with(|| QuotaTracking::new(key.clone(), quota_limit, now));
        row.requests_made = 0;
        row.quota_limit = quota_limit;
        row.last_reset_at = Some(now);
        Ok(row.clone())
    }
}

/// Append-only history kept in insertion order.
#[derive(Default)]
pub struct MemoryHistoryRepository {
    rows: RwLock<Vec<ExchangeRateHistory>>,
    switches: RwLock<Vec<ProviderSwitchEvent>>,
    injected_failures: Mutex<VecDeque<PersistenceError>>,
}

impl MemoryHistoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next appends fail with `errors`, one per write.
    pub fn fail_next_writes(&self, errors: impl IntoIterator<Item = PersistenceError>) {
        self.injected_failures.lock().extend(errors);
    }

    fn take_injected_failure(&self) -> PersistenceResult<()> {
        match self.injected_failures.lock().pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl HistoryRepository for MemoryHistoryRepository {
    async fn append(&self, entry: ExchangeRateHistory) -> PersistenceResult<()> {
        self.take_injected_failure()?;
        self.rows.write().push(entry);
        Ok(())
    }

    async fn latest_by_source(
        &self,
        tenant: &TenantId,
        pair: &CurrencyPair,
        source: RateSource,
    ) -> PersistenceResult<Option<ExchangeRateHistory>> {
        Ok(self
            .rows
            .read()
            .iter()
            .filter(|r| &r.tenant_id == tenant && &r.pair == pair && r.source == source)
            .max_by_key(|r| r.created_at)
            .cloned())
    }

    async fn recent(
        &self,
        tenant: &TenantId,
        limit: usize,
    ) -> PersistenceResult<Vec<ExchangeRateHistory>> {
        let mut rows: Vec<ExchangeRateHistory> = self
            .rows
            .read()
            .iter()
            .rev()
            .filter(|r| &r.tenant_id == tenant)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn append_switch(&self, event: ProviderSwitchEvent) -> PersistenceResult<()> {
        self.take_injected_failure()?;
        self.switches.write().push(event);
        Ok(())
    }

    async fn recent_switches(
        &self,
        tenant: &TenantId,
        limit: usize,
    ) -> PersistenceResult<Vec<ProviderSwitchEvent>> {
        let mut events: Vec<ProviderSwitchEvent> = self
            .switches
            .read()
            .iter()
            .rev()
            .filter(|e| &e.tenant_id == tenant)
            .cloned()
            .collect();
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        events.truncate(limit);
        Ok(events)
    }
}

/// Tenant settings keyed by tenant.
#[derive(Default)]
pub struct MemorySettingsRepository {
    settings: DashMap<TenantId, ExchangeRateSetting>,
}

impl MemorySettingsRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettingsRepository for MemorySettingsRepository {
    async fn get(&self, tenant: &TenantId) -> PersistenceResult<Option<ExchangeRateSetting>> {
        Ok(self.settings.get(tenant).map(|s| s.clone()))
    }

    async fn save(&self, setting: ExchangeRateSetting) -> PersistenceResult<()> {
        self.settings.insert(setting.tenant_id.clone(), setting);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ratekeeper_common::{Currency, EventId, YearMonth};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    use crate::model::EventType;

    fn key(now: Timestamp) -> QuotaKey {
        QuotaKey::new(TenantId::new("t1"), ProviderId::new(), YearMonth::of(now))
    }

    #[tokio::test]
    async fn test_increment_creates_lazily() {
        let repo = MemoryQuotaRepository::new();
        let now = Utc::now();
        let key = key(now);

        assert!(repo.get(&key).await.unwrap().is_none());
        let row = repo.increment(&key, Some(10), now).await.unwrap();
        assert_eq!(row.requests_made, 1);
        assert_eq!(row.quota_limit, Some(10));
        assert_eq!(repo.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_increments_do_not_lose_updates() {
        let repo = Arc::new(MemoryQuotaRepository::new());
        let now = Utc::now();
        let key = key(now);

        let handles: Vec<_> = (0..100)
            .map(|_| {
                let repo = repo.clone();
                let key = key.clone();
                tokio::spawn(async move { repo.increment(&key, Some(500), now).await })
            })
            .collect();

        let mut seen = Vec::new();
        for handle in handles {
            seen.push(handle.await.unwrap().unwrap().requests_made);
        }
        seen.sort_unstable();

        assert_eq!(seen, (1..=100).collect::<Vec<i64>>());
        assert_eq!(repo.get(&key).await.unwrap().unwrap().requests_made, 100);
    }

    #[tokio::test]
    async fn test_latest_by_source_filters() {
        let repo = MemoryHistoryRepository::new();
        let tenant = TenantId::new("t1");
        let usd_eur = CurrencyPair::default();
        let usd_jpy = CurrencyPair::new(Currency::usd(), Currency::new("JPY"));
        let now = Utc::now();

        for (offset, pair, source) in [
            (4, &usd_eur, RateSource::Api),
            (3, &usd_eur, RateSource::Api),
            (2, &usd_eur, RateSource::Cache),
            (1, &usd_jpy, RateSource::Api),
        ] {
            let at = now - chrono::Duration::hours(offset);
            repo.append(ExchangeRateHistory {
                id: EventId::new(),
                tenant_id: tenant.clone(),
                pair: pair.clone(),
                rate: dec!(1.1),
                provider_id: None,
                source,
                event_type: EventType::RateChange,
                metadata: serde_json::Value::Null,
                fetched_at: at,
                created_at: at,
            })
            .await
            .unwrap();
        }

        let latest = repo
            .latest_by_source(&tenant, &usd_eur, RateSource::Api)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.created_at, now - chrono::Duration::hours(3));

        let gbp = CurrencyPair::new(Currency::usd(), Currency::gbp());
        assert!(repo
            .latest_by_source(&tenant, &gbp, RateSource::Api)
            .await
            .unwrap()
            .is_none());

        let recent = repo.recent(&tenant, 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent[0].created_at > recent[1].created_at);
    }

    #[tokio::test]
    async fn test_injected_failure_applies_once() {
        let repo = MemoryHistoryRepository::new();
        repo.fail_next_writes([PersistenceError::ConstraintViolation("dup".into())]);

        let event = ProviderSwitchEvent {
            id: EventId::new(),
            tenant_id: TenantId::new("t1"),
            old_provider_id: None,
            new_provider_id: None,
            reason: "test".into(),
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
        };

        assert!(repo.append_switch(event.clone()).await.is_err());
        assert!(repo.append_switch(event).await.is_ok());
        assert_eq!(repo.recent_switches(&TenantId::new("t1"), 10).await.unwrap().len(), 1);
    }
}
