//! Append-only audit of rate changes, fallbacks and provider switches.

use std::sync::Arc;

use ratekeeper_common::{Clock, CurrencyPair, EventId, PersistenceResult, ProviderId, TenantId};
use serde_json::json;
use tracing::debug;

use crate::error::FxResult;
use crate::model::{EventType, ExchangeRateHistory, ProviderSwitchEvent};
use crate::rate::{RateSource, RateValue};
use crate::store::{with_persistence_retry, HistoryRepository};

/// Writes history rows and switch events; reads back the last good rate.
pub struct EventLog {
    repo: Arc<dyn HistoryRepository>,
    clock: Arc<dyn Clock>,
}

impl EventLog {
    pub fn new(repo: Arc<dyn HistoryRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { repo, clock }
    }

    fn entry(
        &self,
        tenant: &TenantId,
        pair: &CurrencyPair,
        value: &RateValue,
        provider_id: Option<ProviderId>,
        event_type: EventType,
        metadata: serde_json::Value,
    ) -> ExchangeRateHistory {
        ExchangeRateHistory {
            id: EventId::new(),
            tenant_id: tenant.clone(),
            pair: pair.clone(),
            rate: value.rate(),
            provider_id,
            source: value.source(),
            event_type,
            metadata,
            fetched_at: value.fetched_at(),
            created_at: self.clock.now(),
        }
    }

    async fn append(&self, entry: ExchangeRateHistory) -> PersistenceResult<ExchangeRateHistory> {
        with_persistence_retry("history.append", || self.repo.append(entry.clone())).await?;
        debug!(
            tenant = %entry.tenant_id,
            pair = %entry.pair,
            event_type = entry.event_type.as_str(),
            source = %entry.source,
            rate = %entry.rate,
            "History recorded"
        );
        Ok(entry)
    }

    /// A newly acquired or manually set rate.
    pub async fn record_rate_change(
        &self,
        tenant: &TenantId,
        pair: &CurrencyPair,
        value: &RateValue,
        provider_id: Option<ProviderId>,
    ) -> PersistenceResult<ExchangeRateHistory> {
        let metadata = json!({ "provider_code": value.provider_code() });
        self.append(self.entry(tenant, pair, value, provider_id, EventType::RateChange, metadata))
            .await
    }

    /// A rate that came from a different provider than the last one.
    pub async fn record_switch_row(
        &self,
        tenant: &TenantId,
        pair: &CurrencyPair,
        value: &RateValue,
        provider_id: Option<ProviderId>,
        old_provider_id: Option<ProviderId>,
    ) -> PersistenceResult<ExchangeRateHistory> {
        let metadata = json!({
            "provider_code": value.provider_code(),
            "old_provider_id": old_provider_id.map(|id| id.to_string()),
        });
        self.append(self.entry(tenant, pair, value, provider_id, EventType::Switch, metadata))
            .await
    }

    /// The cached rate served because no provider could answer.
    pub async fn record_fallback(
        &self,
        tenant: &TenantId,
        pair: &CurrencyPair,
        cached: &RateValue,
        provider_id: Option<ProviderId>,
    ) -> PersistenceResult<ExchangeRateHistory> {
        let now = self.clock.now();
        let metadata = json!({
            "provider_code": cached.provider_code(),
            "age_hours": cached.age_in_hours(now),
            "is_stale": cached.is_stale(now),
        });
        self.append(self.entry(tenant, pair, cached, provider_id, EventType::Fallback, metadata))
            .await
    }

    pub async fn record_provider_switch(
        &self,
        tenant: &TenantId,
        old_provider_id: Option<ProviderId>,
        new_provider_id: Option<ProviderId>,
        reason: &str,
        metadata: serde_json::Value,
    ) -> PersistenceResult<ProviderSwitchEvent> {
        let event = ProviderSwitchEvent {
            id: EventId::new(),
            tenant_id: tenant.clone(),
            old_provider_id,
            new_provider_id,
            reason: reason.to_string(),
            metadata,
            created_at: self.clock.now(),
        };

        with_persistence_retry("history.append_switch", || {
            self.repo.append_switch(event.clone())
        })
        .await?;

        debug!(tenant = %tenant, reason, "Provider switch recorded");
        Ok(event)
    }

    /// Last rate fetched from a provider for `pair`, as originally fetched.
    pub async fn latest_api_rate(
        &self,
        tenant: &TenantId,
        pair: &CurrencyPair,
    ) -> FxResult<Option<(RateValue, Option<ProviderId>)>> {
        let row = with_persistence_retry("history.latest", || {
            self.repo.latest_by_source(tenant, pair, RateSource::Api)
        })
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let provider_code = row
            .metadata
            .get("provider_code")
            .and_then(|c| c.as_str())
            .map(str::to_string);
        let value = RateValue::new(row.rate, row.fetched_at, RateSource::Api, provider_code)?;
        Ok(Some((value, row.provider_id)))
    }

    /// Newest first.
    pub async fn history(
        &self,
        tenant: &TenantId,
        limit: usize,
    ) -> PersistenceResult<Vec<ExchangeRateHistory>> {
        with_persistence_retry("history.recent", || self.repo.recent(tenant, limit)).await
    }

    /// Newest first.
    pub async fn switch_events(
        &self,
        tenant: &TenantId,
        limit: usize,
    ) -> PersistenceResult<Vec<ProviderSwitchEvent>> {
        with_persistence_retry("history.recent_switches", || {
            self.repo.recent_switches(tenant, limit)
        })
        .await
    }
}
