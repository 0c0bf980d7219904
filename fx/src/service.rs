//! Pricing-facing rate service.

use std::sync::Arc;

use dashmap::DashMap;
use ratekeeper_common::{CurrencyPair, TenantId};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::cache::RateCache;
use crate::error::FxResult;
use crate::model::RateMode;
use crate::orchestrator::{Acquisition, FailoverOrchestrator};
use crate::rate::RateQuote;

/// Serves cached quotes and coalesces concurrent acquisitions per tenant.
pub struct RateService {
    orchestrator: Arc<FailoverOrchestrator>,
    cache: RateCache,
    in_flight: DashMap<TenantId, Arc<Mutex<()>>>,
}

impl RateService {
    pub fn new(orchestrator: Arc<FailoverOrchestrator>, cache: RateCache) -> Self {
        Self {
            orchestrator,
            cache,
            in_flight: DashMap::new(),
        }
    }

    pub fn orchestrator(&self) -> &Arc<FailoverOrchestrator> {
        &self.orchestrator
    }

    pub fn cache(&self) -> &RateCache {
        &self.cache
    }

    fn flight(&self, tenant: &TenantId) -> Arc<Mutex<()>> {
        self.in_flight.entry(tenant.clone()).or_default().clone()
    }

    /// Rate for pricing. Served from cache when possible; otherwise one
    /// acquisition runs per tenant and concurrent callers share its result.
    #[instrument(skip(self))]
    pub async fn current_rate(&self, tenant: &TenantId) -> FxResult<RateQuote> {
        if let Some(hit) = self.cache.get(tenant) {
            return Ok(hit.quote);
        }

        let flight = self.flight(tenant);
        let _guard = flight.lock().await;

        if let Some(hit) = self.cache.get(tenant) {
            debug!(tenant = %tenant, "Served by concurrent acquisition");
            return Ok(hit.quote);
        }

        Ok(self.acquire_and_store(tenant).await?.quote)
    }

    /// Always run an acquisition and refresh the cache.
    #[instrument(skip(self))]
    pub async fn refresh(&self, tenant: &TenantId) -> FxResult<Acquisition> {
        let flight = self.flight(tenant);
        let _guard = flight.lock().await;
        self.acquire_and_store(tenant).await
    }

    async fn acquire_and_store(&self, tenant: &TenantId) -> FxResult<Acquisition> {
        let acquisition = self.orchestrator.acquire(tenant).await?;
        self.cache.insert(
            tenant,
            acquisition.value.clone(),
            acquisition.quote.origin,
            acquisition.provider_id,
        );
        Ok(acquisition)
    }

    pub fn invalidate(&self, tenant: &TenantId) {
        self.cache.remove(tenant);
    }

    pub async fn set_manual_rate(&self, tenant: &TenantId, rate: Decimal) -> FxResult<RateQuote> {
        let quote = self.orchestrator.set_manual_rate(tenant, rate).await?;
        self.invalidate(tenant);
        Ok(quote)
    }

    pub async fn set_mode(&self, tenant: &TenantId, mode: RateMode) -> FxResult<()> {
        self.orchestrator.set_mode(tenant, mode).await?;
        self.invalidate(tenant);
        Ok(())
    }

    /// Change the tenant's currency pair; a quote cached for the old pair is dropped.
    pub async fn set_pair(&self, tenant: &TenantId, pair: CurrencyPair) -> FxResult<()> {
        self.orchestrator.set_pair(tenant, pair).await?;
        self.invalidate(tenant);
        Ok(())
    }
}
