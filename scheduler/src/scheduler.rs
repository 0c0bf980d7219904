//! Periodic refresh of every tenant's rate.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use ratekeeper_common::TenantId;
use ratekeeper_fx::quota::ProviderUsage;
use ratekeeper_fx::{FxError, FxResult, QuoteOrigin, RateQuote, RateService};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::metrics::SchedulerMetrics;
use crate::state::SchedulerState;

/// Outcome counts for one refresh pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub tenants: usize,
    pub fresh: usize,
    pub fallback: usize,
    pub manual: usize,
    pub unavailable: usize,
    pub failed: usize,
    pub rollovers: usize,
}

/// Cached quote and quota usage for one tenant.
#[derive(Debug, Clone, Serialize)]
pub struct TenantReport {
    pub tenant_id: TenantId,
    pub quote: Option<RateQuote>,
    pub usage: Vec<ProviderUsage>,
}

/// Drives acquisitions for a fixed set of tenants on an interval.
pub struct Scheduler {
    service: Arc<RateService>,
    tenants: Vec<TenantId>,
    interval: Duration,
    metrics: Arc<SchedulerMetrics>,
    state: Arc<RwLock<SchedulerState>>,
    /// Shutdown signal sender.
    shutdown_tx: mpsc::Sender<()>,
    /// Shutdown signal receiver, taken by the running loop.
    shutdown_rx: Arc<RwLock<Option<mpsc::Receiver<()>>>>,
}

impl Scheduler {
    pub fn new(service: Arc<RateService>, tenants: Vec<TenantId>, interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        Self {
            service,
            tenants,
            interval,
            metrics: Arc::new(SchedulerMetrics::new()),
            state: Arc::new(RwLock::new(SchedulerState::Starting)),
            shutdown_tx,
            shutdown_rx: Arc::new(RwLock::new(Some(shutdown_rx))),
        }
    }

    pub fn tenants(&self) -> &[TenantId] {
        &self.tenants
    }

    pub fn metrics(&self) -> &Arc<SchedulerMetrics> {
        &self.metrics
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.read()
    }

    pub fn is_running(&self) -> bool {
        self.state.read().is_running()
    }

    /// Run one refresh pass over every tenant.
    #[instrument(skip(self), fields(tenants = self.tenants.len()))]
    pub async fn run_once(&self) -> TickSummary {
        let started = Instant::now();
        let mut summary = TickSummary {
            tenants: self.tenants.len(),
            ..TickSummary::default()
        };

        for tenant in &self.tenants {
            summary.rollovers += self.roll_quota_periods(tenant).await;

            match self.service.refresh(tenant).await {
                Ok(acquisition) => {
                    self.metrics
                        .acquired(acquisition.quote.origin, acquisition.notifications.len());
                    match acquisition.quote.origin {
                        QuoteOrigin::Fresh => summary.fresh += 1,
                        QuoteOrigin::Fallback => summary.fallback += 1,
                        QuoteOrigin::Manual => summary.manual += 1,
                    }
                    debug!(
                        tenant = %tenant,
                        rate = %acquisition.quote.rate,
                        origin = ?acquisition.quote.origin,
                        "Tenant rate refreshed"
                    );
                }
                Err(FxError::RateUnavailable { .. }) => {
                    self.metrics.unavailable();
                    summary.unavailable += 1;
                    warn!(tenant = %tenant, "No rate available");
                }
                Err(e) => {
                    self.metrics.failed();
                    summary.failed += 1;
                    error!(tenant = %tenant, error = %e, code = e.error_code(), "Refresh failed");
                }
            }
        }

        self.metrics
            .tick_completed(started.elapsed().as_millis() as u64);

        info!(
            fresh = summary.fresh,
            fallback = summary.fallback,
            manual = summary.manual,
            unavailable = summary.unavailable,
            failed = summary.failed,
            "Refresh pass complete"
        );

        summary
    }

    /// Open the current month's quota counter for each enabled provider.
    async fn roll_quota_periods(&self, tenant: &TenantId) -> usize {
        let orchestrator = self.service.orchestrator();
        let providers = match orchestrator.registry().enabled_providers(tenant).await {
            Ok(providers) => providers,
            Err(e) => {
                warn!(tenant = %tenant, error = %e, "Could not list providers for rollover");
                return 0;
            }
        };

        let mut opened = 0;
        for provider in &providers {
            match orchestrator.quota().rollover_if_needed(provider).await {
                Ok(true) => {
                    self.metrics.rollover();
                    opened += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(provider = %provider.code, error = %e, "Quota rollover failed");
                }
            }
        }
        opened
    }

    /// Current quote and quota usage for every scheduled tenant.
    pub async fn report(&self) -> FxResult<Vec<TenantReport>> {
        let orchestrator = self.service.orchestrator();
        let mut reports = Vec::with_capacity(self.tenants.len());

        for tenant in &self.tenants {
            let providers = orchestrator.registry().all_providers(tenant).await?;
            let usage = orchestrator.quota().usage_report(&providers).await?;
            reports.push(TenantReport {
                tenant_id: tenant.clone(),
                quote: self.service.cache().get(tenant).map(|hit| hit.quote),
                usage,
            });
        }

        Ok(reports)
    }

    /// Refresh on every interval until [`Scheduler::stop`] is called.
    ///
    /// The first pass runs immediately.
    #[instrument(skip(self))]
    pub async fn run(&self) -> anyhow::Result<()> {
        let mut shutdown_rx = self
            .shutdown_rx
            .write()
            .take()
            .ok_or_else(|| anyhow::anyhow!("scheduler is already running"))?;

        *self.state.write() = SchedulerState::Running;
        info!(
            tenants = self.tenants.len(),
            interval_secs = self.interval.as_secs(),
            "Scheduler started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once().await;
                }
                _ = shutdown_rx.recv() => {
                    break;
                }
            }
        }

        *self.state.write() = SchedulerState::Stopped;
        info!("Scheduler stopped");
        Ok(())
    }

    /// Ask the running loop to exit after its current pass.
    #[instrument(skip(self))]
    pub fn stop(&self) {
        info!("Stopping scheduler");
        *self.state.write() = SchedulerState::ShuttingDown;
        let _ = self.shutdown_tx.try_send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use ratekeeper_common::ManualClock;
    use ratekeeper_fx::{
        CollectingSink, FailoverOrchestrator, FetchErrorKind, MockRateSource, OrchestratorConfig,
        Provider, RateCache, StorePorts,
    };
    use rust_decimal_macros::dec;

    struct Harness {
        scheduler: Arc<Scheduler>,
        source: Arc<MockRateSource>,
        clock: Arc<ManualClock>,
        orchestrator: Arc<FailoverOrchestrator>,
    }

    fn harness(tenants: &[&str]) -> Harness {
        let source = Arc::new(MockRateSource::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 30, 12, 0, 0).unwrap(),
        ));
        let orchestrator = Arc::new(FailoverOrchestrator::new(
            StorePorts::in_memory(),
            source.clone(),
            clock.clone(),
            Arc::new(CollectingSink::new()),
            OrchestratorConfig::default(),
        ));
        let service = Arc::new(RateService::new(
            orchestrator.clone(),
            RateCache::new(clock.clone()),
        ));
        let scheduler = Arc::new(Scheduler::new(
            service,
            tenants.iter().map(|t| TenantId::new(*t)).collect(),
            Duration::from_secs(60),
        ));

        Harness {
            scheduler,
            source,
            clock,
            orchestrator,
        }
    }

    async fn add_provider(h: &Harness, tenant: &str, code: &str) -> Provider {
        let provider = Provider::new(
            TenantId::new(tenant),
            code,
            format!("https://{}.example.com", code),
        );
        h.orchestrator
            .registry()
            .register(provider.clone())
            .await
            .unwrap();
        provider
    }

    #[tokio::test]
    async fn test_run_once_refreshes_each_tenant() {
        let h = harness(&["shop_eu", "shop_us"]);
        add_provider(&h, "shop_eu", "EU_RATES").await;
        add_provider(&h, "shop_us", "US_RATES").await;
        h.source.set_rate("EU_RATES", dec!(0.92));
        h.source.set_rate("US_RATES", dec!(1.08));

        let summary = h.scheduler.run_once().await;

        assert_eq!(summary.tenants, 2);
        assert_eq!(summary.fresh, 2);
        assert_eq!(h.source.total_calls(), 2);

        let snapshot = h.scheduler.metrics().snapshot();
        assert_eq!(snapshot.ticks_total, 1);
        assert_eq!(snapshot.rates_fresh, 2);
    }

    #[tokio::test]
    async fn test_refresh_bypasses_cache() {
        let h = harness(&["shop_eu"]);
        add_provider(&h, "shop_eu", "EU_RATES").await;
        h.source.set_rate("EU_RATES", dec!(0.92));

        h.scheduler.run_once().await;
        h.scheduler.run_once().await;

        assert_eq!(h.source.calls("EU_RATES"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outcomes_are_classified() {
        let h = harness(&["shop_eu", "shop_empty"]);
        add_provider(&h, "shop_eu", "EU_RATES").await;
        h.source.set_rate("EU_RATES", dec!(0.92));
        h.scheduler.run_once().await;

        h.source.fail_with("EU_RATES", FetchErrorKind::Authentication);
        let summary = h.scheduler.run_once().await;

        assert_eq!(summary.fallback, 1);
        assert_eq!(summary.unavailable, 1);
        assert_eq!(summary.failed, 0);

        let snapshot = h.scheduler.metrics().snapshot();
        assert_eq!(snapshot.rates_unavailable, 2);
        assert!(snapshot.notifications_total >= 1);
    }

    #[tokio::test]
    async fn test_rollover_opens_new_month_once() {
        let h = harness(&["shop_eu"]);
        add_provider(&h, "shop_eu", "EU_RATES").await;
        h.source.set_rate("EU_RATES", dec!(0.92));

        let first = h.scheduler.run_once().await;
        assert_eq!(first.rollovers, 1);

        let again = h.scheduler.run_once().await;
        assert_eq!(again.rollovers, 0);

        h.clock.advance(ChronoDuration::days(3));
        let next_month = h.scheduler.run_once().await;
        assert_eq!(next_month.rollovers, 1);
        assert_eq!(h.scheduler.metrics().snapshot().quota_rollovers, 2);
    }

    #[tokio::test]
    async fn test_report_after_refresh() {
        let h = harness(&["shop_eu"]);
        add_provider(&h, "shop_eu", "EU_RATES").await;
        h.source.set_rate("EU_RATES", dec!(0.92));

        h.scheduler.run_once().await;
        let reports = h.scheduler.report().await.unwrap();

        assert_eq!(reports.len(), 1);
        let quote = reports[0].quote.as_ref().unwrap();
        assert_eq!(quote.rate, dec!(0.92));
        assert_eq!(quote.origin, QuoteOrigin::Fresh);
        assert_eq!(reports[0].usage[0].requests_made, 1);

        let json = serde_json::to_value(&reports).unwrap();
        assert_eq!(json[0]["tenant_id"], "shop_eu");
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_stopped() {
        let h = harness(&["shop_eu"]);
        add_provider(&h, "shop_eu", "EU_RATES").await;
        h.source.set_rate("EU_RATES", dec!(0.92));

        let scheduler = h.scheduler.clone();
        let handle = tokio::spawn(async move { scheduler.run().await });

        tokio::time::sleep(Duration::from_secs(150)).await;
        assert!(h.scheduler.is_running());

        h.scheduler.stop();
        handle.await.unwrap().unwrap();

        assert_eq!(h.scheduler.state(), SchedulerState::Stopped);
        // Passes at 0s, 60s and 120s.
        assert_eq!(h.scheduler.metrics().snapshot().ticks_total, 3);
    }

    #[tokio::test]
    async fn test_run_twice_is_rejected() {
        let h = harness(&[]);
        h.scheduler.stop();
        h.scheduler.run().await.unwrap();

        assert!(h.scheduler.run().await.is_err());
    }
}
