//! Failover orchestration for one rate acquisition.
//!
//! A run walks the tenant's providers in selection order, charging quota
//! for every call that reached a provider, until one answers. When none
//! can, the last rate fetched for the tenant's currency pair is served from
//! history and flagged with its age.

use std::sync::Arc;
use std::time::Duration;

use ratekeeper_common::{constants, Clock, CurrencyPair, ProviderId, TenantId};
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{error, info, instrument, warn};

use crate::error::{ConfigError, FetchError, FetchErrorKind, FxError, FxResult};
use crate::event_log::EventLog;
use crate::fetcher::{FetchReport, RateFetcher, RetryPolicy};
use crate::model::{ExchangeRateSetting, RateMode};
use crate::notification::{
    FallbackState, Notification, NotificationDecider, NotificationSink,
};
use crate::provider::Provider;
use crate::quota::{QuotaTracker, QuotaTransition};
use crate::rate::{QuoteOrigin, RateQuote, RateSource, RateValue, StaleLevel};
use crate::registry::ProviderRegistry;
use crate::selector::ProviderSelector;
use crate::source::RateSourceClient;
use crate::store::{with_persistence_retry, SettingsRepository, StorePorts};

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Budget for each individual provider call.
    pub attempt_timeout: Duration,
    /// Retry policy against a single provider.
    pub retry: RetryPolicy,
    /// Age after which a rate is flagged stale.
    pub max_age_hours: i64,
    /// Age after which a fallback rate is escalated as critical.
    pub very_stale_after: chrono::Duration,
    /// Charge quota for calls that reached the provider but failed.
    pub charge_failed_calls: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            max_age_hours: RateValue::DEFAULT_MAX_AGE_HOURS,
            very_stale_after: constants::very_stale_after(),
            charge_failed_calls: true,
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(ms) = std::env::var("RATEKEEPER_ATTEMPT_TIMEOUT_MS") {
            if let Ok(ms) = ms.parse() {
                config.attempt_timeout = Duration::from_millis(ms);
            }
        }

        if let Ok(attempts) = std::env::var("RATEKEEPER_RETRY_MAX_ATTEMPTS") {
            if let Ok(attempts) = attempts.parse() {
                config.retry.max_attempts = attempts;
            }
        }

        if let Ok(hours) = std::env::var("RATEKEEPER_MAX_AGE_HOURS") {
            if let Ok(hours) = hours.parse() {
                config.max_age_hours = hours;
            }
        }

        if let Ok(charge) = std::env::var("RATEKEEPER_CHARGE_FAILED_CALLS") {
            if let Ok(charge) = charge.parse() {
                config.charge_failed_calls = charge;
            }
        }

        config
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.attempt_timeout.is_zero() {
            return Err(ConfigError("attempt timeout cannot be 0".into()));
        }

        self.retry.validate()?;

        if self.max_age_hours <= 0 {
            return Err(ConfigError("max_age_hours must be positive".into()));
        }

        if self.very_stale_after <= chrono::Duration::hours(self.max_age_hours) {
            return Err(ConfigError(
                "very_stale_after must exceed max_age_hours".into(),
            ));
        }

        Ok(())
    }
}

/// Result of one acquisition run.
#[derive(Debug, Clone)]
pub struct Acquisition {
    pub quote: RateQuote,
    /// The rate as acquired; `quote` is this value evaluated at run time.
    pub value: RateValue,
    /// Provider the rate originally came from.
    pub provider_id: Option<ProviderId>,
    /// Notifications raised and dispatched by the run.
    pub notifications: Vec<Notification>,
}

/// One provider call plus the quota it consumed.
struct Attempt {
    report: FetchReport,
    transitions: Vec<QuotaTransition>,
}

/// Drives acquisition runs for tenants.
pub struct FailoverOrchestrator {
    registry: Arc<ProviderRegistry>,
    quota: Arc<QuotaTracker>,
    selector: ProviderSelector,
    fetcher: Arc<RateFetcher>,
    event_log: EventLog,
    settings: Arc<dyn SettingsRepository>,
    sink: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
}

impl FailoverOrchestrator {
    pub fn new(
        ports: StorePorts,
        source: Arc<dyn RateSourceClient>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn NotificationSink>,
        config: OrchestratorConfig,
    ) -> Self {
        let registry = Arc::new(ProviderRegistry::new(ports.providers));
        let quota = Arc::new(QuotaTracker::new(ports.quotas, clock.clone()));
        let selector = ProviderSelector::new(registry.clone(), quota.clone());
        let fetcher = Arc::new(
            RateFetcher::new(source, clock.clone())
                .with_policy(config.retry)
                .with_attempt_timeout(config.attempt_timeout)
                .with_max_age_hours(config.max_age_hours),
        );

        Self {
            registry,
            quota,
            selector,
            fetcher,
            event_log: EventLog::new(ports.history, clock.clone()),
            settings: ports.settings,
            sink,
            clock,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn quota(&self) -> &Arc<QuotaTracker> {
        &self.quota
    }

    pub fn event_log(&self) -> &EventLog {
        &self.event_log
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// The tenant's setting, or a fresh auto-mode default.
    pub async fn setting(&self, tenant: &TenantId) -> FxResult<ExchangeRateSetting> {
        let stored = with_persistence_retry("settings.get", || self.settings.get(tenant)).await?;
        Ok(stored.unwrap_or_else(|| ExchangeRateSetting::new(tenant.clone(), self.clock.now())))
    }

    async fn save_setting(&self, setting: &ExchangeRateSetting) -> FxResult<()> {
        with_persistence_retry("settings.save", || self.settings.save(setting.clone())).await?;
        Ok(())
    }

    /// Acquire a rate for `tenant`.
    ///
    /// Any notifications raised are dispatched to the sink before returning,
    /// including when the run ends in `RateUnavailable`.
    #[instrument(skip(self))]
    pub async fn acquire(&self, tenant: &TenantId) -> FxResult<Acquisition> {
        let setting = self.setting(tenant).await?;
        let mut notifications = Vec::new();

        let result = match (setting.mode, setting.manual_rate) {
            (RateMode::Manual, Some(rate)) => self.serve_manual(&setting, rate),
            (RateMode::Manual, None) => {
                warn!(tenant = %tenant, "Manual mode without a manual rate, using providers");
                self.run_failover(setting, &mut notifications).await
            }
            (RateMode::Auto, _) => self.run_failover(setting, &mut notifications).await,
        };

        if !notifications.is_empty() {
            self.sink.dispatch(&notifications).await;
        }

        result.map(|mut acquisition| {
            acquisition.notifications = notifications;
            acquisition
        })
    }

    fn serve_manual(&self, setting: &ExchangeRateSetting, rate: Decimal) -> FxResult<Acquisition> {
        let set_at = setting.manual_rate_set_at.unwrap_or(setting.update_time);
        let value = RateValue::new(rate, set_at, RateSource::Manual, None)?;

        Ok(Acquisition {
            quote: RateQuote::from_value(&value, QuoteOrigin::Manual, self.clock.now()),
            value,
            provider_id: None,
            notifications: Vec::new(),
        })
    }

    async fn run_failover(
        &self,
        setting: ExchangeRateSetting,
        notifications: &mut Vec<Notification>,
    ) -> FxResult<Acquisition> {
        let tenant = setting.tenant_id.clone();
        let enabled = self.registry.enabled_providers(&tenant).await?;

        let mut current = ProviderSelector::pick_active(&enabled, setting.active_provider_id).cloned();
        let mut switch_recorded = false;
        let mut visited = 0;

        while let Some(provider) = current.take() {
            if visited >= enabled.len() {
                break;
            }
            visited += 1;

            let exhausted = match self.quota.is_exhausted(&provider).await {
                Ok(exhausted) => exhausted,
                Err(e) => {
                    warn!(provider = %provider.code, error = %e, "Quota unreadable, skipping provider");
                    true
                }
            };

            if exhausted {
                let next = self.selector.next_available_in(&enabled, &provider).await;
                info!(
                    tenant = %tenant,
                    provider = %provider.code,
                    next = ?next.as_ref().map(|p| p.code.as_str()),
                    "Provider quota exhausted"
                );
                self.log_switch(
                    &tenant,
                    &provider,
                    next.as_ref(),
                    "quota_exhausted",
                    json!({ "provider_code": provider.code }),
                )
                .await;
                switch_recorded = true;
                current = next;
                continue;
            }

            let attempt = self.attempt(&provider, &setting.pair).await;
            for transition in &attempt.transitions {
                notifications.extend(NotificationDecider::decide(
                    &tenant,
                    Some(&transition.before),
                    Some(&transition.after),
                    None,
                    None,
                ));
            }

            match attempt.report.outcome {
                Ok(value) => {
                    return Ok(self
                        .complete(setting, &provider, value, switch_recorded, notifications)
                        .await);
                }
                Err(fetch_error) => {
                    let next = self.selector.next_available_in(&enabled, &provider).await;
                    warn!(
                        tenant = %tenant,
                        provider = %provider.code,
                        error = %fetch_error,
                        attempts = attempt.report.attempts,
                        next = ?next.as_ref().map(|p| p.code.as_str()),
                        "Provider failed, failing over"
                    );
                    self.log_switch(
                        &tenant,
                        &provider,
                        next.as_ref(),
                        fetch_error.kind.code(),
                        json!({
                            "provider_code": provider.code,
                            "message": fetch_error.message,
                            "attempts": attempt.report.attempts,
                        }),
                    )
                    .await;
                    switch_recorded = true;
                    current = next;
                }
            }
        }

        self.fall_back(setting, notifications).await
    }

    /// Fetch from `provider` and book the quota it used.
    ///
    /// Runs as its own task so that a caller dropping the acquisition does not
    /// lose quota accounting for a call already in flight.
    async fn attempt(&self, provider: &Provider, pair: &CurrencyPair) -> Attempt {
        let fetcher = self.fetcher.clone();
        let quota = self.quota.clone();
        let charge_failed_calls = self.config.charge_failed_calls;
        let task_provider = provider.clone();
        let pair = pair.clone();

        let handle = tokio::spawn(async move {
            let provider = task_provider;
            let report = fetcher.fetch(&provider, &pair).await;
            let charges = if charge_failed_calls {
                report.round_trips
            } else if report.is_success() {
                1
            } else {
                0
            };

            let mut transitions = Vec::with_capacity(charges as usize);
            for _ in 0..charges {
                match quota.increment_usage(&provider).await {
                    Ok(transition) => transitions.push(transition),
                    Err(e) => {
                        error!(provider = %provider.code, error = %e, "Failed to record quota usage")
                    }
                }
            }

            Attempt { report, transitions }
        });

        match handle.await {
            Ok(attempt) => attempt,
            Err(e) => {
                error!(provider = %provider.code, error = %e, "Provider attempt task failed");
                Attempt {
                    report: FetchReport {
                        outcome: Err(FetchError::new(
                            FetchErrorKind::ConnectionFailed,
                            &provider.code,
                            e.to_string(),
                        )),
                        attempts: 0,
                        round_trips: 0,
                    },
                    transitions: Vec::new(),
                }
            }
        }
    }

    async fn complete(
        &self,
        mut setting: ExchangeRateSetting,
        provider: &Provider,
        value: RateValue,
        switch_recorded: bool,
        notifications: &mut Vec<Notification>,
    ) -> Acquisition {
        let tenant = setting.tenant_id.clone();
        let now = self.clock.now();
        let prior_active = setting.active_provider_id;
        let provider_changed = prior_active.map_or(false, |id| id != provider.id);

        if let Err(e) = self
            .event_log
            .record_rate_change(&tenant, &setting.pair, &value, Some(provider.id))
            .await
        {
            error!(tenant = %tenant, error = %e, "Failed to record rate change");
        }

        if provider_changed {
            if let Err(e) = self
                .event_log
                .record_switch_row(
                    &tenant,
                    &setting.pair,
                    &value,
                    Some(provider.id),
                    prior_active,
                )
                .await
            {
                error!(tenant = %tenant, error = %e, "Failed to record switch history");
            }

            if !switch_recorded {
                if let Err(e) = self
                    .event_log
                    .record_provider_switch(
                        &tenant,
                        prior_active,
                        Some(provider.id),
                        "active_provider_unavailable",
                        json!({ "provider_code": provider.code }),
                    )
                    .await
                {
                    error!(tenant = %tenant, error = %e, "Failed to record provider switch");
                }
            }
        }

        setting.current_rate = Some(value.rate());
        setting.current_rate_fetched_at = Some(value.fetched_at());
        setting.active_provider_id = Some(provider.id);
        setting.fallback_active = false;
        setting.stale_level = StaleLevel::Fresh;
        setting.update_time = now;
        if let Err(e) = self.save_setting(&setting).await {
            error!(tenant = %tenant, error = %e, "Failed to save rate setting");
        }

        notifications.extend(NotificationDecider::decide(
            &tenant,
            None,
            None,
            prior_active,
            Some(provider.id),
        ));

        info!(
            tenant = %tenant,
            provider = %provider.code,
            rate = %value.rate(),
            "Rate acquired"
        );

        Acquisition {
            quote: RateQuote::from_value(&value, QuoteOrigin::Fresh, now),
            value,
            provider_id: Some(provider.id),
            notifications: Vec::new(),
        }
    }

    async fn fall_back(
        &self,
        mut setting: ExchangeRateSetting,
        notifications: &mut Vec<Notification>,
    ) -> FxResult<Acquisition> {
        let tenant = setting.tenant_id.clone();
        let now = self.clock.now();

        let latest = self.event_log.latest_api_rate(&tenant, &setting.pair).await?;
        let Some((fetched, provider_id)) = latest else {
            error!(
                tenant = %tenant,
                pair = %setting.pair,
                "No provider answered and no rate was ever fetched for the pair"
            );
            return Err(FxError::RateUnavailable { tenant });
        };

        let cached = fetched
            .with_max_age_hours(self.config.max_age_hours)
            .as_cached();
        let level = cached.stale_level(now, self.config.very_stale_after);
        let prior = FallbackState {
            active: setting.fallback_active,
            stale_level: setting.stale_level,
        };
        let (raised, state) =
            NotificationDecider::decide_fallback(&tenant, prior, level, &cached, now);
        notifications.extend(raised);

        if let Err(e) = self
            .event_log
            .record_fallback(&tenant, &setting.pair, &cached, provider_id)
            .await
        {
            error!(tenant = %tenant, error = %e, "Failed to record fallback");
        }

        setting.fallback_active = state.active;
        setting.stale_level = state.stale_level;
        setting.update_time = now;
        if let Err(e) = self.save_setting(&setting).await {
            error!(tenant = %tenant, error = %e, "Failed to save rate setting");
        }

        warn!(
            tenant = %tenant,
            rate = %cached.rate(),
            age_hours = cached.age_in_hours(now),
            stale = cached.is_stale(now),
            "Serving cached rate"
        );

        Ok(Acquisition {
            quote: RateQuote::from_value(&cached, QuoteOrigin::Fallback, now),
            value: cached,
            provider_id,
            notifications: Vec::new(),
        })
    }

    async fn log_switch(
        &self,
        tenant: &TenantId,
        from: &Provider,
        to: Option<&Provider>,
        reason: &str,
        metadata: serde_json::Value,
    ) {
        if let Err(e) = self
            .event_log
            .record_provider_switch(tenant, Some(from.id), to.map(|p| p.id), reason, metadata)
            .await
        {
            error!(tenant = %tenant, reason, error = %e, "Failed to record provider switch");
        }
    }

    /// Pin a manual rate and switch the tenant to manual mode.
    #[instrument(skip(self))]
    pub async fn set_manual_rate(&self, tenant: &TenantId, rate: Decimal) -> FxResult<RateQuote> {
        let now = self.clock.now();
        let value = RateValue::new(rate, now, RateSource::Manual, None)?;

        let mut setting = self.setting(tenant).await?;
        setting.mode = RateMode::Manual;
        setting.manual_rate = Some(rate);
        setting.manual_rate_set_at = Some(now);
        setting.update_time = now;
        self.save_setting(&setting).await?;

        if let Err(e) = self
            .event_log
            .record_rate_change(tenant, &setting.pair, &value, None)
            .await
        {
            error!(tenant = %tenant, error = %e, "Failed to record manual rate");
        }

        info!(tenant = %tenant, rate = %rate, "Manual rate set");
        Ok(RateQuote::from_value(&value, QuoteOrigin::Manual, now))
    }

    /// Switch between manual and automatic rates.
    pub async fn set_mode(&self, tenant: &TenantId, mode: RateMode) -> FxResult<()> {
        let mut setting = self.setting(tenant).await?;
        if mode == RateMode::Manual && setting.manual_rate.is_none() {
            return Err(FxError::InvalidSetting(
                "manual mode requires a manual rate".to_string(),
            ));
        }

        setting.mode = mode;
        setting.update_time = self.clock.now();
        self.save_setting(&setting).await?;

        info!(tenant = %tenant, mode = mode.as_str(), "Rate mode changed");
        Ok(())
    }

    /// Change the currency pair acquired for the tenant.
    ///
    /// The rate held for the previous pair is dropped; history for it is kept
    /// but never served for the new pair.
    pub async fn set_pair(&self, tenant: &TenantId, pair: CurrencyPair) -> FxResult<()> {
        if !pair.base.is_valid() || !pair.quote.is_valid() || pair.base == pair.quote {
            return Err(FxError::InvalidSetting(format!("invalid currency pair {}", pair)));
        }

        let mut setting = self.setting(tenant).await?;
        if setting.pair == pair {
            return Ok(());
        }

        info!(tenant = %tenant, from = %setting.pair, to = %pair, "Currency pair changed");
        setting.pair = pair;
        setting.current_rate = None;
        setting.current_rate_fetched_at = None;
        setting.fallback_active = false;
        setting.stale_level = StaleLevel::Fresh;
        setting.update_time = self.clock.now();
        self.save_setting(&setting).await
    }
}
