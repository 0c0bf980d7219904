//! Monthly quota tracking and threshold evaluation.

use std::sync::Arc;

use ratekeeper_common::{Clock, PersistenceResult, ProviderId, YearMonth};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::model::{QuotaKey, QuotaTracking};
use crate::provider::Provider;
use crate::store::{with_persistence_retry, QuotaTrackingRepository};

/// Calls left this month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Remaining {
    Unlimited,
    Limited(i64),
}

impl Remaining {
    pub fn is_unlimited(&self) -> bool {
        matches!(self, Remaining::Unlimited)
    }

    pub fn limited(&self) -> Option<i64> {
        match self {
            Remaining::Limited(n) => Some(*n),
            Remaining::Unlimited => None,
        }
    }
}

/// Threshold band a provider's remaining quota falls in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaLevel {
    Unlimited,
    Healthy,
    Warning,
    Critical,
    Exhausted,
}

/// Remaining quota together with the thresholds it is judged against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub provider_id: ProviderId,
    pub remaining: Remaining,
    pub warning_threshold: i64,
    pub critical_threshold: i64,
}

impl QuotaSnapshot {
    /// Snapshot of `provider` given its current counter, if one exists yet.
    pub fn of(provider: &Provider, record: Option<&QuotaTracking>) -> Self {
        let remaining = if provider.is_unlimited {
            Remaining::Unlimited
        } else {
            let limit = record
                .and_then(|r| r.quota_limit)
                .or(provider.monthly_quota)
                .unwrap_or(0);
            let used = record.map_or(0, |r| r.requests_made);
            Remaining::Limited(limit - used)
        };

        Self {
            provider_id: provider.id,
            remaining,
            warning_threshold: provider.warning_threshold,
            critical_threshold: provider.critical_threshold,
        }
    }

    pub fn is_at_warning(&self) -> bool {
        match self.remaining {
            Remaining::Limited(r) => r <= self.warning_threshold && r > self.critical_threshold,
            Remaining::Unlimited => false,
        }
    }

    pub fn is_at_critical(&self) -> bool {
        match self.remaining {
            Remaining::Limited(r) => r <= self.critical_threshold && r > 0,
            Remaining::Unlimited => false,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        match self.remaining {
            Remaining::Limited(r) => r <= 0,
            Remaining::Unlimited => false,
        }
    }

    pub fn level(&self) -> QuotaLevel {
        if self.remaining.is_unlimited() {
            QuotaLevel::Unlimited
        } else if self.is_exhausted() {
            QuotaLevel::Exhausted
        } else if self.is_at_critical() {
            QuotaLevel::Critical
        } else if self.is_at_warning() {
            QuotaLevel::Warning
        } else {
            QuotaLevel::Healthy
        }
    }
}

/// The before/after pair of a single atomic increment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaTransition {
    pub before: QuotaSnapshot,
    pub after: QuotaSnapshot,
    pub record: QuotaTracking,
}

/// Usage line for one provider in a tenant report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderUsage {
    pub provider_id: ProviderId,
    pub code: String,
    pub period: YearMonth,
    pub requests_made: i64,
    pub quota_limit: Option<i64>,
    pub remaining: Remaining,
    pub percent_used: Option<f64>,
    pub level: QuotaLevel,
}

/// Tracks calls made against each provider in the current calendar month.
pub struct QuotaTracker {
    repo: Arc<dyn QuotaTrackingRepository>,
    clock: Arc<dyn Clock>,
}

impl QuotaTracker {
    pub fn new(repo: Arc<dyn QuotaTrackingRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { repo, clock }
    }

    fn key(provider: &Provider, period: YearMonth) -> QuotaKey {
        QuotaKey::new(provider.tenant_id.clone(), provider.id, period)
    }

    fn current_period(&self) -> YearMonth {
        YearMonth::of(self.clock.now())
    }

    /// Counter for `period`, created at zero if absent.
    pub async fn get_or_create(
        &self,
        provider: &Provider,
        period: YearMonth,
    ) -> PersistenceResult<QuotaTracking> {
        let key = Self::key(provider, period);
        let now = self.clock.now();
        with_persistence_retry("quota.get_or_create", || {
            self.repo.get_or_create(&key, provider.monthly_quota, now)
        })
        .await
    }

    /// Record one call against the current month.
    ///
    /// The increment is a single atomic repository operation, so the returned
    /// transition is unique to this call even under concurrent callers.
    pub async fn increment_usage(&self, provider: &Provider) -> PersistenceResult<QuotaTransition> {
        let key = Self::key(provider, self.current_period());
        let now = self.clock.now();
        let record = with_persistence_retry("quota.increment", || {
            self.repo.increment(&key, provider.monthly_quota, now)
        })
        .await?;

        let mut previous = record.clone();
        previous.requests_made -= 1;

        let transition = QuotaTransition {
            before: QuotaSnapshot::of(provider, Some(&previous)),
            after: QuotaSnapshot::of(provider, Some(&record)),
            record,
        };

        debug!(
            provider = %provider.code,
            requests_made = transition.record.requests_made,
            remaining = ?transition.after.remaining,
            "Quota usage recorded"
        );

        Ok(transition)
    }

    /// Current snapshot without creating a counter.
    pub async fn snapshot(&self, provider: &Provider) -> PersistenceResult<QuotaSnapshot> {
        let key = Self::key(provider, self.current_period());
        let record = with_persistence_retry("quota.get", || self.repo.get(&key)).await?;
        Ok(QuotaSnapshot::of(provider, record.as_ref()))
    }

    pub async fn remaining(&self, provider: &Provider) -> PersistenceResult<Remaining> {
        Ok(self.snapshot(provider).await?.remaining)
    }

    pub async fn is_at_warning(&self, provider: &Provider) -> PersistenceResult<bool> {
        Ok(self.snapshot(provider).await?.is_at_warning())
    }

    pub async fn is_at_critical(&self, provider: &Provider) -> PersistenceResult<bool> {
        Ok(self.snapshot(provider).await?.is_at_critical())
    }

    pub async fn is_exhausted(&self, provider: &Provider) -> PersistenceResult<bool> {
        Ok(self.snapshot(provider).await?.is_exhausted())
    }

    /// Zero the current month's counter.
    ///
    /// A counter already at zero that was reset this month is left untouched,
    /// so repeated calls within a month are no-ops.
    pub async fn reset_quota(&self, provider: &Provider) -> PersistenceResult<QuotaTracking> {
        let period = self.current_period();
        let key = Self::key(provider, period);
        let now = self.clock.now();

        if let Some(existing) = with_persistence_retry("quota.get", || self.repo.get(&key)).await? {
            let reset_this_month = existing.last_reset_at.map_or(false, |at| period.contains(at));
            if existing.requests_made == 0 && reset_this_month {
                return Ok(existing);
            }
        }

        let record = with_persistence_retry("quota.reset", || {
            self.repo.reset(&key, provider.monthly_quota, now)
        })
        .await?;

        info!(provider = %provider.code, period = %period, "Quota reset");
        Ok(record)
    }

    /// Open the current month's counter if this is the first use this month.
    ///
    /// Returns true when a new period was started. Never zeroes an existing
    /// counter, so it cannot race with concurrent increments.
    pub async fn rollover_if_needed(&self, provider: &Provider) -> PersistenceResult<bool> {
        let period = self.current_period();
        let key = Self::key(provider, period);
        let existed = with_persistence_retry("quota.get", || self.repo.get(&key))
            .await?
            .is_some();

        if existed {
            return Ok(false);
        }

        self.get_or_create(provider, period).await?;
        info!(provider = %provider.code, period = %period, "Quota period opened");
        Ok(true)
    }

    /// Usage of each provider for the current month.
    pub async fn usage_report(&self, providers: &[Provider]) -> PersistenceResult<Vec<ProviderUsage>> {
        let period = self.current_period();
        let mut report = Vec::with_capacity(providers.len());

        for provider in providers {
            let key = Self::key(provider, period);
            let record = with_persistence_retry("quota.get", || self.repo.get(&key)).await?;
            let snapshot = QuotaSnapshot::of(provider, record.as_ref());
            let requests_made = record.as_ref().map_or(0, |r| r.requests_made);
            let quota_limit = if provider.is_unlimited {
                None
            } else {
                record
                    .as_ref()
                    .and_then(|r| r.quota_limit)
                    .or(provider.monthly_quota)
            };
            let percent_used = quota_limit
                .filter(|limit| *limit > 0)
                .map(|limit| requests_made as f64 / limit as f64 * 100.0);

            report.push(ProviderUsage {
                provider_id: provider.id,
                code: provider.code.clone(),
                period,
                requests_made,
                quota_limit,
                remaining: snapshot.remaining,
                percent_used,
                level: snapshot.level(),
            });
        }

        Ok(report)
    }
}
