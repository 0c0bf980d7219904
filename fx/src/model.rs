//! Persisted records: quota counters, tenant settings and the append-only logs.

use ratekeeper_common::{CurrencyPair, EventId, ProviderId, TenantId, Timestamp, YearMonth};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::quota::Remaining;
use crate::rate::{RateSource, StaleLevel};

/// Key of a quota counter: one per tenant, provider and calendar month.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuotaKey {
    pub tenant_id: TenantId,
    pub provider_id: ProviderId,
    pub period: YearMonth,
}

impl QuotaKey {
    pub fn new(tenant_id: TenantId, provider_id: ProviderId, period: YearMonth) -> Self {
        Self {
            tenant_id,
            provider_id,
            period,
        }
    }
}

/// Calls made against a provider within one month.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaTracking {
    pub key: QuotaKey,
    pub requests_made: i64,
    /// Provider quota captured when the row was created or last reset;
    /// `None` for unlimited providers.
    pub quota_limit: Option<i64>,
    pub last_reset_at: Option<Timestamp>,
    pub created_at: Timestamp,
}

impl QuotaTracking {
    /// A fresh counter starting at zero.
    pub fn new(key: QuotaKey, quota_limit: Option<i64>, now: Timestamp) -> Self {
        Self {
            key,
            requests_made: 0,
            quota_limit,
            last_reset_at: Some(now),
            created_at: now,
        }
    }

    /// `quota_limit - requests_made`, or unlimited.
    pub fn remaining(&self) -> Remaining {
        match self.quota_limit {
            Some(limit) => Remaining::Limited(limit - self.requests_made),
            None => Remaining::Unlimited,
        }
    }
}

/// How a tenant's rate is determined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateMode {
    Manual,
    #[default]
    Auto,
}

impl RateMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateMode::Manual => "manual",
            RateMode::Auto => "auto",
        }
    }
}

/// Per-tenant exchange rate settings, including the failover state carried
/// between acquisition runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRateSetting {
    pub tenant_id: TenantId,
    pub pair: CurrencyPair,
    pub mode: RateMode,
    pub manual_rate: Option<Decimal>,
    pub manual_rate_set_at: Option<Timestamp>,
    pub current_rate: Option<Decimal>,
    pub current_rate_fetched_at: Option<Timestamp>,
    pub active_provider_id: Option<ProviderId>,
    /// Set while rates are being served from history.
    pub fallback_active: bool,
    /// Staleness already reported for the current fallback episode.
    pub stale_level: StaleLevel,
    pub update_time: Timestamp,
}

impl ExchangeRateSetting {
    /// Default settings for a tenant that has never been configured.
    pub fn new(tenant_id: TenantId, now: Timestamp) -> Self {
        Self {
            tenant_id,
            pair: CurrencyPair::default(),
            mode: RateMode::Auto,
            manual_rate: None,
            manual_rate_set_at: None,
            current_rate: None,
            current_rate_fetched_at: None,
            active_provider_id: None,
            fallback_active: false,
            stale_level: StaleLevel::Fresh,
            update_time: now,
        }
    }
}

/// What a history row records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RateChange,
    Fallback,
    Switch,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::RateChange => "rate_change",
            EventType::Fallback => "fallback",
            EventType::Switch => "switch",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "rate_change" => Some(EventType::RateChange),
            "fallback" => Some(EventType::Fallback),
            "switch" => Some(EventType::Switch),
            _ => None,
        }
    }
}

/// Append-only record of a rate the tenant used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRateHistory {
    pub id: EventId,
    pub tenant_id: TenantId,
    pub pair: CurrencyPair,
    pub rate: Decimal,
    pub provider_id: Option<ProviderId>,
    pub source: RateSource,
    pub event_type: EventType,
    pub metadata: serde_json::Value,
    /// When the rate itself was obtained from its provider.
    pub fetched_at: Timestamp,
    pub created_at: Timestamp,
}

/// Append-only audit of a change of provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSwitchEvent {
    pub id: EventId,
    pub tenant_id: TenantId,
    pub old_provider_id: Option<ProviderId>,
    pub new_provider_id: Option<ProviderId>,
    pub reason: String,
    pub metadata: serde_json::Value,
    pub created_at: Timestamp,
}
