//! Transition-based notification decisions and dispatch.
//!
//! Deciding is pure: callers pass the state before and after an event and
//! get back only the notifications for conditions that were just entered.

use async_trait::async_trait;
use ratekeeper_common::{ProviderId, TenantId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use crate::quota::{QuotaSnapshot, Remaining};
use crate::rate::{RateValue, StaleLevel};

/// Notification kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    QuotaWarning,
    QuotaCritical,
    ProviderSwitched,
    FallbackUsed,
    StaleRate,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::QuotaWarning => "quota_warning",
            NotificationKind::QuotaCritical => "quota_critical",
            NotificationKind::ProviderSwitched => "provider_switched",
            NotificationKind::FallbackUsed => "fallback_used",
            NotificationKind::StaleRate => "stale_rate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// A notification addressed to a tenant's operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub severity: Severity,
    pub tenant_id: TenantId,
    pub provider_id: Option<ProviderId>,
    pub message: String,
    pub metadata: serde_json::Value,
}

/// Persisted fallback condition of a tenant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FallbackState {
    pub active: bool,
    pub stale_level: StaleLevel,
}

/// Pure notification rules.
pub struct NotificationDecider;

impl NotificationDecider {
    /// Notifications for a quota change and/or an active provider change.
    ///
    /// Quota kinds fire only when `new_quota` enters a band `prior_quota` was
    /// not already in. A prior snapshot of a different provider counts as
    /// unknown. `provider_switched` needs a known prior provider.
    pub fn decide(
        tenant: &TenantId,
        prior_quota: Option<&QuotaSnapshot>,
        new_quota: Option<&QuotaSnapshot>,
        prior_active: Option<ProviderId>,
        new_active: Option<ProviderId>,
    ) -> Vec<Notification> {
        let mut out = Vec::new();

        if let Some(new) = new_quota {
            let prior = prior_quota.filter(|p| p.provider_id == new.provider_id);
            let remaining = match new.remaining {
                Remaining::Limited(n) => json!(n),
                Remaining::Unlimited => serde_json::Value::Null,
            };

            if new.is_at_warning() && !prior.map_or(false, |p| p.is_at_warning()) {
                out.push(Notification {
                    kind: NotificationKind::QuotaWarning,
                    severity: Severity::Warning,
                    tenant_id: tenant.clone(),
                    provider_id: Some(new.provider_id),
                    message: format!(
                        "Provider quota low: {} calls remaining this month",
                        remaining
                    ),
                    metadata: json!({
                        "remaining": remaining,
                        "warning_threshold": new.warning_threshold,
                    }),
                });
            }

            if new.is_at_critical() && !prior.map_or(false, |p| p.is_at_critical()) {
                out.push(Notification {
                    kind: NotificationKind::QuotaCritical,
                    severity: Severity::Critical,
                    tenant_id: tenant.clone(),
                    provider_id: Some(new.provider_id),
                    message: format!(
                        "Provider quota critical: {} calls remaining this month",
                        remaining
                    ),
                    metadata: json!({
                        "remaining": remaining,
                        "critical_threshold": new.critical_threshold,
                    }),
                });
            }
        }

        if let (Some(old), Some(new)) = (prior_active, new_active) {
            if old != new {
                out.push(Notification {
                    kind: NotificationKind::ProviderSwitched,
                    severity: Severity::Info,
                    tenant_id: tenant.clone(),
                    provider_id: Some(new),
                    message: format!("Active rate provider changed from {} to {}", old, new),
                    metadata: json!({
                        "old_provider_id": old.to_string(),
                        "new_provider_id": new.to_string(),
                    }),
                });
            }
        }

        out
    }

    /// Notifications for serving `cached` as a fallback, plus the state to
    /// persist afterwards.
    ///
    /// `stale_rate` fires when the staleness level rises above the prior one,
    /// so a rate that ages from stale to very stale alerts again.
    pub fn decide_fallback(
        tenant: &TenantId,
        prior: FallbackState,
        stale_level: StaleLevel,
        cached: &RateValue,
        now: Timestamp,
    ) -> (Vec<Notification>, FallbackState) {
        let mut out = Vec::new();
        let age_hours = cached.age_in_hours(now);

        if !prior.active {
            out.push(Notification {
                kind: NotificationKind::FallbackUsed,
                severity: Severity::Warning,
                tenant_id: tenant.clone(),
                provider_id: None,
                message: "No rate provider available, serving last known rate".to_string(),
                metadata: json!({
                    "rate": cached.rate().to_string(),
                    "provider_code": cached.provider_code(),
                    "fetched_at": cached.fetched_at(),
                }),
            });
        }

        if stale_level > prior.stale_level {
            let severity = match stale_level {
                StaleLevel::VeryStale => Severity::Critical,
                _ => Severity::Warning,
            };
            out.push(Notification {
                kind: NotificationKind::StaleRate,
                severity,
                tenant_id: tenant.clone(),
                provider_id: None,
                message: format!("Served exchange rate is {:.1} hours old", age_hours),
                metadata: json!({
                    "age_hours": age_hours,
                    "fetched_at": cached.fetched_at(),
                }),
            });
        }

        (
            out,
            FallbackState {
                active: true,
                stale_level,
            },
        )
    }
}

/// Delivery boundary for notifications.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn dispatch(&self, notifications: &[Notification]);
}

/// Sink that writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn dispatch(&self, notifications: &[Notification]) {
        for n in notifications {
            let provider_id = n.provider_id.map(|id| id.to_string());
            match n.severity {
                Severity::Critical => error!(
                    tenant = %n.tenant_id,
                    kind = n.kind.as_str(),
                    provider_id = ?provider_id,
                    metadata = %n.metadata,
                    "{}", n.message
                ),
                Severity::Warning => warn!(
                    tenant = %n.tenant_id,
                    kind = n.kind.as_str(),
                    provider_id = ?provider_id,
                    metadata = %n.metadata,
                    "{}", n.message
                ),
                Severity::Info => info!(
                    tenant = %n.tenant_id,
                    kind = n.kind.as_str(),
                    provider_id = ?provider_id,
                    metadata = %n.metadata,
                    "{}", n.message
                ),
            }
        }
    }
}

/// Sink that keeps everything it receives.
#[cfg(any(test, feature = "test-utils"))]
#[derive(Debug, Default)]
pub struct CollectingSink {
    seen: parking_lot::Mutex<Vec<Notification>>,
}

#[cfg(any(test, feature = "test-utils"))]
impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.seen.lock().clone()
    }

    pub fn count(&self, kind: NotificationKind) -> usize {
        self.seen.lock().iter().filter(|n| n.kind == kind).count()
    }

    pub fn clear(&self) {
        self.seen.lock().clear();
    }
}

#[cfg(any(test, feature = "test-utils"))]
#[async_trait]
impl NotificationSink for CollectingSink {
    async fn dispatch(&self, notifications: &[Notification]) {
        self.seen.lock().extend_from_slice(notifications);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate::RateSource;
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;

    fn snapshot(id: ProviderId, remaining: i64) -> QuotaSnapshot {
        QuotaSnapshot {
            provider_id: id,
            remaining: Remaining::Limited(remaining),
            warning_threshold: 50,
            critical_threshold: 10,
        }
    }

    fn kinds(notes: &[Notification]) -> Vec<NotificationKind> {
        notes.iter().map(|n| n.kind).collect()
    }

    #[test]
    fn test_warning_fires_once_on_entry() {
        let tenant = TenantId::new("t1");
        let id = ProviderId::new();

        let entering = NotificationDecider::decide(
            &tenant,
            Some(&snapshot(id, 51)),
            Some(&snapshot(id, 50)),
            None,
            None,
        );
        assert_eq!(kinds(&entering), vec![NotificationKind::QuotaWarning]);
        assert_eq!(entering[0].severity, Severity::Warning);

        let staying = NotificationDecider::decide(
            &tenant,
            Some(&snapshot(id, 50)),
            Some(&snapshot(id, 49)),
            None,
            None,
        );
        assert!(staying.is_empty());
    }

    #[test]
    fn test_critical_fires_on_entry() {
        let tenant = TenantId::new("t1");
        let id = ProviderId::new();

        let notes = NotificationDecider::decide(
            &tenant,
            Some(&snapshot(id, 11)),
            Some(&snapshot(id, 10)),
            None,
            None,
        );
        assert_eq!(kinds(&notes), vec![NotificationKind::QuotaCritical]);

        let exhausted = NotificationDecider::decide(
            &tenant,
            Some(&snapshot(id, 1)),
            Some(&snapshot(id, 0)),
            None,
            None,
        );
        assert!(exhausted.is_empty());
    }

    #[test]
    fn test_snapshot_of_other_provider_is_not_prior() {
        let tenant = TenantId::new("t1");
        let notes = NotificationDecider::decide(
            &tenant,
            Some(&snapshot(ProviderId::new(), 40)),
            Some(&snapshot(ProviderId::new(), 40)),
            None,
            None,
        );
        assert_eq!(kinds(&notes), vec![NotificationKind::QuotaWarning]);
    }

    #[test]
    fn test_provider_switched() {
        let tenant = TenantId::new("t1");
        let (a, b) = (ProviderId::new(), ProviderId::new());

        let switched = NotificationDecider::decide(&tenant, None, None, Some(a), Some(b));
        assert_eq!(kinds(&switched), vec![NotificationKind::ProviderSwitched]);

        assert!(NotificationDecider::decide(&tenant, None, None, Some(a), Some(a)).is_empty());
        assert!(NotificationDecider::decide(&tenant, None, None, None, Some(b)).is_empty());
    }

    #[test]
    fn test_fallback_fires_on_entry_and_escalation() {
        let tenant = TenantId::new("t1");
        let now = Utc::now();
        let week = Duration::days(7);
        let cached = RateValue::new(dec!(0.91), now - Duration::hours(30), RateSource::Api, None)
            .unwrap()
            .as_cached();

        let level = cached.stale_level(now, week);
        let (first, state) =
            NotificationDecider::decide_fallback(&tenant, FallbackState::default(), level, &cached, now);
        assert_eq!(
            kinds(&first),
            vec![NotificationKind::FallbackUsed, NotificationKind::StaleRate]
        );
        assert_eq!(first[1].severity, Severity::Warning);

        let (repeat, state) = NotificationDecider::decide_fallback(&tenant, state, level, &cached, now);
        assert!(repeat.is_empty());

        let later = now + Duration::days(7);
        let level = cached.stale_level(later, week);
        let (escalated, state) =
            NotificationDecider::decide_fallback(&tenant, state, level, &cached, later);
        assert_eq!(kinds(&escalated), vec![NotificationKind::StaleRate]);
        assert_eq!(escalated[0].severity, Severity::Critical);
        assert_eq!(state.stale_level, StaleLevel::VeryStale);
    }

    #[tokio::test]
    async fn test_collecting_sink() {
        let sink = CollectingSink::new();
        let tenant = TenantId::new("t1");
        let notes = NotificationDecider::decide(
            &tenant,
            None,
            None,
            Some(ProviderId::new()),
            Some(ProviderId::new()),
        );

        sink.dispatch(&notes).await;
        TracingSink.dispatch(&notes).await;

        assert_eq!(sink.count(NotificationKind::ProviderSwitched), 1);
    }
}
