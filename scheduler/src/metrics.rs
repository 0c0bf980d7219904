//! Counters for the refresh loop.

use std::sync::atomic::{AtomicU64, Ordering};

use ratekeeper_fx::QuoteOrigin;

/// Scheduler metrics.
pub struct SchedulerMetrics {
    /// Refresh passes completed.
    pub ticks_total: AtomicU64,
    /// Tenant acquisitions attempted.
    pub acquisitions_total: AtomicU64,
    /// Acquisitions served by a provider.
    pub rates_fresh: AtomicU64,
    /// Acquisitions served from the last stored rate.
    pub rates_fallback: AtomicU64,
    /// Acquisitions served from a pinned manual rate.
    pub rates_manual: AtomicU64,
    /// Acquisitions with no rate at all.
    pub rates_unavailable: AtomicU64,
    /// Acquisitions that failed for any other reason.
    pub acquisitions_failed: AtomicU64,
    /// Notifications raised by acquisitions.
    pub notifications_total: AtomicU64,
    /// Monthly quota periods opened.
    pub quota_rollovers: AtomicU64,
    /// Duration of the last refresh pass.
    pub last_tick_ms: AtomicU64,
}

impl SchedulerMetrics {
    pub fn new() -> Self {
        Self {
            ticks_total: AtomicU64::new(0),
            acquisitions_total: AtomicU64::new(0),
            rates_fresh: AtomicU64::new(0),
            rates_fallback: AtomicU64::new(0),
            rates_manual: AtomicU64::new(0),
            rates_unavailable: AtomicU64::new(0),
            acquisitions_failed: AtomicU64::new(0),
            notifications_total: AtomicU64::new(0),
            quota_rollovers: AtomicU64::new(0),
            last_tick_ms: AtomicU64::new(0),
        }
    }

    pub fn tick_completed(&self, elapsed_ms: u64) {
        self.ticks_total.fetch_add(1, Ordering::Relaxed);
        self.last_tick_ms.store(elapsed_ms, Ordering::Relaxed);
    }

    /// Record a successful acquisition by where its rate came from.
    pub fn acquired(&self, origin: QuoteOrigin, notifications: usize) {
        self.acquisitions_total.fetch_add(1, Ordering::Relaxed);
        self.notifications_total
            .fetch_add(notifications as u64, Ordering::Relaxed);
        let counter = match origin {
            QuoteOrigin::Fresh => &self.rates_fresh,
            QuoteOrigin::Fallback => &self.rates_fallback,
            QuoteOrigin::Manual => &self.rates_manual,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unavailable(&self) {
        self.acquisitions_total.fetch_add(1, Ordering::Relaxed);
        self.rates_unavailable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failed(&self) {
        self.acquisitions_total.fetch_add(1, Ordering::Relaxed);
        self.acquisitions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rollover(&self) {
        self.quota_rollovers.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            ticks_total: self.ticks_total.load(Ordering::Relaxed),
            acquisitions_total: self.acquisitions_total.load(Ordering::Relaxed),
            rates_fresh: self.rates_fresh.load(Ordering::Relaxed),
            rates_fallback: self.rates_fallback.load(Ordering::Relaxed),
            rates_manual: self.rates_manual.load(Ordering::Relaxed),
            rates_unavailable: self.rates_unavailable.load(Ordering::Relaxed),
            acquisitions_failed: self.acquisitions_failed.load(Ordering::Relaxed),
            notifications_total: self.notifications_total.load(Ordering::Relaxed),
            quota_rollovers: self.quota_rollovers.load(Ordering::Relaxed),
            last_tick_ms: self.last_tick_ms.load(Ordering::Relaxed),
        }
    }

    /// Export metrics in Prometheus format.
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        format!(
            r#"# HELP ratekeeper_ticks_total Refresh passes completed
# TYPE ratekeeper_ticks_total counter
ratekeeper_ticks_total {}

# HELP ratekeeper_acquisitions_total Tenant rate acquisitions attempted
# TYPE ratekeeper_acquisitions_total counter
ratekeeper_acquisitions_total {}

# HELP ratekeeper_rates_total Acquisitions by rate origin
# TYPE ratekeeper_rates_total counter
ratekeeper_rates_total{{origin="fresh"}} {}
ratekeeper_rates_total{{origin="fallback"}} {}
ratekeeper_rates_total{{origin="manual"}} {}

# HELP ratekeeper_rates_unavailable_total Acquisitions with no usable rate
# TYPE ratekeeper_rates_unavailable_total counter
ratekeeper_rates_unavailable_total {}

# HELP ratekeeper_acquisitions_failed_total Acquisitions failed for other reasons
# TYPE ratekeeper_acquisitions_failed_total counter
ratekeeper_acquisitions_failed_total {}

# HELP ratekeeper_notifications_total Notifications raised
# TYPE ratekeeper_notifications_total counter
ratekeeper_notifications_total {}

# HELP ratekeeper_quota_rollovers_total Monthly quota periods opened
# TYPE ratekeeper_quota_rollovers_total counter
ratekeeper_quota_rollovers_total {}

# HELP ratekeeper_last_tick_ms Duration of the last refresh pass
# TYPE ratekeeper_last_tick_ms gauge
ratekeeper_last_tick_ms {}
"#,
            snapshot.ticks_total,
            snapshot.acquisitions_total,
            snapshot.rates_fresh,
            snapshot.rates_fallback,
            snapshot.rates_manual,
            snapshot.rates_unavailable,
            snapshot.acquisitions_failed,
            snapshot.notifications_total,
            snapshot.quota_rollovers,
            snapshot.last_tick_ms,
        )
    }
}

impl Default for SchedulerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub ticks_total: u64,
    pub acquisitions_total: u64,
    pub rates_fresh: u64,
    pub rates_fallback: u64,
    pub rates_manual: u64,
    pub rates_unavailable: u64,
    pub acquisitions_failed: u64,
    pub notifications_total: u64,
    pub quota_rollovers: u64,
    pub last_tick_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquisitions_counted_by_origin() {
        let metrics = SchedulerMetrics::new();
        metrics.acquired(QuoteOrigin::Fresh, 1);
        metrics.acquired(QuoteOrigin::Fallback, 2);
        metrics.unavailable();
        metrics.failed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.acquisitions_total, 4);
        assert_eq!(snapshot.rates_fresh, 1);
        assert_eq!(snapshot.rates_fallback, 1);
        assert_eq!(snapshot.rates_manual, 0);
        assert_eq!(snapshot.notifications_total, 3);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = SchedulerMetrics::new();
        metrics.acquired(QuoteOrigin::Manual, 0);
        metrics.tick_completed(42);

        let text = metrics.to_prometheus();
        assert!(text.contains("ratekeeper_rates_total{origin=\"manual\"} 1"));
        assert!(text.contains("ratekeeper_ticks_total 1"));
        assert!(text.contains("ratekeeper_last_tick_ms 42"));
    }
}
