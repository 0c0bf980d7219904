//! Per-tenant in-process rate cache with TTL support.

use chrono::Duration;
use dashmap::DashMap;
use ratekeeper_common::{Clock, ProviderId, TenantId, Timestamp};
use std::sync::Arc;
use tracing::debug;

use crate::rate::{QuoteOrigin, RateQuote, RateValue};

/// Cached rate entry.
#[derive(Debug, Clone)]
struct CacheEntry {
    value: RateValue,
    origin: QuoteOrigin,
    provider_id: Option<ProviderId>,
    cached_at: Timestamp,
    ttl: Duration,
}

impl CacheEntry {
    fn is_valid(&self, now: Timestamp) -> bool {
        now.signed_duration_since(self.cached_at) < self.ttl
    }
}

/// Configuration for the rate cache.
#[derive(Debug, Clone)]
pub struct RateCacheConfig {
    /// TTL for freshly fetched and manual rates.
    pub default_ttl: Duration,
    /// TTL for fallback rates, kept short so recovery is noticed quickly.
    pub fallback_ttl: Duration,
    /// Maximum number of entries.
    pub max_entries: usize,
}

impl Default for RateCacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::minutes(15),
            fallback_ttl: Duration::minutes(1),
            max_entries: 10000,
        }
    }
}

impl RateCacheConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(secs) = std::env::var("RATEKEEPER_CACHE_TTL_SECS") {
            if let Ok(secs) = secs.parse() {
                config.default_ttl = Duration::seconds(secs);
            }
        }

        config
    }
}

/// A cache hit, evaluated at read time.
#[derive(Debug, Clone)]
pub struct CachedRate {
    pub quote: RateQuote,
    pub provider_id: Option<ProviderId>,
}

/// Thread-safe per-tenant rate cache.
pub struct RateCache {
    cache: DashMap<TenantId, CacheEntry>,
    clock: Arc<dyn Clock>,
    config: RateCacheConfig,
}

impl RateCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_config(clock, RateCacheConfig::default())
    }

    pub fn with_config(clock: Arc<dyn Clock>, config: RateCacheConfig) -> Self {
        Self {
            cache: DashMap::new(),
            clock,
            config,
        }
    }

    /// Get the tenant's rate if the entry is still valid.
    ///
    /// Staleness and age are recomputed on every hit.
    pub fn get(&self, tenant: &TenantId) -> Option<CachedRate> {
        let now = self.clock.now();

        if let Some(entry) = self.cache.get(tenant) {
            if entry.is_valid(now) {
                debug!(tenant = %tenant, "Cache hit");
                return Some(CachedRate {
                    quote: RateQuote::from_value(&entry.value, entry.origin, now),
                    provider_id: entry.provider_id,
                });
            }
            debug!(tenant = %tenant, "Cache entry expired");
            drop(entry);
            self.cache.remove(tenant);
        }

        debug!(tenant = %tenant, "Cache miss");
        None
    }

    /// Insert a rate, choosing the TTL from its origin.
    pub fn insert(
        &self,
        tenant: &TenantId,
        value: RateValue,
        origin: QuoteOrigin,
        provider_id: Option<ProviderId>,
    ) {
        let ttl = match origin {
            QuoteOrigin::Fallback => self.config.fallback_ttl,
            QuoteOrigin::Fresh | QuoteOrigin::Manual => self.config.default_ttl,
        };

        if self.cache.len() >= self.config.max_entries {
            self.evict_expired();
        }

        self.cache.insert(
            tenant.clone(),
            CacheEntry {
                value,
                origin,
                provider_id,
                cached_at: self.clock.now(),
                ttl,
            },
        );
    }

    pub fn remove(&self, tenant: &TenantId) {
        self.cache.remove(tenant);
    }

    pub fn clear(&self) {
        self.cache.clear();
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn evict_expired(&self) {
        let now = self.clock.now();
        self.cache.retain(|_, entry| entry.is_valid(now));
    }

    pub fn stats(&self) -> CacheStats {
        let now = self.clock.now();
        let total = self.cache.len();
        let valid = self.cache.iter().filter(|e| e.is_valid(now)).count();

        CacheStats {
            total_entries: total,
            valid_entries: valid,
            expired_entries: total - valid,
        }
    }
}

/// Cache statistics.
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub total_entries: usize,
    pub valid_entries: usize,
    pub expired_entries: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate::RateSource;
    use chrono::{TimeZone, Utc};
    use ratekeeper_common::ManualClock;
    use rust_decimal_macros::dec;

    fn setup() -> (Arc<ManualClock>, RateCache) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap(),
        ));
        let cache = RateCache::new(clock.clone());
        (clock, cache)
    }

    fn value(clock: &ManualClock) -> RateValue {
        RateValue::new(dec!(0.91), clock.now(), RateSource::Api, Some("P1".into())).unwrap()
    }

    #[test]
    fn test_cache_insert_and_get() {
        let (clock, cache) = setup();
        let tenant = TenantId::new("t1");

        cache.insert(&tenant, value(&clock), QuoteOrigin::Fresh, None);

        let hit = cache.get(&tenant).unwrap();
        assert_eq!(hit.quote.rate, dec!(0.91));
        assert_eq!(hit.quote.origin, QuoteOrigin::Fresh);
        assert!(cache.get(&TenantId::new("t2")).is_none());
    }

    #[test]
    fn test_cache_expiry() {
        let (clock, cache) = setup();
        let tenant = TenantId::new("t1");
        cache.insert(&tenant, value(&clock), QuoteOrigin::Fresh, None);

        clock.advance(Duration::minutes(14));
        let hit = cache.get(&tenant).unwrap();
        assert!((hit.quote.age_hours - 14.0 / 60.0).abs() < 1e-9);

        clock.advance(Duration::minutes(2));
        assert!(cache.get(&tenant).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_fallback_entries_expire_sooner() {
        let (clock, cache) = setup();
        let tenant = TenantId::new("t1");
        cache.insert(&tenant, value(&clock).as_cached(), QuoteOrigin::Fallback, None);

        clock.advance(Duration::seconds(61));
        assert!(cache.get(&tenant).is_none());
    }

    #[test]
    fn test_stats_and_eviction() {
        let (clock, cache) = setup();
        cache.insert(&TenantId::new("t1"), value(&clock), QuoteOrigin::Fallback, None);
        cache.insert(&TenantId::new("t2"), value(&clock), QuoteOrigin::Fresh, None);

        clock.advance(Duration::minutes(5));
        let stats = cache.stats();
        assert_eq!((stats.valid_entries, stats.expired_entries), (1, 1));

        cache.evict_expired();
        assert_eq!(cache.len(), 1);
    }
}
