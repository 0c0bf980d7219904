//! Exchange rate value object and the quote handed to pricing consumers.

use chrono::Duration;
use ratekeeper_common::{age_of, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{FxError, FxResult};

/// Where a rate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateSource {
    /// Fetched from an external provider.
    Api,
    /// Entered by the tenant.
    Manual,
    /// Replayed from history because no provider was usable.
    Cache,
}

impl RateSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateSource::Api => "api",
            RateSource::Manual => "manual",
            RateSource::Cache => "cache",
        }
    }
}

impl fmt::Display for RateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How old a rate is relative to the freshness thresholds.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum StaleLevel {
    #[default]
    Fresh,
    Stale,
    VeryStale,
}

impl StaleLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            StaleLevel::Fresh => "fresh",
            StaleLevel::Stale => "stale",
            StaleLevel::VeryStale => "very_stale",
        }
    }
}

/// An immutable rate with its provenance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateValue {
    rate: Decimal,
    fetched_at: Timestamp,
    source: RateSource,
    provider_code: Option<String>,
    max_age_hours: i64,
}

impl RateValue {
    /// Default freshness window.
    pub const DEFAULT_MAX_AGE_HOURS: i64 = 24;

    /// Create a rate value; zero and negative rates are rejected.
    pub fn new(
        rate: Decimal,
        fetched_at: Timestamp,
        source: RateSource,
        provider_code: Option<String>,
    ) -> FxResult<Self> {
        if rate <= Decimal::ZERO {
            return Err(FxError::InvalidRate(format!(
                "rate must be positive, got {}",
                rate
            )));
        }

        Ok(Self {
            rate,
            fetched_at,
            source,
            provider_code,
            max_age_hours: Self::DEFAULT_MAX_AGE_HOURS,
        })
    }

    /// Override the freshness window.
    pub fn with_max_age_hours(mut self, hours: i64) -> Self {
        self.max_age_hours = hours;
        self
    }

    pub fn rate(&self) -> Decimal {
        self.rate
    }

    pub fn fetched_at(&self) -> Timestamp {
        self.fetched_at
    }

    pub fn source(&self) -> RateSource {
        self.source
    }

    pub fn provider_code(&self) -> Option<&str> {
        self.provider_code.as_deref()
    }

    pub fn max_age_hours(&self) -> i64 {
        self.max_age_hours
    }

    /// Age at `now`.
    pub fn age(&self, now: Timestamp) -> Duration {
        age_of(self.fetched_at, now)
    }

    /// Age at `now` in fractional hours.
    pub fn age_in_hours(&self, now: Timestamp) -> f64 {
        self.age(now).num_seconds() as f64 / 3600.0
    }

    /// Manual rates are set deliberately by the tenant and never go stale.
    pub fn is_stale(&self, now: Timestamp) -> bool {
        self.source != RateSource::Manual && self.age(now) > Duration::hours(self.max_age_hours)
    }

    /// Check the separate, longer "very stale" threshold.
    pub fn is_very_stale(&self, now: Timestamp, very_stale_after: Duration) -> bool {
        self.source != RateSource::Manual && self.age(now) > very_stale_after
    }

    pub fn stale_level(&self, now: Timestamp, very_stale_after: Duration) -> StaleLevel {
        if self.is_very_stale(now, very_stale_after) {
            StaleLevel::VeryStale
        } else if self.is_stale(now) {
            StaleLevel::Stale
        } else {
            StaleLevel::Fresh
        }
    }

    /// The same rate, relabelled as served from cache.
    pub fn as_cached(&self) -> Self {
        Self {
            source: RateSource::Cache,
            ..self.clone()
        }
    }
}

/// Why a quote was served the way it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuoteOrigin {
    Fresh,
    Fallback,
    Manual,
}

/// A rate ready for pricing code: value, provenance and freshness at read time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateQuote {
    pub rate: Decimal,
    pub fetched_at: Timestamp,
    pub source: RateSource,
    pub provider_code: Option<String>,
    pub is_stale: bool,
    pub age_hours: f64,
    pub origin: QuoteOrigin,
}

impl RateQuote {
    /// Evaluate `value` at `now`.
    pub fn from_value(value: &RateValue, origin: QuoteOrigin, now: Timestamp) -> Self {
        Self {
            rate: value.rate,
            fetched_at: value.fetched_at,
            source: value.source,
            provider_code: value.provider_code.clone(),
            is_stale: value.is_stale(now),
            age_hours: value.age_in_hours(now),
            origin,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    #[test]
    fn test_rejects_non_positive_rates() {
        let now = Utc::now();
        assert!(RateValue::new(dec!(0), now, RateSource::Api, None).is_err());
        assert!(RateValue::new(dec!(-1.2), now, RateSource::Api, None).is_err());
        assert!(RateValue::new(dec!(0.0001), now, RateSource::Api, None).is_ok());
    }

    #[test]
    fn test_staleness_thresholds() {
        let now = Utc::now();
        let fetched = now - Duration::hours(30);
        let value = RateValue::new(dec!(0.92), fetched, RateSource::Api, Some("ECB".into())).unwrap();

        assert!(value.is_stale(now));
        assert!(!value.is_very_stale(now, Duration::days(7)));
        assert_eq!(value.stale_level(now, Duration::days(7)), StaleLevel::Stale);
        assert_eq!(value.age_in_hours(now), 30.0);

        let relaxed = value.clone().with_max_age_hours(48);
        assert!(!relaxed.is_stale(now));
    }

    #[test]
    fn test_manual_rates_never_stale() {
        let now = Utc::now();
        let value =
            RateValue::new(dec!(1.1), now - Duration::days(90), RateSource::Manual, None).unwrap();
        assert_eq!(value.stale_level(now, Duration::days(7)), StaleLevel::Fresh);
    }

    #[test]
    fn test_quote_carries_provenance() {
        let now = Utc::now();
        let value = RateValue::new(dec!(0.91), now - Duration::hours(2), RateSource::Api, Some("ECB".into()))
            .unwrap()
            .as_cached();
        let quote = RateQuote::from_value(&value, QuoteOrigin::Fallback, now);

        assert_eq!(quote.source, RateSource::Cache);
        assert_eq!(quote.provider_code.as_deref(), Some("ECB"));
        assert!(!quote.is_stale);
        assert_eq!(quote.age_hours, 2.0);
    }
}
