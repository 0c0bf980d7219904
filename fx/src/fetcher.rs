//! Single-provider rate fetching with bounded retries.

use std::sync::Arc;
use std::time::Duration;

use ratekeeper_common::{Clock, CurrencyPair};
use tracing::{debug, warn};

use crate::error::{ConfigError, FetchError, FetchErrorKind};
use crate::provider::Provider;
use crate::rate::{RateSource, RateValue};
use crate::source::RateSourceClient;

/// Exponential backoff between attempts against one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_millis(800),
        }
    }
}

impl RetryPolicy {
    /// Delay after the failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError("retry max_attempts must be at least 1".into()));
        }
        if self.base_delay > self.max_delay {
            return Err(ConfigError("retry base_delay exceeds max_delay".into()));
        }
        Ok(())
    }
}

/// Outcome of fetching from one provider, with the round-trips it cost.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchReport {
    pub outcome: Result<RateValue, FetchError>,
    pub attempts: u32,
    /// Attempts that reached the provider and so count against its quota.
    pub round_trips: u32,
}

impl FetchReport {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Fetches a rate from one provider, retrying transient failures.
pub struct RateFetcher {
    source: Arc<dyn RateSourceClient>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    attempt_timeout: Duration,
    max_age_hours: i64,
}

impl RateFetcher {
    pub fn new(source: Arc<dyn RateSourceClient>, clock: Arc<dyn Clock>) -> Self {
        Self {
            source,
            clock,
            policy: RetryPolicy::default(),
            attempt_timeout: Duration::from_secs(10),
            max_age_hours: RateValue::DEFAULT_MAX_AGE_HOURS,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_max_age_hours(mut self, hours: i64) -> Self {
        self.max_age_hours = hours;
        self
    }

    pub fn is_retryable(error: &FetchError) -> bool {
        error.is_retryable()
    }

    /// Fetch `pair` from `provider`.
    ///
    /// Each attempt has its own timeout budget. Only timeouts, connection
    /// failures and rate limiting are retried.
    pub async fn fetch(&self, provider: &Provider, pair: &CurrencyPair) -> FetchReport {
        let code = provider.code.as_str();
        let mut attempts = 0;
        let mut round_trips = 0;

        loop {
            attempts += 1;

            let result = match tokio::time::timeout(
                self.attempt_timeout,
                self.source.fetch_rate(provider, pair),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(FetchError::new(
                    FetchErrorKind::NetworkTimeout,
                    code,
                    format!("no response within {}ms", self.attempt_timeout.as_millis()),
                )),
            };

            let error = match result {
                Ok(rate) => {
                    round_trips += 1;
                    let outcome = RateValue::new(
                        rate,
                        self.clock.now(),
                        RateSource::Api,
                        Some(provider.code.clone()),
                    )
                    .map(|v| v.with_max_age_hours(self.max_age_hours))
                    .map_err(|e| {
                        FetchError::new(FetchErrorKind::InvalidResponse, code, e.to_string())
                    });

                    debug!(provider = code, attempts, success = outcome.is_ok(), "Fetch finished");
                    return FetchReport {
                        outcome,
                        attempts,
                        round_trips,
                    };
                }
                Err(e) => e,
            };

            if error.kind.reached_provider() {
                round_trips += 1;
            }

            if error.is_retryable() && attempts < self.policy.max_attempts {
                let delay = self.policy.delay_for(attempts);
                warn!(
                    provider = code,
                    attempt = attempts,
                    error = %error,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying rate fetch"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            return FetchReport {
                outcome: Err(error),
                attempts,
                round_trips,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{MockRateSource, MockResponse};
    use chrono::{TimeZone, Utc};
    use ratekeeper_common::{ManualClock, TenantId};
    use rust_decimal_macros::dec;

    fn setup() -> (Arc<MockRateSource>, RateFetcher, Provider) {
        let source = Arc::new(MockRateSource::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).unwrap(),
        ));
        let fetcher = RateFetcher::new(source.clone(), clock);
        let provider = Provider::new(TenantId::new("t1"), "P1", "https://p1.example.com");
        (source, fetcher, provider)
    }

    #[test]
    fn test_delay_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(10), Duration::from_millis(800));
    }

    #[test]
    fn test_policy_validation() {
        assert!(RetryPolicy::default().validate().is_ok());
        let policy = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        };
        assert!(policy.validate().is_err());
    }

    #[tokio::test]
    async fn test_success_stamps_provenance() {
        let (source, fetcher, provider) = setup();
        source.set_rate("P1", dec!(0.9214));

        let report = fetcher.fetch(&provider, &CurrencyPair::default()).await;
        let value = report.outcome.unwrap();

        assert_eq!(value.rate(), dec!(0.9214));
        assert_eq!(value.source(), RateSource::Api);
        assert_eq!(value.provider_code(), Some("P1"));
        assert_eq!(value.fetched_at(), Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).unwrap());
        assert_eq!((report.attempts, report.round_trips), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_then_succeeds() {
        let (source, fetcher, provider) = setup();
        source.push(
            "P1",
            [
                MockResponse::Fail(FetchErrorKind::RateLimit),
                MockResponse::Fail(FetchErrorKind::ConnectionFailed),
            ],
        );
        source.set_rate("P1", dec!(1.1));

        let started = tokio::time::Instant::now();
        let report = fetcher.fetch(&provider, &CurrencyPair::default()).await;

        assert!(report.is_success());
        assert_eq!(report.attempts, 3);
        // The refused connection never reached the provider.
        assert_eq!(report.round_trips, 2);
        assert!(started.elapsed() >= Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_error_is_not_retried() {
        let (source, fetcher, provider) = setup();
        source.fail_with("P1", FetchErrorKind::Authentication);

        let report = fetcher.fetch(&provider, &CurrencyPair::default()).await;

        assert_eq!(report.outcome.unwrap_err().kind, FetchErrorKind::Authentication);
        assert_eq!(source.calls("P1"), 1);
        assert_eq!(report.round_trips, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let (source, fetcher, provider) = setup();
        source.fail_with("P1", FetchErrorKind::ConnectionFailed);

        let report = fetcher.fetch(&provider, &CurrencyPair::default()).await;

        assert_eq!(report.outcome.unwrap_err().kind, FetchErrorKind::ConnectionFailed);
        assert_eq!(report.attempts, 3);
        assert_eq!(report.round_trips, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_attempt_times_out() {
        let (source, fetcher, provider) = setup();
        let fetcher = fetcher.with_attempt_timeout(Duration::from_secs(2));
        source.push("P1", [MockResponse::Hang]);
        source.set_rate("P1", dec!(0.95));

        let report = fetcher.fetch(&provider, &CurrencyPair::default()).await;

        assert_eq!(report.outcome.unwrap().rate(), dec!(0.95));
        assert_eq!(report.attempts, 2);
    }

    #[tokio::test]
    async fn test_non_positive_rate_is_invalid_response() {
        let (source, fetcher, provider) = setup();
        source.set_rate("P1", dec!(0));

        let report = fetcher.fetch(&provider, &CurrencyPair::default()).await;

        assert_eq!(report.outcome.unwrap_err().kind, FetchErrorKind::InvalidResponse);
        assert_eq!(report.round_trips, 1);
    }
}
