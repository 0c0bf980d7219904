//! Rate source clients: the single network round-trip to a provider.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use ratekeeper_common::CurrencyPair;
use reqwest::{Client, StatusCode, Url};
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::debug;

use crate::error::{FetchError, FetchErrorKind};
use crate::provider::{Provider, ResponseFormat};

/// Performs one call to a provider and returns the raw rate.
///
/// Implementations make exactly one round-trip per call; retries and
/// timeouts are layered on by [`crate::fetcher::RateFetcher`].
#[async_trait]
pub trait RateSourceClient: Send + Sync {
    async fn fetch_rate(&self, provider: &Provider, pair: &CurrencyPair) -> Result<Decimal, FetchError>;
}

/// Default HTTP request timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// JSON-over-HTTP rate source.
///
/// `api_url` may contain `{base}`, `{quote}` and `{api_key}` placeholders.
/// Without them, `base`/`symbols` query parameters are appended, and the key
/// is sent as `apikey` when the provider requires one.
pub struct HttpRateSource {
    client: Client,
}

impl HttpRateSource {
    pub fn new() -> Self {
        Self::with_timeout(REQUEST_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self { client }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn request_url(provider: &Provider, pair: &CurrencyPair) -> Result<Url, FetchError> {
        let templated = provider
            .api_url
            .replace("{base}", pair.base.code())
            .replace("{quote}", pair.quote.code());
        let key_in_template = templated.contains("{api_key}");
        let templated = match &provider.api_key {
            Some(key) => templated.replace("{api_key}", key),
            None => templated,
        };

        // A malformed URL is a configuration fault; retrying cannot fix it.
        let mut url = Url::parse(&templated).map_err(|e| {
            FetchError::new(
                FetchErrorKind::InvalidResponse,
                &provider.code,
                format!("invalid api_url: {}", e),
            )
        })?;

        let mut params: Vec<(&str, &str)> = Vec::new();
        if !provider.api_url.contains("{base}") {
            params.push(("base", pair.base.code()));
            params.push(("symbols", pair.quote.code()));
        }
        if provider.requires_api_key && !key_in_template {
            if let Some(key) = &provider.api_key {
                params.push(("apikey", key));
            }
        }
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params);
        }

        Ok(url)
    }

    fn transport_error(provider: &str, e: reqwest::Error) -> FetchError {
        let kind = if e.is_timeout() {
            FetchErrorKind::NetworkTimeout
        } else if e.is_connect() {
            FetchErrorKind::ConnectionFailed
        } else if e.is_body() || e.is_decode() {
            FetchErrorKind::InvalidResponse
        } else {
            FetchErrorKind::ConnectionFailed
        };
        FetchError::new(kind, provider, e.to_string())
    }
}

impl Default for HttpRateSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateSourceClient for HttpRateSource {
    async fn fetch_rate(&self, provider: &Provider, pair: &CurrencyPair) -> Result<Decimal, FetchError> {
        let url = Self::request_url(provider, pair)?;
        let code = provider.code.as_str();

        debug!(provider = code, pair = %pair, "Requesting rate");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Self::transport_error(code, e))?;

        let status = response.status();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(FetchError::new(
                    FetchErrorKind::Authentication,
                    code,
                    format!("HTTP {}", status),
                ))
            }
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(FetchError::new(
                    FetchErrorKind::RateLimit,
                    code,
                    format!("HTTP {}", status),
                ))
            }
            s if !s.is_success() => {
                return Err(FetchError::new(
                    FetchErrorKind::InvalidResponse,
                    code,
                    format!("HTTP {}", status),
                ))
            }
            _ => {}
        }

        let body = response
            .text()
            .await
            .map_err(|e| Self::transport_error(code, e))?;
        let json: Value = serde_json::from_str(&body).map_err(|e| {
            FetchError::new(FetchErrorKind::InvalidJson, code, e.to_string())
        })?;

        extract_rate(&provider.response_format, &json, pair)
            .map_err(|message| FetchError::new(FetchErrorKind::InvalidResponse, code, message))
    }
}

/// Pull a positive rate out of a provider response body.
pub fn extract_rate(
    format: &ResponseFormat,
    body: &Value,
    pair: &CurrencyPair,
) -> Result<Decimal, String> {
    if body.get("success").and_then(Value::as_bool) == Some(false) {
        let detail = body.get("error").map(|e| e.to_string()).unwrap_or_default();
        return Err(format!("provider reported failure {}", detail));
    }

    let raw = match format {
        ResponseFormat::RatesMap => body.get("rates").and_then(|r| r.get(pair.quote.code())),
        ResponseFormat::ConversionRate => body.get("conversion_rate"),
        ResponseFormat::JsonPointer { pointer } => body.pointer(pointer),
    }
    .ok_or_else(|| format!("no rate for {} in response", pair))?;

    let rate = parse_decimal(raw).ok_or_else(|| format!("rate is not numeric: {}", raw))?;
    if rate <= Decimal::ZERO {
        return Err(format!("rate must be positive, got {}", rate));
    }

    Ok(rate)
}

fn parse_decimal(value: &Value) -> Option<Decimal> {
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        _ => return None,
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
}

/// Scripted response for [`MockRateSource`].
#[cfg(any(test, feature = "test-utils"))]
#[derive(Debug, Clone)]
pub enum MockResponse {
    Rate(Decimal),
    Fail(FetchErrorKind),
    /// Never completes; exercises the per-attempt timeout.
    Hang,
}

/// Mock rate source for testing.
#[cfg(any(test, feature = "test-utils"))]
#[derive(Default)]
pub struct MockRateSource {
    scripted: dashmap::DashMap<String, std::collections::VecDeque<MockResponse>>,
    standing: dashmap::DashMap<String, MockResponse>,
    calls: dashmap::DashMap<String, u32>,
    latency: parking_lot::Mutex<Option<Duration>>,
}

#[cfg(any(test, feature = "test-utils"))]
impl MockRateSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every call to `code` with `rate`.
    pub fn set_rate(&self, code: &str, rate: Decimal) {
        self.standing.insert(code.to_string(), MockResponse::Rate(rate));
    }

    /// Fail every call to `code` with `kind`.
    pub fn fail_with(&self, code: &str, kind: FetchErrorKind) {
        self.standing.insert(code.to_string(), MockResponse::Fail(kind));
    }

    /// Queue one-shot responses, consumed before the standing response.
    pub fn push(&self, code: &str, responses: impl IntoIterator<Item = MockResponse>) {
        self.scripted
            .entry(code.to_string())
            .or_default()
            .extend(responses);
    }

    /// Delay every response.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    pub fn calls(&self, code: &str) -> u32 {
        self.calls.get(code).map(|c| *c).unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.iter().map(|c| *c).sum()
    }
}

#[cfg(any(test, feature = "test-utils"))]
#[async_trait]
impl RateSourceClient for MockRateSource {
    async fn fetch_rate(&self, provider: &Provider, _pair: &CurrencyPair) -> Result<Decimal, FetchError> {
        let code = provider.code.as_str();
        *self.calls.entry(code.to_string()).or_insert(0) += 1;

        let scripted = self
            .scripted
            .get_mut(code)
            .and_then(|mut queue| queue.pop_front());
        let response = scripted
            .or_else(|| self.standing.get(code).map(|r| r.clone()))
            .unwrap_or(MockResponse::Fail(FetchErrorKind::ConnectionFailed));

        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        match response {
            MockResponse::Rate(rate) => Ok(rate),
            MockResponse::Fail(kind) => Err(FetchError::new(kind, code, "mock failure")),
            MockResponse::Hang => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ratekeeper_common::{Currency, TenantId};
    use rust_decimal_macros::dec;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn pair() -> CurrencyPair {
        CurrencyPair::new(Currency::usd(), Currency::eur())
    }

    fn provider(url: String) -> Provider {
        Provider::new(TenantId::new("t1"), "OPENRATES", url)
    }

    #[test]
    fn test_extract_rates_map() {
        let body = json!({ "base": "USD", "rates": { "EUR": 0.9214, "GBP": 0.79 } });
        let rate = extract_rate(&ResponseFormat::RatesMap, &body, &pair()).unwrap();
        assert_eq!(rate, dec!(0.9214));
    }

    #[test]
    fn test_extract_conversion_rate_and_pointer() {
        let body = json!({ "result": "success", "conversion_rate": "0.93" });
        assert_eq!(
            extract_rate(&ResponseFormat::ConversionRate, &body, &pair()).unwrap(),
            dec!(0.93)
        );

        let body = json!({ "data": { "quote": { "price": 1.0875 } } });
        let format = ResponseFormat::JsonPointer {
            pointer: "/data/quote/price".to_string(),
        };
        assert_eq!(extract_rate(&format, &body, &pair()).unwrap(), dec!(1.0875));
    }

    #[test]
    fn test_extract_rejects_bad_values() {
        let format = ResponseFormat::RatesMap;
        assert!(extract_rate(&format, &json!({ "rates": { "EUR": 0 } }), &pair()).is_err());
        assert!(extract_rate(&format, &json!({ "rates": { "EUR": "abc" } }), &pair()).is_err());
        assert!(extract_rate(&format, &json!({ "rates": {} }), &pair()).is_err());
        assert!(extract_rate(&format, &json!({ "success": false, "error": { "code": 104 } }), &pair()).is_err());
    }

    #[test]
    fn test_request_url_templating() {
        let p = Provider::new(
            TenantId::new("t1"),
            "EXR",
            "https://v6.example.com/{api_key}/pair/{base}/{quote}",
        )
        .with_api_key("k123");
        let url = HttpRateSource::request_url(&p, &pair()).unwrap();
        assert_eq!(url.as_str(), "https://v6.example.com/k123/pair/USD/EUR");

        let p = Provider::new(TenantId::new("t1"), "FIXER", "https://fixer.example.com/latest")
            .with_api_key("k123");
        let url = HttpRateSource::request_url(&p, &pair()).unwrap();
        assert_eq!(
            url.as_str(),
            "https://fixer.example.com/latest?base=USD&symbols=EUR&apikey=k123"
        );
    }

    #[tokio::test]
    async fn test_malformed_api_url_is_not_retryable() {
        let err = HttpRateSource::new()
            .fetch_rate(&provider("not a url/{base}".to_string()), &pair())
            .await
            .unwrap_err();

        assert_eq!(err.kind, FetchErrorKind::InvalidResponse);
        assert!(!err.is_retryable());
        assert!(err.message.contains("invalid api_url"));
    }

    #[tokio::test]
    async fn test_http_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/latest"))
            .and(query_param("base", "USD"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "rates": { "EUR": 0.92 } })))
            .mount(&server)
            .await;

        let source = HttpRateSource::new();
        let rate = source
            .fetch_rate(&provider(format!("{}/latest", server.uri())), &pair())
            .await
            .unwrap();
        assert_eq!(rate, dec!(0.92));
    }

    #[tokio::test]
    async fn test_http_status_classification() {
        let cases = [
            (401, FetchErrorKind::Authentication),
            (403, FetchErrorKind::Authentication),
            (429, FetchErrorKind::RateLimit),
            (500, FetchErrorKind::InvalidResponse),
        ];

        for (status, expected) in cases {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(status))
                .mount(&server)
                .await;

            let err = HttpRateSource::new()
                .fetch_rate(&provider(format!("{}/latest", server.uri())), &pair())
                .await
                .unwrap_err();
            assert_eq!(err.kind, expected, "status {}", status);
        }
    }

    #[tokio::test]
    async fn test_http_invalid_json() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
            .mount(&server)
            .await;

        let err = HttpRateSource::new()
            .fetch_rate(&provider(format!("{}/latest", server.uri())), &pair())
            .await
            .unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::InvalidJson);
    }

    #[tokio::test]
    async fn test_http_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "rates": { "EUR": 0.92 } }))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let err = HttpRateSource::with_timeout(Duration::from_millis(50))
            .fetch_rate(&provider(format!("{}/latest", server.uri())), &pair())
            .await
            .unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::NetworkTimeout);
    }

    #[tokio::test]
    async fn test_http_connection_refused() {
        // Port 9 (discard) is closed on test hosts.
        let err = HttpRateSource::new()
            .fetch_rate(&provider("http://127.0.0.1:9/latest".to_string()), &pair())
            .await
            .unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::ConnectionFailed);
    }

    #[tokio::test]
    async fn test_mock_scripts_then_standing() {
        let source = MockRateSource::new();
        let p = provider("https://unused".to_string());
        source.set_rate("OPENRATES", dec!(0.9));
        source.push("OPENRATES", [MockResponse::Fail(FetchErrorKind::RateLimit)]);

        assert!(source.fetch_rate(&p, &pair()).await.is_err());
        assert_eq!(source.fetch_rate(&p, &pair()).await.unwrap(), dec!(0.9));
        assert_eq!(source.calls("OPENRATES"), 2);
    }
}
