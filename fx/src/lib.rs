//! RateKeeper FX Engine
//!
//! Quota-aware exchange rate acquisition for multi-tenant storefronts.
//!
//! # Features
//!
//! - Priority-ordered providers with monthly call quotas
//! - Automatic failover when a provider is exhausted or failing
//! - Fallback to the last fetched rate, flagged with its age
//! - Transition-based quota, failover and staleness notifications
//! - Per-tenant rate caching with single-flight acquisition
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ratekeeper_common::{SystemClock, TenantId};
//! use ratekeeper_fx::{
//!     FailoverOrchestrator, HttpRateSource, OrchestratorConfig, RateCache, RateService,
//!     StorePorts, TracingSink,
//! };
//!
//! let clock = Arc::new(SystemClock);
//! let orchestrator = Arc::new(FailoverOrchestrator::new(
//!     StorePorts::in_memory(),
//!     Arc::new(HttpRateSource::new()),
//!     clock.clone(),
//!     Arc::new(TracingSink),
//!     OrchestratorConfig::default(),
//! ));
//! let service = RateService::new(orchestrator, RateCache::new(clock));
//!
//! let quote = service.current_rate(&TenantId::new("shop_eu")).await?;
//! ```

pub mod cache;
pub mod error;
pub mod event_log;
pub mod fetcher;
pub mod model;
pub mod notification;
pub mod orchestrator;
pub mod provider;
pub mod quota;
pub mod rate;
pub mod registry;
pub mod selector;
pub mod service;
pub mod source;
pub mod store;

pub use cache::{RateCache, RateCacheConfig};
pub use error::{ConfigError, FetchError, FetchErrorKind, FxError, FxResult};
pub use event_log::EventLog;
pub use fetcher::{FetchReport, RateFetcher, RetryPolicy};
pub use model::{
    EventType, ExchangeRateHistory, ExchangeRateSetting, ProviderSwitchEvent, QuotaKey,
    QuotaTracking, RateMode,
};
pub use notification::{
    Notification, NotificationDecider, NotificationKind, NotificationSink, Severity, TracingSink,
};
pub use orchestrator::{Acquisition, FailoverOrchestrator, OrchestratorConfig};
pub use provider::{Provider, ResponseFormat};
pub use quota::{QuotaLevel, QuotaSnapshot, QuotaTracker, Remaining};
pub use rate::{QuoteOrigin, RateQuote, RateSource, RateValue, StaleLevel};
pub use registry::ProviderRegistry;
pub use selector::ProviderSelector;
pub use service::RateService;
pub use source::{HttpRateSource, RateSourceClient};
pub use store::StorePorts;

#[cfg(any(test, feature = "test-utils"))]
pub use notification::CollectingSink;
#[cfg(any(test, feature = "test-utils"))]
pub use source::{MockRateSource, MockResponse};
