//! RateKeeper Scheduler
//!
//! Loads the tenant catalog and keeps every tenant's exchange rate fresh by
//! running acquisitions on a fixed interval.

pub mod catalog;
pub mod config;
pub mod metrics;
pub mod scheduler;
pub mod state;

pub use catalog::{Catalog, ProviderEntry, TenantEntry};
pub use config::SchedulerConfig;
pub use metrics::{MetricsSnapshot, SchedulerMetrics};
pub use scheduler::{Scheduler, TenantReport, TickSummary};
pub use state::SchedulerState;
