//! RateKeeper Binary
//!
//! Loads the provider catalog and refreshes every tenant's exchange rate on
//! a fixed interval.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ratekeeper_common::SystemClock;
use ratekeeper_fx::{
    FailoverOrchestrator, HttpRateSource, RateCache, RateService, StorePorts, TracingSink,
};
use ratekeeper_scheduler::{Catalog, Scheduler, SchedulerConfig};
use ratekeeper_store_pg::PgStore;

#[derive(Parser, Debug)]
#[command(name = "ratekeeper")]
#[command(about = "Quota-aware exchange rate refresher for multi-tenant storefronts")]
struct Args {
    /// Provider catalog (JSON)
    #[arg(short, long)]
    catalog: Option<PathBuf>,

    /// Run a single refresh pass, print the report and exit
    #[arg(long)]
    once: bool,

    /// Seconds between refresh passes
    #[arg(long)]
    tick_secs: Option<u64>,

    /// Comma-separated tenants to refresh (default: all in the catalog)
    #[arg(long)]
    tenants: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = SchedulerConfig::from_env();
    if let Some(path) = args.catalog {
        config.catalog_path = Some(path);
    }
    if let Some(secs) = args.tick_secs {
        config.tick_interval = Duration::from_secs(secs);
    }
    if let Some(tenants) = args.tenants.as_deref() {
        config.tenants = ratekeeper_scheduler::config::parse_tenant_list(tenants);
    }

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting RateKeeper");

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(anyhow::anyhow!("Configuration error: {}", e));
    }

    let ports = match config.database_url.as_deref() {
        Some(url) => {
            let store = PgStore::connect(url).await?;
            store.migrate().await?;
            store.ports()
        }
        None => {
            warn!("DATABASE_URL not set, using in-memory store");
            StorePorts::in_memory()
        }
    };

    let clock = Arc::new(SystemClock);
    let orchestrator = Arc::new(FailoverOrchestrator::new(
        ports,
        Arc::new(HttpRateSource::with_timeout(config.orchestrator.attempt_timeout)),
        clock.clone(),
        Arc::new(TracingSink),
        config.orchestrator.clone(),
    ));

    let catalog = match &config.catalog_path {
        Some(path) => Catalog::load(path)?,
        None => Catalog::default(),
    };
    let catalog_tenants = catalog.apply(&orchestrator).await?;

    let tenants = if config.tenants.is_empty() {
        catalog_tenants
    } else {
        config.tenants.clone()
    };
    if tenants.is_empty() {
        return Err(anyhow::anyhow!(
            "no tenants configured; pass --catalog or set RATEKEEPER_TENANTS"
        ));
    }

    let service = Arc::new(RateService::new(
        orchestrator,
        RateCache::with_config(clock, config.cache.clone()),
    ));
    let scheduler = Arc::new(Scheduler::new(service, tenants, config.tick_interval));

    if args.once {
        let summary = scheduler.run_once().await;
        let report = scheduler.report().await?;
        println!("{}", serde_json::to_string_pretty(&report)?);

        return if summary.unavailable + summary.failed > 0 {
            Err(anyhow::anyhow!(
                "{} of {} tenants have no rate",
                summary.unavailable + summary.failed,
                summary.tenants
            ))
        } else {
            Ok(())
        };
    }

    // Set up graceful shutdown
    let scheduler_clone = scheduler.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        info!("Shutdown signal received");
        scheduler_clone.stop();
    });

    scheduler.run().await?;

    info!(metrics = ?scheduler.metrics().snapshot(), "RateKeeper shutdown complete");
    Ok(())
}
