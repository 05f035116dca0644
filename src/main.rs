//! Process entry point.
//!
//! Loads settings, inits logging, constructs the clock and bus, spawns a
//! ~1Hz clock-tick producer, waits for a shutdown signal, stops the bus.
//! No exchange adapters are wired up here; those stay behind traits this
//! core calls out to but does not implement.

use std::sync::Arc;

use polyloly_core::bus::event::ClockTick;
use polyloly_core::bus::PartitionedEventBus;
use polyloly_core::clock::{Clock, SystemClock};
use polyloly_core::config::Settings;
use polyloly_core::{config::ConfigIssue, logging};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::from_env();
    logging::init(&settings.log_level, !settings.paper_trading);

    let issues = settings.validate();
    let has_errors = issues.iter().any(|i| matches!(i, ConfigIssue::Error(_)));
    for issue in &issues {
        match issue {
            ConfigIssue::Warning(msg) => tracing::warn!("{msg}"),
            ConfigIssue::Error(msg) => tracing::error!("{msg}"),
        }
    }
    if has_errors {
        if settings.paper_trading {
            tracing::error!("configuration error in paper mode; continuing anyway");
        } else {
            anyhow::bail!("configuration error in live-trading mode, aborting startup");
        }
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let bus = Arc::new(PartitionedEventBus::new(settings.event_bus.clone(), clock.clone()));
    bus.start();

    let tick_bus = bus.clone();
    let tick_clock = clock.clone();
    let tick_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            interval.tick().await;
            let tick = Arc::new(ClockTick::new(tick_clock.now_ms()));
            if let Err(e) = tick_bus.publish(tick).await {
                tracing::error!(error = %e, "failed to publish clock tick");
            }
        }
    });

    tracing::info!(run_id = %uuid::Uuid::new_v4(), "polyloly-core started");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");

    tick_task.abort();
    bus.stop().await;

    Ok(())
}
