//! maintrack -- repair and maintenance performance analytics for plant
//! mechanics.
//!
//! This crate provides the core library for incident statistics, time-based
//! pattern detection, improvement-task tracking and the scheduled workflow
//! that ties them together.

pub mod analysis;
pub mod config;
pub mod detect;
pub mod model;
pub mod notify;
pub mod query;
pub mod scheduler;
pub mod storage;
pub mod tracker;
pub mod workflow;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;

use config::TrackerConfig;
use storage::Store;

/// Start the daemon: cron scheduler driving the workflow orchestrator.
/// Returns after Ctrl-C.
pub async fn serve(config: &TrackerConfig, store: Arc<dyn Store>) -> Result<()> {
    let schedules = scheduler::Schedules::from_config(&config.schedule)?;
    let notifier: Arc<dyn notify::Notifier> = Arc::from(
        notify::notifier_from_config(&config.notifications)
            .context("failed to build notifier")?,
    );
    let orchestrator = Arc::new(workflow::Orchestrator::new(store, config, notifier));

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("interrupt received");
                let _ = tx.send(true);
            }
            Err(e) => {
                // Keep the sender alive; a dropped sender reads as shutdown.
                tracing::warn!(error = %e, "cannot listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        }
    });

    scheduler::run_scheduler_loop(
        orchestrator,
        schedules,
        std::time::Duration::from_secs(config.schedule.poll_secs.max(1)),
        rx,
    )
    .await;
    Ok(())
}
