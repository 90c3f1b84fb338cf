// Worker clippy configuration
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Memberpass Background Worker
//!
//! Handles scheduled jobs including:
//! - Monthly price rollover for dynamic plans (00:05 UTC on the 1st)
//! - Replay of webhook events whose handler failed (every 10 minutes)

mod config;
mod event_replay;

use std::sync::Arc;

use memberpass_billing::{BillingService, PlanRollover, RolloverReport};
use memberpass_shared::create_pool;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

/// Log results of a rollover run
fn log_rollover_results(report: &RolloverReport) {
    info!(
        month = %report.month,
        applied = report.count(|o| matches!(o, PlanRollover::Applied { .. })),
        already_current = report.count(|o| matches!(o, PlanRollover::AlreadyCurrent)),
        missing_price = report.count(|o| matches!(o, PlanRollover::MissingPrice { .. })),
        failed = report.count(|o| matches!(o, PlanRollover::Failed(_))),
        "Rollover cycle complete"
    );

    for (plan_id, outcome) in &report.plans {
        match outcome {
            PlanRollover::MissingPrice { paused, pause_failures } => {
                warn!(plan_id = %plan_id, paused = paused, pause_failures = pause_failures, "Plan has no price this month");
            }
            PlanRollover::Failed(e) => {
                error!(plan_id = %plan_id, error = %e, "Rollover failed for plan");
            }
            _ => {}
        }
    }
}

async fn run_rollover(billing: &BillingService) {
    match billing.rollover.run(OffsetDateTime::now_utc()).await {
        Ok(report) => log_rollover_results(&report),
        Err(e) => error!(error = %e, "Monthly rollover failed"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;

    // Initialize logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if config.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("Starting Memberpass Worker");

    let pool = create_pool(&config.database_url, config.database_max_connections).await?;
    info!("Database pool created");

    let billing = Arc::new(BillingService::from_env(pool, config.resume_item_timeout)?);

    if config.rollover_on_startup {
        info!("Running startup rollover check");
        run_rollover(&billing).await;
    }

    // Create scheduler
    let mut scheduler = JobScheduler::new().await?;

    // Job 1: Monthly price rollover
    let rollover_billing = billing.clone();
    scheduler
        .add(Job::new_async(config.rollover_cron.as_str(), move |_uuid, _l| {
            let billing = rollover_billing.clone();
            Box::pin(async move {
                info!("Running scheduled monthly price rollover");
                run_rollover(&billing).await;
            })
        })?)
        .await?;
    info!(cron = %config.rollover_cron, "Scheduled: Monthly price rollover");

    // Job 2: Failed event replay
    let replay_billing = billing.clone();
    let grace = config.event_replay_grace;
    let batch = config.event_replay_batch;
    scheduler
        .add(Job::new_async(config.event_replay_cron.as_str(), move |_uuid, _l| {
            let billing = replay_billing.clone();
            Box::pin(async move {
                event_replay::replay_failed_events(&billing, OffsetDateTime::now_utc(), grace, batch)
                    .await;
            })
        })?)
        .await?;
    info!(cron = %config.event_replay_cron, "Scheduled: Failed event replay");

    scheduler.start().await?;
    info!("Worker started, waiting for jobs");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    scheduler.shutdown().await?;
    info!("Worker shut down");

    Ok(())
}
