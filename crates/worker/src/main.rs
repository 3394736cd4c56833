//! Vendly Background Worker
//!
//! Handles scheduled billing sweeps:
//! - Trial expiry (hourly)
//! - Trial-ending reminder emails (daily at 9:00 UTC)
//! - Grace period enforcement for failed renewals (hourly at :30)
//! - Webhook event retention cleanup (daily at 3:00 UTC)
//! - Billing invariant checks (daily at 6:00 UTC)

use std::sync::Arc;
use std::time::Duration;

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use vendly_billing::{webhooks, BillingService};
use vendly_shared::create_pool;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Vendly Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url).await?;
    info!("Database pool created");

    // Create billing service
    let billing = match BillingService::from_env(pool.clone()) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            // Gateway not configured: nothing to sweep, keep the process
            // alive so deploys don't crash-loop.
            warn!(error = %e, "Failed to create billing service - running in minimal mode");

            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };

    let scheduler = JobScheduler::new().await?;

    // Job 1: Trial expiry sweep (hourly)
    // Demotes free_trial accounts past the trial window back to free.
    let trial_service = billing.trial.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let trial = trial_service.clone();
            Box::pin(async move {
                info!("Running trial expiry sweep");
                match trial.expire_trials().await {
                    Ok(expired) => info!(expired = expired, "Trial expiry sweep complete"),
                    Err(e) => error!(error = %e, "Trial expiry sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Trial expiry sweep (hourly)");

    // Job 2: Trial-ending reminder emails (daily at 9:00 UTC)
    let reminder_service = billing.trial.clone();
    scheduler
        .add(Job::new_async("0 0 9 * * *", move |_uuid, _l| {
            let trial = reminder_service.clone();
            Box::pin(async move {
                info!("Running trial reminder sweep");
                match trial.send_trial_reminders().await {
                    Ok(sent) => info!(recipients = sent, "Trial reminder sweep complete"),
                    Err(e) => error!(error = %e, "Trial reminder sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Trial reminder emails (daily at 9:00 UTC)");

    // Job 3: Grace period enforcement (hourly at :30)
    // Demotes premium accounts whose failed-renewal grace window elapsed.
    let grace_reconciler = billing.reconciler.clone();
    scheduler
        .add(Job::new_async("0 30 * * * *", move |_uuid, _l| {
            let reconciler = grace_reconciler.clone();
            Box::pin(async move {
                info!("Running grace period enforcement");
                match reconciler.enforce_grace_periods().await {
                    Ok(demoted) => {
                        if demoted > 0 {
                            warn!(demoted = demoted, "Accounts demoted after grace period");
                        }
                        info!(demoted = demoted, "Grace period enforcement complete");
                    }
                    Err(e) => error!(error = %e, "Grace period enforcement failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Grace period enforcement (hourly at :30)");

    // Job 4: Webhook event retention cleanup (daily at 3:00 UTC)
    let cleanup_pool = pool.clone();
    let retention_days = billing.settings.webhook_retention_days;
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let pool = cleanup_pool.clone();
            Box::pin(async move {
                info!("Running webhook event cleanup");
                match webhooks::cleanup_old_events(&pool, retention_days).await {
                    Ok(deleted) => info!(deleted = deleted, "Webhook event cleanup complete"),
                    Err(e) => error!(error = %e, "Webhook event cleanup failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Webhook event cleanup (daily at 3:00 UTC)");

    // Job 5: Billing invariant checks (daily at 6:00 UTC)
    let invariant_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 6 * * *", move |_uuid, _l| {
            let billing = invariant_billing.clone();
            Box::pin(async move {
                info!("Running billing invariant checks");
                match billing.invariants.run_all_checks().await {
                    Ok(summary) if summary.healthy => {
                        info!(
                            checks_run = summary.checks_run,
                            "All billing invariants hold"
                        );
                    }
                    Ok(summary) => {
                        for violation in &summary.violations {
                            error!(
                                invariant = %violation.invariant,
                                severity = %violation.severity,
                                description = %violation.description,
                                "Billing invariant violated"
                            );
                        }
                        error!(
                            checks_failed = summary.checks_failed,
                            violations = summary.violations.len(),
                            "Billing invariant check found violations"
                        );
                    }
                    Err(e) => error!(error = %e, "Billing invariant check failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Billing invariant checks (daily at 6:00 UTC)");

    // Job 6: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Vendly Worker started successfully with 6 scheduled jobs");

    // Keep the main task running; the scheduler runs jobs in background tasks.
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
