//! Quota Ledger Background Worker
//!
//! Handles scheduled jobs:
//! - Ledger invariant checks (QMS_INVARIANT_CHECK_CRON, default every 15 minutes)
//! - Rate snapshot repair for subscriptions created without one (hourly)
//! - Heartbeat (every 5 minutes)

use std::time::Duration;

use qms_billing::{InvariantCheckSummary, QuotaLedger, ViolationSeverity};
use qms_shared::{create_pool, run_migrations, Config};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Log results of an invariant check run
fn log_invariant_results(summary: &InvariantCheckSummary) {
    info!(
        checks_run = summary.checks_run,
        checks_passed = summary.checks_passed,
        checks_failed = summary.checks_failed,
        violations = summary.violations.len(),
        healthy = summary.healthy,
        "Invariant check cycle complete"
    );

    for violation in &summary.violations {
        match violation.severity {
            ViolationSeverity::Critical | ViolationSeverity::High => error!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                users = ?violation.user_ids,
                context = %violation.context,
                "{}",
                violation.description
            ),
            ViolationSeverity::Medium | ViolationSeverity::Low => warn!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                users = ?violation.user_ids,
                context = %violation.context,
                "{}",
                violation.description
            ),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting quota ledger worker");

    let config = Config::from_env()?;
    let pool = create_pool(&config).await?;
    if config.run_migrations {
        run_migrations(&pool).await?;
    }

    let ledger = QuotaLedger::from_config(pool, &config);
    info!(
        default_plan = %config.ledger.default_plan,
        comparison_resource = %config.ledger.comparison_resource,
        retirement_policy = %config.ledger.retirement_policy,
        "Ledger configured"
    );

    let scheduler = JobScheduler::new().await?;

    // Job 1: Invariant checks
    let invariant_ledger = ledger.clone();
    scheduler
        .add(Job::new_async(
            config.invariant_check_cron.as_str(),
            move |_uuid, _l| {
                let ledger = invariant_ledger.clone();
                Box::pin(async move {
                    info!("Running ledger invariant checks");
                    match ledger.invariants().run_all_checks().await {
                        Ok(summary) => log_invariant_results(&summary),
                        Err(e) => error!(error = %e, "Invariant check run failed"),
                    }
                })
            },
        )?)
        .await?;
    info!(cron = %config.invariant_check_cron, "Scheduled: Invariant checks");

    // Job 2: Rate snapshot repair (hourly)
    // Subscriptions whose rate could not be snapshotted at creation get the
    // rate active at their start date
    let repair_ledger = ledger.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let ledger = repair_ledger.clone();
            Box::pin(async move {
                match ledger.resolve_missing_rate_snapshots().await {
                    Ok(repair) => {
                        if !repair.resolved.is_empty() || !repair.failed.is_empty() {
                            info!(
                                resolved = repair.resolved.len(),
                                failed = repair.failed.len(),
                                "Rate snapshot repair complete"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Rate snapshot repair failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Rate snapshot repair (hourly)");

    // Job 3: Heartbeat (every 5 minutes)
    let heartbeat_pool = ledger.pool().clone();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            let pool = heartbeat_pool.clone();
            Box::pin(async move {
                match sqlx::query("SELECT 1").execute(&pool).await {
                    Ok(_) => info!(
                        pool_size = pool.size(),
                        idle = pool.num_idle(),
                        "Worker heartbeat - database reachable"
                    ),
                    Err(e) => error!(error = %e, "Worker heartbeat - database unreachable"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Quota ledger worker started with {} scheduled jobs", 3);

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
