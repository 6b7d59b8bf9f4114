//! Ledger Invariants Module
//!
//! Provides runnable consistency checks for the subscription ledger.
//! These invariants can be run after any mutation or on a schedule to ensure
//! the ledger is in a valid state.
//!
//! ## Design Principles
//!
//! 1. **Executable**: Each invariant is a real SQL query that can be run
//! 2. **Explanatory**: Violations include enough context to debug
//! 3. **Non-destructive**: Checks only read, never write

use qms_shared::UserId;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// User(s) affected
    pub user_ids: Vec<UserId>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - entitlements or charges are ambiguous
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - minor inconsistency, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    /// When the check was run
    pub checked_at: OffsetDateTime,
    /// Total number of checks run
    pub checks_run: usize,
    /// Number of checks that passed
    pub checks_passed: usize,
    /// Number of checks that failed
    pub checks_failed: usize,
    /// List of all violations found
    pub violations: Vec<InvariantViolation>,
    /// Overall health status
    pub healthy: bool,
}

impl InvariantCheckSummary {
    fn from_violations(
        checked_at: OffsetDateTime,
        checks_run: usize,
        violations: Vec<InvariantViolation>,
    ) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

/// Row type for multiple active subscriptions violation
#[derive(Debug, sqlx::FromRow)]
struct MultipleActiveRow {
    user_id: UserId,
    username: String,
    sub_count: i64,
    subscription_ids: Vec<Uuid>,
}

/// Row type for overlapping interval violation
#[derive(Debug, sqlx::FromRow)]
struct OverlapRow {
    user_id: UserId,
    username: String,
    first_id: Uuid,
    second_id: Uuid,
    first_start: OffsetDateTime,
    first_end: Option<OffsetDateTime>,
    second_start: OffsetDateTime,
    second_end: Option<OffsetDateTime>,
}

/// Row type for subscriptions whose end precedes their start
#[derive(Debug, sqlx::FromRow)]
struct InvertedIntervalRow {
    subscription_id: Uuid,
    user_id: UserId,
    effective_start_date: OffsetDateTime,
    effective_end_date: OffsetDateTime,
}

/// Row type for subscriptions without a rate snapshot
#[derive(Debug, sqlx::FromRow)]
struct MissingRateRow {
    subscription_id: Uuid,
    user_id: UserId,
    plan_name: String,
}

/// Row type for negative quota or usage values
#[derive(Debug, sqlx::FromRow)]
struct NegativeValueRow {
    table_name: String,
    subscription_id: Uuid,
    user_id: UserId,
    resource_type: String,
    value: f64,
}

/// Service for running ledger invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> LedgerResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        let checks = Self::available_checks();
        for check in &checks {
            violations.extend(self.run_check(check).await?);
        }

        Ok(InvariantCheckSummary::from_violations(
            now,
            checks.len(),
            violations,
        ))
    }

    /// Invariant 1: At most 1 active subscription per user right now
    ///
    /// Two active subscriptions make quota and usage resolution ambiguous.
    async fn check_single_active_subscription(&self) -> LedgerResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleActiveRow> = sqlx::query_as(
            r#"
            SELECT s.user_id, u.username, COUNT(*) AS sub_count,
                   ARRAY_AGG(s.id ORDER BY s.effective_start_date) AS subscription_ids
            FROM subscriptions s
            JOIN users u ON u.id = s.user_id
            WHERE s.effective_start_date <= NOW()
              AND (s.effective_end_date IS NULL OR s.effective_end_date > NOW())
            GROUP BY s.user_id, u.username
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_active_subscription".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "User '{}' has {} active subscriptions (expected at most 1)",
                    row.username, row.sub_count
                ),
                context: serde_json::json!({
                    "subscription_count": row.sub_count,
                    "subscription_ids": row.subscription_ids,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: Subscription intervals of a user never overlap
    ///
    /// Catches overlaps in the past or future that the point-in-time check
    /// above cannot see. Voided (zero-length) subscriptions are ignored.
    async fn check_no_overlapping_intervals(&self) -> LedgerResult<Vec<InvariantViolation>> {
        let rows: Vec<OverlapRow> = sqlx::query_as(
            r#"
            SELECT a.user_id, u.username,
                   a.id AS first_id, b.id AS second_id,
                   a.effective_start_date AS first_start, a.effective_end_date AS first_end,
                   b.effective_start_date AS second_start, b.effective_end_date AS second_end
            FROM subscriptions a
            JOIN subscriptions b ON b.user_id = a.user_id AND a.id < b.id
            JOIN users u ON u.id = a.user_id
            WHERE a.effective_start_date < COALESCE(a.effective_end_date, 'infinity'::TIMESTAMPTZ)
              AND b.effective_start_date < COALESCE(b.effective_end_date, 'infinity'::TIMESTAMPTZ)
              AND a.effective_start_date < COALESCE(b.effective_end_date, 'infinity'::TIMESTAMPTZ)
              AND b.effective_start_date < COALESCE(a.effective_end_date, 'infinity'::TIMESTAMPTZ)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_overlapping_intervals".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "User '{}' has overlapping subscriptions {} and {}",
                    row.username, row.first_id, row.second_id
                ),
                context: serde_json::json!({
                    "first": {
                        "id": row.first_id,
                        "start": row.first_start.to_string(),
                        "end": row.first_end.map(|e| e.to_string()),
                    },
                    "second": {
                        "id": row.second_id,
                        "start": row.second_start.to_string(),
                        "end": row.second_end.map(|e| e.to_string()),
                    },
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 3: No subscription ends before it starts
    ///
    /// Retirement only ever truncates to the window start or collapses to
    /// zero length, so an inverted interval means a write bypassed the ledger.
    async fn check_interval_well_formed(&self) -> LedgerResult<Vec<InvariantViolation>> {
        let rows: Vec<InvertedIntervalRow> = sqlx::query_as(
            r#"
            SELECT id AS subscription_id, user_id, effective_start_date,
                   effective_end_date
            FROM subscriptions
            WHERE effective_end_date < effective_start_date
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "interval_well_formed".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Subscription {} ends ({}) before it starts ({})",
                    row.subscription_id, row.effective_end_date, row.effective_start_date
                ),
                context: serde_json::json!({
                    "subscription_id": row.subscription_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 4: Every subscription carries a rate snapshot
    async fn check_rate_snapshot_present(&self) -> LedgerResult<Vec<InvariantViolation>> {
        let rows: Vec<MissingRateRow> = sqlx::query_as(
            r#"
            SELECT s.id AS subscription_id, s.user_id, p.name AS plan_name
            FROM subscriptions s
            JOIN plans p ON p.id = s.plan_id
            WHERE s.plan_rate_id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "rate_snapshot_present".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Subscription {} on plan '{}' has no rate snapshot",
                    row.subscription_id, row.plan_name
                ),
                context: serde_json::json!({
                    "subscription_id": row.subscription_id,
                    "plan_name": row.plan_name,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 5: Quota and usage values are never negative
    async fn check_non_negative_values(&self) -> LedgerResult<Vec<InvariantViolation>> {
        let rows: Vec<NegativeValueRow> = sqlx::query_as(
            r#"
            SELECT 'quotas' AS table_name, q.subscription_id, s.user_id,
                   rt.name AS resource_type, q.quota AS value
            FROM quotas q
            JOIN subscriptions s ON s.id = q.subscription_id
            JOIN resource_types rt ON rt.id = q.resource_type_id
            WHERE q.quota < 0
            UNION ALL
            SELECT 'usages' AS table_name, us.subscription_id, s.user_id,
                   rt.name AS resource_type, us.usage AS value
            FROM usages us
            JOIN subscriptions s ON s.id = us.subscription_id
            JOIN resource_types rt ON rt.id = us.resource_type_id
            WHERE us.usage < 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "non_negative_values".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Subscription {} has negative {} for '{}': {}",
                    row.subscription_id, row.table_name, row.resource_type, row.value
                ),
                context: serde_json::json!({
                    "table": row.table_name,
                    "subscription_id": row.subscription_id,
                    "resource_type": row.resource_type,
                    "value": row.value,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> LedgerResult<Vec<InvariantViolation>> {
        match name {
            "single_active_subscription" => self.check_single_active_subscription().await,
            "no_overlapping_intervals" => self.check_no_overlapping_intervals().await,
            "interval_well_formed" => self.check_interval_well_formed().await,
            "rate_snapshot_present" => self.check_rate_snapshot_present().await,
            "non_negative_values" => self.check_non_negative_values().await,
            _ => Err(LedgerError::InvalidInput(format!(
                "unknown invariant check '{}', expected one of: {}",
                name,
                Self::available_checks().join(", ")
            ))),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_active_subscription",
            "no_overlapping_intervals",
            "interval_well_formed",
            "rate_snapshot_present",
            "non_negative_values",
        ]
    }
}
