//! Subscription ledger
//!
//! Each user owns a set of subscriptions indexed by their `[start, end)`
//! interval, `end` possibly open. At most one subscription may be active for a
//! user at any instant. Subscriptions are never deleted: a plan change
//! truncates, shifts or voids (collapses to zero length) the ones it overlaps.
//!
//! All operations take a `&mut PgConnection` so they run inside whatever
//! transaction the caller holds.

use qms_shared::{
    add_years, LedgerSettings, PlanId, PlanRateId, RetirementPolicy, SubscriptionId, UserId,
};
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use time::OffsetDateTime;

use crate::error::{LedgerError, LedgerResult};
use crate::plans::{get_plan_by_id, get_plan_by_name, Plan};
use crate::quotas::{
    carry_forward_maximum, find_quota_by_name, insert_seeded_quotas, list_quotas, seed_from_plan,
    Quota,
};
use crate::updates::AuditContext;
use crate::usage::{carry_forward_usages, list_usages_for_subscription, Usage};
use crate::users::{ensure_user, find_user, User};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub user_id: UserId,
    pub plan_id: PlanId,
    /// Rate in effect when the subscription was created
    pub plan_rate_id: Option<PlanRateId>,
    pub effective_start_date: OffsetDateTime,
    /// `None` means open-ended
    pub effective_end_date: Option<OffsetDateTime>,
    pub paid: bool,
}

impl Subscription {
    /// `start <= at < end`, or `start <= at` when open-ended
    pub fn is_active_at(&self, at: OffsetDateTime) -> bool {
        self.effective_start_date <= at && self.effective_end_date.map_or(true, |end| at < end)
    }

    /// Collapsed to zero length by a retirement
    pub fn is_void(&self) -> bool {
        self.effective_end_date == Some(self.effective_start_date)
    }
}

/// Subscription as presented to callers, with names resolved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SubscriptionSummary {
    pub id: SubscriptionId,
    pub username: String,
    pub plan_name: String,
    pub effective_start_date: OffsetDateTime,
    pub effective_end_date: Option<OffsetDateTime>,
    pub paid: bool,
    /// Snapshotted plan rate, if resolved
    pub rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionDetails {
    #[serde(flatten)]
    pub subscription: SubscriptionSummary,
    pub quotas: Vec<Quota>,
    pub usages: Vec<Usage>,
}

/// Result of [`SubscriptionLedger::get_or_create_active`]
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveSubscription {
    pub user: User,
    pub subscription: Subscription,
    /// True if the subscription was provisioned by this call
    pub created: bool,
}

// =============================================================================
// Interval planning
// =============================================================================

/// A validated subscription ready to be written
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedSubscription {
    pub plan_id: PlanId,
    pub plan_rate_id: PlanRateId,
    pub effective_start_date: OffsetDateTime,
    pub effective_end_date: OffsetDateTime,
    pub periods: i32,
    pub quotas: Vec<Quota>,
}

/// Validate and resolve everything a new subscription needs before any write:
/// the interval, the rate snapshot and the seeded quotas.
///
/// One period is one calendar year.
pub fn plan_subscription(
    plan: &Plan,
    start: OffsetDateTime,
    periods: i32,
    end_date: Option<OffsetDateTime>,
) -> LedgerResult<PlannedSubscription> {
    if periods <= 0 {
        return Err(LedgerError::InvalidPeriod(format!(
            "periods must be greater than 0, got {}",
            periods
        )));
    }

    let end = match end_date {
        Some(end) => end,
        None => add_years(start, periods).ok_or_else(|| {
            LedgerError::InvalidPeriod(format!("{} periods from {} is out of range", periods, start))
        })?,
    };
    if end <= start {
        return Err(LedgerError::InvalidPeriod(format!(
            "end date {} must be after start date {}",
            end, start
        )));
    }

    let rate = plan.require_active_rate(start)?;

    Ok(PlannedSubscription {
        plan_id: plan.id,
        plan_rate_id: rate.id,
        effective_start_date: start,
        effective_end_date: end,
        periods,
        quotas: seed_from_plan(plan, start, periods),
    })
}

/// How an existing subscription is adjusted to make room for a new one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetirementAction {
    /// Started before the window; now ends where the window starts
    Truncate,
    /// Started inside the window and outlived it; now starts where the window ends
    Shift,
    /// Fully inside the window; collapsed to zero length
    Void,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalAdjustment {
    pub subscription_id: SubscriptionId,
    pub action: RetirementAction,
    pub effective_start_date: OffsetDateTime,
    pub effective_end_date: Option<OffsetDateTime>,
}

/// Compute the adjustments that clear `[from_start, through_end)` of every
/// existing subscription. `through_end = None` means the window is open-ended.
/// Subscriptions outside the window, and already voided ones, are left alone.
pub fn plan_retirement(
    existing: &[Subscription],
    from_start: OffsetDateTime,
    through_end: Option<OffsetDateTime>,
) -> Vec<IntervalAdjustment> {
    let mut adjustments = Vec::new();

    for sub in existing {
        if sub.is_void() {
            continue;
        }

        let start = sub.effective_start_date;
        let end = sub.effective_end_date;
        let starts_before_window_end = through_end.map_or(true, |t| start < t);
        let ends_after_window_start = end.map_or(true, |e| e > from_start);
        if !(starts_before_window_end && ends_after_window_start) {
            continue;
        }

        let adjustment = if start < from_start {
            IntervalAdjustment {
                subscription_id: sub.id,
                action: RetirementAction::Truncate,
                effective_start_date: start,
                effective_end_date: Some(from_start),
            }
        } else {
            match through_end {
                Some(t) if end.map_or(true, |e| e > t) => IntervalAdjustment {
                    subscription_id: sub.id,
                    action: RetirementAction::Shift,
                    effective_start_date: t,
                    effective_end_date: end,
                },
                _ => IntervalAdjustment {
                    subscription_id: sub.id,
                    action: RetirementAction::Void,
                    effective_start_date: start,
                    effective_end_date: Some(start),
                },
            }
        };
        adjustments.push(adjustment);
    }

    adjustments
}

/// Whether the new plan's quota for `resource` is strictly greater than the
/// current one. A missing quota counts as 0 on either side.
pub fn is_upgrade(new_quotas: &[Quota], current_quota: Option<f64>, resource: &str) -> bool {
    let new_value = new_quotas
        .iter()
        .find(|q| q.resource_type.name == resource)
        .map_or(0.0, |q| q.quota);
    new_value > current_quota.unwrap_or(0.0)
}

// =============================================================================
// Plan changes and listing parameters
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangePlanOptions {
    pub periods: i32,
    pub paid: bool,
    pub end_date: Option<OffsetDateTime>,
    /// Skip the upgrade gate
    pub force: bool,
}

impl Default for ChangePlanOptions {
    fn default() -> Self {
        Self {
            periods: 1,
            paid: false,
            end_date: None,
            force: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangePlanOutcome {
    pub subscription: Subscription,
    /// False when the gate turned the request into a no-op
    pub created: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionSortField {
    #[default]
    Username,
    StartDate,
    EndDate,
    PlanName,
}

impl SubscriptionSortField {
    fn column(self) -> &'static str {
        match self {
            Self::Username => "u.username",
            Self::StartDate => "s.effective_start_date",
            Self::EndDate => "s.effective_end_date",
            Self::PlanName => "p.name",
        }
    }
}

impl std::str::FromStr for SubscriptionSortField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "username" | "user" => Ok(Self::Username),
            "start" | "start_date" | "effective_start_date" => Ok(Self::StartDate),
            "end" | "end_date" | "effective_end_date" => Ok(Self::EndDate),
            "plan" | "plan_name" => Ok(Self::PlanName),
            _ => Err(format!("Invalid sort field: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    fn keyword(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

impl std::str::FromStr for SortDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "asc" => Ok(Self::Asc),
            "desc" => Ok(Self::Desc),
            _ => Err(format!("Invalid sort direction: {}", s)),
        }
    }
}

pub const DEFAULT_PAGE_LIMIT: i64 = 50;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ListSubscriptionsParams {
    pub offset: i64,
    /// Defaults to [`DEFAULT_PAGE_LIMIT`]
    pub limit: Option<i64>,
    pub sort_field: SubscriptionSortField,
    pub sort_dir: SortDirection,
    /// Substring of the username
    pub search: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionPage {
    pub subscriptions: Vec<SubscriptionSummary>,
    pub total: i64,
}

/// Escape `LIKE` metacharacters and wrap the term for a substring match
pub fn like_pattern(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len() + 2);
    escaped.push('%');
    for c in term.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

// =============================================================================
// Ledger
// =============================================================================

const SELECT_SUMMARY: &str = r#"
    SELECT s.id, u.username, p.name AS plan_name, s.effective_start_date,
           s.effective_end_date, s.paid, r.rate
    FROM subscriptions s
    JOIN users u ON u.id = s.user_id
    JOIN plans p ON p.id = s.plan_id
    LEFT JOIN plan_rates r ON r.id = s.plan_rate_id
"#;

#[derive(Debug, Clone, Default)]
pub struct SubscriptionLedger {
    settings: LedgerSettings,
}

impl SubscriptionLedger {
    pub fn new(settings: LedgerSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &LedgerSettings {
        &self.settings
    }

    /// Subscription of `user_id` active at `as_of`, latest start first if the
    /// data holds more than one.
    pub async fn find_active(
        &self,
        conn: &mut PgConnection,
        user_id: UserId,
        as_of: OffsetDateTime,
    ) -> LedgerResult<Option<Subscription>> {
        let subscription = sqlx::query_as(
            r#"
            SELECT id, user_id, plan_id, plan_rate_id, effective_start_date, effective_end_date, paid
            FROM subscriptions
            WHERE user_id = $1
              AND effective_start_date <= $2
              AND (effective_end_date IS NULL OR effective_end_date > $2)
            ORDER BY effective_start_date DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(as_of)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(subscription)
    }

    /// Read-only lookup of the active subscription; never provisions.
    pub async fn get_active(
        &self,
        conn: &mut PgConnection,
        username: &str,
        as_of: OffsetDateTime,
    ) -> LedgerResult<Option<Subscription>> {
        match find_user(conn, username).await? {
            Some(user) => self.find_active(conn, user.id, as_of).await,
            None => Ok(None),
        }
    }

    pub async fn has_active(
        &self,
        conn: &mut PgConnection,
        username: &str,
        as_of: OffsetDateTime,
    ) -> LedgerResult<bool> {
        Ok(self.get_active(conn, username, as_of).await?.is_some())
    }

    /// Return the active subscription of a user, provisioning one on the
    /// default plan if there is none.
    ///
    /// The provisioned subscription starts at `now`, lasts one period, and is
    /// clipped to end where any later subscription of the user begins.
    pub async fn get_or_create_active(
        &self,
        conn: &mut PgConnection,
        username: &str,
        now: OffsetDateTime,
    ) -> LedgerResult<ActiveSubscription> {
        // The upsert row-locks the user until commit, so concurrent
        // provisioning for the same user queues here
        let user = ensure_user(conn, username).await?;

        if let Some(subscription) = self.find_active(conn, user.id, now).await? {
            return Ok(ActiveSubscription {
                user,
                subscription,
                created: false,
            });
        }

        let plan = get_plan_by_name(conn, &self.settings.default_plan).await?;

        let next_start: Option<OffsetDateTime> = sqlx::query_scalar(
            r#"
            SELECT MIN(effective_start_date)
            FROM subscriptions
            WHERE user_id = $1
              AND effective_start_date > $2
              AND (effective_end_date IS NULL OR effective_end_date > effective_start_date)
            "#,
        )
        .bind(user.id)
        .bind(now)
        .fetch_one(&mut *conn)
        .await?;

        let default_end = add_years(now, 1).ok_or_else(|| {
            LedgerError::InvalidPeriod(format!("one period from {} is out of range", now))
        })?;
        let end = match next_start {
            Some(next) if next < default_end => next,
            _ => default_end,
        };

        let planned = plan_subscription(&plan, now, 1, Some(end))?;
        let subscription = self.install(conn, &user, &planned, false).await?;

        tracing::info!(
            user = %user.username,
            plan = %plan.name,
            subscription_id = %subscription.id,
            end = %end,
            "Provisioned default subscription"
        );

        Ok(ActiveSubscription {
            user,
            subscription,
            created: true,
        })
    }

    /// Create a subscription starting at `now` without touching existing ones.
    pub async fn create(
        &self,
        conn: &mut PgConnection,
        user: &User,
        plan: &Plan,
        periods: i32,
        paid: bool,
        end_date: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) -> LedgerResult<Subscription> {
        let planned = plan_subscription(plan, now, periods, end_date)?;
        self.install(conn, user, &planned, paid).await
    }

    async fn install(
        &self,
        conn: &mut PgConnection,
        user: &User,
        planned: &PlannedSubscription,
        paid: bool,
    ) -> LedgerResult<Subscription> {
        let subscription: Subscription = sqlx::query_as(
            r#"
            INSERT INTO subscriptions
                (user_id, plan_id, plan_rate_id, effective_start_date, effective_end_date, paid)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, user_id, plan_id, plan_rate_id, effective_start_date, effective_end_date, paid
            "#,
        )
        .bind(user.id)
        .bind(planned.plan_id)
        .bind(planned.plan_rate_id)
        .bind(planned.effective_start_date)
        .bind(planned.effective_end_date)
        .bind(paid)
        .fetch_one(&mut *conn)
        .await?;

        insert_seeded_quotas(conn, subscription.id, &planned.quotas).await?;

        tracing::debug!(
            user = %user.username,
            subscription_id = %subscription.id,
            periods = planned.periods,
            quotas = planned.quotas.len(),
            "Inserted subscription"
        );

        Ok(subscription)
    }

    /// Adjust the user's existing subscriptions so that none overlaps
    /// `[from_start, through_end)`, following the configured retirement
    /// policy. Returns the number of subscriptions changed.
    pub async fn retire(
        &self,
        conn: &mut PgConnection,
        user_id: UserId,
        from_start: OffsetDateTime,
        through_end: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) -> LedgerResult<usize> {
        match self.settings.retirement_policy {
            RetirementPolicy::OverlapAware => {
                self.retire_overlapping(conn, user_id, from_start, through_end)
                    .await
            }
            RetirementPolicy::ExpireOpen => self.expire_open(conn, user_id, now).await,
        }
    }

    async fn retire_overlapping(
        &self,
        conn: &mut PgConnection,
        user_id: UserId,
        from_start: OffsetDateTime,
        through_end: Option<OffsetDateTime>,
    ) -> LedgerResult<usize> {
        let existing: Vec<Subscription> = sqlx::query_as(
            r#"
            SELECT id, user_id, plan_id, plan_rate_id, effective_start_date, effective_end_date, paid
            FROM subscriptions
            WHERE user_id = $1
            ORDER BY effective_start_date
            FOR UPDATE
            "#,
        )
        .bind(user_id)
        .fetch_all(&mut *conn)
        .await?;

        let adjustments = plan_retirement(&existing, from_start, through_end);

        for adjustment in &adjustments {
            sqlx::query(
                r#"
                UPDATE subscriptions
                SET effective_start_date = $2, effective_end_date = $3, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(adjustment.subscription_id)
            .bind(adjustment.effective_start_date)
            .bind(adjustment.effective_end_date)
            .execute(&mut *conn)
            .await?;

            tracing::info!(
                user_id = %user_id,
                subscription_id = %adjustment.subscription_id,
                action = ?adjustment.action,
                "Retired overlapping subscription"
            );
        }

        Ok(adjustments.len())
    }

    /// Legacy retirement: every subscription that has started and has not yet
    /// ended is expired as of `now`.
    async fn expire_open(
        &self,
        conn: &mut PgConnection,
        user_id: UserId,
        now: OffsetDateTime,
    ) -> LedgerResult<usize> {
        let expired = sqlx::query(
            r#"
            UPDATE subscriptions
            SET effective_end_date = $2, updated_at = NOW()
            WHERE user_id = $1
              AND effective_start_date <= $2
              AND (effective_end_date IS NULL OR effective_end_date > $2)
            "#,
        )
        .bind(user_id)
        .bind(now)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        if expired > 0 {
            tracing::info!(user_id = %user_id, expired = expired, "Expired open subscriptions");
        }

        Ok(usize::try_from(expired).unwrap_or(usize::MAX))
    }

    /// Move a user onto a plan.
    ///
    /// Unless `force` is set, the change only happens if the new plan grants
    /// strictly more of the comparison resource than the current subscription;
    /// otherwise the current subscription is returned with `created = false`.
    /// A change retires the overlapping subscriptions, creates the new one, and
    /// carries forward larger quotas and in-flight usage from the old one.
    pub async fn change_plan(
        &self,
        conn: &mut PgConnection,
        username: &str,
        plan_name: &str,
        options: &ChangePlanOptions,
        now: OffsetDateTime,
    ) -> LedgerResult<ChangePlanOutcome> {
        let plan = get_plan_by_name(conn, plan_name).await?;
        let planned = plan_subscription(&plan, now, options.periods, options.end_date)?;

        let user = ensure_user(conn, username).await?;
        let current = self.find_active(conn, user.id, now).await?;

        if let Some(current) = &current {
            if !options.force {
                let resource = &self.settings.comparison_resource;
                let current_quota = find_quota_by_name(conn, current.id, resource).await?;

                if !is_upgrade(&planned.quotas, current_quota, resource) {
                    tracing::info!(
                        user = %user.username,
                        plan = %plan.name,
                        subscription_id = %current.id,
                        resource_type = %resource,
                        "Plan change does not raise quota; keeping current subscription"
                    );
                    return Ok(ChangePlanOutcome {
                        subscription: current.clone(),
                        created: false,
                    });
                }
            }
        }

        self.retire(
            conn,
            user.id,
            planned.effective_start_date,
            Some(planned.effective_end_date),
            now,
        )
        .await?;
        let subscription = self.install(conn, &user, &planned, options.paid).await?;

        if let Some(previous) = &current {
            let audit = AuditContext {
                user_id: user.id,
                updated_by: user.username.clone(),
                effective_date: now,
            };
            carry_forward_maximum(conn, previous.id, subscription.id, &audit).await?;
            carry_forward_usages(conn, previous.id, subscription.id, &audit).await?;
        }

        tracing::info!(
            user = %user.username,
            plan = %plan.name,
            subscription_id = %subscription.id,
            replaced = ?current.as_ref().map(|s| s.id),
            force = options.force,
            "Changed subscription plan"
        );

        Ok(ChangePlanOutcome {
            subscription,
            created: true,
        })
    }

    /// Subscription with names, rate, quotas and usages resolved
    pub async fn details(
        &self,
        conn: &mut PgConnection,
        subscription_id: SubscriptionId,
    ) -> LedgerResult<SubscriptionDetails> {
        let query = format!("{} WHERE s.id = $1", SELECT_SUMMARY);
        let subscription: SubscriptionSummary = sqlx::query_as(&query)
            .bind(subscription_id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| {
                LedgerError::NotFound(format!("subscription {} not found", subscription_id))
            })?;

        let quotas = list_quotas(conn, subscription_id).await?;
        let usages = list_usages_for_subscription(conn, subscription_id).await?;

        Ok(SubscriptionDetails {
            subscription,
            quotas,
            usages,
        })
    }

    /// Page through the subscriptions active at `as_of`
    pub async fn list_active(
        &self,
        conn: &mut PgConnection,
        params: &ListSubscriptionsParams,
        as_of: OffsetDateTime,
    ) -> LedgerResult<SubscriptionPage> {
        if params.offset < 0 {
            return Err(LedgerError::InvalidInput(format!(
                "offset must not be negative, got {}",
                params.offset
            )));
        }
        let limit = params.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
        if limit <= 0 {
            return Err(LedgerError::InvalidInput(format!(
                "limit must be greater than 0, got {}",
                limit
            )));
        }

        let search = params
            .search
            .as_deref()
            .map(str::trim)
            .filter(|term| !term.is_empty())
            .map(like_pattern);

        let filter = r#"
            WHERE s.effective_start_date <= $1
              AND (s.effective_end_date IS NULL OR s.effective_end_date > $1)
              AND ($2::TEXT IS NULL OR u.username LIKE $2 ESCAPE '\')
        "#;

        let total: i64 = sqlx::query_scalar(&format!(
            r#"
            SELECT COUNT(*)
            FROM subscriptions s
            JOIN users u ON u.id = s.user_id
            {}
            "#,
            filter
        ))
        .bind(as_of)
        .bind(search.as_deref())
        .fetch_one(&mut *conn)
        .await?;

        let query = format!(
            "{} {} ORDER BY {} {}, s.id LIMIT $3 OFFSET $4",
            SELECT_SUMMARY,
            filter,
            params.sort_field.column(),
            params.sort_dir.keyword()
        );
        let subscriptions = sqlx::query_as(&query)
            .bind(as_of)
            .bind(search.as_deref())
            .bind(limit)
            .bind(params.offset)
            .fetch_all(&mut *conn)
            .await?;

        Ok(SubscriptionPage {
            subscriptions,
            total,
        })
    }

    /// Fill in the rate snapshot of a subscription created without one, using
    /// the plan rate active at the subscription's start.
    pub async fn resolve_rate_snapshot(
        &self,
        conn: &mut PgConnection,
        subscription_id: SubscriptionId,
    ) -> LedgerResult<Subscription> {
        let subscription: Option<Subscription> = sqlx::query_as(
            r#"
            SELECT id, user_id, plan_id, plan_rate_id, effective_start_date, effective_end_date, paid
            FROM subscriptions
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(subscription_id)
        .fetch_optional(&mut *conn)
        .await?;
        let mut subscription = subscription.ok_or_else(|| {
            LedgerError::NotFound(format!("subscription {} not found", subscription_id))
        })?;

        if subscription.plan_rate_id.is_some() {
            return Ok(subscription);
        }

        let plan = get_plan_by_id(conn, subscription.plan_id).await?;
        let rate = plan.require_active_rate(subscription.effective_start_date)?;

        sqlx::query("UPDATE subscriptions SET plan_rate_id = $2, updated_at = NOW() WHERE id = $1")
            .bind(subscription_id)
            .bind(rate.id)
            .execute(&mut *conn)
            .await?;

        tracing::info!(
            subscription_id = %subscription_id,
            plan = %plan.name,
            rate = rate.rate,
            "Resolved subscription rate snapshot"
        );

        subscription.plan_rate_id = Some(rate.id);
        Ok(subscription)
    }

    pub async fn subscriptions_missing_rate(
        &self,
        conn: &mut PgConnection,
    ) -> LedgerResult<Vec<SubscriptionId>> {
        let ids = sqlx::query_scalar(
            "SELECT id FROM subscriptions WHERE plan_rate_id IS NULL ORDER BY created_at",
        )
        .fetch_all(&mut *conn)
        .await?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plans::fixtures::{default, plan, rate, resource};
    use time::macros::datetime;
    use time::Duration;

    fn sub(start: OffsetDateTime, end: Option<OffsetDateTime>) -> Subscription {
        Subscription {
            id: SubscriptionId::new(),
            user_id: UserId::default(),
            plan_id: PlanId::default(),
            plan_rate_id: None,
            effective_start_date: start,
            effective_end_date: end,
            paid: false,
        }
    }

    #[test]
    fn test_active_interval_is_half_open() {
        let start = datetime!(2024-01-01 0:00 UTC);
        let end = datetime!(2025-01-01 0:00 UTC);
        let s = sub(start, Some(end));

        assert!(s.is_active_at(start));
        assert!(s.is_active_at(end - Duration::seconds(1)));
        assert!(!s.is_active_at(end));
        assert!(!s.is_active_at(start - Duration::seconds(1)));

        let open = sub(start, None);
        assert!(open.is_active_at(datetime!(2999-01-01 0:00 UTC)));
    }

    #[test]
    fn test_void_subscription_never_active() {
        let at = datetime!(2024-01-01 0:00 UTC);
        let s = sub(at, Some(at));
        assert!(s.is_void());
        assert!(!s.is_active_at(at));
    }

    #[test]
    fn test_plan_subscription_one_period_is_one_year() {
        let cpu = resource("cpu.hours", true);
        let at = datetime!(2024-03-10 12:00 UTC);
        let p = plan(
            "Basic",
            vec![default(&cpu, 100.0, datetime!(2020-01-01 0:00 UTC))],
            vec![rate(0.0, datetime!(2020-01-01 0:00 UTC))],
        );

        let planned = plan_subscription(&p, at, 2, None).unwrap();
        assert_eq!(planned.effective_end_date, datetime!(2026-03-10 12:00 UTC));
        assert_eq!(planned.plan_rate_id, p.rates[0].id);
        assert_eq!(planned.quotas[0].quota, 200.0);
    }

    #[test]
    fn test_plan_subscription_explicit_end_wins() {
        let at = datetime!(2024-03-10 12:00 UTC);
        let p = plan("Basic", vec![], vec![rate(1.0, at)]);
        let end = datetime!(2024-04-01 0:00 UTC);

        let planned = plan_subscription(&p, at, 5, Some(end)).unwrap();
        assert_eq!(planned.effective_end_date, end);
    }

    #[test]
    fn test_plan_subscription_rejects_bad_periods() {
        let at = datetime!(2024-03-10 12:00 UTC);
        let p = plan("Basic", vec![], vec![rate(1.0, at)]);

        assert!(matches!(
            plan_subscription(&p, at, 0, None),
            Err(LedgerError::InvalidPeriod(_))
        ));
        assert!(matches!(
            plan_subscription(&p, at, -3, None),
            Err(LedgerError::InvalidPeriod(_))
        ));
        assert!(matches!(
            plan_subscription(&p, at, 1, Some(at)),
            Err(LedgerError::InvalidPeriod(_))
        ));
        assert!(matches!(
            plan_subscription(&p, at, 1, Some(at - Duration::days(1))),
            Err(LedgerError::InvalidPeriod(_))
        ));
    }

    #[test]
    fn test_plan_subscription_requires_rate_in_past() {
        let at = datetime!(2024-03-10 12:00 UTC);
        let p = plan("Later", vec![], vec![rate(1.0, at + Duration::days(1))]);

        assert!(matches!(
            plan_subscription(&p, at, 1, None),
            Err(LedgerError::NoActiveRate(_))
        ));
    }

    #[test]
    fn test_retirement_truncates_subscription_started_before_window() {
        let from = datetime!(2024-06-01 0:00 UTC);
        let through = datetime!(2025-06-01 0:00 UTC);
        let old = sub(datetime!(2024-01-01 0:00 UTC), Some(datetime!(2025-01-01 0:00 UTC)));

        let adjustments = plan_retirement(std::slice::from_ref(&old), from, Some(through));
        assert_eq!(adjustments.len(), 1);
        assert_eq!(adjustments[0].action, RetirementAction::Truncate);
        assert_eq!(adjustments[0].effective_start_date, old.effective_start_date);
        assert_eq!(adjustments[0].effective_end_date, Some(from));
    }

    #[test]
    fn test_retirement_truncates_open_ended_subscription() {
        let from = datetime!(2024-06-01 0:00 UTC);
        let old = sub(datetime!(2024-01-01 0:00 UTC), None);

        let adjustments = plan_retirement(&[old], from, Some(datetime!(2025-06-01 0:00 UTC)));
        assert_eq!(adjustments[0].action, RetirementAction::Truncate);
        assert_eq!(adjustments[0].effective_end_date, Some(from));
    }

    #[test]
    fn test_retirement_shifts_subscription_outliving_window() {
        let from = datetime!(2024-06-01 0:00 UTC);
        let through = datetime!(2025-06-01 0:00 UTC);
        let future = sub(datetime!(2025-01-01 0:00 UTC), Some(datetime!(2026-01-01 0:00 UTC)));

        let adjustments = plan_retirement(&[future], from, Some(through));
        assert_eq!(adjustments[0].action, RetirementAction::Shift);
        assert_eq!(adjustments[0].effective_start_date, through);
        assert_eq!(
            adjustments[0].effective_end_date,
            Some(datetime!(2026-01-01 0:00 UTC))
        );
    }

    #[test]
    fn test_retirement_voids_contained_subscription() {
        let from = datetime!(2024-06-01 0:00 UTC);
        let through = datetime!(2025-06-01 0:00 UTC);
        let inside = sub(datetime!(2024-07-01 0:00 UTC), Some(datetime!(2024-08-01 0:00 UTC)));

        let adjustments = plan_retirement(&[inside], from, Some(through));
        assert_eq!(adjustments[0].action, RetirementAction::Void);
        assert_eq!(
            adjustments[0].effective_end_date,
            Some(adjustments[0].effective_start_date)
        );
    }

    #[test]
    fn test_retirement_with_open_window_voids_later_subscriptions() {
        let from = datetime!(2024-06-01 0:00 UTC);
        let later = sub(datetime!(2025-01-01 0:00 UTC), None);

        let adjustments = plan_retirement(&[later], from, None);
        assert_eq!(adjustments[0].action, RetirementAction::Void);
    }

    #[test]
    fn test_retirement_ignores_non_overlapping_and_void() {
        let from = datetime!(2024-06-01 0:00 UTC);
        let through = datetime!(2025-06-01 0:00 UTC);
        let existing = vec![
            // ends exactly at window start
            sub(datetime!(2023-06-01 0:00 UTC), Some(from)),
            // starts exactly at window end
            sub(through, None),
            // already voided
            sub(
                datetime!(2024-07-01 0:00 UTC),
                Some(datetime!(2024-07-01 0:00 UTC)),
            ),
        ];

        assert!(plan_retirement(&existing, from, Some(through)).is_empty());
    }

    #[test]
    fn test_retirement_leaves_no_overlap() {
        let from = datetime!(2024-06-01 0:00 UTC);
        let through = datetime!(2025-06-01 0:00 UTC);
        let existing = vec![
            sub(datetime!(2024-01-01 0:00 UTC), None),
            sub(datetime!(2024-09-01 0:00 UTC), Some(datetime!(2024-10-01 0:00 UTC))),
            sub(datetime!(2025-03-01 0:00 UTC), Some(datetime!(2026-03-01 0:00 UTC))),
        ];

        let adjustments = plan_retirement(&existing, from, Some(through));
        assert_eq!(adjustments.len(), 3);

        for adjustment in adjustments {
            let adjusted = sub(adjustment.effective_start_date, adjustment.effective_end_date);
            if adjusted.is_void() {
                continue;
            }
            let overlaps = adjusted.effective_start_date < through
                && adjusted.effective_end_date.map_or(true, |e| e > from);
            assert!(!overlaps, "{:?} still overlaps the window", adjustment);
        }
    }

    #[test]
    fn test_upgrade_gate() {
        let cpu = resource("cpu.hours", true);
        let new = vec![Quota {
            resource_type: cpu,
            quota: 200.0,
        }];

        assert!(is_upgrade(&new, Some(100.0), "cpu.hours"));
        assert!(!is_upgrade(&new, Some(200.0), "cpu.hours"));
        assert!(!is_upgrade(&new, Some(300.0), "cpu.hours"));
        assert!(is_upgrade(&new, None, "cpu.hours"));
        // New plan lacks the comparison resource entirely
        assert!(!is_upgrade(&new, Some(1.0), "data.size"));
        assert!(!is_upgrade(&new, None, "data.size"));
    }

    #[test]
    fn test_like_pattern_escapes_metacharacters() {
        assert_eq!(like_pattern("ali"), "%ali%");
        assert_eq!(like_pattern("a_b%c"), "%a\\_b\\%c%");
        assert_eq!(like_pattern("back\\slash"), "%back\\\\slash%");
    }

    #[test]
    fn test_sort_parsing() {
        assert_eq!(
            "start".parse::<SubscriptionSortField>(),
            Ok(SubscriptionSortField::StartDate)
        );
        assert_eq!("DESC".parse::<SortDirection>(), Ok(SortDirection::Desc));
        assert!("price".parse::<SubscriptionSortField>().is_err());
    }
}
