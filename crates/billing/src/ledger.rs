//! Transactional entry points
//!
//! [`QuotaLedger`] owns the pool and runs every operation in its own
//! transaction: committed on success, rolled back (by drop) on any error.

use qms_shared::{parse_timestamp, Config, LedgerSettings, PlanId, ResourceTypeId, SubscriptionId};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::BTreeMap;
use time::OffsetDateTime;

use crate::error::{ErrorKind, LedgerError, LedgerResult};
use crate::invariants::InvariantChecker;
use crate::overage::{self, Overage};
use crate::plans::{self, NewPlan, NewPlanQuotaDefault, NewPlanRate, Plan, PlanRate};
use crate::quotas::{self, QuotaSetOutcome, QuotaUpdate};
use crate::resources::{self, ResourceType, ResourceTypeInput};
use crate::subscriptions::{
    ChangePlanOptions, ListSubscriptionsParams, Subscription, SubscriptionDetails,
    SubscriptionLedger, SubscriptionPage,
};
use crate::updates::{self, Update, UpdateRequest};
use crate::usage::{AppliedUsage, Usage, UsageTracker, UsageUpdate};
use crate::users::{self, User};

/// Request to put a user on a plan, as received from a collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    pub username: String,
    pub plan_name: String,
    pub periods: i32,
    pub paid: bool,
    /// Explicit end date; date-only, local datetime (UTC) or RFC 3339
    pub end_date: Option<String>,
    /// Skip the upgrade gate
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionResult {
    pub subscription: SubscriptionDetails,
    /// False when the request was a no-op under the upgrade gate
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&LedgerError> for BatchFailure {
    fn from(err: &LedgerError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Per-item result of [`QuotaLedger::subscribe_batch`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub username: String,
    pub plan_name: String,
    pub subscription: Option<SubscriptionDetails>,
    pub created: bool,
    pub failure: Option<BatchFailure>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateSnapshotRepair {
    pub resolved: Vec<SubscriptionId>,
    pub failed: Vec<(SubscriptionId, BatchFailure)>,
}

/// Quota ledger with all operations bound to a connection pool
#[derive(Debug, Clone)]
pub struct QuotaLedger {
    pool: PgPool,
    usage: UsageTracker,
}

impl QuotaLedger {
    pub fn new(pool: PgPool, settings: LedgerSettings) -> Self {
        Self {
            pool,
            usage: UsageTracker::new(SubscriptionLedger::new(settings)),
        }
    }

    pub fn from_config(pool: PgPool, config: &Config) -> Self {
        Self::new(pool, config.ledger.clone())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn subscriptions(&self) -> &SubscriptionLedger {
        self.usage.ledger()
    }

    pub fn invariants(&self) -> InvariantChecker {
        InvariantChecker::new(self.pool.clone())
    }

    // =========================================================================
    // Users
    // =========================================================================

    /// Register a user explicitly; returns the existing row if already known
    pub async fn ensure_user(&self, username: &str) -> LedgerResult<User> {
        let mut tx = self.pool.begin().await?;
        let user = users::ensure_user(&mut tx, username).await?;
        tx.commit().await?;
        Ok(user)
    }

    pub async fn list_users(&self) -> LedgerResult<Vec<User>> {
        let mut conn = self.pool.acquire().await?;
        users::list_users(&mut conn).await
    }

    // =========================================================================
    // Resource types
    // =========================================================================

    pub async fn create_resource_type(
        &self,
        input: &ResourceTypeInput,
    ) -> LedgerResult<ResourceType> {
        let mut tx = self.pool.begin().await?;
        let resource_type = resources::create_resource_type(&mut tx, input).await?;
        tx.commit().await?;
        Ok(resource_type)
    }

    pub async fn update_resource_type(
        &self,
        id: ResourceTypeId,
        input: &ResourceTypeInput,
    ) -> LedgerResult<ResourceType> {
        let mut tx = self.pool.begin().await?;
        let resource_type = resources::update_resource_type(&mut tx, id, input).await?;
        tx.commit().await?;
        Ok(resource_type)
    }

    pub async fn get_resource_type(&self, name: &str) -> LedgerResult<ResourceType> {
        let mut conn = self.pool.acquire().await?;
        resources::get_resource_type_by_name(&mut conn, name).await
    }

    pub async fn get_resource_type_by_id(&self, id: ResourceTypeId) -> LedgerResult<ResourceType> {
        let mut conn = self.pool.acquire().await?;
        resources::get_resource_type_by_id(&mut conn, id).await
    }

    pub async fn list_resource_types(&self) -> LedgerResult<Vec<ResourceType>> {
        let mut conn = self.pool.acquire().await?;
        resources::list_resource_types(&mut conn).await
    }

    // =========================================================================
    // Plans
    // =========================================================================

    pub async fn add_plan(&self, new_plan: &NewPlan) -> LedgerResult<Plan> {
        let mut tx = self.pool.begin().await?;
        let plan = plans::add_plan(&mut tx, new_plan).await?;
        tx.commit().await?;
        Ok(plan)
    }

    pub async fn get_plan(&self, name: &str) -> LedgerResult<Plan> {
        let mut conn = self.pool.acquire().await?;
        plans::get_plan_by_name(&mut conn, name).await
    }

    pub async fn get_plan_by_id(&self, id: PlanId) -> LedgerResult<Plan> {
        let mut conn = self.pool.acquire().await?;
        plans::get_plan_by_id(&mut conn, id).await
    }

    pub async fn list_plans(&self) -> LedgerResult<Vec<Plan>> {
        let mut conn = self.pool.acquire().await?;
        plans::list_plans(&mut conn).await
    }

    pub async fn add_plan_quota_defaults(
        &self,
        plan_id: PlanId,
        defaults: &[NewPlanQuotaDefault],
    ) -> LedgerResult<Plan> {
        let mut tx = self.pool.begin().await?;
        let plan = plans::add_plan_quota_defaults(&mut tx, plan_id, defaults).await?;
        tx.commit().await?;
        Ok(plan)
    }

    pub async fn add_plan_rates(
        &self,
        plan_id: PlanId,
        rates: &[NewPlanRate],
    ) -> LedgerResult<Plan> {
        let mut tx = self.pool.begin().await?;
        let plan = plans::add_plan_rates(&mut tx, plan_id, rates).await?;
        tx.commit().await?;
        Ok(plan)
    }

    pub async fn active_quota_defaults(
        &self,
        plan_name: &str,
        as_of: Option<OffsetDateTime>,
    ) -> LedgerResult<BTreeMap<String, f64>> {
        let mut conn = self.pool.acquire().await?;
        let as_of = as_of.unwrap_or_else(OffsetDateTime::now_utc);
        plans::active_quota_defaults(&mut conn, plan_name, as_of).await
    }

    pub async fn active_rate(
        &self,
        plan_name: &str,
        as_of: Option<OffsetDateTime>,
    ) -> LedgerResult<PlanRate> {
        let mut conn = self.pool.acquire().await?;
        let as_of = as_of.unwrap_or_else(OffsetDateTime::now_utc);
        plans::active_rate(&mut conn, plan_name, as_of).await
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Read-only: the subscription active at `as_of` (default now), if any
    pub async fn get_active_subscription(
        &self,
        username: &str,
        as_of: Option<OffsetDateTime>,
    ) -> LedgerResult<Option<SubscriptionDetails>> {
        let mut tx = self.pool.begin().await?;
        let as_of = as_of.unwrap_or_else(OffsetDateTime::now_utc);
        let details = match self.subscriptions().get_active(&mut tx, username, as_of).await? {
            Some(subscription) => Some(self.subscriptions().details(&mut tx, subscription.id).await?),
            None => None,
        };
        tx.commit().await?;
        Ok(details)
    }

    /// The active subscription, provisioning one on the default plan if the
    /// user has none. `created` reports whether provisioning happened.
    pub async fn get_or_create_active_subscription(
        &self,
        username: &str,
    ) -> LedgerResult<SubscriptionResult> {
        let mut tx = self.pool.begin().await?;
        let active = self
            .subscriptions()
            .get_or_create_active(&mut tx, username, OffsetDateTime::now_utc())
            .await?;
        let subscription = self
            .subscriptions()
            .details(&mut tx, active.subscription.id)
            .await?;
        tx.commit().await?;

        Ok(SubscriptionResult {
            subscription,
            created: active.created,
        })
    }

    pub async fn has_active_subscription(
        &self,
        username: &str,
        as_of: Option<OffsetDateTime>,
    ) -> LedgerResult<bool> {
        let mut conn = self.pool.acquire().await?;
        let as_of = as_of.unwrap_or_else(OffsetDateTime::now_utc);
        self.subscriptions()
            .has_active(&mut conn, username, as_of)
            .await
    }

    /// Put a user on a plan, subject to the upgrade gate unless forced
    pub async fn create_subscription(
        &self,
        request: &SubscriptionRequest,
    ) -> LedgerResult<SubscriptionResult> {
        let end_date = request
            .end_date
            .as_deref()
            .map(parse_timestamp)
            .transpose()?;
        let options = ChangePlanOptions {
            periods: request.periods,
            paid: request.paid,
            end_date,
            force: request.force,
        };

        let mut tx = self.pool.begin().await?;
        let outcome = self
            .subscriptions()
            .change_plan(
                &mut tx,
                &request.username,
                &request.plan_name,
                &options,
                OffsetDateTime::now_utc(),
            )
            .await?;
        let subscription = self
            .subscriptions()
            .details(&mut tx, outcome.subscription.id)
            .await?;
        tx.commit().await?;

        Ok(SubscriptionResult {
            subscription,
            created: outcome.created,
        })
    }

    /// Apply many subscription requests, each in its own transaction. One
    /// failing request never affects the others.
    pub async fn subscribe_batch(&self, requests: &[SubscriptionRequest]) -> Vec<BatchOutcome> {
        let mut outcomes = Vec::with_capacity(requests.len());

        for request in requests {
            let outcome = match self.create_subscription(request).await {
                Ok(result) => BatchOutcome {
                    username: request.username.clone(),
                    plan_name: request.plan_name.clone(),
                    subscription: Some(result.subscription),
                    created: result.created,
                    failure: None,
                },
                Err(e) => {
                    tracing::warn!(
                        user = %request.username,
                        plan = %request.plan_name,
                        kind = %e.kind(),
                        error = %e,
                        "Subscription request failed"
                    );
                    BatchOutcome {
                        username: request.username.clone(),
                        plan_name: request.plan_name.clone(),
                        subscription: None,
                        created: false,
                        failure: Some(BatchFailure::from(&e)),
                    }
                }
            };
            outcomes.push(outcome);
        }

        let failed = outcomes.iter().filter(|o| o.failure.is_some()).count();
        tracing::info!(
            requests = requests.len(),
            failed = failed,
            "Processed subscription batch"
        );

        outcomes
    }

    pub async fn list_active_subscriptions(
        &self,
        params: &ListSubscriptionsParams,
    ) -> LedgerResult<SubscriptionPage> {
        let mut tx = self.pool.begin().await?;
        let page = self
            .subscriptions()
            .list_active(&mut tx, params, OffsetDateTime::now_utc())
            .await?;
        tx.commit().await?;
        Ok(page)
    }

    pub async fn resolve_rate_snapshot(
        &self,
        subscription_id: SubscriptionId,
    ) -> LedgerResult<Subscription> {
        let mut tx = self.pool.begin().await?;
        let subscription = self
            .subscriptions()
            .resolve_rate_snapshot(&mut tx, subscription_id)
            .await?;
        tx.commit().await?;
        Ok(subscription)
    }

    /// Resolve every missing rate snapshot, one transaction per subscription
    pub async fn resolve_missing_rate_snapshots(&self) -> LedgerResult<RateSnapshotRepair> {
        let ids = {
            let mut conn = self.pool.acquire().await?;
            self.subscriptions()
                .subscriptions_missing_rate(&mut conn)
                .await?
        };

        let mut repair = RateSnapshotRepair::default();
        for id in ids {
            match self.resolve_rate_snapshot(id).await {
                Ok(_) => repair.resolved.push(id),
                Err(e) => {
                    tracing::warn!(subscription_id = %id, error = %e, "Failed to resolve rate snapshot");
                    repair.failed.push((id, BatchFailure::from(&e)));
                }
            }
        }
        Ok(repair)
    }

    // =========================================================================
    // Usage, quotas and updates
    // =========================================================================

    pub async fn apply_usage(&self, update: &UsageUpdate) -> LedgerResult<AppliedUsage> {
        let mut tx = self.pool.begin().await?;
        let applied = self
            .usage
            .apply(&mut tx, update, OffsetDateTime::now_utc())
            .await?;
        tx.commit().await?;
        Ok(applied)
    }

    pub async fn list_usages(&self, username: &str) -> LedgerResult<Vec<Usage>> {
        let mut tx = self.pool.begin().await?;
        let usages = self
            .usage
            .list_usages(&mut tx, username, OffsetDateTime::now_utc())
            .await?;
        tx.commit().await?;
        Ok(usages)
    }

    pub async fn set_quota(&self, update: &QuotaUpdate) -> LedgerResult<QuotaSetOutcome> {
        let mut tx = self.pool.begin().await?;
        let outcome = quotas::set_user_quota(
            &mut tx,
            self.subscriptions(),
            update,
            OffsetDateTime::now_utc(),
        )
        .await?;
        tx.commit().await?;
        Ok(outcome)
    }

    pub async fn apply_update(&self, request: &UpdateRequest) -> LedgerResult<f64> {
        let mut tx = self.pool.begin().await?;
        let value =
            updates::apply_update(&mut tx, &self.usage, request, OffsetDateTime::now_utc())
                .await?;
        tx.commit().await?;
        Ok(value)
    }

    pub async fn list_updates(&self, username: &str) -> LedgerResult<Vec<Update>> {
        let mut conn = self.pool.acquire().await?;
        updates::list_updates_for_user(&mut conn, username).await
    }

    // =========================================================================
    // Overage
    // =========================================================================

    pub async fn list_overages(&self, username: &str) -> LedgerResult<Vec<Overage>> {
        let mut tx = self.pool.begin().await?;
        let overages = overage::list_overages(
            &mut tx,
            self.subscriptions(),
            username,
            OffsetDateTime::now_utc(),
        )
        .await?;
        tx.commit().await?;
        Ok(overages)
    }

    pub async fn is_overage(&self, username: &str, resource_type: &str) -> LedgerResult<bool> {
        let mut tx = self.pool.begin().await?;
        let over = overage::is_overage(
            &mut tx,
            self.subscriptions(),
            username,
            resource_type,
            OffsetDateTime::now_utc(),
        )
        .await?;
        tx.commit().await?;
        Ok(over)
    }
}
