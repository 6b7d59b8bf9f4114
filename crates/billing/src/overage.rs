//! Overage evaluation
//!
//! Read-only comparison of usage against quota on a user's active
//! subscription. A resource is over when both rows exist and
//! `usage >= quota`; usage without a quota row is never an overage.

use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use time::OffsetDateTime;

use crate::error::LedgerResult;
use crate::quotas::{find_quota, list_quotas, Quota};
use crate::resources::require_resource_type;
use crate::subscriptions::SubscriptionLedger;
use crate::usage::{list_usages_for_subscription, Usage};
use crate::users::find_user;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Overage {
    pub resource_type: String,
    pub quota: f64,
    pub usage: f64,
}

pub fn is_over(quota: Option<f64>, usage: Option<f64>) -> bool {
    match (quota, usage) {
        (Some(quota), Some(usage)) => usage >= quota,
        _ => false,
    }
}

/// Overages for the given quota and usage rows, ordered by resource type name
pub fn evaluate_overages(quotas: &[Quota], usages: &[Usage]) -> Vec<Overage> {
    let mut overages: Vec<Overage> = quotas
        .iter()
        .filter_map(|quota| {
            let usage = usages
                .iter()
                .find(|u| u.resource_type.id == quota.resource_type.id)?;
            is_over(Some(quota.quota), Some(usage.usage)).then(|| Overage {
                resource_type: quota.resource_type.name.clone(),
                quota: quota.quota,
                usage: usage.usage,
            })
        })
        .collect();
    overages.sort_by(|a, b| a.resource_type.cmp(&b.resource_type));
    overages
}

pub async fn list_overages(
    conn: &mut PgConnection,
    ledger: &SubscriptionLedger,
    username: &str,
    as_of: OffsetDateTime,
) -> LedgerResult<Vec<Overage>> {
    let Some(user) = find_user(conn, username).await? else {
        return Ok(Vec::new());
    };
    let Some(subscription) = ledger.find_active(conn, user.id, as_of).await? else {
        return Ok(Vec::new());
    };

    let quotas = list_quotas(conn, subscription.id).await?;
    let usages = list_usages_for_subscription(conn, subscription.id).await?;
    let overages = evaluate_overages(&quotas, &usages);

    tracing::debug!(
        user = %username,
        subscription_id = %subscription.id,
        overages = overages.len(),
        "Evaluated overages"
    );

    Ok(overages)
}

/// Fails with `UnknownResource` if the resource type is not catalogued
pub async fn is_overage(
    conn: &mut PgConnection,
    ledger: &SubscriptionLedger,
    username: &str,
    resource_type: &str,
    as_of: OffsetDateTime,
) -> LedgerResult<bool> {
    let resource_type = require_resource_type(conn, resource_type).await?;

    let Some(user) = find_user(conn, username).await? else {
        return Ok(false);
    };
    let Some(subscription) = ledger.find_active(conn, user.id, as_of).await? else {
        return Ok(false);
    };

    let quota = find_quota(conn, subscription.id, resource_type.id).await?;
    let usage: Option<f64> = sqlx::query_scalar(
        "SELECT usage FROM usages WHERE subscription_id = $1 AND resource_type_id = $2",
    )
    .bind(subscription.id)
    .bind(resource_type.id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(is_over(quota, usage))
}
