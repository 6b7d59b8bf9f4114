//! Per-subscription quotas
//!
//! One row per (subscription, resource type), enforced by a unique
//! constraint and written with upserts.

use qms_shared::{ResourceTypeId, SubscriptionId, UpdateOperation, ValueType};
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use time::OffsetDateTime;

use crate::error::{LedgerError, LedgerResult};
use crate::plans::Plan;
use crate::resources::{require_resource_type, ResourceType};
use crate::subscriptions::{SubscriptionDetails, SubscriptionLedger};
use crate::updates::{record_update, AuditContext, NewUpdate};
use crate::usage::{checked_apply, parse_operation};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quota {
    pub resource_type: ResourceType,
    pub quota: f64,
}

/// Quota rows a new subscription starts with: the plan's active defaults as of
/// `as_of`, with consumable resources scaled by the number of periods.
pub fn seed_from_plan(plan: &Plan, as_of: OffsetDateTime, periods: i32) -> Vec<Quota> {
    plan.active_quota_defaults(as_of)
        .into_iter()
        .map(|default| Quota {
            resource_type: default.resource_type.clone(),
            quota: if default.resource_type.consumable {
                default.quota_value * f64::from(periods)
            } else {
                default.quota_value
            },
        })
        .collect()
}

/// Old quotas the replacement subscription must be raised to: those missing
/// from `new` or granted at a smaller value there.
pub fn carry_forward_targets(old: &[Quota], new: &[Quota]) -> Vec<Quota> {
    old.iter()
        .filter(|held| {
            !new.iter().any(|granted| {
                granted.resource_type.id == held.resource_type.id && granted.quota >= held.quota
            })
        })
        .cloned()
        .collect()
}

#[derive(Debug, sqlx::FromRow)]
struct QuotaRow {
    resource_type_id: ResourceTypeId,
    name: String,
    unit: String,
    consumable: bool,
    quota: f64,
}

impl From<QuotaRow> for Quota {
    fn from(row: QuotaRow) -> Self {
        Self {
            resource_type: ResourceType {
                id: row.resource_type_id,
                name: row.name,
                unit: row.unit,
                consumable: row.consumable,
            },
            quota: row.quota,
        }
    }
}

pub async fn list_quotas(
    conn: &mut PgConnection,
    subscription_id: SubscriptionId,
) -> LedgerResult<Vec<Quota>> {
    let rows: Vec<QuotaRow> = sqlx::query_as(
        r#"
        SELECT q.resource_type_id, rt.name, rt.unit, rt.consumable, q.quota
        FROM quotas q
        JOIN resource_types rt ON rt.id = q.resource_type_id
        WHERE q.subscription_id = $1
        ORDER BY rt.name
        "#,
    )
    .bind(subscription_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows.into_iter().map(Quota::from).collect())
}

pub async fn find_quota(
    conn: &mut PgConnection,
    subscription_id: SubscriptionId,
    resource_type_id: ResourceTypeId,
) -> LedgerResult<Option<f64>> {
    let quota = sqlx::query_scalar(
        "SELECT quota FROM quotas WHERE subscription_id = $1 AND resource_type_id = $2",
    )
    .bind(subscription_id)
    .bind(resource_type_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(quota)
}

pub async fn find_quota_by_name(
    conn: &mut PgConnection,
    subscription_id: SubscriptionId,
    resource_type: &str,
) -> LedgerResult<Option<f64>> {
    let quota = sqlx::query_scalar(
        r#"
        SELECT q.quota
        FROM quotas q
        JOIN resource_types rt ON rt.id = q.resource_type_id
        WHERE q.subscription_id = $1 AND rt.name = $2
        "#,
    )
    .bind(subscription_id)
    .bind(resource_type)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(quota)
}

/// Insert or overwrite a quota; last write wins
pub async fn upsert_quota(
    conn: &mut PgConnection,
    subscription_id: SubscriptionId,
    resource_type_id: ResourceTypeId,
    quota: f64,
) -> LedgerResult<()> {
    sqlx::query(
        r#"
        INSERT INTO quotas (subscription_id, resource_type_id, quota)
        VALUES ($1, $2, $3)
        ON CONFLICT (subscription_id, resource_type_id)
        DO UPDATE SET quota = EXCLUDED.quota, updated_at = NOW()
        "#,
    )
    .bind(subscription_id)
    .bind(resource_type_id)
    .bind(quota)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Write the seeded quotas of a freshly created subscription
pub async fn insert_seeded_quotas(
    conn: &mut PgConnection,
    subscription_id: SubscriptionId,
    quotas: &[Quota],
) -> LedgerResult<()> {
    for quota in quotas {
        upsert_quota(conn, subscription_id, quota.resource_type.id, quota.quota).await?;
    }
    Ok(())
}

/// Raise quotas on `new_subscription` so none is below what `old_subscription`
/// held. Returns the quotas that were raised.
pub async fn carry_forward_maximum(
    conn: &mut PgConnection,
    old_subscription: SubscriptionId,
    new_subscription: SubscriptionId,
    audit: &AuditContext,
) -> LedgerResult<Vec<Quota>> {
    let old = list_quotas(conn, old_subscription).await?;
    let new = list_quotas(conn, new_subscription).await?;
    let targets = carry_forward_targets(&old, &new);

    for target in &targets {
        sqlx::query(
            r#"
            INSERT INTO quotas (subscription_id, resource_type_id, quota)
            VALUES ($1, $2, $3)
            ON CONFLICT (subscription_id, resource_type_id)
            DO UPDATE SET quota = GREATEST(quotas.quota, EXCLUDED.quota), updated_at = NOW()
            "#,
        )
        .bind(new_subscription)
        .bind(target.resource_type.id)
        .bind(target.quota)
        .execute(&mut *conn)
        .await?;

        record_update(
            conn,
            audit,
            &NewUpdate {
                resource_type_id: target.resource_type.id,
                value_type: ValueType::Quotas,
                operation: UpdateOperation::Set,
                value: target.quota,
            },
        )
        .await?;

        tracing::info!(
            subscription_id = %new_subscription,
            resource_type = %target.resource_type.name,
            quota = target.quota,
            "Carried forward larger quota"
        );
    }

    Ok(targets)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaUpdate {
    pub username: String,
    pub resource_type: String,
    pub operation: String,
    pub value: f64,
    pub effective_date: Option<OffsetDateTime>,
    pub updated_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaSetOutcome {
    pub subscription: SubscriptionDetails,
    /// Stored quota after the update
    pub quota: f64,
    /// True if the active subscription had to be provisioned first
    pub created: bool,
}

/// Set (or add to) a quota on the active subscription of a user, provisioning
/// a default subscription if the user has none.
pub async fn set_user_quota(
    conn: &mut PgConnection,
    ledger: &SubscriptionLedger,
    update: &QuotaUpdate,
    now: OffsetDateTime,
) -> LedgerResult<QuotaSetOutcome> {
    if !update.value.is_finite() || update.value < 0.0 {
        return Err(LedgerError::InvalidInput(format!(
            "quota must be 0 or greater, got {}",
            update.value
        )));
    }
    let operation = parse_operation(&update.operation)?;
    let resource_type = require_resource_type(conn, &update.resource_type).await?;

    let active = ledger
        .get_or_create_active(conn, &update.username, now)
        .await?;
    let subscription_id = active.subscription.id;

    let current = find_quota(conn, subscription_id, resource_type.id)
        .await?
        .unwrap_or(0.0);
    let quota = checked_apply(operation, current, update.value)?;

    upsert_quota(conn, subscription_id, resource_type.id, quota).await?;
    record_update(
        conn,
        &AuditContext {
            user_id: active.user.id,
            updated_by: update
                .updated_by
                .clone()
                .unwrap_or_else(|| active.user.username.clone()),
            effective_date: update.effective_date.unwrap_or(now),
        },
        &NewUpdate {
            resource_type_id: resource_type.id,
            value_type: ValueType::Quotas,
            operation,
            value: update.value,
        },
    )
    .await?;

    tracing::info!(
        user = %active.user.username,
        subscription_id = %subscription_id,
        resource_type = %resource_type.name,
        operation = %operation,
        quota = quota,
        "Updated quota"
    );

    Ok(QuotaSetOutcome {
        subscription: ledger.details(conn, subscription_id).await?,
        quota,
        created: active.created,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plans::fixtures::{default, plan, resource};
    use time::macros::datetime;

    fn quota(resource_type: ResourceType, quota: f64) -> Quota {
        Quota {
            resource_type,
            quota,
        }
    }

    #[test]
    fn test_seed_scales_only_consumable_resources() {
        let cpu = resource("cpu.hours", true);
        let disk = resource("data.size", false);
        let at = datetime!(2024-01-01 0:00 UTC);
        let plan = plan(
            "Basic",
            vec![default(&cpu, 100.0, at), default(&disk, 50.0, at)],
            vec![],
        );

        let seeded = seed_from_plan(&plan, at, 3);
        assert_eq!(seeded.len(), 2);
        assert_eq!(seeded[0].resource_type.name, "cpu.hours");
        assert_eq!(seeded[0].quota, 300.0);
        assert_eq!(seeded[1].resource_type.name, "data.size");
        assert_eq!(seeded[1].quota, 50.0);
    }

    #[test]
    fn test_seed_skips_future_defaults() {
        let cpu = resource("cpu.hours", true);
        let plan = plan(
            "Basic",
            vec![default(&cpu, 100.0, datetime!(2030-01-01 0:00 UTC))],
            vec![],
        );

        assert!(seed_from_plan(&plan, datetime!(2024-01-01 0:00 UTC), 1).is_empty());
    }

    #[test]
    fn test_carry_forward_targets_keep_larger_old_values() {
        let cpu = resource("cpu.hours", true);
        let disk = resource("data.size", false);
        let gpu = resource("gpu.hours", true);

        let old = vec![
            quota(cpu.clone(), 100.0),
            quota(disk.clone(), 50.0),
            quota(gpu.clone(), 5.0),
        ];
        let new = vec![
            quota(cpu, 200.0),
            quota(disk, 30.0),
        ];

        let targets = carry_forward_targets(&old, &new);
        let names: Vec<_> = targets.iter().map(|q| q.resource_type.name.as_str()).collect();
        assert_eq!(names, vec!["data.size", "gpu.hours"]);
        assert_eq!(targets[0].quota, 50.0);
        assert_eq!(targets[1].quota, 5.0);
    }

    #[test]
    fn test_carry_forward_targets_equal_values_untouched() {
        let cpu = resource("cpu.hours", true);
        let old = vec![quota(cpu.clone(), 100.0)];
        let new = vec![quota(cpu, 100.0)];
        assert!(carry_forward_targets(&old, &new).is_empty());
    }
}
