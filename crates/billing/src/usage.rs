//! Usage tracking
//!
//! Per-subscription, per-resource counters mutated by SET (replace) or ADD
//! (accumulate). Every mutation writes an audit record in the same
//! transaction.

use qms_shared::{ResourceTypeId, SubscriptionId, UpdateOperation, ValueType};
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use time::OffsetDateTime;

use crate::error::{LedgerError, LedgerResult};
use crate::resources::{require_resource_type, ResourceType};
use crate::subscriptions::SubscriptionLedger;
use crate::updates::{record_update, AuditContext, NewUpdate};
use crate::users::find_user;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub resource_type: ResourceType,
    pub usage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageUpdate {
    pub username: String,
    /// Resource type name
    pub resource_type: String,
    /// `SET` or `ADD`
    pub operation: String,
    pub amount: f64,
    /// Defaults to the time of the call
    pub effective_date: Option<OffsetDateTime>,
    /// Defaults to the username
    pub updated_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedUsage {
    pub subscription_id: SubscriptionId,
    pub resource_type: String,
    pub operation: UpdateOperation,
    /// Stored usage after the update
    pub value: f64,
    /// True if the active subscription had to be provisioned first
    pub subscription_created: bool,
}

pub fn validate_amount(amount: f64) -> LedgerResult<()> {
    if !amount.is_finite() || amount < 0.0 {
        return Err(LedgerError::InvalidAmount(format!(
            "amount must be a finite number 0 or greater, got {}",
            amount
        )));
    }
    Ok(())
}

/// Apply `operation` to the stored value, rejecting a result that is not finite
/// (an ADD past `f64::MAX`) so it is never persisted.
pub fn checked_apply(operation: UpdateOperation, current: f64, amount: f64) -> LedgerResult<f64> {
    let value = operation.apply(current, amount);
    if !value.is_finite() {
        return Err(LedgerError::InvalidAmount(format!(
            "{} {} to {} overflows",
            operation, amount, current
        )));
    }
    Ok(value)
}

pub fn parse_operation(operation: &str) -> LedgerResult<UpdateOperation> {
    operation
        .parse()
        .map_err(|_| LedgerError::InvalidOperation(format!("'{}' is not SET or ADD", operation)))
}

#[derive(Debug, sqlx::FromRow)]
struct UsageRow {
    resource_type_id: ResourceTypeId,
    name: String,
    unit: String,
    consumable: bool,
    usage: f64,
}

impl From<UsageRow> for Usage {
    fn from(row: UsageRow) -> Self {
        Self {
            resource_type: ResourceType {
                id: row.resource_type_id,
                name: row.name,
                unit: row.unit,
                consumable: row.consumable,
            },
            usage: row.usage,
        }
    }
}

pub async fn list_usages_for_subscription(
    conn: &mut PgConnection,
    subscription_id: SubscriptionId,
) -> LedgerResult<Vec<Usage>> {
    let rows: Vec<UsageRow> = sqlx::query_as(
        r#"
        SELECT us.resource_type_id, rt.name, rt.unit, rt.consumable, us.usage
        FROM usages us
        JOIN resource_types rt ON rt.id = us.resource_type_id
        WHERE us.subscription_id = $1
        ORDER BY rt.name
        "#,
    )
    .bind(subscription_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows.into_iter().map(Usage::from).collect())
}

/// Stored usage for a subscription and resource type, 0 if there is no row
pub async fn current_value(
    conn: &mut PgConnection,
    subscription_id: SubscriptionId,
    resource_type_id: ResourceTypeId,
) -> LedgerResult<f64> {
    let value: Option<f64> = sqlx::query_scalar(
        "SELECT usage FROM usages WHERE subscription_id = $1 AND resource_type_id = $2",
    )
    .bind(subscription_id)
    .bind(resource_type_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(value.unwrap_or(0.0))
}

pub async fn upsert_usage(
    conn: &mut PgConnection,
    subscription_id: SubscriptionId,
    resource_type_id: ResourceTypeId,
    usage: f64,
) -> LedgerResult<()> {
    sqlx::query(
        r#"
        INSERT INTO usages (subscription_id, resource_type_id, usage)
        VALUES ($1, $2, $3)
        ON CONFLICT (subscription_id, resource_type_id)
        DO UPDATE SET usage = EXCLUDED.usage, updated_at = NOW()
        "#,
    )
    .bind(subscription_id)
    .bind(resource_type_id)
    .bind(usage)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Copy usage rows from a replaced subscription onto its replacement so
/// in-flight consumption survives a plan change.
pub async fn carry_forward_usages(
    conn: &mut PgConnection,
    old_subscription: SubscriptionId,
    new_subscription: SubscriptionId,
    audit: &AuditContext,
) -> LedgerResult<usize> {
    let usages = list_usages_for_subscription(conn, old_subscription).await?;

    for usage in &usages {
        upsert_usage(conn, new_subscription, usage.resource_type.id, usage.usage).await?;
        record_update(
            conn,
            audit,
            &NewUpdate {
                resource_type_id: usage.resource_type.id,
                value_type: ValueType::Usages,
                operation: UpdateOperation::Set,
                value: usage.usage,
            },
        )
        .await?;
    }

    if !usages.is_empty() {
        tracing::info!(
            from_subscription = %old_subscription,
            to_subscription = %new_subscription,
            count = usages.len(),
            "Carried forward usages"
        );
    }

    Ok(usages.len())
}

#[derive(Debug, Clone, Default)]
pub struct UsageTracker {
    ledger: SubscriptionLedger,
}

impl UsageTracker {
    pub fn new(ledger: SubscriptionLedger) -> Self {
        Self { ledger }
    }

    pub fn ledger(&self) -> &SubscriptionLedger {
        &self.ledger
    }

    /// Apply a SET or ADD to the usage of a resource on the user's active
    /// subscription, provisioning a default subscription if needed.
    ///
    /// Amount, operation and resource type are all checked before anything
    /// is written.
    pub async fn apply(
        &self,
        conn: &mut PgConnection,
        update: &UsageUpdate,
        now: OffsetDateTime,
    ) -> LedgerResult<AppliedUsage> {
        validate_amount(update.amount)?;
        let operation = parse_operation(&update.operation)?;
        let resource_type = require_resource_type(conn, &update.resource_type).await?;

        let active = self
            .ledger
            .get_or_create_active(conn, &update.username, now)
            .await?;
        let subscription_id = active.subscription.id;

        let current = current_value(conn, subscription_id, resource_type.id).await?;
        let value = checked_apply(operation, current, update.amount)?;

        upsert_usage(conn, subscription_id, resource_type.id, value).await?;
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
                value_type: ValueType::Usages,
                operation,
                value: update.amount,
            },
        )
        .await?;

        tracing::info!(
            user = %active.user.username,
            subscription_id = %subscription_id,
            resource_type = %resource_type.name,
            operation = %operation,
            amount = update.amount,
            value = value,
            "Applied usage update"
        );

        Ok(AppliedUsage {
            subscription_id,
            resource_type: resource_type.name,
            operation,
            value,
            subscription_created: active.created,
        })
    }

    /// Usages on the user's active subscription; empty if there is none
    pub async fn list_usages(
        &self,
        conn: &mut PgConnection,
        username: &str,
        now: OffsetDateTime,
    ) -> LedgerResult<Vec<Usage>> {
        let Some(user) = find_user(conn, username).await? else {
            return Ok(Vec::new());
        };
        match self.ledger.find_active(conn, user.id, now).await? {
            Some(subscription) => list_usages_for_subscription(conn, subscription.id).await,
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_and_non_finite_amounts_rejected() {
        assert!(validate_amount(0.0).is_ok());
        assert!(validate_amount(12.5).is_ok());
        assert!(matches!(
            validate_amount(-0.01),
            Err(LedgerError::InvalidAmount(_))
        ));
        assert!(matches!(
            validate_amount(f64::NAN),
            Err(LedgerError::InvalidAmount(_))
        ));
        assert!(matches!(
            validate_amount(f64::INFINITY),
            Err(LedgerError::InvalidAmount(_))
        ));
    }

    #[test]
    fn test_unknown_operation_rejected() {
        assert_eq!(parse_operation("set").unwrap(), UpdateOperation::Set);
        assert_eq!(parse_operation("ADD").unwrap(), UpdateOperation::Add);
        assert!(matches!(
            parse_operation("SUBTRACT"),
            Err(LedgerError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_overflowing_add_rejected() {
        assert_eq!(
            checked_apply(UpdateOperation::Add, f64::MAX, 0.0).unwrap(),
            f64::MAX
        );
        assert!(matches!(
            checked_apply(UpdateOperation::Add, f64::MAX, f64::MAX),
            Err(LedgerError::InvalidAmount(_))
        ));
        // SET replaces, so a huge stored value never blocks it
        assert_eq!(checked_apply(UpdateOperation::Set, f64::MAX, 1.0).unwrap(), 1.0);
    }

    #[test]
    fn test_set_is_idempotent() {
        let once = UpdateOperation::Set.apply(0.0, 7.0);
        let twice = UpdateOperation::Set.apply(once, 7.0);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_add_accumulates_from_zero() {
        let after_first = UpdateOperation::Add.apply(0.0, 10.0);
        let after_second = UpdateOperation::Add.apply(after_first, 5.0);
        assert_eq!(after_second, 15.0);
    }
}
