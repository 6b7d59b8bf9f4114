//! Append-only audit trail of quota and usage mutations

use qms_shared::{ResourceTypeId, UpdateId, UpdateOperation, UserId, ValueType};
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use time::OffsetDateTime;

use crate::error::LedgerResult;
use crate::quotas::{set_user_quota, QuotaUpdate};
use crate::usage::{UsageTracker, UsageUpdate};
use crate::users::find_user;

/// Recorded mutation, as read back from the trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Update {
    pub id: UpdateId,
    pub username: String,
    pub resource_type: String,
    pub value_type: ValueType,
    pub operation: UpdateOperation,
    /// Amount supplied with the operation, not the resulting value
    pub value: f64,
    pub effective_date: OffsetDateTime,
    pub updated_by: String,
    pub created_at: OffsetDateTime,
}

/// Who is acting, and as of when, for audit records written during an operation
#[derive(Debug, Clone, PartialEq)]
pub struct AuditContext {
    pub user_id: UserId,
    pub updated_by: String,
    pub effective_date: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewUpdate {
    pub resource_type_id: ResourceTypeId,
    pub value_type: ValueType,
    pub operation: UpdateOperation,
    pub value: f64,
}

pub async fn record_update(
    conn: &mut PgConnection,
    audit: &AuditContext,
    update: &NewUpdate,
) -> LedgerResult<UpdateId> {
    let id: UpdateId = sqlx::query_scalar(
        r#"
        INSERT INTO updates
            (user_id, resource_type_id, value_type, operation, value, effective_date, updated_by)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING id
        "#,
    )
    .bind(audit.user_id)
    .bind(update.resource_type_id)
    .bind(update.value_type)
    .bind(update.operation)
    .bind(update.value)
    .bind(audit.effective_date)
    .bind(&audit.updated_by)
    .fetch_one(&mut *conn)
    .await?;

    tracing::debug!(
        update_id = %id,
        user_id = %audit.user_id,
        value_type = %update.value_type,
        operation = %update.operation,
        value = update.value,
        "Recorded update"
    );

    Ok(id)
}

/// Updates recorded for a user, newest first
pub async fn list_updates_for_user(
    conn: &mut PgConnection,
    username: &str,
) -> LedgerResult<Vec<Update>> {
    let Some(user) = find_user(conn, username).await? else {
        return Ok(Vec::new());
    };

    let updates = sqlx::query_as(
        r#"
        SELECT up.id, u.username, rt.name AS resource_type, up.value_type, up.operation,
               up.value, up.effective_date, up.updated_by, up.created_at
        FROM updates up
        JOIN users u ON u.id = up.user_id
        JOIN resource_types rt ON rt.id = up.resource_type_id
        WHERE up.user_id = $1
        ORDER BY up.created_at DESC, up.id
        "#,
    )
    .bind(user.id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(updates)
}

/// Generic update addressed at either the usage or the quota of a resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub username: String,
    pub resource_type: String,
    pub value_type: ValueType,
    pub operation: String,
    pub value: f64,
    pub effective_date: Option<OffsetDateTime>,
    pub updated_by: Option<String>,
}

/// Apply an update to the active subscription of a user, returning the stored value
pub async fn apply_update(
    conn: &mut PgConnection,
    tracker: &UsageTracker,
    request: &UpdateRequest,
    now: OffsetDateTime,
) -> LedgerResult<f64> {
    match request.value_type {
        ValueType::Usages => {
            let applied = tracker
                .apply(
                    conn,
                    &UsageUpdate {
                        username: request.username.clone(),
                        resource_type: request.resource_type.clone(),
                        operation: request.operation.clone(),
                        amount: request.value,
                        effective_date: request.effective_date,
                        updated_by: request.updated_by.clone(),
                    },
                    now,
                )
                .await?;
            Ok(applied.value)
        }
        ValueType::Quotas => {
            let outcome = set_user_quota(
                conn,
                tracker.ledger(),
                &QuotaUpdate {
                    username: request.username.clone(),
                    resource_type: request.resource_type.clone(),
                    operation: request.operation.clone(),
                    value: request.value,
                    effective_date: request.effective_date,
                    updated_by: request.updated_by.clone(),
                },
                now,
            )
            .await?;
            Ok(outcome.quota)
        }
    }
}
