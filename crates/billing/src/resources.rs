//! Resource type catalog
//!
//! Maps a resource-type name (e.g. `cpu.hours`) to its identity, unit and
//! consumable flag. A type becomes immutable once any quota or usage row
//! references it.

use qms_shared::ResourceTypeId;
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;

use crate::error::{LedgerError, LedgerResult};

/// Resource type catalogued by the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ResourceType {
    pub id: ResourceTypeId,
    pub name: String,
    pub unit: String,
    /// True if usage permanently depletes the grant (compute hours), false if
    /// the resource is reclaimable (storage)
    pub consumable: bool,
}

/// Fields for creating or updating a resource type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceTypeInput {
    pub name: String,
    pub unit: String,
    pub consumable: bool,
}

impl ResourceTypeInput {
    fn validate(&self) -> LedgerResult<()> {
        if self.name.trim().is_empty() {
            return Err(LedgerError::InvalidInput(
                "resource type name is required".to_string(),
            ));
        }
        if self.unit.trim().is_empty() {
            return Err(LedgerError::InvalidInput(format!(
                "unit is required for resource type '{}'",
                self.name
            )));
        }
        Ok(())
    }
}

pub async fn create_resource_type(
    conn: &mut PgConnection,
    input: &ResourceTypeInput,
) -> LedgerResult<ResourceType> {
    input.validate()?;

    let resource_type: ResourceType = sqlx::query_as(
        r#"
        INSERT INTO resource_types (name, unit, consumable)
        VALUES ($1, $2, $3)
        RETURNING id, name, unit, consumable
        "#,
    )
    .bind(input.name.trim())
    .bind(input.unit.trim())
    .bind(input.consumable)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| {
        LedgerError::conflict_on_unique(e, || {
            format!("resource type '{}' already exists", input.name.trim())
        })
    })?;

    tracing::info!(
        resource_type = %resource_type.name,
        unit = %resource_type.unit,
        consumable = resource_type.consumable,
        "Created resource type"
    );

    Ok(resource_type)
}

pub async fn find_resource_type_by_name(
    conn: &mut PgConnection,
    name: &str,
) -> LedgerResult<Option<ResourceType>> {
    let resource_type = sqlx::query_as(
        "SELECT id, name, unit, consumable FROM resource_types WHERE name = $1",
    )
    .bind(name)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(resource_type)
}

/// Look up a resource type by name, failing with `UnknownResource` if it is not catalogued
pub async fn require_resource_type(
    conn: &mut PgConnection,
    name: &str,
) -> LedgerResult<ResourceType> {
    find_resource_type_by_name(conn, name)
        .await?
        .ok_or_else(|| LedgerError::UnknownResource(name.to_string()))
}

pub async fn get_resource_type_by_name(
    conn: &mut PgConnection,
    name: &str,
) -> LedgerResult<ResourceType> {
    find_resource_type_by_name(conn, name)
        .await?
        .ok_or_else(|| LedgerError::NotFound(format!("resource type '{}' not found", name)))
}

pub async fn get_resource_type_by_id(
    conn: &mut PgConnection,
    id: ResourceTypeId,
) -> LedgerResult<ResourceType> {
    sqlx::query_as("SELECT id, name, unit, consumable FROM resource_types WHERE id = $1")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| LedgerError::NotFound(format!("resource type {} not found", id)))
}

pub async fn list_resource_types(conn: &mut PgConnection) -> LedgerResult<Vec<ResourceType>> {
    let resource_types =
        sqlx::query_as("SELECT id, name, unit, consumable FROM resource_types ORDER BY name")
            .fetch_all(&mut *conn)
            .await?;
    Ok(resource_types)
}

/// Update a resource type that no quota or usage row references yet
pub async fn update_resource_type(
    conn: &mut PgConnection,
    id: ResourceTypeId,
    input: &ResourceTypeInput,
) -> LedgerResult<ResourceType> {
    input.validate()?;

    // Lock the row so a concurrent quota insert cannot slip in between the
    // reference check and the update
    let existing: Option<ResourceType> = sqlx::query_as(
        "SELECT id, name, unit, consumable FROM resource_types WHERE id = $1 FOR UPDATE",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;
    let existing =
        existing.ok_or_else(|| LedgerError::NotFound(format!("resource type {} not found", id)))?;

    let referenced: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS (SELECT 1 FROM quotas WHERE resource_type_id = $1)
            OR EXISTS (SELECT 1 FROM usages WHERE resource_type_id = $1)
        "#,
    )
    .bind(id)
    .fetch_one(&mut *conn)
    .await?;

    if referenced {
        return Err(LedgerError::Conflict(format!(
            "resource type '{}' is referenced by quotas or usages and cannot be changed",
            existing.name
        )));
    }

    let updated: ResourceType = sqlx::query_as(
        r#"
        UPDATE resource_types
        SET name = $2, unit = $3, consumable = $4, updated_at = NOW()
        WHERE id = $1
        RETURNING id, name, unit, consumable
        "#,
    )
    .bind(id)
    .bind(input.name.trim())
    .bind(input.unit.trim())
    .bind(input.consumable)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| {
        LedgerError::conflict_on_unique(e, || {
            format!("resource type '{}' already exists", input.name.trim())
        })
    })?;

    tracing::info!(
        resource_type_id = %id,
        from = %existing.name,
        to = %updated.name,
        "Updated resource type"
    );

    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(name: &str, unit: &str) -> ResourceTypeInput {
        ResourceTypeInput {
            name: name.to_string(),
            unit: unit.to_string(),
            consumable: true,
        }
    }

    #[test]
    fn test_validation_requires_name_and_unit() {
        assert!(input("cpu.hours", "cpu hours").validate().is_ok());
        assert!(matches!(
            input("  ", "cpu hours").validate(),
            Err(LedgerError::InvalidInput(_))
        ));
        assert!(matches!(
            input("cpu.hours", "").validate(),
            Err(LedgerError::InvalidInput(_))
        ));
    }
}
