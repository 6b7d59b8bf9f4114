//! Plan catalog
//!
//! Plans carry two append-only, time-versioned sequences: quota defaults (one
//! sequence per resource type) and rates (a single scalar sequence). The
//! active version of either is the row with the latest effective date not
//! after the query instant.

use std::collections::BTreeMap;

use qms_shared::{PlanId, PlanQuotaDefaultId, PlanRateId, ResourceTypeId};
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use time::OffsetDateTime;

use crate::error::{LedgerError, LedgerResult};
use crate::resources::{get_resource_type_by_name, ResourceType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanQuotaDefault {
    pub id: PlanQuotaDefaultId,
    pub resource_type: ResourceType,
    pub quota_value: f64,
    pub effective_date: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PlanRate {
    pub id: PlanRateId,
    pub rate: f64,
    pub effective_date: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub name: String,
    pub description: String,
    /// Ordered by effective date, then resource type name
    pub quota_defaults: Vec<PlanQuotaDefault>,
    /// Ordered by effective date
    pub rates: Vec<PlanRate>,
}

impl Plan {
    pub fn active_quota_defaults(&self, as_of: OffsetDateTime) -> Vec<&PlanQuotaDefault> {
        resolve_active_quota_defaults(&self.quota_defaults, as_of)
    }

    /// Active quota default values keyed by resource type name
    pub fn active_quota_values(&self, as_of: OffsetDateTime) -> BTreeMap<String, f64> {
        self.active_quota_defaults(as_of)
            .into_iter()
            .map(|d| (d.resource_type.name.clone(), d.quota_value))
            .collect()
    }

    pub fn active_rate(&self, as_of: OffsetDateTime) -> Option<&PlanRate> {
        resolve_active_rate(&self.rates, as_of)
    }

    /// Like [`Plan::active_rate`], failing with `NoActiveRate` if every rate is in the future
    pub fn require_active_rate(&self, as_of: OffsetDateTime) -> LedgerResult<&PlanRate> {
        self.active_rate(as_of).ok_or_else(|| {
            LedgerError::NoActiveRate(format!(
                "plan '{}' has no rate effective at or before {}",
                self.name, as_of
            ))
        })
    }
}

/// Pick, per resource type, the quota default with the latest effective date
/// not after `as_of`. Resource types with only future defaults are omitted.
/// The result is ordered by resource type name.
pub fn resolve_active_quota_defaults(
    defaults: &[PlanQuotaDefault],
    as_of: OffsetDateTime,
) -> Vec<&PlanQuotaDefault> {
    let mut active: BTreeMap<&str, &PlanQuotaDefault> = BTreeMap::new();

    for default in defaults.iter().filter(|d| d.effective_date <= as_of) {
        active
            .entry(default.resource_type.name.as_str())
            .and_modify(|current| {
                if default.effective_date > current.effective_date {
                    *current = default;
                }
            })
            .or_insert(default);
    }

    active.into_values().collect()
}

/// Pick the rate with the latest effective date not after `as_of`.
pub fn resolve_active_rate(rates: &[PlanRate], as_of: OffsetDateTime) -> Option<&PlanRate> {
    rates
        .iter()
        .filter(|r| r.effective_date <= as_of)
        .fold(None, |best: Option<&PlanRate>, rate| match best {
            Some(current) if current.effective_date >= rate.effective_date => Some(current),
            _ => Some(rate),
        })
}

// =============================================================================
// New plan input
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPlanQuotaDefault {
    /// Resource type name
    pub resource_type: String,
    pub quota_value: f64,
    pub effective_date: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPlanRate {
    pub rate: f64,
    pub effective_date: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPlan {
    pub name: String,
    pub description: String,
    pub quota_defaults: Vec<NewPlanQuotaDefault>,
    pub rates: Vec<NewPlanRate>,
}

impl NewPlan {
    pub fn validate(&self) -> LedgerResult<()> {
        if self.name.trim().is_empty() {
            return Err(LedgerError::InvalidInput("plan name is required".to_string()));
        }
        if self.description.trim().is_empty() {
            return Err(LedgerError::InvalidInput(format!(
                "description is required for plan '{}'",
                self.name
            )));
        }
        validate_quota_defaults(&self.quota_defaults)?;
        validate_rates(&self.rates)
    }
}

pub fn validate_quota_defaults(defaults: &[NewPlanQuotaDefault]) -> LedgerResult<()> {
    for default in defaults {
        if default.resource_type.trim().is_empty() {
            return Err(LedgerError::InvalidInput(
                "quota default resource type is required".to_string(),
            ));
        }
        if !default.quota_value.is_finite() || default.quota_value <= 0.0 {
            return Err(LedgerError::InvalidInput(format!(
                "default quota for '{}' must be greater than 0, got {}",
                default.resource_type, default.quota_value
            )));
        }
    }
    Ok(())
}

pub fn validate_rates(rates: &[NewPlanRate]) -> LedgerResult<()> {
    for rate in rates {
        if !rate.rate.is_finite() || rate.rate < 0.0 {
            return Err(LedgerError::InvalidInput(format!(
                "rate must be 0 or greater, got {}",
                rate.rate
            )));
        }
    }
    Ok(())
}

// =============================================================================
// Store access
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct PlanRow {
    id: PlanId,
    name: String,
    description: String,
}

#[derive(Debug, sqlx::FromRow)]
struct QuotaDefaultRow {
    id: PlanQuotaDefaultId,
    resource_type_id: ResourceTypeId,
    resource_type_name: String,
    unit: String,
    consumable: bool,
    quota_value: f64,
    effective_date: OffsetDateTime,
}

impl From<QuotaDefaultRow> for PlanQuotaDefault {
    fn from(row: QuotaDefaultRow) -> Self {
        Self {
            id: row.id,
            resource_type: ResourceType {
                id: row.resource_type_id,
                name: row.resource_type_name,
                unit: row.unit,
                consumable: row.consumable,
            },
            quota_value: row.quota_value,
            effective_date: row.effective_date,
        }
    }
}

async fn load_plan(conn: &mut PgConnection, row: PlanRow) -> LedgerResult<Plan> {
    let defaults: Vec<QuotaDefaultRow> = sqlx::query_as(
        r#"
        SELECT d.id, d.resource_type_id, rt.name AS resource_type_name, rt.unit, rt.consumable,
               d.quota_value, d.effective_date
        FROM plan_quota_defaults d
        JOIN resource_types rt ON rt.id = d.resource_type_id
        WHERE d.plan_id = $1
        ORDER BY d.effective_date, rt.name
        "#,
    )
    .bind(row.id)
    .fetch_all(&mut *conn)
    .await?;

    let rates: Vec<PlanRate> = sqlx::query_as(
        "SELECT id, rate, effective_date FROM plan_rates WHERE plan_id = $1 ORDER BY effective_date",
    )
    .bind(row.id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(Plan {
        id: row.id,
        name: row.name,
        description: row.description,
        quota_defaults: defaults.into_iter().map(PlanQuotaDefault::from).collect(),
        rates,
    })
}

pub async fn find_plan_by_name(conn: &mut PgConnection, name: &str) -> LedgerResult<Option<Plan>> {
    let row: Option<PlanRow> =
        sqlx::query_as("SELECT id, name, description FROM plans WHERE name = $1")
            .bind(name)
            .fetch_optional(&mut *conn)
            .await?;

    match row {
        Some(row) => Ok(Some(load_plan(conn, row).await?)),
        None => Ok(None),
    }
}

pub async fn get_plan_by_name(conn: &mut PgConnection, name: &str) -> LedgerResult<Plan> {
    find_plan_by_name(conn, name)
        .await?
        .ok_or_else(|| LedgerError::NotFound(format!("plan '{}' not found", name)))
}

pub async fn get_plan_by_id(conn: &mut PgConnection, id: PlanId) -> LedgerResult<Plan> {
    let row: Option<PlanRow> =
        sqlx::query_as("SELECT id, name, description FROM plans WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
    let row = row.ok_or_else(|| LedgerError::NotFound(format!("plan {} not found", id)))?;
    load_plan(conn, row).await
}

pub async fn list_plans(conn: &mut PgConnection) -> LedgerResult<Vec<Plan>> {
    let rows: Vec<PlanRow> = sqlx::query_as("SELECT id, name, description FROM plans ORDER BY name")
        .fetch_all(&mut *conn)
        .await?;

    let mut plans = Vec::with_capacity(rows.len());
    for row in rows {
        plans.push(load_plan(conn, row).await?);
    }
    Ok(plans)
}

async fn insert_quota_defaults(
    conn: &mut PgConnection,
    plan_id: PlanId,
    defaults: &[NewPlanQuotaDefault],
) -> LedgerResult<()> {
    for default in defaults {
        let resource_type = get_resource_type_by_name(conn, default.resource_type.trim()).await?;

        sqlx::query(
            r#"
            INSERT INTO plan_quota_defaults (plan_id, resource_type_id, quota_value, effective_date)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(plan_id)
        .bind(resource_type.id)
        .bind(default.quota_value)
        .bind(default.effective_date)
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            LedgerError::conflict_on_unique(e, || {
                format!(
                    "quota default for '{}' effective {} already exists",
                    resource_type.name, default.effective_date
                )
            })
        })?;
    }
    Ok(())
}

async fn insert_rates(
    conn: &mut PgConnection,
    plan_id: PlanId,
    rates: &[NewPlanRate],
) -> LedgerResult<()> {
    for rate in rates {
        sqlx::query("INSERT INTO plan_rates (plan_id, rate, effective_date) VALUES ($1, $2, $3)")
            .bind(plan_id)
            .bind(rate.rate)
            .bind(rate.effective_date)
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                LedgerError::conflict_on_unique(e, || {
                    format!("rate effective {} already exists", rate.effective_date)
                })
            })?;
    }
    Ok(())
}

pub async fn add_plan(conn: &mut PgConnection, new_plan: &NewPlan) -> LedgerResult<Plan> {
    new_plan.validate()?;

    let plan_id: PlanId =
        sqlx::query_scalar("INSERT INTO plans (name, description) VALUES ($1, $2) RETURNING id")
            .bind(new_plan.name.trim())
            .bind(new_plan.description.trim())
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| {
                LedgerError::conflict_on_unique(e, || {
                    format!("plan '{}' already exists", new_plan.name.trim())
                })
            })?;

    insert_quota_defaults(conn, plan_id, &new_plan.quota_defaults).await?;
    insert_rates(conn, plan_id, &new_plan.rates).await?;

    tracing::info!(
        plan = %new_plan.name,
        plan_id = %plan_id,
        quota_defaults = new_plan.quota_defaults.len(),
        rates = new_plan.rates.len(),
        "Created plan"
    );

    get_plan_by_id(conn, plan_id).await
}

/// Append new quota default versions to a plan
pub async fn add_plan_quota_defaults(
    conn: &mut PgConnection,
    plan_id: PlanId,
    defaults: &[NewPlanQuotaDefault],
) -> LedgerResult<Plan> {
    if defaults.is_empty() {
        return Err(LedgerError::InvalidInput(
            "at least one quota default is required".to_string(),
        ));
    }
    validate_quota_defaults(defaults)?;
    // Existence check before any insert
    get_plan_by_id(conn, plan_id).await?;

    insert_quota_defaults(conn, plan_id, defaults).await?;

    tracing::info!(plan_id = %plan_id, count = defaults.len(), "Added plan quota defaults");

    get_plan_by_id(conn, plan_id).await
}

/// Append new rate versions to a plan
pub async fn add_plan_rates(
    conn: &mut PgConnection,
    plan_id: PlanId,
    rates: &[NewPlanRate],
) -> LedgerResult<Plan> {
    if rates.is_empty() {
        return Err(LedgerError::InvalidInput(
            "at least one rate is required".to_string(),
        ));
    }
    validate_rates(rates)?;
    get_plan_by_id(conn, plan_id).await?;

    insert_rates(conn, plan_id, rates).await?;

    tracing::info!(plan_id = %plan_id, count = rates.len(), "Added plan rates");

    get_plan_by_id(conn, plan_id).await
}

/// Active quota default values of a named plan, keyed by resource type name
pub async fn active_quota_defaults(
    conn: &mut PgConnection,
    plan_name: &str,
    as_of: OffsetDateTime,
) -> LedgerResult<BTreeMap<String, f64>> {
    let plan = get_plan_by_name(conn, plan_name).await?;
    Ok(plan.active_quota_values(as_of))
}

pub async fn active_rate(
    conn: &mut PgConnection,
    plan_name: &str,
    as_of: OffsetDateTime,
) -> LedgerResult<PlanRate> {
    let plan = get_plan_by_name(conn, plan_name).await?;
    plan.require_active_rate(as_of).cloned()
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn resource(name: &str, consumable: bool) -> ResourceType {
        ResourceType {
            id: ResourceTypeId::new(),
            name: name.to_string(),
            unit: "units".to_string(),
            consumable,
        }
    }

    pub fn default(
        resource_type: &ResourceType,
        quota_value: f64,
        effective_date: OffsetDateTime,
    ) -> PlanQuotaDefault {
        PlanQuotaDefault {
            id: PlanQuotaDefaultId::new(),
            resource_type: resource_type.clone(),
            quota_value,
            effective_date,
        }
    }

    pub fn rate(rate: f64, effective_date: OffsetDateTime) -> PlanRate {
        PlanRate {
            id: PlanRateId::new(),
            rate,
            effective_date,
        }
    }

    pub fn plan(name: &str, quota_defaults: Vec<PlanQuotaDefault>, rates: Vec<PlanRate>) -> Plan {
        Plan {
            id: PlanId::new(),
            name: name.to_string(),
            description: format!("{} plan", name),
            quota_defaults,
            rates,
        }
    }
}
