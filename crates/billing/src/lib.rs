// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::too_many_arguments)] // Ledger operations take a connection, identity and timing
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Quota Ledger Engine
//!
//! Tracks which subscription plan is active for each user, what quotas that
//! plan grants, and how much of each resource has been consumed.
//!
//! ## Features
//!
//! - **Resource Catalog**: Named resource types with unit and consumable flag
//! - **Plan Catalog**: Time-versioned quota defaults and rates per plan
//! - **Subscription Ledger**: Non-overlapping subscription intervals per user,
//!   first-use provisioning, gated plan changes with overlap-aware retirement
//! - **Quotas**: Seeded from plan defaults, carried forward across plan changes
//! - **Usage Tracking**: SET/ADD counters with an append-only audit trail
//! - **Overage**: Read-only usage-versus-quota evaluation
//! - **Invariants**: Runnable consistency checks over the ledger

pub mod error;
pub mod invariants;
pub mod ledger;
pub mod overage;
pub mod plans;
pub mod quotas;
pub mod resources;
pub mod subscriptions;
pub mod updates;
pub mod usage;
pub mod users;

#[cfg(test)]
mod edge_case_tests;

// Error
pub use error::{ErrorKind, LedgerError, LedgerResult};

// Ledger
pub use ledger::{
    BatchFailure, BatchOutcome, QuotaLedger, RateSnapshotRepair, SubscriptionRequest,
    SubscriptionResult,
};

// Resources
pub use resources::{ResourceType, ResourceTypeInput};

// Plans
pub use plans::{
    resolve_active_quota_defaults, resolve_active_rate, NewPlan, NewPlanQuotaDefault,
    NewPlanRate, Plan, PlanQuotaDefault, PlanRate,
};

// Subscriptions
pub use subscriptions::{
    plan_retirement, plan_subscription, ActiveSubscription, ChangePlanOptions, ChangePlanOutcome,
    IntervalAdjustment, ListSubscriptionsParams, PlannedSubscription, RetirementAction,
    SortDirection, Subscription, SubscriptionDetails, SubscriptionLedger, SubscriptionPage,
    SubscriptionSortField, SubscriptionSummary,
};

// Quotas
pub use quotas::{carry_forward_targets, seed_from_plan, Quota, QuotaSetOutcome, QuotaUpdate};

// Usage
pub use usage::{AppliedUsage, Usage, UsageTracker, UsageUpdate};

// Updates
pub use updates::{AuditContext, Update, UpdateRequest};

// Overage
pub use overage::{evaluate_overages, Overage};

// Users
pub use users::User;

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};
