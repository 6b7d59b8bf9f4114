//! Common types used across the quota ledger

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// ID Wrappers
// =============================================================================

macro_rules! id_wrapper {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
        #[serde(transparent)]
        #[sqlx(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_wrapper!(
    /// User ID wrapper
    UserId
);
id_wrapper!(
    /// Resource type ID wrapper
    ResourceTypeId
);
id_wrapper!(
    /// Plan ID wrapper
    PlanId
);
id_wrapper!(
    /// Plan quota default ID wrapper
    PlanQuotaDefaultId
);
id_wrapper!(
    /// Plan rate ID wrapper
    PlanRateId
);
id_wrapper!(
    /// Subscription ID wrapper
    SubscriptionId
);
id_wrapper!(
    /// Update (audit record) ID wrapper
    UpdateId
);

// =============================================================================
// Enums
// =============================================================================

/// How an update combines with the stored value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum UpdateOperation {
    /// Replace the stored value
    Set,
    /// Accumulate onto the stored value
    Add,
}

impl UpdateOperation {
    /// Compute the value stored after applying `amount` to `current`.
    pub fn apply(self, current: f64, amount: f64) -> f64 {
        match self {
            Self::Set => amount,
            Self::Add => current + amount,
        }
    }
}

impl std::fmt::Display for UpdateOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Set => write!(f, "SET"),
            Self::Add => write!(f, "ADD"),
        }
    }
}

impl std::str::FromStr for UpdateOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "SET" => Ok(Self::Set),
            "ADD" => Ok(Self::Add),
            _ => Err(format!("Invalid update operation: {}", s)),
        }
    }
}

/// Which per-subscription value an update targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Usages,
    Quotas,
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Usages => write!(f, "usages"),
            Self::Quotas => write!(f, "quotas"),
        }
    }
}

impl std::str::FromStr for ValueType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "usages" | "usage" => Ok(Self::Usages),
            "quotas" | "quota" => Ok(Self::Quotas),
            _ => Err(format!("Invalid value type: {}", s)),
        }
    }
}

/// How existing subscriptions are retired when a user changes plans
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetirementPolicy {
    /// Truncate, shift or void only the subscriptions overlapping the new window
    #[default]
    OverlapAware,
    /// Expire every open or future-ending subscription as of now
    ExpireOpen,
}

impl std::fmt::Display for RetirementPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OverlapAware => write!(f, "overlap"),
            Self::ExpireOpen => write!(f, "expire-open"),
        }
    }
}

impl std::str::FromStr for RetirementPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "overlap" | "overlap-aware" => Ok(Self::OverlapAware),
            "expire-open" | "expire" => Ok(Self::ExpireOpen),
            _ => Err(format!("Invalid retirement policy: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_operation_parse() {
        assert_eq!("SET".parse::<UpdateOperation>(), Ok(UpdateOperation::Set));
        assert_eq!("add".parse::<UpdateOperation>(), Ok(UpdateOperation::Add));
        assert!("DELETE".parse::<UpdateOperation>().is_err());
        assert!("".parse::<UpdateOperation>().is_err());
    }

    #[test]
    fn test_set_replaces_and_add_accumulates() {
        assert_eq!(UpdateOperation::Set.apply(40.0, 3.0), 3.0);
        assert_eq!(UpdateOperation::Add.apply(40.0, 3.0), 43.0);
    }

    #[test]
    fn test_value_type_parse() {
        assert_eq!("usages".parse::<ValueType>(), Ok(ValueType::Usages));
        assert_eq!("Quotas".parse::<ValueType>(), Ok(ValueType::Quotas));
        assert!("limits".parse::<ValueType>().is_err());
    }

    #[test]
    fn test_retirement_policy_round_trip_display() {
        for policy in [RetirementPolicy::OverlapAware, RetirementPolicy::ExpireOpen] {
            assert_eq!(policy.to_string().parse::<RetirementPolicy>(), Ok(policy));
        }
        assert_eq!(RetirementPolicy::default(), RetirementPolicy::OverlapAware);
    }
}
