//! Environment-driven configuration.

use thiserror::Error;

use crate::types::RetirementPolicy;

/// Default plan assigned on first use
pub const DEFAULT_PLAN_NAME: &str = "Basic";
/// Resource type compared when gating plan changes
pub const DEFAULT_COMPARISON_RESOURCE: &str = "cpu.hours";
/// Invariant checks every 15 minutes
pub const DEFAULT_INVARIANT_CHECK_CRON: &str = "0 */15 * * * *";
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} has invalid value '{value}': {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Settings that shape ledger behavior, independent of the store connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerSettings {
    /// Plan used when a subscription is provisioned implicitly
    pub default_plan: String,
    /// Resource type whose quota decides whether a plan change is an upgrade
    pub comparison_resource: String,
    pub retirement_policy: RetirementPolicy,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            default_plan: DEFAULT_PLAN_NAME.to_string(),
            comparison_resource: DEFAULT_COMPARISON_RESOURCE.to_string(),
            retirement_policy: RetirementPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub run_migrations: bool,
    pub invariant_check_cron: String,
    pub ledger: LedgerSettings,
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// Callers are expected to have run `dotenvy::dotenv()` first.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let database_url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let database_max_connections = match get("DATABASE_MAX_CONNECTIONS") {
            Some(raw) => match raw.parse::<u32>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(ConfigError::Invalid {
                        name: "DATABASE_MAX_CONNECTIONS",
                        value: raw,
                        reason: "expected a positive integer".to_string(),
                    })
                }
            },
            None => DEFAULT_MAX_CONNECTIONS,
        };

        let run_migrations = match get("QMS_RUN_MIGRATIONS") {
            Some(raw) => parse_bool(&raw).ok_or_else(|| ConfigError::Invalid {
                name: "QMS_RUN_MIGRATIONS",
                value: raw.clone(),
                reason: "expected true or false".to_string(),
            })?,
            None => true,
        };

        let retirement_policy = match get("QMS_RETIREMENT_POLICY") {
            Some(raw) => raw
                .parse::<RetirementPolicy>()
                .map_err(|reason| ConfigError::Invalid {
                    name: "QMS_RETIREMENT_POLICY",
                    value: raw.clone(),
                    reason,
                })?,
            None => RetirementPolicy::default(),
        };

        Ok(Self {
            database_url,
            database_max_connections,
            run_migrations,
            invariant_check_cron: get("QMS_INVARIANT_CHECK_CRON")
                .unwrap_or_else(|| DEFAULT_INVARIANT_CHECK_CRON.to_string()),
            ledger: LedgerSettings {
                default_plan: get("QMS_DEFAULT_PLAN")
                    .unwrap_or_else(|| DEFAULT_PLAN_NAME.to_string()),
                comparison_resource: get("QMS_UPGRADE_COMPARISON_RESOURCE")
                    .unwrap_or_else(|| DEFAULT_COMPARISON_RESOURCE.to_string()),
                retirement_policy,
            },
        })
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
