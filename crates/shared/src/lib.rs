#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Shared building blocks for the quota ledger: configuration, database
//! bootstrap, identifier wrappers and timestamp handling.

pub mod config;
pub mod db;
pub mod timestamp;
pub mod types;

pub use config::{Config, ConfigError, LedgerSettings};
pub use db::{create_pool, run_migrations};
pub use timestamp::{add_years, parse_timestamp, TimestampError};
pub use types::*;
