//! PostgreSQL implementations of the engine and integration stores.
//!
//! This module provides data access for:
//! - Workflows, triggers, executions, and execution logs
//! - Integrations and sealed credentials
//! - The shared rate-limit window
//! - Application tables used by the database actions

pub mod data_store;
pub mod integration;
pub mod rate_limit;
pub mod repository;

pub use data_store::PgDataStore;
pub use integration::{PgCredentialStore, PgIntegrationStore};
pub use rate_limit::PgRateLimitStore;
pub use repository::PgRepository;

use std::fmt::Display;
use std::str::FromStr;

fn decode_error(message: String) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        message,
    )))
}

/// Parses a text id column.
fn parse_id<T>(value: &str, what: &str) -> Result<T, sqlx::Error>
where
    T: FromStr,
    T::Err: Display,
{
    T::from_str(value).map_err(|e| decode_error(format!("invalid {what} id '{value}': {e}")))
}

/// Parses a text enum column.
fn parse_enum<T>(value: &str, what: &str, parse: fn(&str) -> Option<T>) -> Result<T, sqlx::Error> {
    parse(value).ok_or_else(|| decode_error(format!("invalid {what} '{value}'")))
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}
