//! Centralized worker configuration.
//!
//! Loaded via the `config` crate from `AUTOFLOW__*` environment variables;
//! nested sections use `__`, e.g. `AUTOFLOW__QUEUE__MAX_CONCURRENCY=8`.

use autoflow_workflow::{EngineSettings, HousekeepingSettings, QueueSettings};
use serde::Deserialize;

/// Worker configuration composed from library settings.
#[derive(Debug, Deserialize)]
pub struct WorkerConfig {
    /// PostgreSQL database connection URL.
    pub database_url: String,

    #[serde(default = "default_database_max_connections")]
    pub database_max_connections: u32,

    /// NATS server URL for lifecycle events and run requests.
    pub nats_url: String,

    /// Base64 encoding of the 32-byte credential encryption key.
    pub credential_key: String,

    /// Default mail transport. Without it, `send_email` steps need an
    /// email integration.
    #[serde(default)]
    pub smtp: Option<SmtpSettings>,

    #[serde(default)]
    pub engine: EngineSettings,

    #[serde(default)]
    pub queue: QueueSettings,

    #[serde(default)]
    pub housekeeping: HousekeepingSettings,
}

/// SMTP relay settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpSettings {
    pub host: String,

    #[serde(default = "default_smtp_port")]
    pub port: u16,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Sender used when a step does not set `from`.
    pub from_address: String,

    /// Upgrade with STARTTLS instead of connecting over implicit TLS.
    #[serde(default = "default_starttls")]
    pub starttls: bool,
}

fn default_database_max_connections() -> u32 {
    5
}

fn default_smtp_port() -> u16 {
    587
}

fn default_starttls() -> bool {
    true
}

fn environment() -> config::Environment {
    config::Environment::with_prefix("AUTOFLOW")
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}

impl WorkerConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required configuration is missing or invalid.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::from_environment(environment())
    }

    fn from_environment(source: config::Environment) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(source)
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<WorkerConfig, config::ConfigError> {
        let vars = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect::<config::Map<_, _>>();
        WorkerConfig::from_environment(environment().source(Some(vars)))
    }

    const REQUIRED: [(&str, &str); 3] = [
        ("AUTOFLOW__DATABASE_URL", "postgres://localhost/autoflow"),
        ("AUTOFLOW__NATS_URL", "nats://localhost:4222"),
        ("AUTOFLOW__CREDENTIAL_KEY", "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="),
    ];

    #[test]
    fn sections_default_when_absent() {
        let config = load(&REQUIRED).expect("config");
        assert_eq!(config.database_url, "postgres://localhost/autoflow");
        assert_eq!(config.database_max_connections, 5);
        assert!(config.smtp.is_none());
        assert_eq!(config.queue, QueueSettings::default());
        assert_eq!(config.engine, EngineSettings::default());
        assert_eq!(config.housekeeping, HousekeepingSettings::default());
    }

    #[test]
    fn nested_sections_use_double_underscore() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("AUTOFLOW__QUEUE__MAX_CONCURRENCY", "8"));
        vars.push(("AUTOFLOW__HOUSEKEEPING__RETENTION_DAYS", "7"));
        vars.push(("AUTOFLOW__SMTP__HOST", "smtp.example.com"));
        vars.push(("AUTOFLOW__SMTP__FROM_ADDRESS", "robot@example.com"));

        let config = load(&vars).expect("config");
        assert_eq!(config.queue.max_concurrency, 8);
        assert_eq!(config.queue.max_attempts, QueueSettings::default().max_attempts);
        assert_eq!(config.housekeeping.retention_days, 7);
        let smtp = config.smtp.expect("smtp");
        assert_eq!(smtp.host, "smtp.example.com");
        assert_eq!(smtp.port, 587);
        assert!(smtp.starttls);
    }

    #[test]
    fn credential_key_is_required() {
        let err = load(&REQUIRED[..2]).expect_err("missing key");
        assert!(err.to_string().contains("credential_key"));
    }
}
