//! Tunable limits for the engine, the execution queue, and housekeeping.
//!
//! Each struct deserializes with per-field defaults so a partial
//! configuration section is valid.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Limits applied by the step runner and built-in handlers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Cap on a single `wait` step.
    #[serde(default = "default_max_wait_seconds")]
    pub max_wait_seconds: u64,
    /// Cap on the items a `loop` step processes.
    #[serde(default = "default_max_loop_items")]
    pub max_loop_items: usize,
    /// Timeout for outbound webhook steps.
    #[serde(default = "default_webhook_timeout_secs")]
    pub webhook_timeout_secs: u64,
    #[serde(default)]
    pub custom_code: CustomCodeLimits,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_wait_seconds: default_max_wait_seconds(),
            max_loop_items: default_max_loop_items(),
            webhook_timeout_secs: default_webhook_timeout_secs(),
            custom_code: CustomCodeLimits::default(),
        }
    }
}

impl EngineSettings {
    #[must_use]
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_seconds)
    }

    #[must_use]
    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_secs)
    }
}

fn default_max_wait_seconds() -> u64 {
    300
}

fn default_max_loop_items() -> usize {
    1000
}

fn default_webhook_timeout_secs() -> u64 {
    30
}

/// Sandbox limits for `custom_code` scripts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomCodeLimits {
    #[serde(default = "default_max_operations")]
    pub max_operations: u64,
    #[serde(default = "default_max_call_levels")]
    pub max_call_levels: usize,
    #[serde(default = "default_max_expr_depth")]
    pub max_expr_depth: usize,
    #[serde(default = "default_max_string_size")]
    pub max_string_size: usize,
    #[serde(default = "default_max_collection_size")]
    pub max_collection_size: usize,
}

impl Default for CustomCodeLimits {
    fn default() -> Self {
        Self {
            max_operations: default_max_operations(),
            max_call_levels: default_max_call_levels(),
            max_expr_depth: default_max_expr_depth(),
            max_string_size: default_max_string_size(),
            max_collection_size: default_max_collection_size(),
        }
    }
}

fn default_max_operations() -> u64 {
    100_000
}

fn default_max_call_levels() -> usize {
    32
}

fn default_max_expr_depth() -> usize {
    64
}

fn default_max_string_size() -> usize {
    64 * 1024
}

fn default_max_collection_size() -> usize {
    10_000
}

/// Concurrency and whole-run retry policy of the execution queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Runs executing at the same time.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Attempts per run request, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each further attempt.
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
        }
    }
}

fn default_max_concurrency() -> usize {
    8
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_secs() -> u64 {
    60
}

fn default_max_delay_secs() -> u64 {
    3600
}

/// Periodic maintenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HousekeepingSettings {
    /// Seconds between housekeeping passes.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Running executions started longer ago than this are failed.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    /// Terminal executions older than this many days are deleted.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for HousekeepingSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            stale_after_secs: default_stale_after_secs(),
            retention_days: default_retention_days(),
        }
    }
}

impl HousekeepingSettings {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

fn default_interval_secs() -> u64 {
    300
}

fn default_stale_after_secs() -> u64 {
    2 * 60 * 60
}

fn default_retention_days() -> u32 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_sections_use_defaults() {
        let settings: QueueSettings =
            serde_json::from_str(r#"{"max_attempts": 5}"#).expect("deserialize");
        assert_eq!(settings.max_attempts, 5);
        assert_eq!(settings.max_concurrency, 8);
        assert_eq!(settings.base_delay_secs, 60);
    }

    #[test]
    fn engine_defaults() {
        let settings = EngineSettings::default();
        assert_eq!(settings.max_wait(), Duration::from_secs(300));
        assert_eq!(settings.max_loop_items, 1000);
        assert_eq!(settings.custom_code.max_operations, 100_000);
    }

    #[test]
    fn housekeeping_defaults() {
        let settings: HousekeepingSettings = serde_json::from_str("{}").expect("deserialize");
        assert_eq!(settings.stale_after_secs, 7200);
        assert_eq!(settings.retention_days, 30);
    }
}
