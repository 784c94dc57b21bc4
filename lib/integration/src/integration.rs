//! Configured connections to external services.

use crate::error::StoreError;
use async_trait::async_trait;
use autoflow_core::{IntegrationId, OrganizationId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Kind of external service an integration talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationType {
    /// Transactional email API.
    Email,
    /// Payment processor.
    Payment,
    /// Generic outbound webhook.
    Webhook,
    /// Chat notification (incoming-webhook style).
    Chat,
    /// Generic REST API.
    GenericApi,
    /// Anything else; requires a registered adapter.
    Custom,
}

impl IntegrationType {
    /// Storage representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Payment => "payment",
            Self::Webhook => "webhook",
            Self::Chat => "chat",
            Self::GenericApi => "generic_api",
            Self::Custom => "custom",
        }
    }

    /// Parses the storage representation.
    #[must_use]
    pub fn from_str_value(value: &str) -> Option<Self> {
        match value {
            "email" => Some(Self::Email),
            "payment" => Some(Self::Payment),
            "webhook" => Some(Self::Webhook),
            "chat" => Some(Self::Chat),
            "generic_api" | "generic-api" => Some(Self::GenericApi),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

impl fmt::Display for IntegrationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operational status of an integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationStatus {
    #[default]
    Active,
    Inactive,
    Error,
}

impl IntegrationStatus {
    /// Storage representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Error => "error",
        }
    }

    /// Parses the storage representation.
    #[must_use]
    pub fn from_str_value(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "inactive" => Some(Self::Inactive),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Running call counters for an integration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallStats {
    pub total_calls: u64,
    pub success_calls: u64,
    pub failed_calls: u64,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl CallStats {
    /// Counts one call. Both outcomes count toward `total_calls`; only
    /// successes move `last_used_at`.
    pub fn record(&mut self, succeeded: bool, at: DateTime<Utc>) {
        self.total_calls += 1;
        if succeeded {
            self.success_calls += 1;
            self.last_used_at = Some(at);
        } else {
            self.failed_calls += 1;
        }
    }
}

/// A configured connection to an external service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Integration {
    pub id: IntegrationId,
    pub organization_id: OrganizationId,
    pub name: String,
    pub integration_type: IntegrationType,
    /// Provider settings such as base URLs, default senders, and headers.
    #[serde(default)]
    pub config: Map<String, JsonValue>,
    pub status: IntegrationStatus,
    /// Calls allowed per trailing hour. `None` or zero means unlimited.
    pub rate_limit: Option<u32>,
    #[serde(default)]
    pub stats: CallStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Integration {
    /// Creates an active integration with empty config.
    #[must_use]
    pub fn new(
        organization_id: OrganizationId,
        name: impl Into<String>,
        integration_type: IntegrationType,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: IntegrationId::new(),
            organization_id,
            name: name.into(),
            integration_type,
            config: Map::new(),
            status: IntegrationStatus::Active,
            rate_limit: None,
            stats: CallStats::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets a config entry.
    #[must_use]
    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    /// Caps calls per trailing hour.
    #[must_use]
    pub fn with_rate_limit(mut self, calls_per_hour: u32) -> Self {
        self.rate_limit = Some(calls_per_hour);
        self
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == IntegrationStatus::Active
    }

    /// The effective cap, treating zero as unlimited.
    #[must_use]
    pub fn effective_rate_limit(&self) -> Option<u32> {
        self.rate_limit.filter(|limit| *limit > 0)
    }

    /// A string config value.
    #[must_use]
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(JsonValue::as_str)
    }

    /// Per-integration timeout override from `config.timeout_secs`.
    #[must_use]
    pub fn timeout_override(&self) -> Option<Duration> {
        self.config
            .get("timeout_secs")
            .and_then(JsonValue::as_u64)
            .map(Duration::from_secs)
    }
}

/// Persistence for integrations and their call statistics.
#[async_trait]
pub trait IntegrationStore: Send + Sync {
    /// Loads an integration.
    async fn fetch(&self, id: IntegrationId) -> Result<Integration, StoreError>;

    /// Inserts or replaces an integration. Returns true when newly created.
    async fn save(&self, integration: &Integration) -> Result<bool, StoreError>;

    /// Atomically counts one call and returns the updated statistics.
    async fn record_call(
        &self,
        id: IntegrationId,
        succeeded: bool,
        at: DateTime<Utc>,
    ) -> Result<CallStats, StoreError>;
}

/// Process-local integration store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryIntegrationStore {
    integrations: Arc<RwLock<HashMap<IntegrationId, Integration>>>,
}

impl InMemoryIntegrationStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IntegrationStore for InMemoryIntegrationStore {
    async fn fetch(&self, id: IntegrationId) -> Result<Integration, StoreError> {
        self.integrations
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                entity: "integration",
                id: id.to_string(),
            })
    }

    async fn save(&self, integration: &Integration) -> Result<bool, StoreError> {
        let previous = self
            .integrations
            .write()
            .await
            .insert(integration.id, integration.clone());
        Ok(previous.is_none())
    }

    async fn record_call(
        &self,
        id: IntegrationId,
        succeeded: bool,
        at: DateTime<Utc>,
    ) -> Result<CallStats, StoreError> {
        let mut integrations = self.integrations.write().await;
        let integration = integrations.get_mut(&id).ok_or_else(|| StoreError::NotFound {
            entity: "integration",
            id: id.to_string(),
        })?;
        integration.stats.record(succeeded, at);
        integration.updated_at = at;
        Ok(integration.stats.clone())
    }
}
