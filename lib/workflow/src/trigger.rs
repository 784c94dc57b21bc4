//! Trigger types for workflow initiation.
//!
//! Triggers describe what starts a workflow. The engine itself only
//! evaluates `schedule` triggers (through housekeeping); the others are
//! recorded on the execution as `trigger_id` by whatever surface fired them.

use autoflow_core::{TriggerId, WorkflowId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// The type of trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Event,
    Webhook,
    /// Fires every `config.interval_seconds`.
    Schedule,
    Form,
    DataChange,
    Api,
}

impl TriggerType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Event => "event",
            Self::Webhook => "webhook",
            Self::Schedule => "schedule",
            Self::Form => "form",
            Self::DataChange => "data_change",
            Self::Api => "api",
        }
    }

    #[must_use]
    pub fn from_str_value(value: &str) -> Option<Self> {
        match value {
            "manual" => Some(Self::Manual),
            "event" => Some(Self::Event),
            "webhook" => Some(Self::Webhook),
            "schedule" => Some(Self::Schedule),
            "form" => Some(Self::Form),
            "data_change" => Some(Self::DataChange),
            "api" => Some(Self::Api),
            _ => None,
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A trigger attached to a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub id: TriggerId,
    pub workflow_id: WorkflowId,
    pub trigger_type: TriggerType,
    /// Type-specific settings.
    #[serde(default)]
    pub config: JsonValue,
    pub is_active: bool,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Trigger {
    /// Creates an active trigger.
    #[must_use]
    pub fn new(workflow_id: WorkflowId, trigger_type: TriggerType, config: JsonValue) -> Self {
        let now = Utc::now();
        Self {
            id: TriggerId::new(),
            workflow_id,
            trigger_type,
            config,
            is_active: true,
            last_triggered_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A schedule trigger firing every `interval`.
    #[must_use]
    pub fn every(workflow_id: WorkflowId, interval: Duration) -> Self {
        Self::new(
            workflow_id,
            TriggerType::Schedule,
            serde_json::json!({ "interval_seconds": interval.num_seconds() }),
        )
    }

    pub fn enable(&mut self) {
        self.is_active = true;
        self.updated_at = Utc::now();
    }

    pub fn disable(&mut self) {
        self.is_active = false;
        self.updated_at = Utc::now();
    }

    /// The interval of a schedule trigger. Cron expressions are not evaluated.
    #[must_use]
    pub fn schedule_interval(&self) -> Option<Duration> {
        if self.trigger_type != TriggerType::Schedule {
            return None;
        }
        self.config
            .get("interval_seconds")
            .and_then(JsonValue::as_i64)
            .filter(|secs| *secs > 0)
            .map(Duration::seconds)
    }

    /// Whether an active schedule trigger should fire at `now`.
    ///
    /// A trigger that never fired is due immediately.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.is_active {
            return false;
        }
        let Some(interval) = self.schedule_interval() else {
            return false;
        };
        self.last_triggered_at
            .is_none_or(|last| now - last >= interval)
    }

    /// Records that the trigger fired at `at`.
    pub fn mark_fired(&mut self, at: DateTime<Utc>) {
        self.last_triggered_at = Some(at);
        self.updated_at = at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn schedule_trigger_is_due_after_interval() {
        let mut trigger = Trigger::every(WorkflowId::new(), Duration::minutes(5));
        let start = Utc::now();
        assert!(trigger.is_due(start));

        trigger.mark_fired(start);
        assert!(!trigger.is_due(start + Duration::minutes(4)));
        assert!(trigger.is_due(start + Duration::minutes(5)));
    }

    #[test]
    fn inactive_and_non_schedule_triggers_are_never_due() {
        let mut trigger = Trigger::every(WorkflowId::new(), Duration::minutes(1));
        trigger.disable();
        assert!(!trigger.is_due(Utc::now()));

        let webhook = Trigger::new(WorkflowId::new(), TriggerType::Webhook, json!({"path": "/h"}));
        assert!(!webhook.is_due(Utc::now()));
        assert_eq!(webhook.schedule_interval(), None);
    }

    #[test]
    fn cron_only_schedule_has_no_interval() {
        let trigger = Trigger::new(
            WorkflowId::new(),
            TriggerType::Schedule,
            json!({"cron": "0 7 * * *"}),
        );
        assert_eq!(trigger.schedule_interval(), None);
        assert!(!trigger.is_due(Utc::now()));
    }

    #[test]
    fn trigger_type_names() {
        assert_eq!(TriggerType::DataChange.as_str(), "data_change");
        assert_eq!(TriggerType::from_str_value("form"), Some(TriggerType::Form));
        let json = serde_json::to_value(TriggerType::DataChange).expect("serialize");
        assert_eq!(json, json!("data_change"));
    }
}
