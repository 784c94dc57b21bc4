//! Lifecycle events and the sinks that receive them.
//!
//! The engine emits events explicitly at each transition. Publishing is
//! fire-and-forget: a sink failure is logged and never affects the run.

use crate::envelope::Envelope;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Source tag stamped on engine events.
pub const EVENT_SOURCE: &str = "workflow_engine";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "workflow.created")]
    WorkflowCreated,
    #[serde(rename = "workflow.updated")]
    WorkflowUpdated,
    #[serde(rename = "workflow.deleted")]
    WorkflowDeleted,
    #[serde(rename = "workflow.executed")]
    WorkflowExecuted,
    #[serde(rename = "workflow.failed")]
    WorkflowFailed,
    #[serde(rename = "execution.started")]
    ExecutionStarted,
    #[serde(rename = "execution.completed")]
    ExecutionCompleted,
    #[serde(rename = "execution.failed")]
    ExecutionFailed,
    #[serde(rename = "execution.cancelled")]
    ExecutionCancelled,
    #[serde(rename = "integration.created")]
    IntegrationCreated,
}

impl EventType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkflowCreated => "workflow.created",
            Self::WorkflowUpdated => "workflow.updated",
            Self::WorkflowDeleted => "workflow.deleted",
            Self::WorkflowExecuted => "workflow.executed",
            Self::WorkflowFailed => "workflow.failed",
            Self::ExecutionStarted => "execution.started",
            Self::ExecutionCompleted => "execution.completed",
            Self::ExecutionFailed => "execution.failed",
            Self::ExecutionCancelled => "execution.cancelled",
            Self::IntegrationCreated => "integration.created",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub payload: JsonValue,
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

impl LifecycleEvent {
    #[must_use]
    pub fn new(event_type: EventType, payload: JsonValue) -> Self {
        Self {
            event_type,
            payload,
            source: EVENT_SOURCE.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Errors from event sinks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventSinkError {
    ConnectionFailed { message: String },
    PublishFailed { message: String },
}

impl fmt::Display for EventSinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed { message } => {
                write!(f, "event sink connection failed: {message}")
            }
            Self::PublishFailed { message } => write!(f, "event publish failed: {message}"),
        }
    }
}

impl std::error::Error for EventSinkError {}

/// A destination for lifecycle events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: Envelope<LifecycleEvent>) -> Result<(), EventSinkError>;
}

/// Writes every event to the tracing log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn publish(&self, event: Envelope<LifecycleEvent>) -> Result<(), EventSinkError> {
        let event = event.payload();
        info!(
            event_type = %event.event_type,
            source = %event.source,
            payload = %event.payload,
            "Lifecycle event"
        );
        Ok(())
    }
}

/// Keeps every event in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventSink {
    events: Arc<Mutex<Vec<LifecycleEvent>>>,
}

impl InMemoryEventSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event received so far, oldest first.
    pub async fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().await.clone()
    }

    /// The types of every event received so far.
    pub async fn event_types(&self) -> Vec<EventType> {
        self.events
            .lock()
            .await
            .iter()
            .map(|event| event.event_type)
            .collect()
    }
}

#[async_trait]
impl EventSink for InMemoryEventSink {
    async fn publish(&self, event: Envelope<LifecycleEvent>) -> Result<(), EventSinkError> {
        self.events.lock().await.push(event.into_payload());
        Ok(())
    }
}

/// Publishes to several sinks; fails if any of them fails.
#[derive(Clone, Default)]
pub struct FanoutEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutEventSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait]
impl EventSink for FanoutEventSink {
    async fn publish(&self, event: Envelope<LifecycleEvent>) -> Result<(), EventSinkError> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.publish(event.clone()).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl fmt::Debug for FanoutEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FanoutEventSink")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FailingSink;

    #[async_trait]
    impl EventSink for FailingSink {
        async fn publish(&self, _event: Envelope<LifecycleEvent>) -> Result<(), EventSinkError> {
            Err(EventSinkError::PublishFailed {
                message: "offline".to_string(),
            })
        }
    }

    #[test]
    fn event_serializes_with_dotted_type() {
        let event = LifecycleEvent::new(EventType::ExecutionStarted, json!({"status": "running"}));
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["type"], json!("execution.started"));
        assert_eq!(value["source"], json!(EVENT_SOURCE));
        assert_eq!(EventType::WorkflowExecuted.to_string(), "workflow.executed");
    }

    #[tokio::test]
    async fn fanout_delivers_to_every_sink_even_after_failure() {
        let memory = InMemoryEventSink::new();
        let fanout = FanoutEventSink::new()
            .with_sink(Arc::new(FailingSink))
            .with_sink(Arc::new(memory.clone()));

        let result = fanout
            .publish(Envelope::new(LifecycleEvent::new(
                EventType::WorkflowCreated,
                json!({}),
            )))
            .await;

        assert!(result.is_err());
        assert_eq!(memory.event_types().await, [EventType::WorkflowCreated]);
    }

    #[tokio::test]
    async fn tracing_sink_accepts_events() {
        TracingEventSink
            .publish(Envelope::new(LifecycleEvent::new(
                EventType::IntegrationCreated,
                json!({"integration_id": "int_x"}),
            )))
            .await
            .expect("publish");
    }
}
