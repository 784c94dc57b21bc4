//! Workflow execution state machine.
//!
//! An execution moves `pending → running → {completed, failed, cancelled}`.
//! Terminal executions are never reopened; every transition goes through a
//! method here that checks the source state.

use crate::definition::Workflow;
use autoflow_core::{ExecutionId, ExecutionLogId, TriggerId, UserId, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue, json};
use std::fmt;

/// The status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Returns true if this is a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the state machine allows `self → next`.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running | Self::Cancelled)
                | (Self::Running, Self::Completed | Self::Failed | Self::Cancelled)
        )
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn from_str_value(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rejected status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionError {
    pub from: ExecutionStatus,
    pub to: ExecutionStatus,
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot move execution from {} to {}", self.from, self.to)
    }
}

impl std::error::Error for TransitionError {}

/// A request to run a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub workflow_id: WorkflowId,
    #[serde(default = "empty_object")]
    pub input_data: JsonValue,
    #[serde(default)]
    pub triggered_by: Option<UserId>,
    #[serde(default)]
    pub trigger_id: Option<TriggerId>,
}

fn empty_object() -> JsonValue {
    JsonValue::Object(Map::new())
}

impl RunRequest {
    #[must_use]
    pub fn new(workflow_id: WorkflowId, input_data: JsonValue) -> Self {
        Self {
            workflow_id,
            input_data,
            triggered_by: None,
            trigger_id: None,
        }
    }

    #[must_use]
    pub fn triggered_by(mut self, user_id: UserId) -> Self {
        self.triggered_by = Some(user_id);
        self
    }

    #[must_use]
    pub fn from_trigger(mut self, trigger_id: TriggerId) -> Self {
        self.trigger_id = Some(trigger_id);
        self
    }
}

/// One concrete run of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub trigger_id: Option<TriggerId>,
    pub triggered_by: Option<UserId>,
    pub status: ExecutionStatus,
    pub input_data: JsonValue,
    pub output_data: JsonValue,
    /// `{input, variables, output, steps}` plus anything actions add.
    pub context: JsonValue,
    pub current_step_id: Option<String>,
    /// Step ids applied so far, in order, without duplicates.
    pub completed_steps: Vec<String>,
    pub error_message: Option<String>,
    pub error_details: JsonValue,
    /// Queue-level submission number, starting at 1.
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowExecution {
    /// A pending execution with the context seeded from the workflow and request.
    #[must_use]
    pub fn new(workflow: &Workflow, request: &RunRequest, attempt: u32) -> Self {
        let context = json!({
            "input": request.input_data,
            "variables": workflow.variables,
            "output": {},
            "steps": {},
        });
        Self {
            id: ExecutionId::new(),
            workflow_id: workflow.id,
            trigger_id: request.trigger_id,
            triggered_by: request.triggered_by,
            status: ExecutionStatus::Pending,
            input_data: request.input_data.clone(),
            output_data: JsonValue::Null,
            context,
            current_step_id: None,
            completed_steps: Vec::new(),
            error_message: None,
            error_details: JsonValue::Null,
            attempt,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    fn transition(&mut self, to: ExecutionStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// `pending → running`.
    ///
    /// # Errors
    ///
    /// Returns an error if the execution is not pending.
    pub fn start(&mut self, at: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(ExecutionStatus::Running)?;
        self.started_at = Some(at);
        Ok(())
    }

    /// `running → completed`; `output_data` becomes `context.output`.
    ///
    /// # Errors
    ///
    /// Returns an error if the execution is not running.
    pub fn complete(&mut self, at: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(ExecutionStatus::Completed)?;
        self.output_data = self
            .context
            .get("output")
            .cloned()
            .unwrap_or_else(empty_object);
        self.completed_at = Some(at);
        Ok(())
    }

    /// `running → failed`.
    ///
    /// # Errors
    ///
    /// Returns an error if the execution is not running.
    pub fn fail(
        &mut self,
        at: DateTime<Utc>,
        message: impl Into<String>,
        details: JsonValue,
    ) -> Result<(), TransitionError> {
        self.transition(ExecutionStatus::Failed)?;
        self.error_message = Some(message.into());
        self.error_details = details;
        self.completed_at = Some(at);
        Ok(())
    }

    /// `{pending, running} → cancelled`.
    ///
    /// # Errors
    ///
    /// Returns an error if the execution is already terminal.
    pub fn cancel(&mut self, at: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(ExecutionStatus::Cancelled)?;
        self.completed_at = Some(at);
        Ok(())
    }

    /// Appends `step_id` to `completed_steps` unless already present.
    pub fn mark_step_completed(&mut self, step_id: &str) {
        if !self.completed_steps.iter().any(|s| s == step_id) {
            self.completed_steps.push(step_id.to_string());
        }
    }

    /// Stores a value at `context.steps[step_id]`.
    pub fn record_step_result(&mut self, step_id: &str, result: JsonValue) {
        insert_path(&mut self.context, "steps", step_id, result);
    }

    /// Stores a value at `context.output[key]`.
    pub fn record_output(&mut self, key: &str, value: JsonValue) {
        insert_path(&mut self.context, "output", key, value);
    }

    /// Time from start to completion, or to now while running.
    #[must_use]
    pub fn duration(&self) -> Option<chrono::Duration> {
        let start = self.started_at?;
        let end = self.completed_at.unwrap_or_else(Utc::now);
        Some(end - start)
    }

    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        self.duration().map_or(0, |d| d.num_milliseconds())
    }

    /// The `error_type` recorded on a failed execution.
    #[must_use]
    pub fn error_type(&self) -> Option<&str> {
        self.error_details.get("error_type").and_then(JsonValue::as_str)
    }
}

fn insert_path(context: &mut JsonValue, section: &str, key: &str, value: JsonValue) {
    if !context.is_object() {
        *context = empty_object();
    }
    let Some(root) = context.as_object_mut() else {
        return;
    };
    let entry = root
        .entry(section.to_string())
        .or_insert_with(empty_object);
    if !entry.is_object() {
        *entry = empty_object();
    }
    if let Some(map) = entry.as_object_mut() {
        map.insert(key.to_string(), value);
    }
}

/// Severity of an execution log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub fn from_str_value(value: &str) -> Option<Self> {
        match value {
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warning" => Some(Self::Warning),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// An append-only audit entry for an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub id: ExecutionLogId,
    pub execution_id: ExecutionId,
    pub step_id: Option<String>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default)]
    pub details: JsonValue,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionLog {
    #[must_use]
    pub fn new(
        execution_id: ExecutionId,
        step_id: Option<&str>,
        level: LogLevel,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: ExecutionLogId::new(),
            execution_id,
            step_id: step_id.map(str::to_string),
            level,
            message: message.into(),
            details: JsonValue::Null,
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: JsonValue) -> Self {
        self.details = details;
        self
    }
}
