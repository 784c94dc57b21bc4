//! Workflow definition types.
//!
//! A workflow is an ordered list of steps plus the triggers that start it.
//! Definitions are edited outside the engine and read once at run start;
//! the engine never mutates a definition except for its running totals.

use crate::trigger::Trigger;
use autoflow_core::{IntegrationId, OrganizationId, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Lifecycle status of a workflow definition. Only `Active` workflows run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Draft,
    Active,
    Paused,
    Archived,
}

impl WorkflowStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Archived => "archived",
        }
    }

    #[must_use]
    pub fn from_str_value(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(Self::Draft),
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Running totals over every terminal execution of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorkflowStats {
    pub execution_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_executed_at: Option<DateTime<Utc>>,
}

impl WorkflowStats {
    /// Counts one finished run.
    pub fn record(&mut self, succeeded: bool, at: DateTime<Utc>) {
        self.execution_count += 1;
        if succeeded {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
        self.last_executed_at = Some(at);
    }
}

/// What the step runner does when a step's action fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Abort the run.
    #[default]
    Stop,
    /// Record the error in context and go on with the next step.
    Continue,
    /// Re-attempt up to `retry_count` times, `retry_delay` seconds apart.
    Retry,
    /// Jump forward to `goto_step`.
    Goto,
}

/// A `field operator value` test against the execution context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Dotted path into the context, e.g. `input.amount`.
    pub field: String,
    pub operator: String,
    #[serde(default)]
    pub value: JsonValue,
}

impl Condition {
    #[must_use]
    pub fn new(field: impl Into<String>, operator: impl Into<String>, value: JsonValue) -> Self {
        Self {
            field: field.into(),
            operator: operator.into(),
            value,
        }
    }
}

/// One unit of work within a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Unique within the workflow; results are stored under `context.steps[step_id]`.
    pub step_id: String,
    pub name: String,
    /// The action dispatcher tag, e.g. `send_webhook`.
    pub action_type: String,
    /// May contain `{{path}}` placeholders.
    #[serde(default)]
    pub params: JsonValue,
    pub integration_id: Option<IntegrationId>,
    /// Execution sequence; ties keep definition order.
    #[serde(default)]
    pub order: i32,
    pub condition: Option<Condition>,
    #[serde(default)]
    pub on_error: ErrorPolicy,
    #[serde(default)]
    pub retry_count: u32,
    /// Seconds between retry attempts.
    #[serde(default)]
    pub retry_delay: u64,
    /// Target step for the `goto` policy.
    pub goto_step: Option<String>,
    /// Also copy the result to `context.output[output_key]`.
    pub output_key: Option<String>,
}

impl Step {
    #[must_use]
    pub fn new(step_id: impl Into<String>, action_type: impl Into<String>, params: JsonValue) -> Self {
        let step_id = step_id.into();
        Self {
            name: step_id.clone(),
            step_id,
            action_type: action_type.into(),
            params,
            integration_id: None,
            order: 0,
            condition: None,
            on_error: ErrorPolicy::Stop,
            retry_count: 0,
            retry_delay: 0,
            goto_step: None,
            output_key: None,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    #[must_use]
    pub fn with_integration(mut self, integration_id: IntegrationId) -> Self {
        self.integration_id = Some(integration_id);
        self
    }

    #[must_use]
    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    #[must_use]
    pub fn continue_on_error(mut self) -> Self {
        self.on_error = ErrorPolicy::Continue;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry_count: u32, retry_delay_secs: u64) -> Self {
        self.on_error = ErrorPolicy::Retry;
        self.retry_count = retry_count;
        self.retry_delay = retry_delay_secs;
        self
    }

    #[must_use]
    pub fn goto_on_error(mut self, target: impl Into<String>) -> Self {
        self.on_error = ErrorPolicy::Goto;
        self.goto_step = Some(target.into());
        self
    }

    #[must_use]
    pub fn with_output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = Some(key.into());
        self
    }

    /// Attempts the runner makes before giving up.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        match self.on_error {
            ErrorPolicy::Retry => self.retry_count.saturating_add(1),
            _ => 1,
        }
    }
}

/// A workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub organization_id: OrganizationId,
    pub name: String,
    pub description: Option<String>,
    pub status: WorkflowStatus,
    /// Seeds `context.variables` at run start.
    #[serde(default)]
    pub variables: Map<String, JsonValue>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    #[serde(default)]
    pub stats: WorkflowStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    /// Creates an empty draft workflow.
    #[must_use]
    pub fn new(organization_id: OrganizationId, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: WorkflowId::new(),
            organization_id,
            name: name.into(),
            description: None,
            status: WorkflowStatus::Draft,
            variables: Map::new(),
            steps: Vec::new(),
            triggers: Vec::new(),
            stats: WorkflowStats::default(),
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: WorkflowStatus) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn activated(self) -> Self {
        self.with_status(WorkflowStatus::Active)
    }

    #[must_use]
    pub fn with_variable(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.variables.insert(key.into(), value);
        self
    }

    /// Appends a step. Steps without an explicit order run in insertion order.
    #[must_use]
    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    #[must_use]
    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.triggers.push(trigger);
        self
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == WorkflowStatus::Active
    }

    /// Updates `updated_at`.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Checks that step ids are unique and every goto target exists.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.step_id.is_empty() {
                return Err(DefinitionError::EmptyStepId);
            }
            if !seen.insert(step.step_id.as_str()) {
                return Err(DefinitionError::DuplicateStepId {
                    step_id: step.step_id.clone(),
                });
            }
        }
        for step in &self.steps {
            if step.on_error != ErrorPolicy::Goto {
                continue;
            }
            match step.goto_step.as_deref() {
                Some(target) if seen.contains(target) => {}
                Some(target) => {
                    return Err(DefinitionError::UnknownGotoTarget {
                        step_id: step.step_id.clone(),
                        target: target.to_string(),
                    });
                }
                None => {
                    return Err(DefinitionError::MissingGotoTarget {
                        step_id: step.step_id.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// The steps in execution order.
    #[must_use]
    pub fn plan(&self) -> ExecutionPlan {
        ExecutionPlan::new(&self.steps)
    }
}

/// Problems found by [`Workflow::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    EmptyStepId,
    DuplicateStepId { step_id: String },
    MissingGotoTarget { step_id: String },
    UnknownGotoTarget { step_id: String, target: String },
}

impl fmt::Display for DefinitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyStepId => write!(f, "step id must not be empty"),
            Self::DuplicateStepId { step_id } => write!(f, "duplicate step id '{step_id}'"),
            Self::MissingGotoTarget { step_id } => {
                write!(f, "step '{step_id}' uses goto without a goto_step")
            }
            Self::UnknownGotoTarget { step_id, target } => {
                write!(f, "step '{step_id}' jumps to unknown step '{target}'")
            }
        }
    }
}

impl std::error::Error for DefinitionError {}

/// Steps sorted by `order` with a lookup from step id to position.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionPlan {
    steps: Vec<Step>,
    positions: HashMap<String, usize>,
}

impl ExecutionPlan {
    #[must_use]
    pub fn new(steps: &[Step]) -> Self {
        let mut steps = steps.to_vec();
        // stable: equal orders keep definition order
        steps.sort_by_key(|step| step.order);
        let positions = steps
            .iter()
            .enumerate()
            .map(|(index, step)| (step.step_id.clone(), index))
            .collect();
        Self { steps, positions }
    }

    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    #[must_use]
    pub fn get(&self, position: usize) -> Option<&Step> {
        self.steps.get(position)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    #[must_use]
    pub fn position_of(&self, step_id: &str) -> Option<usize> {
        self.positions.get(step_id).copied()
    }

    /// Position of `target` if it lies strictly after `from`.
    ///
    /// Jumps only move forward, so a run always terminates.
    #[must_use]
    pub fn forward_target(&self, from: usize, target: &str) -> Option<usize> {
        self.position_of(target).filter(|to| *to > from)
    }
}
