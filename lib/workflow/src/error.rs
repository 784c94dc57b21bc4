//! Error types for the workflow crate.
//!
//! Errors are layered:
//! - `ActionError`: one action handler invocation failed
//! - `StepError`: a step failed after its error policy was applied
//! - `RepositoryError` / `StorageError`: persistence failures
//! - `EngineError`: what a run, cancel, or housekeeping caller sees
//!
//! Every failure that can end a run maps to an `ErrorKind`, whose string
//! form is stored in `error_details.error_type`.

use crate::execution::{ExecutionStatus, TransitionError};
use autoflow_core::{ExecutionId, WorkflowId};
use autoflow_integration::IntegrationError;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use std::fmt;

/// Machine-readable failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    WorkflowNotActive,
    NoStepsDefined,
    UnknownActionType,
    MissingIntegration,
    MissingRecipient,
    WebhookError,
    IntegrationCallFailed,
    RateLimitExceeded,
    StorageError,
    ValidationFailed,
    RetryExhausted,
    Cancelled,
    CustomCodeFailed,
    EmailFailed,
    ExecutionTimeout,
}

impl ErrorKind {
    /// The name stored in `error_details.error_type`.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkflowNotActive => "WorkflowNotActive",
            Self::NoStepsDefined => "NoStepsDefined",
            Self::UnknownActionType => "UnknownActionType",
            Self::MissingIntegration => "MissingIntegration",
            Self::MissingRecipient => "MissingRecipient",
            Self::WebhookError => "WebhookError",
            Self::IntegrationCallFailed => "IntegrationCallFailed",
            Self::RateLimitExceeded => "RateLimitExceeded",
            Self::StorageError => "StorageError",
            Self::ValidationFailed => "ValidationFailed",
            Self::RetryExhausted => "RetryExhausted",
            Self::Cancelled => "Cancelled",
            Self::CustomCodeFailed => "CustomCodeFailed",
            Self::EmailFailed => "EmailFailed",
            Self::ExecutionTimeout => "ExecutionTimeout",
        }
    }

    /// Parses the stored name.
    #[must_use]
    pub fn from_str_value(value: &str) -> Option<Self> {
        [
            Self::WorkflowNotActive,
            Self::NoStepsDefined,
            Self::UnknownActionType,
            Self::MissingIntegration,
            Self::MissingRecipient,
            Self::WebhookError,
            Self::IntegrationCallFailed,
            Self::RateLimitExceeded,
            Self::StorageError,
            Self::ValidationFailed,
            Self::RetryExhausted,
            Self::Cancelled,
            Self::CustomCodeFailed,
            Self::EmailFailed,
            Self::ExecutionTimeout,
        ]
        .into_iter()
        .find(|kind| kind.as_str() == value)
    }

    /// Whether resubmitting the whole run may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::WebhookError
                | Self::IntegrationCallFailed
                | Self::RateLimitExceeded
                | Self::StorageError
                | Self::RetryExhausted
                | Self::EmailFailed
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures of the data store behind `database_save` / `database_query`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// A table or column name failed identifier validation.
    InvalidIdentifier { name: String },
    /// A named query is not registered.
    UnknownQuery { name: String },
    /// The store cannot run this kind of statement.
    Unsupported { operation: String },
    /// The statement failed.
    QueryFailed { reason: String },
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidIdentifier { name } => write!(f, "invalid identifier '{name}'"),
            Self::UnknownQuery { name } => write!(f, "unknown named query '{name}'"),
            Self::Unsupported { operation } => {
                write!(f, "operation not supported by this store: {operation}")
            }
            Self::QueryFailed { reason } => write!(f, "query failed: {reason}"),
        }
    }
}

impl std::error::Error for StorageError {}

/// Failure of a single action handler invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionError {
    /// The action type tag is not registered.
    UnknownActionType { action_type: String },
    /// The action needs a bound integration and the step has none.
    MissingIntegration { action_type: String },
    /// `send_email` without a `to`.
    MissingRecipient,
    /// Params are malformed for the action.
    InvalidParams { reason: String },
    /// Outbound webhook failed at the transport or with a non-2xx status.
    Webhook {
        url: String,
        status: Option<u16>,
        response: Option<JsonValue>,
        reason: String,
    },
    /// The integration client rejected or failed the call.
    Integration(IntegrationError),
    /// The data store failed.
    Storage(StorageError),
    /// The default mail transport failed.
    Email { reason: String },
    /// The custom-code script failed or hit a sandbox limit.
    CustomCode { reason: String },
}

impl ActionError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownActionType { .. } => ErrorKind::UnknownActionType,
            Self::MissingIntegration { .. } => ErrorKind::MissingIntegration,
            Self::MissingRecipient => ErrorKind::MissingRecipient,
            Self::InvalidParams { .. } => ErrorKind::ValidationFailed,
            Self::Webhook { .. } => ErrorKind::WebhookError,
            Self::Integration(e) if e.is_rate_limited() => ErrorKind::RateLimitExceeded,
            Self::Integration(_) => ErrorKind::IntegrationCallFailed,
            Self::Storage(_) => ErrorKind::StorageError,
            Self::Email { .. } => ErrorKind::EmailFailed,
            Self::CustomCode { .. } => ErrorKind::CustomCodeFailed,
        }
    }

    /// Provider status and body, when the failure carries them.
    #[must_use]
    pub fn cause(&self) -> JsonValue {
        match self {
            Self::Webhook {
                url,
                status,
                response,
                ..
            } => json!({ "url": url, "status": status, "response": response }),
            Self::Integration(IntegrationError::CallFailed {
                integration_id,
                status,
                response,
                ..
            }) => json!({
                "integration_id": integration_id,
                "status": status,
                "response": response,
            }),
            Self::Integration(IntegrationError::RateLimitExceeded {
                integration_id,
                limit,
                retry_after_secs,
            }) => json!({
                "integration_id": integration_id,
                "limit": limit,
                "retry_after_secs": retry_after_secs,
            }),
            _ => JsonValue::Null,
        }
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidParams {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownActionType { action_type } => {
                write!(f, "unknown action type '{action_type}'")
            }
            Self::MissingIntegration { action_type } => {
                write!(f, "action '{action_type}' requires an integration")
            }
            Self::MissingRecipient => write!(f, "email recipient ('to') is required"),
            Self::InvalidParams { reason } => write!(f, "invalid parameters: {reason}"),
            Self::Webhook { url, reason, .. } => write!(f, "webhook to {url} failed: {reason}"),
            Self::Integration(e) => write!(f, "{e}"),
            Self::Storage(e) => write!(f, "storage error: {e}"),
            Self::Email { reason } => write!(f, "email delivery failed: {reason}"),
            Self::CustomCode { reason } => write!(f, "custom code failed: {reason}"),
        }
    }
}

impl std::error::Error for ActionError {}

impl From<IntegrationError> for ActionError {
    fn from(err: IntegrationError) -> Self {
        Self::Integration(err)
    }
}

impl From<StorageError> for ActionError {
    fn from(err: StorageError) -> Self {
        Self::Storage(err)
    }
}

/// A step failure that the step's error policy did not absorb.
#[derive(Debug, Clone, PartialEq)]
pub enum StepError {
    /// The action failed and the policy propagates it.
    Failed { step_id: String, source: ActionError },
    /// Every retry attempt failed.
    RetryExhausted {
        step_id: String,
        attempts: u32,
        last: ActionError,
    },
}

impl StepError {
    #[must_use]
    pub fn step_id(&self) -> &str {
        match self {
            Self::Failed { step_id, .. } | Self::RetryExhausted { step_id, .. } => step_id,
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Failed { source, .. } => source.kind(),
            Self::RetryExhausted { .. } => ErrorKind::RetryExhausted,
        }
    }

    /// The action failure underneath.
    #[must_use]
    pub fn action_error(&self) -> &ActionError {
        match self {
            Self::Failed { source, .. } => source,
            Self::RetryExhausted { last, .. } => last,
        }
    }

    /// Structured details stored on a failed execution.
    #[must_use]
    pub fn details(&self) -> JsonValue {
        let action = self.action_error();
        let mut details = json!({
            "error_type": self.kind().as_str(),
            "message": self.to_string(),
            "step_id": self.step_id(),
            "cause": {
                "error_type": action.kind().as_str(),
                "message": action.to_string(),
                "details": action.cause(),
            },
        });
        if let Self::RetryExhausted { attempts, .. } = self {
            details["attempts"] = json!(attempts);
        }
        details
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed { step_id, source } => write!(f, "step '{step_id}' failed: {source}"),
            Self::RetryExhausted {
                step_id,
                attempts,
                last,
            } => write!(
                f,
                "step '{step_id}' failed after {attempts} attempts: {last}"
            ),
        }
    }
}

impl std::error::Error for StepError {}

/// Persistence failures of the engine repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    /// No record with the given id.
    NotFound { entity: &'static str, id: String },
    /// The execution already reached a terminal status and cannot change.
    ExecutionTerminal {
        execution_id: ExecutionId,
        status: ExecutionStatus,
    },
    /// Cancellation requires a running execution.
    NotRunning {
        execution_id: ExecutionId,
        status: ExecutionStatus,
    },
    /// The backing store failed.
    StorageFailed { reason: String },
}

impl fmt::Display for RepositoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            Self::ExecutionTerminal {
                execution_id,
                status,
            } => write!(f, "execution {execution_id} is already {status}"),
            Self::NotRunning {
                execution_id,
                status,
            } => write!(f, "execution {execution_id} is {status}, not running"),
            Self::StorageFailed { reason } => write!(f, "repository storage failed: {reason}"),
        }
    }
}

impl std::error::Error for RepositoryError {}

/// Errors surfaced by the engine, the execution queue, and housekeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Workflow not found.
    WorkflowNotFound { workflow_id: WorkflowId },
    /// The workflow is not `active`.
    WorkflowNotActive {
        workflow_id: WorkflowId,
        status: String,
    },
    /// The workflow has no steps.
    NoStepsDefined { workflow_id: WorkflowId },
    /// The workflow definition is inconsistent.
    InvalidDefinition { reason: String },
    /// Execution not found.
    ExecutionNotFound { execution_id: ExecutionId },
    /// A status change that the execution state machine forbids.
    InvalidTransition {
        execution_id: ExecutionId,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },
    /// The repository failed.
    Repository { reason: String },
    /// A queued run task ended without producing a result.
    TaskFailed { reason: String },
}

impl EngineError {
    /// The failure category, when the error corresponds to one.
    #[must_use]
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::WorkflowNotActive { .. } => Some(ErrorKind::WorkflowNotActive),
            Self::NoStepsDefined { .. } => Some(ErrorKind::NoStepsDefined),
            Self::InvalidDefinition { .. } => Some(ErrorKind::ValidationFailed),
            Self::Repository { .. } => Some(ErrorKind::StorageError),
            _ => None,
        }
    }

    /// Whether resubmitting the run may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Repository { .. } | Self::TaskFailed { .. })
    }

    pub(crate) fn transition(execution_id: ExecutionId, err: TransitionError) -> Self {
        Self::InvalidTransition {
            execution_id,
            from: err.from,
            to: err.to,
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WorkflowNotFound { workflow_id } => {
                write!(f, "workflow not found: {workflow_id}")
            }
            Self::WorkflowNotActive {
                workflow_id,
                status,
            } => write!(f, "workflow {workflow_id} is not active (status: {status})"),
            Self::NoStepsDefined { workflow_id } => {
                write!(f, "workflow {workflow_id} has no steps defined")
            }
            Self::InvalidDefinition { reason } => {
                write!(f, "invalid workflow definition: {reason}")
            }
            Self::ExecutionNotFound { execution_id } => {
                write!(f, "execution not found: {execution_id}")
            }
            Self::InvalidTransition {
                execution_id,
                from,
                to,
            } => write!(
                f,
                "invalid transition for execution {execution_id}: {from} -> {to}"
            ),
            Self::Repository { reason } => write!(f, "repository error: {reason}"),
            Self::TaskFailed { reason } => write!(f, "run task failed: {reason}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<RepositoryError> for EngineError {
    fn from(err: RepositoryError) -> Self {
        Self::Repository {
            reason: err.to_string(),
        }
    }
}
