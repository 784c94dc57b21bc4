//! Workflow execution engine for autoflow.
//!
//! This crate provides:
//!
//! - **Definitions**: workflows, ordered steps, conditions, and error policies
//! - **Templates and conditions**: `{{path}}` resolution and field predicates
//! - **Action dispatch**: built-in handlers behind one routing table
//! - **Step runner**: conditions, retries, `continue` and `goto` policies
//! - **Engine**: execution lifecycle with checkpoints and cancellation
//! - **Queue**: bounded concurrent runs with exponential-backoff resubmission
//! - **Housekeeping**: stale-run reaping, retention, interval triggers
//! - **Events**: lifecycle events to tracing, memory, or NATS JetStream

pub mod action;
pub mod condition;
pub mod definition;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod events;
pub mod execution;
pub mod housekeeping;
pub mod nats;
pub mod queue;
pub mod repository;
pub mod settings;
pub mod step_runner;
pub mod template;
pub mod trigger;

pub use action::{ActionDispatcher, ActionHandler, ActionInput, ActionType, BuiltinServices};
pub use definition::{Condition, ErrorPolicy, ExecutionPlan, Step, Workflow, WorkflowStatus};
pub use engine::WorkflowEngine;
pub use envelope::{Envelope, RawEnvelope};
pub use error::{ActionError, EngineError, ErrorKind, RepositoryError, StepError, StorageError};
pub use events::{
    EventSink, EventSinkError, EventType, FanoutEventSink, InMemoryEventSink, LifecycleEvent,
    TracingEventSink,
};
pub use execution::{ExecutionLog, ExecutionStatus, LogLevel, RunRequest, WorkflowExecution};
pub use housekeeping::Housekeeper;
pub use nats::{NatsConfig, NatsEventSink, NatsRunQueue, ReceivedRun, RunQueueError, RunRequestStream};
pub use queue::{ExecutionQueue, RetryPolicy, TaskHandle};
pub use repository::{InMemoryRepository, Repository};
pub use settings::{CustomCodeLimits, EngineSettings, HousekeepingSettings, QueueSettings};
pub use step_runner::{StepOutcome, StepRunner};
pub use trigger::{Trigger, TriggerType};
