//! Bounded, asynchronous run submission with whole-run retry.
//!
//! Each submitted request becomes one tokio task. A semaphore caps how many
//! runs execute at once; a permit is held only while an attempt runs, never
//! during backoff. A run that fails for a transient reason is resubmitted as
//! a fresh execution after `base_delay * 2^(attempt-1)`, capped.

use crate::engine::WorkflowEngine;
use crate::error::{EngineError, ErrorKind};
use crate::execution::{ExecutionStatus, RunRequest, WorkflowExecution};
use crate::settings::QueueSettings;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{Instrument, info, info_span, warn};
use ulid::Ulid;

/// Whole-run retry schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// A policy that never resubmits.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay after the given (1-based) attempt failed.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }
}

impl From<&QueueSettings> for RetryPolicy {
    fn from(settings: &QueueSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_secs(settings.base_delay_secs),
            max_delay: Duration::from_secs(settings.max_delay_secs),
        }
    }
}

pub struct ExecutionQueue {
    engine: Arc<WorkflowEngine>,
    permits: Arc<Semaphore>,
    retry: RetryPolicy,
}

impl ExecutionQueue {
    #[must_use]
    pub fn new(engine: Arc<WorkflowEngine>, settings: &QueueSettings) -> Self {
        Self {
            engine,
            permits: Arc::new(Semaphore::new(settings.max_concurrency.max(1))),
            retry: RetryPolicy::from(settings),
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Permits not held by a running attempt.
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Starts a run in the background.
    pub fn submit(&self, request: RunRequest) -> TaskHandle {
        let task_id = Ulid::new();
        let span = info_span!("run_task", %task_id, workflow_id = %request.workflow_id);
        let join = tokio::spawn(
            run_with_retry(
                self.engine.clone(),
                self.permits.clone(),
                self.retry,
                request,
            )
            .instrument(span),
        );
        TaskHandle { task_id, join }
    }
}

async fn run_with_retry(
    engine: Arc<WorkflowEngine>,
    permits: Arc<Semaphore>,
    retry: RetryPolicy,
    request: RunRequest,
) -> Result<WorkflowExecution, EngineError> {
    let mut attempt = 1;
    loop {
        let outcome = {
            let _permit = permits
                .acquire()
                .await
                .map_err(|_| EngineError::TaskFailed {
                    reason: "execution queue closed".to_string(),
                })?;
            engine.execute(&request, attempt).await
        };

        if attempt >= retry.max_attempts || !should_resubmit(&outcome) {
            return outcome;
        }
        let delay = retry.delay_for(attempt);
        warn!(
            attempt,
            max_attempts = retry.max_attempts,
            delay_secs = delay.as_secs(),
            "Run failed transiently, resubmitting"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
        info!(attempt, "Resubmitting run");
    }
}

fn should_resubmit(outcome: &Result<WorkflowExecution, EngineError>) -> bool {
    match outcome {
        Ok(execution) => {
            execution.status == ExecutionStatus::Failed
                && execution
                    .error_type()
                    .and_then(ErrorKind::from_str_value)
                    .is_some_and(|kind| kind.is_transient())
        }
        Err(e) => e.is_transient(),
    }
}

/// Handle to a submitted run.
#[derive(Debug)]
pub struct TaskHandle {
    task_id: Ulid,
    join: JoinHandle<Result<WorkflowExecution, EngineError>>,
}

impl TaskHandle {
    #[must_use]
    pub fn id(&self) -> Ulid {
        self.task_id
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Stops the task. An attempt in flight is dropped at its next await.
    pub fn abort(&self) {
        self.join.abort();
    }

    /// Waits for the final execution of the last attempt.
    ///
    /// # Errors
    ///
    /// The engine error of the last attempt, or `TaskFailed` if the task
    /// panicked or was aborted.
    pub async fn join(self) -> autoflow_core::Result<WorkflowExecution, EngineError> {
        match self.join.await {
            Ok(outcome) => Ok(outcome?),
            Err(e) => Err(EngineError::TaskFailed {
                reason: e.to_string(),
            }
            .into()),
        }
    }
}
