//! The workflow engine.
//!
//! One call to [`WorkflowEngine::run`] drives one execution through
//! `pending → running → {completed, failed, cancelled}`. Steps run strictly
//! in plan order on the calling task. Before every step the execution is
//! checkpointed; the repository refuses writes to a terminal execution, which
//! is how a concurrent cancel stops the run at the next step boundary.

use crate::action::ActionDispatcher;
use crate::definition::{Step, Workflow};
use crate::envelope::Envelope;
use crate::error::{EngineError, RepositoryError, StepError};
use crate::events::{EventSink, EventType, LifecycleEvent};
use crate::execution::{ExecutionLog, ExecutionStatus, LogLevel, RunRequest, WorkflowExecution};
use crate::repository::Repository;
use crate::step_runner::{StepOutcome, StepRunner};
use autoflow_core::{ExecutionId, WorkflowId};
use autoflow_integration::{Integration, IntegrationStore, StoreError};
use chrono::Utc;
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

pub struct WorkflowEngine {
    repository: Arc<dyn Repository>,
    integrations: Arc<dyn IntegrationStore>,
    runner: StepRunner,
    events: Arc<dyn EventSink>,
}

impl WorkflowEngine {
    #[must_use]
    pub fn new(
        repository: Arc<dyn Repository>,
        integrations: Arc<dyn IntegrationStore>,
        dispatcher: ActionDispatcher,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let runner = StepRunner::new(dispatcher, repository.clone());
        Self {
            repository,
            integrations,
            runner,
            events,
        }
    }

    #[must_use]
    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repository
    }

    /// Runs a workflow to a terminal state and returns the execution.
    ///
    /// A run whose steps fail still returns `Ok` with a `failed` execution;
    /// errors are reserved for runs that could not start or persist.
    ///
    /// # Errors
    ///
    /// `WorkflowNotFound`, `WorkflowNotActive`, and `NoStepsDefined` before
    /// any execution exists; `Repository` when persistence fails.
    pub async fn run(&self, request: RunRequest) -> autoflow_core::Result<WorkflowExecution, EngineError> {
        Ok(self.execute(&request, 1).await?)
    }

    #[instrument(skip_all, fields(workflow_id = %request.workflow_id, attempt = attempt))]
    pub(crate) async fn execute(
        &self,
        request: &RunRequest,
        attempt: u32,
    ) -> Result<WorkflowExecution, EngineError> {
        let workflow = self.load_runnable(request.workflow_id).await?;
        let plan = workflow.plan();

        let mut execution = WorkflowExecution::new(&workflow, request, attempt);
        self.repository.create_execution(&execution).await?;
        execution
            .start(Utc::now())
            .map_err(|e| EngineError::transition(execution.id, e))?;
        self.repository.update_execution(&execution).await?;
        info!(execution_id = %execution.id, steps = plan.len(), "Execution started");
        self.emit(EventType::ExecutionStarted, execution_payload(&execution))
            .await;

        let mut position = 0;
        while let Some(step) = plan.get(position) {
            execution.current_step_id = Some(step.step_id.clone());
            if let Some(stopped) = self.checkpoint(&execution).await? {
                return Ok(stopped);
            }

            let integration = self.load_integration(step).await;
            match self
                .runner
                .run(&plan, position, integration.as_ref(), &mut execution)
                .await
            {
                Ok(StepOutcome::Jump { index }) => {
                    debug!(execution_id = %execution.id, from = position, to = index, "Jumping");
                    position = index;
                }
                Ok(_) => position += 1,
                Err(step_err) => return self.finish_failed(execution, &step_err).await,
            }
        }

        execution.current_step_id = None;
        self.finish_completed(execution).await
    }

    async fn load_runnable(&self, workflow_id: WorkflowId) -> Result<Workflow, EngineError> {
        let workflow = self
            .repository
            .fetch_workflow(workflow_id)
            .await
            .map_err(|e| match e {
                RepositoryError::NotFound { .. } => EngineError::WorkflowNotFound { workflow_id },
                other => other.into(),
            })?;
        if !workflow.is_active() {
            return Err(EngineError::WorkflowNotActive {
                workflow_id,
                status: workflow.status.as_str().to_string(),
            });
        }
        if workflow.steps.is_empty() {
            return Err(EngineError::NoStepsDefined { workflow_id });
        }
        Ok(workflow)
    }

    /// Persists progress. Returns the stored execution when it was cancelled
    /// (or otherwise finished) elsewhere.
    async fn checkpoint(
        &self,
        execution: &WorkflowExecution,
    ) -> Result<Option<WorkflowExecution>, EngineError> {
        match self.repository.update_execution(execution).await {
            Ok(()) => Ok(None),
            Err(RepositoryError::ExecutionTerminal { status, .. }) => {
                info!(execution_id = %execution.id, %status, "Execution finished elsewhere, stopping");
                Ok(Some(self.repository.fetch_execution(execution.id).await?))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn load_integration(&self, step: &Step) -> Option<Integration> {
        let id = step.integration_id?;
        match self.integrations.fetch(id).await {
            Ok(integration) => Some(integration),
            Err(e) => {
                warn!(step_id = %step.step_id, integration_id = %id, error = %e, "Integration unavailable");
                None
            }
        }
    }

    async fn finish_completed(
        &self,
        mut execution: WorkflowExecution,
    ) -> Result<WorkflowExecution, EngineError> {
        let now = Utc::now();
        execution
            .complete(now)
            .map_err(|e| EngineError::transition(execution.id, e))?;
        if let Some(stopped) = self.checkpoint(&execution).await? {
            return Ok(stopped);
        }
        info!(
            execution_id = %execution.id,
            duration_ms = execution.duration_ms(),
            "Execution completed"
        );
        self.record_outcome(execution.workflow_id, true).await;
        let payload = execution_payload(&execution);
        self.emit(EventType::ExecutionCompleted, payload.clone()).await;
        self.emit(EventType::WorkflowExecuted, payload).await;
        Ok(execution)
    }

    async fn finish_failed(
        &self,
        mut execution: WorkflowExecution,
        step_err: &StepError,
    ) -> Result<WorkflowExecution, EngineError> {
        execution
            .fail(Utc::now(), step_err.to_string(), step_err.details())
            .map_err(|e| EngineError::transition(execution.id, e))?;
        if let Some(stopped) = self.checkpoint(&execution).await? {
            return Ok(stopped);
        }
        error!(
            execution_id = %execution.id,
            step_id = step_err.step_id(),
            error_type = step_err.kind().as_str(),
            "Execution failed"
        );
        self.record_outcome(execution.workflow_id, false).await;
        let payload = execution_payload(&execution);
        self.emit(EventType::ExecutionFailed, payload.clone()).await;
        self.emit(EventType::WorkflowFailed, payload).await;
        Ok(execution)
    }

    async fn record_outcome(&self, workflow_id: WorkflowId, succeeded: bool) {
        if let Err(e) = self
            .repository
            .record_workflow_outcome(workflow_id, succeeded, Utc::now())
            .await
        {
            warn!(%workflow_id, error = %e, "Failed to update workflow statistics");
        }
    }

    /// Cancels a running execution. The worker running it stops at its next
    /// step boundary.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` when the execution is not running,
    /// `ExecutionNotFound` when it does not exist.
    #[instrument(skip(self))]
    pub async fn cancel(
        &self,
        execution_id: ExecutionId,
    ) -> autoflow_core::Result<WorkflowExecution, EngineError> {
        let cancelled = self
            .repository
            .cancel_execution(execution_id, Utc::now())
            .await
            .map_err(|e| match e {
                RepositoryError::NotFound { .. } => EngineError::ExecutionNotFound { execution_id },
                RepositoryError::NotRunning { status, .. } => EngineError::InvalidTransition {
                    execution_id,
                    from: status,
                    to: ExecutionStatus::Cancelled,
                },
                other => other.into(),
            })?;

        let entry = ExecutionLog::new(execution_id, None, LogLevel::Info, "Execution cancelled");
        if let Err(e) = self.repository.append_log(&entry).await {
            warn!(%execution_id, error = %e, "Failed to append execution log");
        }
        info!(%execution_id, "Execution cancelled");
        self.emit(EventType::ExecutionCancelled, execution_payload(&cancelled))
            .await;
        Ok(cancelled)
    }

    /// Validates and stores a workflow.
    ///
    /// # Errors
    ///
    /// `InvalidDefinition` for inconsistent steps, `Repository` on storage failure.
    #[instrument(skip_all, fields(workflow_id = %workflow.id))]
    pub async fn save_workflow(
        &self,
        mut workflow: Workflow,
    ) -> autoflow_core::Result<Workflow, EngineError> {
        workflow
            .validate()
            .map_err(|e| EngineError::InvalidDefinition {
                reason: e.to_string(),
            })?;
        workflow.touch();
        let created = self
            .repository
            .save_workflow(&workflow)
            .await
            .map_err(EngineError::from)?;
        let event_type = if created {
            EventType::WorkflowCreated
        } else {
            EventType::WorkflowUpdated
        };
        info!(created, "Workflow saved");
        self.emit(event_type, workflow_payload(&workflow)).await;
        Ok(workflow)
    }

    /// # Errors
    ///
    /// `WorkflowNotFound` when no such workflow exists.
    #[instrument(skip(self))]
    pub async fn delete_workflow(
        &self,
        workflow_id: WorkflowId,
    ) -> autoflow_core::Result<(), EngineError> {
        self.repository
            .delete_workflow(workflow_id)
            .await
            .map_err(|e| match e {
                RepositoryError::NotFound { .. } => EngineError::WorkflowNotFound { workflow_id },
                other => other.into(),
            })?;
        info!("Workflow deleted");
        self.emit(
            EventType::WorkflowDeleted,
            json!({ "workflow_id": workflow_id.to_string() }),
        )
        .await;
        Ok(())
    }

    /// Stores an integration; `integration.created` is emitted for new ones.
    ///
    /// # Errors
    ///
    /// `Repository` when the integration store fails.
    #[instrument(skip_all, fields(integration_id = %integration.id))]
    pub async fn register_integration(
        &self,
        integration: &Integration,
    ) -> autoflow_core::Result<bool, EngineError> {
        let created = self
            .integrations
            .save(integration)
            .await
            .map_err(|e: StoreError| EngineError::Repository {
                reason: e.to_string(),
            })?;
        if created {
            self.emit(
                EventType::IntegrationCreated,
                json!({
                    "integration_id": integration.id.to_string(),
                    "organization_id": integration.organization_id.to_string(),
                    "name": integration.name,
                    "integration_type": integration.integration_type.as_str(),
                }),
            )
            .await;
        }
        Ok(created)
    }

    async fn emit(&self, event_type: EventType, payload: JsonValue) {
        let event = Envelope::new(LifecycleEvent::new(event_type, payload));
        if let Err(e) = self.events.publish(event).await {
            warn!(%event_type, error = %e, "Failed to publish lifecycle event");
        }
    }
}

pub(crate) fn execution_payload(execution: &WorkflowExecution) -> JsonValue {
    let mut payload = json!({
        "execution_id": execution.id.to_string(),
        "workflow_id": execution.workflow_id.to_string(),
        "status": execution.status.as_str(),
        "duration_ms": execution.duration_ms(),
        "attempt": execution.attempt,
    });
    if let (Some(map), Some(error_type)) = (payload.as_object_mut(), execution.error_type()) {
        map.insert("error_type".to_string(), json!(error_type));
    }
    payload
}

fn workflow_payload(workflow: &Workflow) -> JsonValue {
    json!({
        "workflow_id": workflow.id.to_string(),
        "organization_id": workflow.organization_id.to_string(),
        "name": workflow.name,
        "status": workflow.status.as_str(),
        "steps": workflow.steps.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::test_support::ScriptedHandler;
    use crate::action::{
        ActionType, BuiltinServices, InMemoryDataStore, InMemoryMailer, SchemaRegistry,
        WaitHandler,
    };
    use crate::definition::{Condition, Step, WorkflowStatus};
    use crate::events::InMemoryEventSink;
    use crate::repository::InMemoryRepository;
    use autoflow_core::OrganizationId;
    use autoflow_integration::{
        CredentialCipher, CredentialVault, HttpTransport, InMemoryCredentialStore,
        InMemoryIntegrationStore, InMemoryRateLimitStore, IntegrationClient, IntegrationType,
        RateLimiter,
    };
    use std::time::Duration;

    struct Harness {
        engine: Arc<WorkflowEngine>,
        repo: Arc<InMemoryRepository>,
        events: Arc<InMemoryEventSink>,
    }

    fn harness(dispatcher: ActionDispatcher) -> Harness {
        let repo = Arc::new(InMemoryRepository::new());
        let events = Arc::new(InMemoryEventSink::new());
        let engine = WorkflowEngine::new(
            repo.clone(),
            Arc::new(InMemoryIntegrationStore::new()),
            dispatcher,
            events.clone(),
        );
        Harness {
            engine: Arc::new(engine),
            repo,
            events,
        }
    }

    fn builtin_dispatcher(data: Arc<InMemoryDataStore>) -> ActionDispatcher {
        let store = Arc::new(InMemoryIntegrationStore::new());
        let cipher = CredentialCipher::from_key_bytes(&[7u8; 32]).expect("key");
        let vault = Arc::new(CredentialVault::new(
            cipher,
            Arc::new(InMemoryCredentialStore::new()),
        ));
        let limiter = RateLimiter::hourly(Arc::new(InMemoryRateLimitStore::new()));
        let transport = HttpTransport::new().expect("transport");
        let client = Arc::new(IntegrationClient::with_default_adapters(
            vault, limiter, store, &transport,
        ));
        let schemas = SchemaRegistry::new().with_schema(
            "lead",
            json!({"required": ["email"], "properties": {"email": {"type": "string"}}}),
        );
        let services = BuiltinServices::new(client, data, Arc::new(InMemoryMailer::new()), transport)
            .with_schemas(schemas);
        ActionDispatcher::builder()
            .with_builtin_handlers(services)
            .build()
    }

    async fn stored(h: &Harness, steps: Vec<Step>) -> Workflow {
        let workflow = steps
            .into_iter()
            .fold(Workflow::new(OrganizationId::new(), "test").activated(), Workflow::with_step);
        h.repo.save_workflow(&workflow).await.expect("save");
        workflow
    }

    #[tokio::test]
    async fn ordered_steps_all_complete() {
        let handler = ScriptedHandler::default();
        let h = harness(
            ActionDispatcher::builder()
                .register(ActionType::TransformData, handler.clone())
                .build(),
        );
        let wf = stored(
            &h,
            vec![
                Step::new("c", "transform_data", json!({})).with_order(3),
                Step::new("a", "transform_data", json!({"v": "{{input.v}}"}))
                    .with_order(1)
                    .with_output_key("first"),
                Step::new("b", "transform_data", json!({})).with_order(2),
            ],
        )
        .await;

        let execution = h
            .engine
            .run(RunRequest::new(wf.id, json!({"v": 9})))
            .await
            .expect("run");
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.completed_steps, ["a", "b", "c"]);
        assert_eq!(execution.output_data, json!({"first": {"v": 9}}));
        assert!(execution.current_step_id.is_none());
        assert_eq!(handler.call_count(), 3);

        let persisted = h.repo.fetch_execution(execution.id).await.expect("fetch");
        assert_eq!(persisted.status, ExecutionStatus::Completed);
        let stats = h.repo.fetch_workflow(wf.id).await.expect("workflow").stats;
        assert_eq!((stats.execution_count, stats.success_count), (1, 1));
        assert_eq!(
            h.events.event_types().await,
            [
                EventType::ExecutionStarted,
                EventType::ExecutionCompleted,
                EventType::WorkflowExecuted
            ]
        );
    }

    #[tokio::test]
    async fn continue_policy_lets_the_run_complete() {
        let next = ScriptedHandler::default();
        let h = harness(
            ActionDispatcher::builder()
                .register(ActionType::SendWebhook, ScriptedHandler::failing(1))
                .register(ActionType::TransformData, next.clone())
                .build(),
        );
        let wf = stored(
            &h,
            vec![
                Step::new("notify", "send_webhook", json!({})).continue_on_error(),
                Step::new("shape", "transform_data", json!({})),
            ],
        )
        .await;

        let execution = h.engine.run(RunRequest::new(wf.id, json!({}))).await.expect("run");
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(next.call_count(), 1);
        assert_eq!(execution.completed_steps, ["shape"]);
        assert_eq!(
            execution.context["steps"]["notify"]["error_type"],
            json!("WebhookError")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fail_the_run() {
        let flaky = ScriptedHandler::failing(u32::MAX);
        let h = harness(
            ActionDispatcher::builder()
                .register(ActionType::SendWebhook, flaky.clone())
                .build(),
        );
        let wf = stored(&h, vec![Step::new("a", "send_webhook", json!({})).with_retry(2, 3)]).await;

        let execution = h.engine.run(RunRequest::new(wf.id, json!({}))).await.expect("run");
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.error_type(), Some("RetryExhausted"));
        assert_eq!(execution.error_details["attempts"], json!(3));
        assert_eq!(flaky.call_count(), 3);
    }

    #[tokio::test]
    async fn validate_then_save_writes_a_row() {
        let data = Arc::new(InMemoryDataStore::new());
        let h = harness(builtin_dispatcher(data.clone()));
        let wf = stored(
            &h,
            vec![
                Step::new(
                    "validate_data",
                    "validate_data",
                    json!({"schema_ref": "lead", "data": "{{input}}"}),
                ),
                Step::new("save", "database_save", json!({"table": "leads", "data": "{{input}}"})),
            ],
        )
        .await;

        let execution = h
            .engine
            .run(RunRequest::new(wf.id, json!({"email": "ada@example.com"})))
            .await
            .expect("run");
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.context["steps"]["validate_data"]["valid"], json!(true));
        let rows = data.rows("leads").await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("email"), Some(&json!("ada@example.com")));
    }

    #[tokio::test]
    async fn unreachable_webhook_fails_with_webhook_error() {
        let h = harness(builtin_dispatcher(Arc::new(InMemoryDataStore::new())));
        let wf = stored(
            &h,
            vec![
                Step::new(
                    "notify",
                    "send_webhook",
                    json!({"url": "http://127.0.0.1:1/hook", "data": {"id": "{{input.id}}"}, "timeout": 2}),
                ),
                Step::new("after", "transform_data", json!({})),
            ],
        )
        .await;

        let execution = h
            .engine
            .run(RunRequest::new(wf.id, json!({"id": 1})))
            .await
            .expect("run");
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.error_type(), Some("WebhookError"));
        assert_eq!(execution.error_details["step_id"], json!("notify"));
        assert!(execution.completed_steps.is_empty());
        assert!(execution.error_message.is_some());

        let stats = h.repo.fetch_workflow(wf.id).await.expect("workflow").stats;
        assert_eq!(stats.failure_count, 1);
        let types = h.events.event_types().await;
        assert!(types.contains(&EventType::ExecutionFailed));
        assert!(types.contains(&EventType::WorkflowFailed));
        let logs = h.repo.list_logs(execution.id).await.expect("logs");
        assert!(logs.iter().any(|l| l.level == LogLevel::Error));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_the_run_at_the_next_step() {
        let after = ScriptedHandler::default();
        let h = harness(
            ActionDispatcher::builder()
                .register(ActionType::Wait, WaitHandler::new(Duration::from_secs(300)))
                .register(ActionType::TransformData, after.clone())
                .build(),
        );
        let wf = stored(
            &h,
            vec![
                Step::new("pause", "wait", json!({"seconds": 10})),
                Step::new("after", "transform_data", json!({})),
            ],
        )
        .await;

        let engine = h.engine.clone();
        let run = tokio::spawn(async move { engine.run(RunRequest::new(wf.id, json!({}))).await });
        tokio::time::sleep(Duration::from_secs(1)).await;

        let running = h
            .repo
            .list_running_started_before(Utc::now() + chrono::Duration::hours(1))
            .await
            .expect("running");
        assert_eq!(running.len(), 1);
        let cancelled = h.engine.cancel(running[0].id).await.expect("cancel");
        assert_eq!(cancelled.status, ExecutionStatus::Cancelled);

        let execution = run.await.expect("join").expect("run");
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
        assert_eq!(after.call_count(), 0);
        let types = h.events.event_types().await;
        assert!(types.contains(&EventType::ExecutionCancelled));
        assert!(!types.contains(&EventType::ExecutionCompleted));

        let again = h.engine.cancel(execution.id).await.expect_err("terminal");
        assert!(again.to_string().contains("invalid transition"));
    }

    #[tokio::test]
    async fn goto_skips_ahead_after_failure() {
        let ok = ScriptedHandler::default();
        let h = harness(
            ActionDispatcher::builder()
                .register(ActionType::SendWebhook, ScriptedHandler::failing(1))
                .register(ActionType::TransformData, ok.clone())
                .build(),
        );
        let wf = stored(
            &h,
            vec![
                Step::new("a", "send_webhook", json!({})).goto_on_error("c"),
                Step::new("b", "transform_data", json!({})),
                Step::new("c", "transform_data", json!({})),
            ],
        )
        .await;

        let execution = h.engine.run(RunRequest::new(wf.id, json!({}))).await.expect("run");
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.completed_steps, ["c"]);
        assert_eq!(ok.call_count(), 1);
    }

    #[tokio::test]
    async fn conditional_routes_to_branch_and_skips_by_condition() {
        let h = harness(
            ActionDispatcher::builder()
                .register(ActionType::TransformData, ScriptedHandler::default())
                .build(),
        );
        let wf = stored(
            &h,
            vec![
                Step::new(
                    "route",
                    "conditional",
                    json!({
                        "condition": {"field": "input.amount", "operator": ">", "value": 100},
                        "if_true": "review",
                        "if_false": "approve",
                    }),
                ),
                Step::new("approve", "transform_data", json!({})).with_condition(Condition::new(
                    "steps.route.result",
                    "==",
                    json!(false),
                )),
                Step::new("review", "transform_data", json!({})),
            ],
        )
        .await;

        let big = h
            .engine
            .run(RunRequest::new(wf.id, json!({"amount": 500})))
            .await
            .expect("run");
        assert_eq!(big.completed_steps, ["route", "review"]);

        let small = h
            .engine
            .run(RunRequest::new(wf.id, json!({"amount": 5})))
            .await
            .expect("run");
        assert_eq!(small.completed_steps, ["route", "approve", "review"]);
    }

    #[tokio::test]
    async fn inactive_empty_and_missing_workflows_do_not_start() {
        let h = harness(ActionDispatcher::builder().build());
        let draft = Workflow::new(OrganizationId::new(), "draft")
            .with_status(WorkflowStatus::Draft)
            .with_step(Step::new("a", "wait", json!({})));
        let empty = Workflow::new(OrganizationId::new(), "empty").activated();
        h.repo.save_workflow(&draft).await.expect("save");
        h.repo.save_workflow(&empty).await.expect("save");

        let err = h
            .engine
            .execute(&RunRequest::new(draft.id, json!({})), 1)
            .await
            .expect_err("draft");
        assert!(matches!(err, EngineError::WorkflowNotActive { .. }));

        let err = h
            .engine
            .execute(&RunRequest::new(empty.id, json!({})), 1)
            .await
            .expect_err("empty");
        assert!(matches!(err, EngineError::NoStepsDefined { .. }));

        let err = h
            .engine
            .execute(&RunRequest::new(WorkflowId::new(), json!({})), 1)
            .await
            .expect_err("missing");
        assert!(matches!(err, EngineError::WorkflowNotFound { .. }));

        assert!(h.events.events().await.is_empty());
    }

    #[tokio::test]
    async fn save_and_delete_emit_workflow_events() {
        let h = harness(ActionDispatcher::builder().build());
        let workflow = Workflow::new(OrganizationId::new(), "crm")
            .with_step(Step::new("a", "wait", json!({})));

        let saved = h.engine.save_workflow(workflow).await.expect("create");
        h.engine.save_workflow(saved.clone()).await.expect("update");
        h.engine.delete_workflow(saved.id).await.expect("delete");
        assert_eq!(
            h.events.event_types().await,
            [
                EventType::WorkflowCreated,
                EventType::WorkflowUpdated,
                EventType::WorkflowDeleted
            ]
        );

        let broken = Workflow::new(OrganizationId::new(), "broken")
            .with_step(Step::new("a", "wait", json!({})))
            .with_step(Step::new("a", "wait", json!({})));
        assert!(h.engine.save_workflow(broken).await.is_err());
    }

    #[tokio::test]
    async fn new_integrations_emit_created() {
        let h = harness(ActionDispatcher::builder().build());
        let integration = Integration::new(OrganizationId::new(), "crm", IntegrationType::GenericApi);

        assert!(h.engine.register_integration(&integration).await.expect("create"));
        assert!(!h.engine.register_integration(&integration).await.expect("update"));
        assert_eq!(h.events.event_types().await, [EventType::IntegrationCreated]);
    }
}
