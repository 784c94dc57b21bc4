//! Runs one step: condition, parameter resolution, dispatch, error policy.
//!
//! A step moves `pending → {skipped, succeeded, failed}`; with the retry
//! policy a failure may go through `retrying` up to `retry_count` times.
//! Every failed attempt is written to the execution log before the policy
//! is applied.

use crate::action::{ActionDispatcher, ActionType};
use crate::condition;
use crate::definition::{ErrorPolicy, ExecutionPlan, Step};
use crate::error::{ActionError, StepError};
use crate::execution::{ExecutionLog, LogLevel, WorkflowExecution};
use crate::repository::Repository;
use crate::template;
use autoflow_integration::Integration;
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

/// How a step ended when it did not abort the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Succeeded,
    /// The condition was false; nothing was dispatched.
    Skipped,
    /// The action failed and the `continue` policy absorbed it.
    Continued,
    /// Continue at this plan position instead of the next one.
    Jump { index: usize },
}

#[derive(Clone)]
pub struct StepRunner {
    dispatcher: ActionDispatcher,
    repository: Arc<dyn Repository>,
}

impl StepRunner {
    #[must_use]
    pub fn new(dispatcher: ActionDispatcher, repository: Arc<dyn Repository>) -> Self {
        Self {
            dispatcher,
            repository,
        }
    }

    /// Runs the step at `position` of `plan` against `execution`.
    ///
    /// # Errors
    ///
    /// Returns a `StepError` when the step's policy does not absorb the
    /// failure: `stop`, exhausted `retry`, or `goto` without a later target.
    #[instrument(
        skip_all,
        fields(execution_id = %execution.id, position = position)
    )]
    pub async fn run(
        &self,
        plan: &ExecutionPlan,
        position: usize,
        integration: Option<&Integration>,
        execution: &mut WorkflowExecution,
    ) -> Result<StepOutcome, StepError> {
        let Some(step) = plan.get(position) else {
            return Ok(StepOutcome::Skipped);
        };

        if let Some(condition) = &step.condition
            && !condition::evaluate(condition, &execution.context)
        {
            info!(step_id = %step.step_id, "Step skipped, condition not met");
            self.log(
                execution,
                step,
                LogLevel::Info,
                format!("Step '{}' skipped: condition not met", step.name),
                json!({ "condition": condition }),
            )
            .await;
            return Ok(StepOutcome::Skipped);
        }

        let params = resolve_params(step, &execution.context);
        let max_attempts = step.max_attempts();
        let mut attempt = 1;
        loop {
            let outcome = self
                .dispatcher
                .execute_action(&step.action_type, &params, integration, &execution.context)
                .await;
            let err = match outcome {
                Ok(result) => return Ok(self.succeed(plan, position, step, result, execution).await),
                Err(err) => err,
            };

            error!(step_id = %step.step_id, attempt, error = %err, "Step failed");
            self.log(
                execution,
                step,
                LogLevel::Error,
                format!("Step '{}' failed: {err}", step.name),
                json!({
                    "error_type": err.kind().as_str(),
                    "attempt": attempt,
                    "cause": err.cause(),
                }),
            )
            .await;

            if attempt >= max_attempts {
                return self.apply_policy(plan, position, step, err, attempt, execution).await;
            }

            warn!(
                step_id = %step.step_id,
                attempt,
                max_attempts,
                delay_secs = step.retry_delay,
                "Retrying step"
            );
            self.log(
                execution,
                step,
                LogLevel::Warning,
                format!(
                    "Retrying step '{}' (attempt {} of {max_attempts})",
                    step.name,
                    attempt + 1
                ),
                json!({ "delay_secs": step.retry_delay }),
            )
            .await;
            tokio::time::sleep(Duration::from_secs(step.retry_delay)).await;
            attempt += 1;
        }
    }

    async fn succeed(
        &self,
        plan: &ExecutionPlan,
        position: usize,
        step: &Step,
        result: JsonValue,
        execution: &mut WorkflowExecution,
    ) -> StepOutcome {
        let jump = branch_target(plan, position, step, &result);

        if let Some(key) = &step.output_key {
            execution.record_output(key, result.clone());
        }
        execution.record_step_result(&step.step_id, result);
        execution.mark_step_completed(&step.step_id);

        info!(step_id = %step.step_id, "Step completed");
        self.log(
            execution,
            step,
            LogLevel::Info,
            format!("Step '{}' completed", step.name),
            JsonValue::Null,
        )
        .await;

        jump.map_or(StepOutcome::Succeeded, |index| StepOutcome::Jump { index })
    }

    async fn apply_policy(
        &self,
        plan: &ExecutionPlan,
        position: usize,
        step: &Step,
        err: ActionError,
        attempts: u32,
        execution: &mut WorkflowExecution,
    ) -> Result<StepOutcome, StepError> {
        match step.on_error {
            ErrorPolicy::Continue => {
                record_failure(execution, step, &err);
                self.log(
                    execution,
                    step,
                    LogLevel::Warning,
                    format!("Continuing after failure of step '{}'", step.name),
                    JsonValue::Null,
                )
                .await;
                Ok(StepOutcome::Continued)
            }
            ErrorPolicy::Retry => Err(StepError::RetryExhausted {
                step_id: step.step_id.clone(),
                attempts,
                last: err,
            }),
            ErrorPolicy::Goto => {
                let target = step.goto_step.as_deref().unwrap_or_default();
                match plan.forward_target(position, target) {
                    Some(index) => {
                        record_failure(execution, step, &err);
                        info!(step_id = %step.step_id, target, "Jumping after failure");
                        self.log(
                            execution,
                            step,
                            LogLevel::Warning,
                            format!("Step '{}' failed, jumping to '{target}'", step.name),
                            JsonValue::Null,
                        )
                        .await;
                        Ok(StepOutcome::Jump { index })
                    }
                    None => {
                        warn!(step_id = %step.step_id, target, "Goto target is not a later step");
                        Err(StepError::Failed {
                            step_id: step.step_id.clone(),
                            source: err,
                        })
                    }
                }
            }
            ErrorPolicy::Stop => Err(StepError::Failed {
                step_id: step.step_id.clone(),
                source: err,
            }),
        }
    }

    async fn log(
        &self,
        execution: &WorkflowExecution,
        step: &Step,
        level: LogLevel,
        message: String,
        details: JsonValue,
    ) {
        let entry = ExecutionLog::new(execution.id, Some(&step.step_id), level, message)
            .with_details(details);
        if let Err(e) = self.repository.append_log(&entry).await {
            warn!(execution_id = %execution.id, error = %e, "Failed to append execution log");
        }
    }
}

fn record_failure(execution: &mut WorkflowExecution, step: &Step, err: &ActionError) {
    execution.record_step_result(
        &step.step_id,
        json!({ "error": err.to_string(), "error_type": err.kind().as_str() }),
    );
}

/// A forward jump requested by a `conditional` result.
fn branch_target(
    plan: &ExecutionPlan,
    position: usize,
    step: &Step,
    result: &JsonValue,
) -> Option<usize> {
    if ActionType::from_tag(&step.action_type) != Some(ActionType::Conditional) {
        return None;
    }
    let target = result.get("next_step")?.as_str()?;
    let index = plan.forward_target(position, target);
    if index.is_none() {
        warn!(step_id = %step.step_id, target, "Branch target is not a later step, continuing in order");
    }
    index
}

/// Resolves templates in the step params. A loop's per-item `params` stay
/// unresolved until the loop binds `item` and `index`.
fn resolve_params(step: &Step, context: &JsonValue) -> JsonValue {
    if ActionType::from_tag(&step.action_type) == Some(ActionType::Loop)
        && let JsonValue::Object(map) = &step.params
    {
        return JsonValue::Object(
            map.iter()
                .map(|(key, value)| {
                    let value = if key == "params" {
                        value.clone()
                    } else {
                        template::resolve(value, context)
                    };
                    (key.clone(), value)
                })
                .collect(),
        );
    }
    template::resolve(&step.params, context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::test_support::ScriptedHandler;
    use crate::definition::{Condition, Workflow};
    use crate::error::ErrorKind;
    use crate::execution::RunRequest;
    use crate::repository::InMemoryRepository;
    use autoflow_core::OrganizationId;
    use tokio::time::Instant;

    struct Fixture {
        runner: StepRunner,
        repo: Arc<InMemoryRepository>,
        handler: ScriptedHandler,
    }

    fn fixture(handler: ScriptedHandler) -> Fixture {
        let repo = Arc::new(InMemoryRepository::new());
        let dispatcher = ActionDispatcher::builder()
            .register(ActionType::SendWebhook, handler.clone())
            .register(ActionType::Conditional, crate::action::ConditionalHandler)
            .build();
        Fixture {
            runner: StepRunner::new(dispatcher, repo.clone()),
            repo,
            handler,
        }
    }

    fn execution_for(workflow: &Workflow) -> WorkflowExecution {
        WorkflowExecution::new(workflow, &RunRequest::new(workflow.id, json!({"amount": 5})), 1)
    }

    fn workflow(steps: Vec<Step>) -> Workflow {
        steps
            .into_iter()
            .fold(Workflow::new(OrganizationId::new(), "wf").activated(), Workflow::with_step)
    }

    #[tokio::test]
    async fn false_condition_skips_without_dispatch() {
        let f = fixture(ScriptedHandler::default());
        let wf = workflow(vec![Step::new("a", "send_webhook", json!({})).with_condition(
            Condition::new("input.amount", ">", json!(10)),
        )]);
        let mut exec = execution_for(&wf);

        let outcome = f.runner.run(&wf.plan(), 0, None, &mut exec).await.expect("run");
        assert_eq!(outcome, StepOutcome::Skipped);
        assert_eq!(f.handler.call_count(), 0);
        assert!(exec.completed_steps.is_empty());
        let logs = f.repo.list_logs(exec.id).await.expect("logs");
        assert_eq!(logs[0].level, LogLevel::Info);
    }

    #[tokio::test]
    async fn success_stores_result_and_output() {
        let f = fixture(ScriptedHandler::default());
        let wf = workflow(vec![
            Step::new("a", "send_webhook", json!({"amount": "{{input.amount}}"})).with_output_key("sent"),
        ]);
        let mut exec = execution_for(&wf);

        let outcome = f.runner.run(&wf.plan(), 0, None, &mut exec).await.expect("run");
        assert_eq!(outcome, StepOutcome::Succeeded);
        assert_eq!(exec.context["steps"]["a"], json!({"amount": 5}));
        assert_eq!(exec.context["output"]["sent"], json!({"amount": 5}));
        assert_eq!(exec.completed_steps, ["a"]);
    }

    #[tokio::test]
    async fn continue_records_error_and_absorbs() {
        let f = fixture(ScriptedHandler::failing(1));
        let wf = workflow(vec![Step::new("a", "send_webhook", json!({})).continue_on_error()]);
        let mut exec = execution_for(&wf);

        let outcome = f.runner.run(&wf.plan(), 0, None, &mut exec).await.expect("run");
        assert_eq!(outcome, StepOutcome::Continued);
        assert_eq!(exec.context["steps"]["a"]["error_type"], json!("WebhookError"));
        assert!(exec.completed_steps.is_empty());
        let logs = f.repo.list_logs(exec.id).await.expect("logs");
        assert_eq!(logs[0].level, LogLevel::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_dispatches_k_plus_one_times_with_delay() {
        let f = fixture(ScriptedHandler::failing(u32::MAX));
        let wf = workflow(vec![Step::new("a", "send_webhook", json!({})).with_retry(2, 5)]);
        let mut exec = execution_for(&wf);

        let start = Instant::now();
        let err = f
            .runner
            .run(&wf.plan(), 0, None, &mut exec)
            .await
            .expect_err("exhausted");
        assert_eq!(f.handler.call_count(), 3);
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert_eq!(err.kind(), ErrorKind::RetryExhausted);
        assert!(matches!(err, StepError::RetryExhausted { attempts: 3, .. }));

        let logs = f.repo.list_logs(exec.id).await.expect("logs");
        let errors = logs.iter().filter(|l| l.level == LogLevel::Error).count();
        let warnings = logs.iter().filter(|l| l.level == LogLevel::Warning).count();
        assert_eq!((errors, warnings), (3, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_recovers_on_later_attempt() {
        let f = fixture(ScriptedHandler::failing(1));
        let wf = workflow(vec![Step::new("a", "send_webhook", json!({"ok": true})).with_retry(3, 1)]);
        let mut exec = execution_for(&wf);

        let outcome = f.runner.run(&wf.plan(), 0, None, &mut exec).await.expect("run");
        assert_eq!(outcome, StepOutcome::Succeeded);
        assert_eq!(f.handler.call_count(), 2);
        assert_eq!(exec.completed_steps, ["a"]);
    }

    #[tokio::test]
    async fn stop_propagates_after_one_attempt() {
        let f = fixture(ScriptedHandler::failing(u32::MAX));
        let wf = workflow(vec![Step::new("a", "send_webhook", json!({}))]);
        let mut exec = execution_for(&wf);

        let err = f.runner.run(&wf.plan(), 0, None, &mut exec).await.expect_err("stop");
        assert_eq!(f.handler.call_count(), 1);
        assert_eq!(err.kind(), ErrorKind::WebhookError);
        assert_eq!(err.step_id(), "a");
    }

    #[tokio::test]
    async fn goto_jumps_forward_only() {
        let f = fixture(ScriptedHandler::failing(u32::MAX));
        let wf = workflow(vec![
            Step::new("a", "send_webhook", json!({})),
            Step::new("b", "send_webhook", json!({})).goto_on_error("d"),
            Step::new("c", "send_webhook", json!({})).goto_on_error("a"),
            Step::new("d", "send_webhook", json!({})),
        ]);
        let plan = wf.plan();
        let mut exec = execution_for(&wf);

        let outcome = f.runner.run(&plan, 1, None, &mut exec).await.expect("goto");
        assert_eq!(outcome, StepOutcome::Jump { index: 3 });
        assert_eq!(exec.context["steps"]["b"]["error_type"], json!("WebhookError"));

        let err = f.runner.run(&plan, 2, None, &mut exec).await.expect_err("backward");
        assert_eq!(err.step_id(), "c");
    }

    #[tokio::test]
    async fn conditional_branch_jumps_to_selected_step() {
        let f = fixture(ScriptedHandler::default());
        let wf = workflow(vec![
            Step::new(
                "route",
                "conditional",
                json!({
                    "condition": {"field": "input.amount", "operator": "<", "value": 10},
                    "if_true": "small",
                    "if_false": "large",
                }),
            ),
            Step::new("large", "send_webhook", json!({})),
            Step::new("small", "send_webhook", json!({})),
        ]);
        let mut exec = execution_for(&wf);

        let outcome = f.runner.run(&wf.plan(), 0, None, &mut exec).await.expect("branch");
        assert_eq!(outcome, StepOutcome::Jump { index: 2 });
        assert_eq!(exec.context["steps"]["route"]["branch"], json!("if_true"));
        assert_eq!(exec.completed_steps, ["route"]);
    }

    #[test]
    fn loop_item_params_stay_unresolved() {
        let step = Step::new(
            "each",
            "loop",
            json!({"items": "{{input.list}}", "action": "send_webhook", "params": {"to": "{{item.email}}"}}),
        );
        let resolved = resolve_params(&step, &json!({"input": {"list": [1, 2]}}));
        assert_eq!(resolved["items"], json!([1, 2]));
        assert_eq!(resolved["params"]["to"], json!("{{item.email}}"));
    }
}
