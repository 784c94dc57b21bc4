//! Persistence seam of the engine.
//!
//! `Repository` is the only storage the engine and housekeeping touch.
//! Implementations must refuse to overwrite a terminal execution so a late
//! checkpoint from a worker can never reopen a cancelled or failed run.

use crate::definition::{Workflow, WorkflowStats};
use crate::error::RepositoryError;
use crate::execution::{ExecutionLog, ExecutionStatus, WorkflowExecution};
use crate::trigger::{Trigger, TriggerType};
use async_trait::async_trait;
use autoflow_core::{ExecutionId, TriggerId, WorkflowId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[async_trait]
pub trait Repository: Send + Sync {
    /// Loads a workflow with its steps and triggers.
    async fn fetch_workflow(&self, id: WorkflowId) -> Result<Workflow, RepositoryError>;

    /// Inserts or replaces a workflow. Returns true when newly created.
    ///
    /// Replacing keeps the stored `stats` and never moves a trigger's
    /// `last_triggered_at` backwards.
    async fn save_workflow(&self, workflow: &Workflow) -> Result<bool, RepositoryError>;

    /// Removes a workflow with its triggers, executions, and logs.
    async fn delete_workflow(&self, id: WorkflowId) -> Result<(), RepositoryError>;

    /// Atomically counts one finished run on the workflow.
    async fn record_workflow_outcome(
        &self,
        id: WorkflowId,
        succeeded: bool,
        at: DateTime<Utc>,
    ) -> Result<WorkflowStats, RepositoryError>;

    async fn create_execution(&self, execution: &WorkflowExecution) -> Result<(), RepositoryError>;

    /// Persists a checkpoint or transition.
    ///
    /// Fails with `ExecutionTerminal` when the stored execution is already
    /// terminal; the stored record is left untouched.
    async fn update_execution(&self, execution: &WorkflowExecution) -> Result<(), RepositoryError>;

    async fn fetch_execution(&self, id: ExecutionId) -> Result<WorkflowExecution, RepositoryError>;

    /// Moves a running execution to `cancelled` in one compare-and-set.
    ///
    /// Fails with `NotRunning` for any other stored status.
    async fn cancel_execution(
        &self,
        id: ExecutionId,
        at: DateTime<Utc>,
    ) -> Result<WorkflowExecution, RepositoryError>;

    async fn append_log(&self, log: &ExecutionLog) -> Result<(), RepositoryError>;

    /// Log entries of an execution, oldest first.
    async fn list_logs(&self, execution_id: ExecutionId) -> Result<Vec<ExecutionLog>, RepositoryError>;

    /// Running executions whose `started_at` is before `cutoff`.
    async fn list_running_started_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError>;

    /// Pending executions created before `cutoff`: runs whose start was
    /// never persisted.
    async fn list_pending_created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError>;

    /// Deletes terminal executions completed before `cutoff`, with their logs.
    /// Returns the number of executions removed.
    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError>;

    /// Active schedule triggers of active workflows.
    async fn list_schedule_triggers(&self) -> Result<Vec<Trigger>, RepositoryError>;

    /// Moves `last_triggered_at` from `seen` to `at` in one compare-and-set.
    ///
    /// Returns false when another worker already fired the trigger since
    /// `seen` was read, or the trigger no longer exists.
    async fn claim_trigger(
        &self,
        trigger_id: TriggerId,
        seen: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;
}

#[derive(Debug, Default)]
struct State {
    workflows: HashMap<WorkflowId, Workflow>,
    executions: HashMap<ExecutionId, WorkflowExecution>,
    logs: Vec<ExecutionLog>,
}

/// Process-local repository.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRepository {
    state: Arc<RwLock<State>>,
}

impl InMemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn workflow_not_found(id: WorkflowId) -> RepositoryError {
    RepositoryError::NotFound {
        entity: "workflow",
        id: id.to_string(),
    }
}

fn execution_not_found(id: ExecutionId) -> RepositoryError {
    RepositoryError::NotFound {
        entity: "execution",
        id: id.to_string(),
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn fetch_workflow(&self, id: WorkflowId) -> Result<Workflow, RepositoryError> {
        self.state
            .read()
            .await
            .workflows
            .get(&id)
            .cloned()
            .ok_or_else(|| workflow_not_found(id))
    }

    async fn save_workflow(&self, workflow: &Workflow) -> Result<bool, RepositoryError> {
        let mut state = self.state.write().await;
        let mut saved = workflow.clone();
        let Some(stored) = state.workflows.get(&workflow.id) else {
            state.workflows.insert(saved.id, saved);
            return Ok(true);
        };

        saved.stats = stored.stats;
        for trigger in &mut saved.triggers {
            let fired = stored
                .triggers
                .iter()
                .find(|t| t.id == trigger.id)
                .and_then(|t| t.last_triggered_at);
            trigger.last_triggered_at = trigger.last_triggered_at.max(fired);
        }
        state.workflows.insert(saved.id, saved);
        Ok(false)
    }

    async fn delete_workflow(&self, id: WorkflowId) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        state
            .workflows
            .remove(&id)
            .ok_or_else(|| workflow_not_found(id))?;
        let removed: Vec<ExecutionId> = state
            .executions
            .values()
            .filter(|e| e.workflow_id == id)
            .map(|e| e.id)
            .collect();
        state.executions.retain(|_, e| e.workflow_id != id);
        state.logs.retain(|log| !removed.contains(&log.execution_id));
        Ok(())
    }

    async fn record_workflow_outcome(
        &self,
        id: WorkflowId,
        succeeded: bool,
        at: DateTime<Utc>,
    ) -> Result<WorkflowStats, RepositoryError> {
        let mut state = self.state.write().await;
        let workflow = state
            .workflows
            .get_mut(&id)
            .ok_or_else(|| workflow_not_found(id))?;
        workflow.stats.record(succeeded, at);
        Ok(workflow.stats)
    }

    async fn create_execution(&self, execution: &WorkflowExecution) -> Result<(), RepositoryError> {
        self.state
            .write()
            .await
            .executions
            .insert(execution.id, execution.clone());
        Ok(())
    }

    async fn update_execution(&self, execution: &WorkflowExecution) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        let stored = state
            .executions
            .get_mut(&execution.id)
            .ok_or_else(|| execution_not_found(execution.id))?;
        if stored.status.is_terminal() {
            return Err(RepositoryError::ExecutionTerminal {
                execution_id: execution.id,
                status: stored.status,
            });
        }
        *stored = execution.clone();
        Ok(())
    }

    async fn fetch_execution(&self, id: ExecutionId) -> Result<WorkflowExecution, RepositoryError> {
        self.state
            .read()
            .await
            .executions
            .get(&id)
            .cloned()
            .ok_or_else(|| execution_not_found(id))
    }

    async fn cancel_execution(
        &self,
        id: ExecutionId,
        at: DateTime<Utc>,
    ) -> Result<WorkflowExecution, RepositoryError> {
        let mut state = self.state.write().await;
        let stored = state
            .executions
            .get_mut(&id)
            .ok_or_else(|| execution_not_found(id))?;
        if stored.status != ExecutionStatus::Running {
            return Err(RepositoryError::NotRunning {
                execution_id: id,
                status: stored.status,
            });
        }
        stored
            .cancel(at)
            .map_err(|e| RepositoryError::StorageFailed {
                reason: e.to_string(),
            })?;
        Ok(stored.clone())
    }

    async fn append_log(&self, log: &ExecutionLog) -> Result<(), RepositoryError> {
        self.state.write().await.logs.push(log.clone());
        Ok(())
    }

    async fn list_logs(&self, execution_id: ExecutionId) -> Result<Vec<ExecutionLog>, RepositoryError> {
        Ok(self
            .state
            .read()
            .await
            .logs
            .iter()
            .filter(|log| log.execution_id == execution_id)
            .cloned()
            .collect())
    }

    async fn list_running_started_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        Ok(self
            .state
            .read()
            .await
            .executions
            .values()
            .filter(|e| {
                e.status == ExecutionStatus::Running && e.started_at.is_some_and(|at| at < cutoff)
            })
            .cloned()
            .collect())
    }

    async fn list_pending_created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        Ok(self
            .state
            .read()
            .await
            .executions
            .values()
            .filter(|e| e.status == ExecutionStatus::Pending && e.created_at < cutoff)
            .cloned()
            .collect())
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let mut state = self.state.write().await;
        let expired: Vec<ExecutionId> = state
            .executions
            .values()
            .filter(|e| e.status.is_terminal() && e.completed_at.is_some_and(|at| at < cutoff))
            .map(|e| e.id)
            .collect();
        for id in &expired {
            state.executions.remove(id);
        }
        state.logs.retain(|log| !expired.contains(&log.execution_id));
        Ok(expired.len() as u64)
    }

    async fn list_schedule_triggers(&self) -> Result<Vec<Trigger>, RepositoryError> {
        Ok(self
            .state
            .read()
            .await
            .workflows
            .values()
            .filter(|wf| wf.is_active())
            .flat_map(|wf| wf.triggers.iter())
            .filter(|t| t.is_active && t.trigger_type == TriggerType::Schedule)
            .cloned()
            .collect())
    }

    async fn claim_trigger(
        &self,
        trigger_id: TriggerId,
        seen: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.state.write().await;
        let trigger = state
            .workflows
            .values_mut()
            .flat_map(|wf| wf.triggers.iter_mut())
            .find(|t| t.id == trigger_id && t.last_triggered_at == seen);
        let Some(trigger) = trigger else {
            return Ok(false);
        };
        trigger.mark_fired(at);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{LogLevel, RunRequest};
    use autoflow_core::OrganizationId;
    use chrono::Duration;
    use serde_json::json;

    async fn running(repo: &InMemoryRepository) -> WorkflowExecution {
        let workflow = Workflow::new(OrganizationId::new(), "wf").activated();
        repo.save_workflow(&workflow).await.expect("save");
        let mut exec = WorkflowExecution::new(&workflow, &RunRequest::new(workflow.id, json!({})), 1);
        repo.create_execution(&exec).await.expect("create");
        exec.start(Utc::now()).expect("start");
        repo.update_execution(&exec).await.expect("update");
        exec
    }

    #[tokio::test]
    async fn terminal_executions_are_not_overwritten() {
        let repo = InMemoryRepository::new();
        let mut exec = running(&repo).await;

        repo.cancel_execution(exec.id, Utc::now()).await.expect("cancel");

        exec.mark_step_completed("late");
        let err = repo.update_execution(&exec).await.expect_err("terminal");
        assert!(matches!(
            err,
            RepositoryError::ExecutionTerminal {
                status: ExecutionStatus::Cancelled,
                ..
            }
        ));
        let stored = repo.fetch_execution(exec.id).await.expect("fetch");
        assert_eq!(stored.status, ExecutionStatus::Cancelled);
        assert!(stored.completed_steps.is_empty());
    }

    #[tokio::test]
    async fn cancel_requires_running() {
        let repo = InMemoryRepository::new();
        let exec = running(&repo).await;
        repo.cancel_execution(exec.id, Utc::now()).await.expect("first cancel");
        let err = repo
            .cancel_execution(exec.id, Utc::now())
            .await
            .expect_err("second cancel");
        assert!(matches!(err, RepositoryError::NotRunning { .. }));
    }

    #[tokio::test]
    async fn purge_removes_old_terminal_executions_and_logs() {
        let repo = InMemoryRepository::new();
        let mut exec = running(&repo).await;
        repo.append_log(&ExecutionLog::new(exec.id, None, LogLevel::Info, "hello"))
            .await
            .expect("log");
        let long_ago = Utc::now() - Duration::days(40);
        exec.complete(long_ago).expect("complete");
        repo.update_execution(&exec).await.expect("update");

        let still_running = running(&repo).await;

        let removed = repo
            .delete_terminal_before(Utc::now() - Duration::days(30))
            .await
            .expect("purge");
        assert_eq!(removed, 1);
        assert!(repo.fetch_execution(exec.id).await.is_err());
        assert!(repo.list_logs(exec.id).await.expect("logs").is_empty());
        assert!(repo.fetch_execution(still_running.id).await.is_ok());
    }

    #[tokio::test]
    async fn outcome_updates_stats() {
        let repo = InMemoryRepository::new();
        let workflow = Workflow::new(OrganizationId::new(), "wf");
        repo.save_workflow(&workflow).await.expect("save");
        let stats = repo
            .record_workflow_outcome(workflow.id, false, Utc::now())
            .await
            .expect("record");
        assert_eq!(stats.failure_count, 1);
        assert_eq!(stats.execution_count, 1);
    }

    #[tokio::test]
    async fn schedule_triggers_come_from_active_workflows() {
        let repo = InMemoryRepository::new();
        let active = Workflow::new(OrganizationId::new(), "active").activated();
        let active = active.clone().with_trigger(Trigger::every(active.id, Duration::minutes(5)));
        let draft = Workflow::new(OrganizationId::new(), "draft");
        let draft = draft.clone().with_trigger(Trigger::every(draft.id, Duration::minutes(5)));
        repo.save_workflow(&active).await.expect("save");
        repo.save_workflow(&draft).await.expect("save");

        let triggers = repo.list_schedule_triggers().await.expect("list");
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].workflow_id, active.id);

        let now = Utc::now();
        assert!(repo.claim_trigger(triggers[0].id, None, now).await.expect("claim"));
        let triggers = repo.list_schedule_triggers().await.expect("list");
        assert_eq!(triggers[0].last_triggered_at, Some(now));
    }

    #[tokio::test]
    async fn a_trigger_is_claimed_once_per_firing() {
        let repo = InMemoryRepository::new();
        let workflow = Workflow::new(OrganizationId::new(), "hourly").activated();
        let trigger = Trigger::every(workflow.id, Duration::hours(1));
        let trigger_id = trigger.id;
        repo.save_workflow(&workflow.with_trigger(trigger)).await.expect("save");

        let now = Utc::now();
        assert!(repo.claim_trigger(trigger_id, None, now).await.expect("first"));
        assert!(!repo.claim_trigger(trigger_id, None, now).await.expect("second"));

        let later = now + Duration::hours(1);
        assert!(repo.claim_trigger(trigger_id, Some(now), later).await.expect("next tick"));
        assert!(!repo.claim_trigger(TriggerId::new(), None, later).await.expect("missing"));
    }

    #[tokio::test]
    async fn saving_an_edited_workflow_keeps_stats_and_firing_times() {
        let repo = InMemoryRepository::new();
        let workflow = Workflow::new(OrganizationId::new(), "digest").activated();
        let trigger = Trigger::every(workflow.id, Duration::hours(1));
        let trigger_id = trigger.id;
        let workflow = workflow.with_trigger(trigger);
        assert!(repo.save_workflow(&workflow).await.expect("create"));

        let fired_at = Utc::now();
        repo.record_workflow_outcome(workflow.id, true, fired_at).await.expect("record");
        repo.record_workflow_outcome(workflow.id, false, fired_at).await.expect("record");
        assert!(repo.claim_trigger(trigger_id, None, fired_at).await.expect("claim"));

        let mut edited = workflow.clone();
        edited.name = "renamed digest".to_string();
        assert!(!repo.save_workflow(&edited).await.expect("update"));

        let stored = repo.fetch_workflow(workflow.id).await.expect("fetch");
        assert_eq!(stored.name, "renamed digest");
        assert_eq!(stored.stats.execution_count, 2);
        assert_eq!(stored.stats.success_count, 1);
        assert_eq!(stored.stats.failure_count, 1);
        assert_eq!(stored.stats.last_executed_at, Some(fired_at));
        assert_eq!(stored.triggers[0].last_triggered_at, Some(fired_at));
    }

    #[tokio::test]
    async fn deleting_a_workflow_removes_its_executions_and_logs() {
        let repo = InMemoryRepository::new();
        let exec = running(&repo).await;
        repo.append_log(&ExecutionLog::new(exec.id, None, LogLevel::Info, "hello"))
            .await
            .expect("log");
        let other = running(&repo).await;

        repo.delete_workflow(exec.workflow_id).await.expect("delete");

        assert!(repo.fetch_workflow(exec.workflow_id).await.is_err());
        assert!(repo.fetch_execution(exec.id).await.is_err());
        assert!(repo.list_logs(exec.id).await.expect("logs").is_empty());
        assert!(repo.fetch_execution(other.id).await.is_ok());
    }
}
