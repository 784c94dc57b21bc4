//! The long-running side of the worker: submitted runs and periodic
//! housekeeping.

use autoflow_workflow::{ExecutionQueue, Housekeeper, RunRequest, TaskHandle};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct Worker {
    queue: Arc<ExecutionQueue>,
    housekeeper: Housekeeper,
}

/// Logs the final outcome of a run in the background.
fn supervise(handle: TaskHandle) {
    tokio::spawn(async move {
        let task_id = handle.id();
        match handle.join().await {
            Ok(execution) => info!(
                %task_id,
                execution_id = %execution.id,
                status = %execution.status,
                attempt = execution.attempt,
                "Run finished"
            ),
            Err(e) => warn!(%task_id, error = %e, "Run did not start"),
        }
    });
}

impl Worker {
    #[must_use]
    pub fn new(queue: Arc<ExecutionQueue>, housekeeper: Housekeeper) -> Self {
        Self { queue, housekeeper }
    }

    /// Submits a run and logs its outcome when it finishes.
    pub fn dispatch(&self, request: RunRequest) {
        supervise(self.queue.submit(request));
    }

    /// Reaps stale runs, purges expired ones, and submits due schedule
    /// triggers. Failures are logged; the next pass tries again.
    pub async fn housekeeping_pass(&self, now: DateTime<Utc>) -> Vec<TaskHandle> {
        match self.housekeeper.reap_stale(now).await {
            Ok(reaped) if reaped > 0 => info!(reaped, "Reaped stale executions"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to reap stale executions"),
        }
        if let Err(e) = self.housekeeper.purge_expired(now).await {
            warn!(error = %e, "Failed to purge expired executions");
        }
        match self.housekeeper.due_schedule_runs(now).await {
            Ok(requests) => requests
                .into_iter()
                .map(|request| self.queue.submit(request))
                .collect(),
            Err(e) => {
                warn!(error = %e, "Failed to evaluate schedule triggers");
                Vec::new()
            }
        }
    }

    /// Runs `housekeeping_pass` every configured interval.
    pub fn spawn_housekeeping(self: &Arc<Self>) -> JoinHandle<()> {
        let worker = Arc::clone(self);
        let period = self.housekeeper.settings().interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                for handle in worker.housekeeping_pass(Utc::now()).await {
                    supervise(handle);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoflow_core::OrganizationId;
    use autoflow_integration::InMemoryIntegrationStore;
    use autoflow_workflow::action::WaitHandler;
    use autoflow_workflow::{
        ActionDispatcher, ActionType, ExecutionStatus, HousekeepingSettings, InMemoryEventSink,
        InMemoryRepository, QueueSettings, Repository, Step, Trigger, Workflow, WorkflowEngine,
        WorkflowExecution,
    };
    use chrono::TimeDelta;
    use serde_json::json;
    use std::time::Duration;

    fn worker(repo: Arc<InMemoryRepository>) -> Worker {
        let events = Arc::new(InMemoryEventSink::new());
        let dispatcher = ActionDispatcher::builder()
            .register(ActionType::Wait, WaitHandler::new(Duration::from_secs(60)))
            .build();
        let engine = WorkflowEngine::new(
            repo.clone(),
            Arc::new(InMemoryIntegrationStore::new()),
            dispatcher,
            events.clone(),
        );
        let queue = ExecutionQueue::new(Arc::new(engine), &QueueSettings::default());
        Worker::new(
            Arc::new(queue),
            Housekeeper::new(repo, events, HousekeepingSettings::default()),
        )
    }

    #[tokio::test]
    async fn housekeeping_runs_due_schedules_and_reaps_stale_runs() {
        let repo = Arc::new(InMemoryRepository::new());
        let mut workflow = Workflow::new(OrganizationId::new(), "hourly digest")
            .activated()
            .with_step(Step::new("pause", "wait", json!({"seconds": 0})));
        let trigger = Trigger::every(workflow.id, TimeDelta::hours(1));
        workflow = workflow.with_trigger(trigger);
        repo.save_workflow(&workflow).await.expect("save");

        let now = Utc::now();
        let mut stale = WorkflowExecution::new(&workflow, &RunRequest::new(workflow.id, json!({})), 1);
        repo.create_execution(&stale).await.expect("create");
        stale.start(now - TimeDelta::days(1)).expect("start");
        repo.update_execution(&stale).await.expect("update");

        let worker = worker(repo.clone());
        let handles = worker.housekeeping_pass(now).await;
        assert_eq!(handles.len(), 1);
        for handle in handles {
            let execution = handle.join().await.expect("run");
            assert_eq!(execution.status, ExecutionStatus::Completed);
            assert!(execution.trigger_id.is_some());
        }

        let reaped = repo.fetch_execution(stale.id).await.expect("fetch");
        assert_eq!(reaped.status, ExecutionStatus::Failed);
        assert_eq!(reaped.error_type(), Some("ExecutionTimeout"));

        assert!(worker.housekeeping_pass(now + TimeDelta::minutes(1)).await.is_empty());
    }
}
