//! Periodic maintenance: stale-run reaping, retention, and interval triggers.

use crate::engine::execution_payload;
use crate::envelope::Envelope;
use crate::error::{EngineError, ErrorKind, RepositoryError};
use crate::events::{EventSink, EventType, LifecycleEvent};
use crate::execution::{ExecutionLog, LogLevel, RunRequest, WorkflowExecution};
use crate::repository::Repository;
use crate::settings::HousekeepingSettings;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

pub struct Housekeeper {
    repository: Arc<dyn Repository>,
    events: Arc<dyn EventSink>,
    settings: HousekeepingSettings,
}

fn delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

fn before(now: DateTime<Utc>, age: TimeDelta) -> DateTime<Utc> {
    now.checked_sub_signed(age)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl Housekeeper {
    #[must_use]
    pub fn new(
        repository: Arc<dyn Repository>,
        events: Arc<dyn EventSink>,
        settings: HousekeepingSettings,
    ) -> Self {
        Self {
            repository,
            events,
            settings,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &HousekeepingSettings {
        &self.settings
    }

    /// Fails running executions that started more than `stale_after_secs`
    /// before `now`, and cancels pending ones created that long ago whose
    /// start was never persisted. Returns how many were reaped.
    ///
    /// # Errors
    ///
    /// Returns `Repository` when the stale executions cannot be listed.
    #[instrument(skip(self))]
    pub async fn reap_stale(&self, now: DateTime<Utc>) -> autoflow_core::Result<usize, EngineError> {
        let stale_after = self.settings.stale_after_secs;
        let cutoff = before(now, delta(Duration::from_secs(stale_after)));
        let stale = self
            .repository
            .list_running_started_before(cutoff)
            .await
            .map_err(EngineError::from)?;

        let mut reaped = 0;
        for mut execution in stale {
            let message = format!("execution did not finish within {stale_after} seconds");
            let details = json!({
                "error_type": ErrorKind::ExecutionTimeout.as_str(),
                "message": message,
                "step_id": execution.current_step_id,
            });
            if let Err(e) = execution.fail(now, message.as_str(), details) {
                debug!(execution_id = %execution.id, error = %e, "Skipping execution");
                continue;
            }
            match self.repository.update_execution(&execution).await {
                Ok(()) => {}
                Err(RepositoryError::ExecutionTerminal { .. }) => {
                    debug!(execution_id = %execution.id, "Execution finished before reaping");
                    continue;
                }
                Err(e) => {
                    warn!(execution_id = %execution.id, error = %e, "Failed to reap execution");
                    continue;
                }
            }

            warn!(execution_id = %execution.id, workflow_id = %execution.workflow_id, "Reaped stale execution");
            let entry = ExecutionLog::new(
                execution.id,
                execution.current_step_id.as_deref(),
                LogLevel::Error,
                message,
            );
            if let Err(e) = self.repository.append_log(&entry).await {
                warn!(execution_id = %execution.id, error = %e, "Failed to append execution log");
            }
            if let Err(e) = self
                .repository
                .record_workflow_outcome(execution.workflow_id, false, now)
                .await
            {
                warn!(workflow_id = %execution.workflow_id, error = %e, "Failed to update workflow statistics");
            }
            self.emit(EventType::ExecutionFailed, &execution).await;
            reaped += 1;
        }
        Ok(reaped + self.abandon_pending(cutoff, now).await?)
    }

    async fn abandon_pending(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize, EngineError> {
        let orphans = self.repository.list_pending_created_before(cutoff).await?;

        let mut abandoned = 0;
        for mut execution in orphans {
            if let Err(e) = execution.cancel(now) {
                debug!(execution_id = %execution.id, error = %e, "Skipping execution");
                continue;
            }
            let message = "execution was never started";
            execution.error_message = Some(message.to_string());
            execution.error_details = json!({
                "error_type": ErrorKind::ExecutionTimeout.as_str(),
                "message": message,
            });
            match self.repository.update_execution(&execution).await {
                Ok(()) => {}
                Err(RepositoryError::ExecutionTerminal { .. }) => continue,
                Err(e) => {
                    warn!(execution_id = %execution.id, error = %e, "Failed to abandon execution");
                    continue;
                }
            }

            warn!(execution_id = %execution.id, workflow_id = %execution.workflow_id, "Abandoned unstarted execution");
            let entry = ExecutionLog::new(execution.id, None, LogLevel::Warning, message);
            if let Err(e) = self.repository.append_log(&entry).await {
                warn!(execution_id = %execution.id, error = %e, "Failed to append execution log");
            }
            self.emit(EventType::ExecutionCancelled, &execution).await;
            abandoned += 1;
        }
        Ok(abandoned)
    }

    /// Deletes terminal executions, with their logs, completed more than
    /// `retention_days` before `now`.
    ///
    /// # Errors
    ///
    /// Returns `Repository` when the delete fails.
    #[instrument(skip(self))]
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> autoflow_core::Result<u64, EngineError> {
        let retention = TimeDelta::try_days(i64::from(self.settings.retention_days))
            .unwrap_or(TimeDelta::MAX);
        let purged = self
            .repository
            .delete_terminal_before(before(now, retention))
            .await
            .map_err(EngineError::from)?;
        if purged > 0 {
            info!(purged, "Purged expired executions");
        }
        Ok(purged)
    }

    /// Run requests for every interval trigger due at `now`. A trigger is
    /// returned only by the pass that claims it, so concurrent workers never
    /// submit the same firing twice.
    ///
    /// # Errors
    ///
    /// Returns `Repository` when the triggers cannot be listed.
    #[instrument(skip(self))]
    pub async fn due_schedule_runs(
        &self,
        now: DateTime<Utc>,
    ) -> autoflow_core::Result<Vec<RunRequest>, EngineError> {
        let triggers = self
            .repository
            .list_schedule_triggers()
            .await
            .map_err(EngineError::from)?;

        let mut requests = Vec::new();
        for trigger in triggers.into_iter().filter(|t| t.is_due(now)) {
            match self
                .repository
                .claim_trigger(trigger.id, trigger.last_triggered_at, now)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    debug!(trigger_id = %trigger.id, "Trigger already fired by another worker");
                    continue;
                }
                Err(e) => {
                    warn!(trigger_id = %trigger.id, error = %e, "Failed to claim trigger");
                    continue;
                }
            }
            let input = trigger
                .config
                .get("input")
                .cloned()
                .unwrap_or_else(|| json!({}));
            debug!(trigger_id = %trigger.id, workflow_id = %trigger.workflow_id, "Schedule trigger due");
            requests.push(RunRequest::new(trigger.workflow_id, input).from_trigger(trigger.id));
        }
        Ok(requests)
    }

    async fn emit(&self, event_type: EventType, execution: &WorkflowExecution) {
        let event = Envelope::new(LifecycleEvent::new(event_type, execution_payload(execution)));
        if let Err(e) = self.events.publish(event).await {
            warn!(%event_type, error = %e, "Failed to publish lifecycle event");
        }
    }
}
