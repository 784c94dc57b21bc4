//! Workflows, triggers, executions, and execution logs in PostgreSQL.
//!
//! Terminal executions are protected in SQL: checkpoints only update rows
//! whose status is still open, and cancellation is a single conditional
//! update on `status = 'running'`.

use super::{decode_error, parse_enum, parse_id, to_i64, to_u64};
use async_trait::async_trait;
use autoflow_core::{ExecutionId, TriggerId, WorkflowId};
use autoflow_workflow::definition::WorkflowStats;
use autoflow_workflow::{
    ExecutionLog, ExecutionStatus, LogLevel, Repository, RepositoryError, Step, Trigger,
    TriggerType, Workflow, WorkflowExecution, WorkflowStatus,
};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value as JsonValue};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};

fn storage(err: sqlx::Error) -> RepositoryError {
    RepositoryError::StorageFailed {
        reason: err.to_string(),
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

/// Row type for workflow queries.
#[derive(FromRow)]
struct WorkflowRow {
    id: String,
    organization_id: String,
    name: String,
    description: Option<String>,
    status: String,
    variables: Json<Map<String, JsonValue>>,
    steps: Json<Vec<Step>>,
    execution_count: i64,
    success_count: i64,
    failure_count: i64,
    last_executed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl WorkflowRow {
    fn try_into_record(self, triggers: Vec<Trigger>) -> Result<Workflow, sqlx::Error> {
        Ok(Workflow {
            id: parse_id(&self.id, "workflow")?,
            organization_id: parse_id(&self.organization_id, "organization")?,
            name: self.name,
            description: self.description,
            status: parse_enum(&self.status, "workflow status", WorkflowStatus::from_str_value)?,
            variables: self.variables.0,
            steps: self.steps.0,
            triggers,
            stats: WorkflowStats {
                execution_count: to_u64(self.execution_count),
                success_count: to_u64(self.success_count),
                failure_count: to_u64(self.failure_count),
                last_executed_at: self.last_executed_at,
            },
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Row type for trigger queries.
#[derive(FromRow)]
struct TriggerRow {
    id: String,
    workflow_id: String,
    trigger_type: String,
    config: JsonValue,
    is_active: bool,
    last_triggered_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TriggerRow {
    fn try_into_record(self) -> Result<Trigger, sqlx::Error> {
        Ok(Trigger {
            id: parse_id(&self.id, "trigger")?,
            workflow_id: parse_id(&self.workflow_id, "workflow")?,
            trigger_type: parse_enum(&self.trigger_type, "trigger type", TriggerType::from_str_value)?,
            config: self.config,
            is_active: self.is_active,
            last_triggered_at: self.last_triggered_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Row type for execution queries.
#[derive(FromRow)]
struct ExecutionRow {
    id: String,
    workflow_id: String,
    trigger_id: Option<String>,
    triggered_by: Option<String>,
    status: String,
    input_data: JsonValue,
    output_data: JsonValue,
    context: JsonValue,
    current_step_id: Option<String>,
    completed_steps: Json<Vec<String>>,
    error_message: Option<String>,
    error_details: JsonValue,
    attempt: i32,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl ExecutionRow {
    fn try_into_record(self) -> Result<WorkflowExecution, sqlx::Error> {
        Ok(WorkflowExecution {
            id: parse_id(&self.id, "execution")?,
            workflow_id: parse_id(&self.workflow_id, "workflow")?,
            trigger_id: self
                .trigger_id
                .as_deref()
                .map(|id| parse_id(id, "trigger"))
                .transpose()?,
            triggered_by: self
                .triggered_by
                .as_deref()
                .map(|id| parse_id(id, "user"))
                .transpose()?,
            status: parse_enum(&self.status, "execution status", ExecutionStatus::from_str_value)?,
            input_data: self.input_data,
            output_data: self.output_data,
            context: self.context,
            current_step_id: self.current_step_id,
            completed_steps: self.completed_steps.0,
            error_message: self.error_message,
            error_details: self.error_details,
            attempt: u32::try_from(self.attempt)
                .map_err(|_| decode_error(format!("invalid attempt {}", self.attempt)))?,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

/// Row type for execution log queries.
#[derive(FromRow)]
struct LogRow {
    id: String,
    execution_id: String,
    step_id: Option<String>,
    level: String,
    message: String,
    details: JsonValue,
    logged_at: DateTime<Utc>,
}

impl LogRow {
    fn try_into_record(self) -> Result<ExecutionLog, sqlx::Error> {
        Ok(ExecutionLog {
            id: parse_id(&self.id, "execution log")?,
            execution_id: parse_id(&self.execution_id, "execution")?,
            step_id: self.step_id,
            level: parse_enum(&self.level, "log level", LogLevel::from_str_value)?,
            message: self.message,
            details: self.details,
            timestamp: self.logged_at,
        })
    }
}

/// The engine's repository over a PostgreSQL pool.
#[derive(Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    /// Creates a new repository.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_triggers(&self, workflow_id: &str) -> Result<Vec<Trigger>, sqlx::Error> {
        let rows: Vec<TriggerRow> = sqlx::query_as(
            r#"
            SELECT id, workflow_id, trigger_type, config, is_active, last_triggered_at,
                   created_at, updated_at
            FROM workflow_triggers
            WHERE workflow_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TriggerRow::try_into_record).collect()
    }

    async fn stored_status(&self, id: ExecutionId) -> Result<Option<ExecutionStatus>, RepositoryError> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM workflow_executions WHERE id = $1")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(storage)?;
        status
            .map(|s| parse_enum(&s, "execution status", ExecutionStatus::from_str_value))
            .transpose()
            .map_err(storage)
    }
}

#[async_trait]
impl Repository for PgRepository {
    async fn fetch_workflow(&self, id: WorkflowId) -> Result<Workflow, RepositoryError> {
        let row: Option<WorkflowRow> = sqlx::query_as(
            r#"
            SELECT id, organization_id, name, description, status, variables, steps,
                   execution_count, success_count, failure_count, last_executed_at,
                   created_at, updated_at
            FROM workflows
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;
        let row = row.ok_or_else(|| workflow_not_found(id))?;
        let triggers = self.fetch_triggers(&row.id).await.map_err(storage)?;
        row.try_into_record(triggers).map_err(storage)
    }

    async fn save_workflow(&self, workflow: &Workflow) -> Result<bool, RepositoryError> {
        let workflow_id = workflow.id.to_string();
        let mut tx = self.pool.begin().await.map_err(storage)?;

        // Counters belong to record_workflow_outcome and are only set on insert.
        let inserted: bool = sqlx::query_scalar(
            r#"
            INSERT INTO workflows (id, organization_id, name, description, status, variables,
                                   steps, execution_count, success_count, failure_count,
                                   last_executed_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                description = EXCLUDED.description,
                status = EXCLUDED.status,
                variables = EXCLUDED.variables,
                steps = EXCLUDED.steps,
                updated_at = EXCLUDED.updated_at
            RETURNING (xmax = 0)
            "#,
        )
        .bind(&workflow_id)
        .bind(workflow.organization_id.to_string())
        .bind(&workflow.name)
        .bind(&workflow.description)
        .bind(workflow.status.as_str())
        .bind(Json(&workflow.variables))
        .bind(Json(&workflow.steps))
        .bind(to_i64(workflow.stats.execution_count))
        .bind(to_i64(workflow.stats.success_count))
        .bind(to_i64(workflow.stats.failure_count))
        .bind(workflow.stats.last_executed_at)
        .bind(workflow.created_at)
        .bind(workflow.updated_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(storage)?;

        let kept: Vec<String> = workflow.triggers.iter().map(|t| t.id.to_string()).collect();
        sqlx::query("DELETE FROM workflow_triggers WHERE workflow_id = $1 AND NOT (id = ANY($2))")
            .bind(&workflow_id)
            .bind(&kept)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;

        for trigger in &workflow.triggers {
            sqlx::query(
                r#"
                INSERT INTO workflow_triggers (id, workflow_id, trigger_type, config, is_active,
                                               last_triggered_at, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (id) DO UPDATE SET
                    trigger_type = EXCLUDED.trigger_type,
                    config = EXCLUDED.config,
                    is_active = EXCLUDED.is_active,
                    last_triggered_at = GREATEST(workflow_triggers.last_triggered_at,
                                                 EXCLUDED.last_triggered_at),
                    updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(trigger.id.to_string())
            .bind(&workflow_id)
            .bind(trigger.trigger_type.as_str())
            .bind(&trigger.config)
            .bind(trigger.is_active)
            .bind(trigger.last_triggered_at)
            .bind(trigger.created_at)
            .bind(trigger.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        }

        tx.commit().await.map_err(storage)?;
        Ok(inserted)
    }

    async fn delete_workflow(&self, id: WorkflowId) -> Result<(), RepositoryError> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = $1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        if result.rows_affected() == 0 {
            return Err(workflow_not_found(id));
        }
        Ok(())
    }

    async fn record_workflow_outcome(
        &self,
        id: WorkflowId,
        succeeded: bool,
        at: DateTime<Utc>,
    ) -> Result<WorkflowStats, RepositoryError> {
        let row: Option<(i64, i64, i64, Option<DateTime<Utc>>)> = sqlx::query_as(
            r#"
            UPDATE workflows SET
                execution_count = execution_count + 1,
                success_count = success_count + CASE WHEN $2 THEN 1 ELSE 0 END,
                failure_count = failure_count + CASE WHEN $2 THEN 0 ELSE 1 END,
                last_executed_at = $3
            WHERE id = $1
            RETURNING execution_count, success_count, failure_count, last_executed_at
            "#,
        )
        .bind(id.to_string())
        .bind(succeeded)
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;
        let (execution_count, success_count, failure_count, last_executed_at) =
            row.ok_or_else(|| workflow_not_found(id))?;
        Ok(WorkflowStats {
            execution_count: to_u64(execution_count),
            success_count: to_u64(success_count),
            failure_count: to_u64(failure_count),
            last_executed_at,
        })
    }

    async fn create_execution(&self, execution: &WorkflowExecution) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_executions (id, workflow_id, trigger_id, triggered_by, status,
                                             input_data, output_data, context, current_step_id,
                                             completed_steps, error_message, error_details,
                                             attempt, created_at, started_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(execution.id.to_string())
        .bind(execution.workflow_id.to_string())
        .bind(execution.trigger_id.map(|id| id.to_string()))
        .bind(execution.triggered_by.map(|id| id.to_string()))
        .bind(execution.status.as_str())
        .bind(&execution.input_data)
        .bind(&execution.output_data)
        .bind(&execution.context)
        .bind(&execution.current_step_id)
        .bind(Json(&execution.completed_steps))
        .bind(&execution.error_message)
        .bind(&execution.error_details)
        .bind(i32::try_from(execution.attempt).unwrap_or(i32::MAX))
        .bind(execution.created_at)
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn update_execution(&self, execution: &WorkflowExecution) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_executions SET
                status = $2,
                output_data = $3,
                context = $4,
                current_step_id = $5,
                completed_steps = $6,
                error_message = $7,
                error_details = $8,
                started_at = $9,
                completed_at = $10
            WHERE id = $1 AND status NOT IN ('completed', 'failed', 'cancelled')
            "#,
        )
        .bind(execution.id.to_string())
        .bind(execution.status.as_str())
        .bind(&execution.output_data)
        .bind(&execution.context)
        .bind(&execution.current_step_id)
        .bind(Json(&execution.completed_steps))
        .bind(&execution.error_message)
        .bind(&execution.error_details)
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        if result.rows_affected() > 0 {
            return Ok(());
        }
        match self.stored_status(execution.id).await? {
            None => Err(execution_not_found(execution.id)),
            Some(status) => Err(RepositoryError::ExecutionTerminal {
                execution_id: execution.id,
                status,
            }),
        }
    }

    async fn fetch_execution(&self, id: ExecutionId) -> Result<WorkflowExecution, RepositoryError> {
        let row: Option<ExecutionRow> = sqlx::query_as(
            r#"
            SELECT id, workflow_id, trigger_id, triggered_by, status, input_data, output_data,
                   context, current_step_id, completed_steps, error_message, error_details,
                   attempt, created_at, started_at, completed_at
            FROM workflow_executions
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;
        row.ok_or_else(|| execution_not_found(id))?
            .try_into_record()
            .map_err(storage)
    }

    async fn cancel_execution(
        &self,
        id: ExecutionId,
        at: DateTime<Utc>,
    ) -> Result<WorkflowExecution, RepositoryError> {
        let row: Option<ExecutionRow> = sqlx::query_as(
            r#"
            UPDATE workflow_executions SET status = 'cancelled', completed_at = $2
            WHERE id = $1 AND status = 'running'
            RETURNING id, workflow_id, trigger_id, triggered_by, status, input_data, output_data,
                      context, current_step_id, completed_steps, error_message, error_details,
                      attempt, created_at, started_at, completed_at
            "#,
        )
        .bind(id.to_string())
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        if let Some(row) = row {
            return row.try_into_record().map_err(storage);
        }
        match self.stored_status(id).await? {
            None => Err(execution_not_found(id)),
            Some(status) => Err(RepositoryError::NotRunning {
                execution_id: id,
                status,
            }),
        }
    }

    async fn append_log(&self, log: &ExecutionLog) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO execution_logs (id, execution_id, step_id, level, message, details, logged_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(log.id.to_string())
        .bind(log.execution_id.to_string())
        .bind(&log.step_id)
        .bind(log.level.as_str())
        .bind(&log.message)
        .bind(&log.details)
        .bind(log.timestamp)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn list_logs(&self, execution_id: ExecutionId) -> Result<Vec<ExecutionLog>, RepositoryError> {
        let rows: Vec<LogRow> = sqlx::query_as(
            r#"
            SELECT id, execution_id, step_id, level, message, details, logged_at
            FROM execution_logs
            WHERE execution_id = $1
            ORDER BY logged_at, id
            "#,
        )
        .bind(execution_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.into_iter()
            .map(LogRow::try_into_record)
            .collect::<Result<_, _>>()
            .map_err(storage)
    }

    async fn list_running_started_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        let rows: Vec<ExecutionRow> = sqlx::query_as(
            r#"
            SELECT id, workflow_id, trigger_id, triggered_by, status, input_data, output_data,
                   context, current_step_id, completed_steps, error_message, error_details,
                   attempt, created_at, started_at, completed_at
            FROM workflow_executions
            WHERE status = 'running' AND started_at < $1
            ORDER BY started_at
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.into_iter()
            .map(ExecutionRow::try_into_record)
            .collect::<Result<_, _>>()
            .map_err(storage)
    }

    async fn list_pending_created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        let rows: Vec<ExecutionRow> = sqlx::query_as(
            r#"
            SELECT id, workflow_id, trigger_id, triggered_by, status, input_data, output_data,
                   context, current_step_id, completed_steps, error_message, error_details,
                   attempt, created_at, started_at, completed_at
            FROM workflow_executions
            WHERE status = 'pending' AND created_at < $1
            ORDER BY created_at
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.into_iter()
            .map(ExecutionRow::try_into_record)
            .collect::<Result<_, _>>()
            .map_err(storage)
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            r#"
            DELETE FROM workflow_executions
            WHERE status IN ('completed', 'failed', 'cancelled') AND completed_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(result.rows_affected())
    }

    async fn list_schedule_triggers(&self) -> Result<Vec<Trigger>, RepositoryError> {
        let rows: Vec<TriggerRow> = sqlx::query_as(
            r#"
            SELECT t.id, t.workflow_id, t.trigger_type, t.config, t.is_active,
                   t.last_triggered_at, t.created_at, t.updated_at
            FROM workflow_triggers t
            JOIN workflows w ON w.id = t.workflow_id
            WHERE t.trigger_type = $1 AND t.is_active AND w.status = $2
            "#,
        )
        .bind(TriggerType::Schedule.as_str())
        .bind(WorkflowStatus::Active.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.into_iter()
            .map(TriggerRow::try_into_record)
            .collect::<Result<_, _>>()
            .map_err(storage)
    }

    async fn claim_trigger(
        &self,
        trigger_id: TriggerId,
        seen: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_triggers SET last_triggered_at = $2, updated_at = $2
            WHERE id = $1 AND last_triggered_at IS NOT DISTINCT FROM $3
            "#,
        )
        .bind(trigger_id.to_string())
        .bind(at)
        .bind(seen)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(result.rows_affected() == 1)
    }
}
