//! PostgreSQL run repository.

use crate::map_insert_error;
use crate::values::{decode_error, decode_value, decode_values, encode_error, encode_value, encode_values};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool};
use std::str::FromStr;
use std::sync::Arc;
use worldkit_contract::{
    CreateRunRequest, GetRunOptions, ListRunsParams, ResolveData, RunPatch, RunStatus, RunStore,
    WorkflowRun,
};
use worldkit_core::{IdGenerator, Page, RunId, WorldError};

const RUN_COLUMNS: &str = "id, workflow_name, deployment_id, status, input, output, \
     execution_context, error, created_at, updated_at, started_at, completed_at";

/// Row type for run queries.
#[derive(FromRow)]
struct RunRow {
    id: String,
    workflow_name: String,
    deployment_id: String,
    status: String,
    input: Option<JsonValue>,
    output: Option<JsonValue>,
    execution_context: Option<JsonValue>,
    error: Option<JsonValue>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl RunRow {
    fn try_into_run(self) -> Result<WorkflowRun, WorldError> {
        let run_id = RunId::from_str(&self.id)
            .map_err(|e| WorldError::internal(format!("invalid run id '{}': {e}", self.id)))?;
        let status = RunStatus::parse(&self.status)
            .ok_or_else(|| WorldError::internal(format!("unknown run status '{}'", self.status)))?;
        Ok(WorkflowRun {
            run_id,
            workflow_name: self.workflow_name,
            deployment_id: self.deployment_id,
            status,
            input: self.input.map(decode_values).transpose()?,
            output: self.output.map(decode_values).transpose()?,
            execution_context: self.execution_context.map(decode_value),
            error: self.error.map(decode_error).transpose()?,
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

/// Run repository over a Postgres pool.
#[derive(Clone)]
pub struct PostgresRunStore {
    pool: PgPool,
    ids: Arc<IdGenerator>,
}

impl PostgresRunStore {
    pub fn new(pool: PgPool, ids: Arc<IdGenerator>) -> Self {
        Self { pool, ids }
    }

    /// Runs a guarded state transition inside a row-locking transaction.
    ///
    /// Derived timestamps are written with `COALESCE(column, $n)` so a
    /// concurrent update that also observed the transition leaves the first
    /// write in place.
    async fn transition<F>(&self, run_id: RunId, mutation: F) -> Result<WorkflowRun, WorldError>
    where
        F: FnOnce(&WorkflowRun) -> Result<RunPatch, WorldError> + Send,
    {
        let mut tx = self.pool.begin().await.map_err(WorldError::internal)?;

        let row: Option<RunRow> = sqlx::query_as(&format!(
            "SELECT {RUN_COLUMNS} FROM workflow_runs WHERE id = $1 FOR UPDATE"
        ))
        .bind(run_id.to_string())
        .fetch_optional(&mut *tx)
        .await
        .map_err(WorldError::internal)?;

        let mut run = row
            .ok_or_else(|| WorldError::not_found("run", run_id))?
            .try_into_run()?;
        let patch = mutation(&run)?;
        run.apply(patch, Utc::now());

        sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = $2, output = $3, execution_context = $4, error = $5,
                updated_at = $6,
                started_at = COALESCE(started_at, $7),
                completed_at = COALESCE(completed_at, $8)
            WHERE id = $1
            "#,
        )
        .bind(run.run_id.to_string())
        .bind(run.status.as_str())
        .bind(run.output.as_deref().map(encode_values))
        .bind(run.execution_context.as_ref().map(encode_value))
        .bind(run.error.as_ref().map(encode_error).transpose()?)
        .bind(run.updated_at)
        .bind(run.started_at)
        .bind(run.completed_at)
        .execute(&mut *tx)
        .await
        .map_err(WorldError::internal)?;

        tx.commit().await.map_err(WorldError::internal)?;
        Ok(run)
    }
}

#[async_trait]
impl RunStore for PostgresRunStore {
    async fn create(&self, request: CreateRunRequest) -> Result<WorkflowRun, WorldError> {
        if request.workflow_name.is_empty() {
            return Err(WorldError::invalid_argument("workflow name must not be empty"));
        }

        let run_id = self.ids.run_id();
        let run = WorkflowRun::create(run_id, request, Utc::now());

        sqlx::query(
            r#"
            INSERT INTO workflow_runs
                (id, workflow_name, deployment_id, status, input, output,
                 execution_context, error, created_at, updated_at, started_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(run.run_id.to_string())
        .bind(&run.workflow_name)
        .bind(&run.deployment_id)
        .bind(run.status.as_str())
        .bind(run.input.as_deref().map(encode_values))
        .bind(run.output.as_deref().map(encode_values))
        .bind(run.execution_context.as_ref().map(encode_value))
        .bind(None::<JsonValue>)
        .bind(run.created_at)
        .bind(run.updated_at)
        .bind(run.started_at)
        .bind(run.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_insert_error(e, "run", &run.run_id.to_string()))?;

        tracing::debug!(run_id = %run.run_id, workflow_name = %run.workflow_name, "created run");
        Ok(run)
    }

    async fn get(&self, run_id: RunId, options: GetRunOptions) -> Result<WorkflowRun, WorldError> {
        // With data elided the store does not fetch the value columns.
        let sql = match options.resolve_data {
            ResolveData::Full => format!("SELECT {RUN_COLUMNS} FROM workflow_runs WHERE id = $1"),
            ResolveData::None => {
                "SELECT id, workflow_name, deployment_id, status, \
                 NULL::JSONB AS input, NULL::JSONB AS output, execution_context, error, \
                 created_at, updated_at, started_at, completed_at \
                 FROM workflow_runs WHERE id = $1"
                    .to_string()
            }
        };
        let row: Option<RunRow> = sqlx::query_as(&sql)
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(WorldError::internal)?;
        row.ok_or_else(|| WorldError::not_found("run", run_id))?
            .try_into_run()
    }

    async fn update(&self, run_id: RunId, patch: RunPatch) -> Result<WorkflowRun, WorldError> {
        self.transition(run_id, |_| Ok(patch)).await
    }

    async fn cancel(&self, run_id: RunId) -> Result<WorkflowRun, WorldError> {
        self.transition(run_id, |run| {
            run.ensure_cancellable()?;
            Ok(RunPatch::status(RunStatus::Cancelled))
        })
        .await
    }

    async fn pause(&self, run_id: RunId) -> Result<WorkflowRun, WorldError> {
        self.transition(run_id, |run| {
            run.ensure_pausable()?;
            Ok(RunPatch::status(RunStatus::Paused))
        })
        .await
    }

    async fn resume(&self, run_id: RunId) -> Result<WorkflowRun, WorldError> {
        self.transition(run_id, |run| {
            run.ensure_resumable()?;
            Ok(RunPatch::status(RunStatus::Running))
        })
        .await
    }

    async fn list(&self, params: ListRunsParams) -> Result<Page<WorkflowRun>, WorldError> {
        let limit = params.pagination.effective_limit();
        let cursor = params.pagination.decoded_cursor()?;

        let rows: Vec<RunRow> = sqlx::query_as(&format!(
            r#"
            SELECT {RUN_COLUMNS} FROM workflow_runs
            WHERE ($1::TEXT IS NULL OR workflow_name = $1)
              AND ($2::TEXT IS NULL OR status = $2)
              AND ($3::TEXT IS NULL OR id < $3)
            ORDER BY id DESC
            LIMIT $4
            "#
        ))
        .bind(params.workflow_name.as_deref())
        .bind(params.status.map(|status| status.as_str()))
        .bind(cursor.as_deref())
        .bind((limit + 1) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(WorldError::internal)?;

        let runs = rows
            .into_iter()
            .map(RunRow::try_into_run)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page::from_overfetched(runs, limit, |run| {
            run.run_id.to_string()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(id: &str, status: &str) -> RunRow {
        let now = Utc::now();
        RunRow {
            id: id.to_string(),
            workflow_name: "w".to_string(),
            deployment_id: "dep-1".to_string(),
            status: status.to_string(),
            input: Some(encode_values(&[json!("a")])),
            output: None,
            execution_context: None,
            error: Some(json!("legacy failure")),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn row_conversion_unwraps_values_and_lifts_errors() {
        let ids = IdGenerator::new();
        let run_id = ids.run_id();
        let run = row(&run_id.to_string(), "failed").try_into_run().expect("convert");

        assert_eq!(run.run_id, run_id);
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.input, Some(vec![json!("a")]));
        assert_eq!(run.error.map(|e| e.message), Some("legacy failure".to_string()));
    }

    #[test]
    fn row_conversion_rejects_unknown_status() {
        let ids = IdGenerator::new();
        let err = row(&ids.run_id().to_string(), "exploded")
            .try_into_run()
            .unwrap_err();
        assert!(matches!(err, WorldError::Internal { .. }));
    }

    #[test]
    fn row_conversion_rejects_bad_id() {
        let err = row("not-an-id", "pending").try_into_run().unwrap_err();
        assert!(matches!(err, WorldError::Internal { .. }));
    }
}
