//! PostgreSQL step repository.

use crate::values::{decode_error, decode_values, encode_error, encode_values};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool};
use std::str::FromStr;
use worldkit_contract::{CreateStepRequest, ListStepsParams, Step, StepPatch, StepStatus, StepStore};
use worldkit_core::{Page, RunId, WorldError};

const STEP_COLUMNS: &str = "run_id, step_id, step_name, status, input, output, error, \
     attempt, retry_after, created_at, updated_at, started_at, completed_at";

/// Row type for step queries.
#[derive(FromRow)]
struct StepRow {
    run_id: String,
    step_id: String,
    step_name: String,
    status: String,
    input: Option<JsonValue>,
    output: Option<JsonValue>,
    error: Option<JsonValue>,
    attempt: i32,
    retry_after: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl StepRow {
    fn try_into_step(self) -> Result<Step, WorldError> {
        let run_id = RunId::from_str(&self.run_id)
            .map_err(|e| WorldError::internal(format!("invalid run id '{}': {e}", self.run_id)))?;
        let status = StepStatus::parse(&self.status)
            .ok_or_else(|| WorldError::internal(format!("unknown step status '{}'", self.status)))?;
        let attempt = u32::try_from(self.attempt)
            .map_err(|_| WorldError::internal(format!("negative attempt count {}", self.attempt)))?;
        Ok(Step {
            run_id,
            step_id: self.step_id,
            step_name: self.step_name,
            status,
            input: self.input.map(decode_values).transpose()?,
            output: self.output.map(decode_values).transpose()?,
            error: self.error.map(decode_error).transpose()?,
            attempt,
            retry_after: self.retry_after,
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

/// Step repository over a Postgres pool.
#[derive(Clone)]
pub struct PostgresStepStore {
    pool: PgPool,
}

impl PostgresStepStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StepStore for PostgresStepStore {
    async fn create(&self, run_id: RunId, request: CreateStepRequest) -> Result<Step, WorldError> {
        if request.step_id.is_empty() {
            return Err(WorldError::invalid_argument("step id must not be empty"));
        }

        let step = Step::create(run_id, request, Utc::now());

        // Replay-safe: a concurrent or earlier create wins and its record is
        // returned unchanged.
        let inserted = sqlx::query(
            r#"
            INSERT INTO workflow_steps
                (run_id, step_id, step_name, status, input, output, error,
                 attempt, retry_after, created_at, updated_at, started_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (run_id, step_id) DO NOTHING
            "#,
        )
        .bind(step.run_id.to_string())
        .bind(&step.step_id)
        .bind(&step.step_name)
        .bind(step.status.as_str())
        .bind(step.input.as_deref().map(encode_values))
        .bind(step.output.as_deref().map(encode_values))
        .bind(None::<JsonValue>)
        .bind(step.attempt as i32)
        .bind(step.retry_after)
        .bind(step.created_at)
        .bind(step.updated_at)
        .bind(step.started_at)
        .bind(step.completed_at)
        .execute(&self.pool)
        .await
        .map_err(WorldError::internal)?
        .rows_affected();

        if inserted == 0 {
            return self.get(Some(run_id), &step.step_id).await;
        }
        tracing::debug!(run_id = %run_id, step_id = %step.step_id, "created step");
        Ok(step)
    }

    async fn get(&self, run_id: Option<RunId>, step_id: &str) -> Result<Step, WorldError> {
        let row: Option<StepRow> = match run_id {
            Some(run_id) => {
                sqlx::query_as(&format!(
                    "SELECT {STEP_COLUMNS} FROM workflow_steps WHERE run_id = $1 AND step_id = $2"
                ))
                .bind(run_id.to_string())
                .bind(step_id)
                .fetch_optional(&self.pool)
                .await
            }
            // Cross-run lookup is the sanctioned slow path.
            None => {
                sqlx::query_as(&format!(
                    "SELECT {STEP_COLUMNS} FROM workflow_steps WHERE step_id = $1 LIMIT 1"
                ))
                .bind(step_id)
                .fetch_optional(&self.pool)
                .await
            }
        }
        .map_err(WorldError::internal)?;

        row.ok_or_else(|| WorldError::not_found("step", step_id))?
            .try_into_step()
    }

    async fn update(
        &self,
        run_id: RunId,
        step_id: &str,
        patch: StepPatch,
    ) -> Result<Step, WorldError> {
        let mut tx = self.pool.begin().await.map_err(WorldError::internal)?;

        let row: Option<StepRow> = sqlx::query_as(&format!(
            "SELECT {STEP_COLUMNS} FROM workflow_steps \
             WHERE run_id = $1 AND step_id = $2 FOR UPDATE"
        ))
        .bind(run_id.to_string())
        .bind(step_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(WorldError::internal)?;

        let mut step = row
            .ok_or_else(|| WorldError::not_found("step", step_id))?
            .try_into_step()?;
        step.apply(patch, Utc::now());

        sqlx::query(
            r#"
            UPDATE workflow_steps
            SET status = $3, output = $4, error = $5, attempt = $6, retry_after = $7,
                updated_at = $8,
                started_at = COALESCE(started_at, $9),
                completed_at = COALESCE(completed_at, $10)
            WHERE run_id = $1 AND step_id = $2
            "#,
        )
        .bind(step.run_id.to_string())
        .bind(&step.step_id)
        .bind(step.status.as_str())
        .bind(step.output.as_deref().map(encode_values))
        .bind(step.error.as_ref().map(encode_error).transpose()?)
        .bind(step.attempt as i32)
        .bind(step.retry_after)
        .bind(step.updated_at)
        .bind(step.started_at)
        .bind(step.completed_at)
        .execute(&mut *tx)
        .await
        .map_err(WorldError::internal)?;

        tx.commit().await.map_err(WorldError::internal)?;
        Ok(step)
    }

    async fn list(&self, params: ListStepsParams) -> Result<Page<Step>, WorldError> {
        let limit = params.pagination.effective_limit();
        let cursor = params.pagination.decoded_cursor()?;

        let rows: Vec<StepRow> = sqlx::query_as(&format!(
            r#"
            SELECT {STEP_COLUMNS} FROM workflow_steps
            WHERE run_id = $1
              AND ($2::TEXT IS NULL OR step_id < $2)
            ORDER BY step_id DESC
            LIMIT $3
            "#
        ))
        .bind(params.run_id.to_string())
        .bind(cursor.as_deref())
        .bind((limit + 1) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(WorldError::internal)?;

        let steps = rows
            .into_iter()
            .map(StepRow::try_into_step)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page::from_overfetched(steps, limit, |step| {
            step.step_id.clone()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use worldkit_core::IdGenerator;

    #[test]
    fn row_conversion_preserves_retry_metadata() {
        let ids = IdGenerator::new();
        let run_id = ids.run_id();
        let now = Utc::now();
        let row = StepRow {
            run_id: run_id.to_string(),
            step_id: "s1".to_string(),
            step_name: "first".to_string(),
            status: "failed".to_string(),
            input: Some(encode_values(&[json!(1)])),
            output: None,
            error: Some(json!({"message": "boom", "code": "E1"})),
            attempt: 3,
            retry_after: Some(now),
            created_at: now,
            updated_at: now,
            started_at: Some(now),
            completed_at: Some(now),
        };

        let step = row.try_into_step().expect("convert");
        assert_eq!(step.attempt, 3);
        assert_eq!(step.retry_after, Some(now));
        assert_eq!(step.error.and_then(|e| e.code), Some("E1".to_string()));
    }

    #[test]
    fn row_conversion_rejects_negative_attempt() {
        let ids = IdGenerator::new();
        let now = Utc::now();
        let row = StepRow {
            run_id: ids.run_id().to_string(),
            step_id: "s1".to_string(),
            step_name: "first".to_string(),
            status: "pending".to_string(),
            input: None,
            output: None,
            error: None,
            attempt: -1,
            retry_after: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };
        assert!(matches!(
            row.try_into_step().unwrap_err(),
            WorldError::Internal { .. }
        ));
    }
}
