//! PostgreSQL hook repository.
//!
//! The token index is a unique index on the hooks table, so `get_by_token`
//! is a point lookup and a token collision surfaces as a unique violation
//! at insert time.

use crate::map_insert_error;
use crate::values::{decode_value, encode_value};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool};
use std::str::FromStr;
use worldkit_contract::{CreateHookRequest, Hook, HookStore, ListHooksParams};
use worldkit_core::{Page, RunId, WorldError};

const HOOK_COLUMNS: &str =
    "run_id, hook_id, token, owner_id, project_id, environment, metadata, created_at";

/// Row type for hook queries.
#[derive(FromRow)]
struct HookRow {
    run_id: String,
    hook_id: String,
    token: String,
    owner_id: String,
    project_id: String,
    environment: String,
    metadata: Option<JsonValue>,
    created_at: DateTime<Utc>,
}

impl HookRow {
    fn try_into_hook(self) -> Result<Hook, WorldError> {
        let run_id = RunId::from_str(&self.run_id)
            .map_err(|e| WorldError::internal(format!("invalid run id '{}': {e}", self.run_id)))?;
        Ok(Hook {
            run_id,
            hook_id: self.hook_id,
            token: self.token,
            owner_id: self.owner_id,
            project_id: self.project_id,
            environment: self.environment,
            metadata: self.metadata.map(decode_value),
            created_at: self.created_at,
        })
    }
}

/// Hook repository over a Postgres pool.
#[derive(Clone)]
pub struct PostgresHookStore {
    pool: PgPool,
}

impl PostgresHookStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn find_by_run_and_id(
        &self,
        run_id: RunId,
        hook_id: &str,
    ) -> Result<Option<Hook>, WorldError> {
        let row: Option<HookRow> = sqlx::query_as(&format!(
            "SELECT {HOOK_COLUMNS} FROM workflow_hooks WHERE run_id = $1 AND hook_id = $2"
        ))
        .bind(run_id.to_string())
        .bind(hook_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(WorldError::internal)?;
        row.map(HookRow::try_into_hook).transpose()
    }
}

#[async_trait]
impl HookStore for PostgresHookStore {
    async fn create(&self, run_id: RunId, request: CreateHookRequest) -> Result<Hook, WorldError> {
        if request.hook_id.is_empty() {
            return Err(WorldError::invalid_argument("hook id must not be empty"));
        }
        if request.token.is_empty() {
            return Err(WorldError::invalid_argument("hook token must not be empty"));
        }

        // Replay-safe: the stored record wins, original token included.
        if let Some(existing) = self.find_by_run_and_id(run_id, &request.hook_id).await? {
            return Ok(existing);
        }

        let hook = Hook::create(run_id, request, Utc::now());
        sqlx::query(
            r#"
            INSERT INTO workflow_hooks
                (run_id, hook_id, token, owner_id, project_id, environment, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(hook.run_id.to_string())
        .bind(&hook.hook_id)
        .bind(&hook.token)
        .bind(&hook.owner_id)
        .bind(&hook.project_id)
        .bind(&hook.environment)
        .bind(hook.metadata.as_ref().map(encode_value))
        .bind(hook.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_insert_error(e, "hook token", &hook.token))?;

        tracing::debug!(run_id = %run_id, hook_id = %hook.hook_id, "registered hook");
        Ok(hook)
    }

    async fn get(&self, hook_id: &str) -> Result<Hook, WorldError> {
        let row: Option<HookRow> = sqlx::query_as(&format!(
            "SELECT {HOOK_COLUMNS} FROM workflow_hooks WHERE hook_id = $1 ORDER BY run_id LIMIT 1"
        ))
        .bind(hook_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(WorldError::internal)?;
        row.ok_or_else(|| WorldError::not_found("hook", hook_id))?
            .try_into_hook()
    }

    async fn get_by_token(&self, token: &str) -> Result<Hook, WorldError> {
        let row: Option<HookRow> = sqlx::query_as(&format!(
            "SELECT {HOOK_COLUMNS} FROM workflow_hooks WHERE token = $1"
        ))
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(WorldError::internal)?;
        row.ok_or_else(|| WorldError::not_found("hook token", token))?
            .try_into_hook()
    }

    async fn list(&self, params: ListHooksParams) -> Result<Page<Hook>, WorldError> {
        let limit = params.pagination.effective_limit();
        let cursor = params.pagination.decoded_cursor()?;

        let rows: Vec<HookRow> = sqlx::query_as(&format!(
            r#"
            SELECT {HOOK_COLUMNS} FROM workflow_hooks
            WHERE run_id = $1
              AND ($2::TEXT IS NULL OR hook_id < $2)
            ORDER BY hook_id DESC
            LIMIT $3
            "#
        ))
        .bind(params.run_id.to_string())
        .bind(cursor.as_deref())
        .bind((limit + 1) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(WorldError::internal)?;

        let hooks = rows
            .into_iter()
            .map(HookRow::try_into_hook)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page::from_overfetched(hooks, limit, |hook| {
            hook.hook_id.clone()
        }))
    }

    async fn dispose(&self, hook_id: &str) -> Result<Hook, WorldError> {
        // Hook ids are only unique per run; delete exactly one registration.
        let row: Option<HookRow> = sqlx::query_as(&format!(
            r#"
            DELETE FROM workflow_hooks
            WHERE hook_id = $1
              AND run_id = (
                  SELECT run_id FROM workflow_hooks WHERE hook_id = $1 ORDER BY run_id LIMIT 1
              )
            RETURNING {HOOK_COLUMNS}
            "#
        ))
        .bind(hook_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(WorldError::internal)?;

        let hook = row
            .ok_or_else(|| WorldError::not_found("hook", hook_id))?
            .try_into_hook()?;
        tracing::debug!(run_id = %hook.run_id, hook_id = %hook_id, "disposed hook");
        Ok(hook)
    }
}
