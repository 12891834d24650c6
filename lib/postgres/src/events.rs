//! PostgreSQL event repository with dual indexing.

use crate::values::{decode_value, encode_value};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool};
use std::str::FromStr;
use std::sync::Arc;
use worldkit_contract::{
    CreateEventRequest, Event, EventStore, ListByCorrelationParams, ListEventsParams,
};
use worldkit_core::{EventId, IdGenerator, Page, RunId, SortOrder, WorldError};

const EVENT_COLUMNS: &str = "id, run_id, event_type, correlation_id, event_data, created_at";

/// Row type for event queries.
#[derive(FromRow)]
struct EventRow {
    id: String,
    run_id: String,
    event_type: String,
    correlation_id: Option<String>,
    event_data: Option<JsonValue>,
    created_at: DateTime<Utc>,
}

impl EventRow {
    fn try_into_event(self) -> Result<Event, WorldError> {
        let event_id = EventId::from_str(&self.id)
            .map_err(|e| WorldError::internal(format!("invalid event id '{}': {e}", self.id)))?;
        let run_id = RunId::from_str(&self.run_id)
            .map_err(|e| WorldError::internal(format!("invalid run id '{}': {e}", self.run_id)))?;
        Ok(Event {
            event_id,
            run_id,
            event_type: self.event_type,
            correlation_id: self.correlation_id,
            event_data: self.event_data.map(decode_value),
            created_at: self.created_at,
        })
    }
}

/// Event repository over a Postgres pool.
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
    ids: Arc<IdGenerator>,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool, ids: Arc<IdGenerator>) -> Self {
        Self { pool, ids }
    }

    async fn list_filtered(
        &self,
        filter_column: &str,
        filter_value: &str,
        sort_order: SortOrder,
        limit: usize,
        cursor: Option<String>,
    ) -> Result<Page<Event>, WorldError> {
        // Keyset pagination over the primary key; the filter column is one
        // of the two indexed access paths.
        let sql = match sort_order {
            SortOrder::Ascending => format!(
                "SELECT {EVENT_COLUMNS} FROM workflow_events \
                 WHERE {filter_column} = $1 AND ($2::TEXT IS NULL OR id > $2) \
                 ORDER BY id ASC LIMIT $3"
            ),
            SortOrder::Descending => format!(
                "SELECT {EVENT_COLUMNS} FROM workflow_events \
                 WHERE {filter_column} = $1 AND ($2::TEXT IS NULL OR id < $2) \
                 ORDER BY id DESC LIMIT $3"
            ),
        };

        let rows: Vec<EventRow> = sqlx::query_as(&sql)
            .bind(filter_value)
            .bind(cursor.as_deref())
            .bind((limit + 1) as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(WorldError::internal)?;

        let events = rows
            .into_iter()
            .map(EventRow::try_into_event)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page::from_overfetched(events, limit, |event| {
            event.event_id.to_string()
        }))
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    async fn create(&self, run_id: RunId, request: CreateEventRequest) -> Result<Event, WorldError> {
        if request.event_type.is_empty() {
            return Err(WorldError::invalid_argument("event type must not be empty"));
        }

        let event = Event {
            event_id: self.ids.event_id(),
            run_id,
            event_type: request.event_type,
            correlation_id: request.correlation_id,
            event_data: request.event_data,
            created_at: Utc::now(),
        };

        sqlx::query(
            r#"
            INSERT INTO workflow_events (id, run_id, event_type, correlation_id, event_data, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(event.event_id.to_string())
        .bind(event.run_id.to_string())
        .bind(&event.event_type)
        .bind(event.correlation_id.as_deref())
        .bind(event.event_data.as_ref().map(encode_value))
        .bind(event.created_at)
        .execute(&self.pool)
        .await
        .map_err(WorldError::internal)?;

        Ok(event)
    }

    async fn list(&self, params: ListEventsParams) -> Result<Page<Event>, WorldError> {
        let limit = params.pagination.effective_limit();
        let cursor = params.pagination.decoded_cursor()?;
        self.list_filtered(
            "run_id",
            &params.run_id.to_string(),
            params.sort_order,
            limit,
            cursor,
        )
        .await
    }

    async fn list_by_correlation_id(
        &self,
        params: ListByCorrelationParams,
    ) -> Result<Page<Event>, WorldError> {
        let limit = params.pagination.effective_limit();
        let cursor = params.pagination.decoded_cursor()?;
        self.list_filtered(
            "correlation_id",
            &params.correlation_id,
            params.sort_order,
            limit,
            cursor,
        )
        .await
    }
}
