//! Poll-based byte streamer over a chunk table.
//!
//! There is no push channel here: readers poll for `id > last_seen` at a
//! bounded cadence, so live delivery trails the writer by at most one poll
//! interval. `last_seen` advances on every fetched chunk, which is what
//! guarantees a chunk is never delivered twice.

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use sqlx::{FromRow, PgPool};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use worldkit_contract::{ByteStream, ReadStreamOptions, RunIdHandle, StreamPayload, Streamer};
use worldkit_core::{IdGenerator, WorldError};

/// Cadence at which readers poll for new chunks.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Chunk rows fetched per poll.
const POLL_BATCH: i64 = 64;

#[derive(FromRow)]
struct ChunkRow {
    id: String,
    payload: Vec<u8>,
    eof: bool,
}

/// Streamer over a Postgres chunk table.
#[derive(Clone)]
pub struct PostgresStreamer {
    pool: PgPool,
    ids: Arc<IdGenerator>,
    poll_interval: Duration,
}

impl PostgresStreamer {
    pub fn new(pool: PgPool, ids: Arc<IdGenerator>) -> Self {
        Self {
            pool,
            ids,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Overrides the poll cadence. Mostly useful to tighten test latency.
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn append(
        &self,
        name: &str,
        run_id: RunIdHandle,
        payload: Vec<u8>,
        eof: bool,
    ) -> Result<(), WorldError> {
        // Awaiting resolution orders the append after the run's creation.
        let run_id = run_id.resolve().await;
        let chunk_id = self.ids.chunk_id();

        // The insert is guarded against an existing EOF chunk, so "at most
        // one EOF, nothing after it" holds without a separate read.
        let inserted = sqlx::query(
            r#"
            INSERT INTO stream_chunks (id, stream_name, run_id, payload, eof, created_at)
            SELECT $1, $2, $3, $4, $5, $6
            WHERE NOT EXISTS (
                SELECT 1 FROM stream_chunks WHERE stream_name = $2 AND eof
            )
            "#,
        )
        .bind(chunk_id.to_string())
        .bind(name)
        .bind(run_id.to_string())
        .bind(&payload)
        .bind(eof)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(WorldError::internal)?
        .rows_affected();

        if inserted == 0 {
            return Err(WorldError::invalid_state(format!(
                "stream '{name}' is already closed"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Streamer for PostgresStreamer {
    async fn write_to_stream(
        &self,
        name: &str,
        run_id: RunIdHandle,
        payload: StreamPayload,
    ) -> Result<(), WorldError> {
        self.append(name, run_id, payload.into_bytes(), false).await
    }

    async fn close_stream(&self, name: &str, run_id: RunIdHandle) -> Result<(), WorldError> {
        self.append(name, run_id, Vec::new(), true).await
    }

    async fn read_from_stream(
        &self,
        name: &str,
        options: ReadStreamOptions,
    ) -> Result<ByteStream, WorldError> {
        let pool = self.pool.clone();
        let stream_name = name.to_string();
        let poll_interval = self.poll_interval;

        let (tx, rx) = mpsc::channel::<Result<Vec<u8>, WorldError>>(32);
        tokio::spawn(async move {
            let mut last_seen: Option<String> = None;
            let mut remaining_skip = options.start_index.unwrap_or(0);

            loop {
                let rows: Result<Vec<ChunkRow>, sqlx::Error> = sqlx::query_as(
                    r#"
                    SELECT id, payload, eof FROM stream_chunks
                    WHERE stream_name = $1
                      AND ($2::TEXT IS NULL OR id > $2)
                    ORDER BY id ASC
                    LIMIT $3
                    "#,
                )
                .bind(&stream_name)
                .bind(last_seen.as_deref())
                .bind(POLL_BATCH)
                .fetch_all(&pool)
                .await;

                let rows = match rows {
                    Ok(rows) => rows,
                    Err(error) => {
                        // Reader errors close the sequence.
                        let _ = tx.send(Err(WorldError::internal(error))).await;
                        return;
                    }
                };

                let drained = rows.is_empty();
                for row in rows {
                    last_seen = Some(row.id);
                    if row.eof {
                        return;
                    }
                    if remaining_skip > 0 {
                        remaining_skip -= 1;
                        continue;
                    }
                    if tx.send(Ok(row.payload)).await.is_err() {
                        // Consumer cancelled.
                        return;
                    }
                }

                if drained {
                    tokio::select! {
                        () = tx.closed() => return,
                        () = tokio::time::sleep(poll_interval) => {}
                    }
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}
