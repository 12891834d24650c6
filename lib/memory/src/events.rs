//! In-memory append-only event log with dual indexing.
//!
//! Event ids are monotonic, so the per-run and per-correlation index vectors
//! stay sorted by construction and pagination is a binary search plus a
//! slice.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use worldkit_contract::{
    CreateEventRequest, Event, EventStore, ListByCorrelationParams, ListEventsParams,
};
use worldkit_core::{EventId, IdGenerator, Page, RunId, SortOrder, WorldError};

#[derive(Default)]
struct EventLog {
    events: HashMap<EventId, Event>,
    by_run: HashMap<RunId, Vec<EventId>>,
    by_correlation: HashMap<String, Vec<EventId>>,
}

/// Event log backed by process memory.
#[derive(Clone)]
pub struct MemoryEventStore {
    ids: Arc<IdGenerator>,
    log: Arc<RwLock<EventLog>>,
}

impl MemoryEventStore {
    pub fn new(ids: Arc<IdGenerator>) -> Self {
        Self {
            ids,
            log: Arc::new(RwLock::new(EventLog::default())),
        }
    }

    async fn page_from_index(
        &self,
        ids: &[EventId],
        sort_order: SortOrder,
        limit: usize,
        cursor: Option<EventId>,
    ) -> Page<Event> {
        let selected = select_ids(ids, cursor, limit, sort_order);
        let log = self.log.read().await;
        let items: Vec<Event> = selected
            .into_iter()
            .filter_map(|id| log.events.get(&id).cloned())
            .collect();
        Page::from_overfetched(items, limit, |event| event.event_id.to_string())
    }
}

/// Picks up to `limit + 1` ids from a sorted index, after the cursor, in the
/// requested order.
fn select_ids(
    ids: &[EventId],
    cursor: Option<EventId>,
    limit: usize,
    order: SortOrder,
) -> Vec<EventId> {
    match order {
        SortOrder::Ascending => {
            let start = cursor.map_or(0, |c| ids.partition_point(|id| *id <= c));
            ids[start..].iter().take(limit + 1).copied().collect()
        }
        SortOrder::Descending => {
            let end = cursor.map_or(ids.len(), |c| ids.partition_point(|id| *id < c));
            ids[..end].iter().rev().take(limit + 1).copied().collect()
        }
    }
}

fn decode_event_cursor(raw: Option<String>) -> Result<Option<EventId>, WorldError> {
    raw.map(|raw| {
        EventId::from_str(&raw)
            .map_err(|e| WorldError::invalid_argument(format!("invalid cursor: {e}")))
    })
    .transpose()
}

#[async_trait]
impl EventStore for MemoryEventStore {
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

        let mut log = self.log.write().await;
        log.by_run.entry(run_id).or_default().push(event.event_id);
        if let Some(correlation_id) = &event.correlation_id {
            log.by_correlation
                .entry(correlation_id.clone())
                .or_default()
                .push(event.event_id);
        }
        log.events.insert(event.event_id, event.clone());
        Ok(event)
    }

    async fn list(&self, params: ListEventsParams) -> Result<Page<Event>, WorldError> {
        let limit = params.pagination.effective_limit();
        let cursor = decode_event_cursor(params.pagination.decoded_cursor()?)?;
        let ids = {
            let log = self.log.read().await;
            log.by_run.get(&params.run_id).cloned().unwrap_or_default()
        };
        Ok(self
            .page_from_index(&ids, params.sort_order, limit, cursor)
            .await)
    }

    async fn list_by_correlation_id(
        &self,
        params: ListByCorrelationParams,
    ) -> Result<Page<Event>, WorldError> {
        let limit = params.pagination.effective_limit();
        let cursor = decode_event_cursor(params.pagination.decoded_cursor()?)?;
        let ids = {
            let log = self.log.read().await;
            log.by_correlation
                .get(&params.correlation_id)
                .cloned()
                .unwrap_or_default()
        };
        Ok(self
            .page_from_index(&ids, params.sort_order, limit, cursor)
            .await)
    }
}
