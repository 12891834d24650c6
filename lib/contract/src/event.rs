//! Append-only events recorded against runs.
//!
//! Events are immutable after creation. Backends index them twice: by run
//! and by correlation id, both ordered by event id (which equals creation
//! order within a generator).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use worldkit_core::{EventId, Pagination, RunId, SortOrder};

/// Well-known event type strings. The set is open; callers may record any
/// type they need.
pub mod event_types {
    pub const WORKFLOW_STARTED: &str = "workflow_started";
    pub const WORKFLOW_COMPLETED: &str = "workflow_completed";
    pub const STEP_STARTED: &str = "step_started";
    pub const STEP_COMPLETED: &str = "step_completed";
    pub const STEP_FAILED: &str = "step_failed";
    pub const STEP_RETRYING: &str = "step_retrying";
    pub const HOOK_CREATED: &str = "hook_created";
    pub const HOOK_RECEIVED: &str = "hook_received";
    pub const HOOK_DISPOSED: &str = "hook_disposed";
}

/// An immutable record of something that happened to a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event id (`wevt_` prefixed); ordering equals creation order.
    pub event_id: EventId,
    /// Run the event belongs to.
    pub run_id: RunId,
    /// Open-enumerated kind string.
    pub event_type: String,
    /// Identifier linking events of the same logical sub-activity,
    /// typically a step or hook id.
    pub correlation_id: Option<String>,
    /// Opaque payload.
    pub event_data: Option<JsonValue>,
    /// When the event was appended.
    pub created_at: DateTime<Utc>,
}

/// Request to append an event to a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateEventRequest {
    /// Open-enumerated kind string.
    pub event_type: String,
    /// Correlation id, typically a step or hook id.
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Opaque payload.
    #[serde(default)]
    pub event_data: Option<JsonValue>,
}

/// Parameters for listing a run's events.
#[derive(Debug, Clone, PartialEq)]
pub struct ListEventsParams {
    /// Run whose events to list.
    pub run_id: RunId,
    /// Ordering by event id; defaults to ascending (chronological).
    pub sort_order: SortOrder,
    /// Page bounds.
    pub pagination: Pagination,
}

/// Parameters for listing events across runs by correlation id.
#[derive(Debug, Clone, PartialEq)]
pub struct ListByCorrelationParams {
    /// Correlation id shared by the events.
    pub correlation_id: String,
    /// Ordering by event id; defaults to ascending (chronological).
    pub sort_order: SortOrder,
    /// Page bounds.
    pub pagination: Pagination,
}
