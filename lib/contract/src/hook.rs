//! Hooks: token-addressable callback handles registered against runs.
//!
//! A hook lets an external system call back into a run. The hook id is
//! caller-supplied and unique within its run; the token is globally unique
//! and backs an O(1) secondary index.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use worldkit_core::{Pagination, RunId};

/// An external-callback handle on a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hook {
    /// Owning run.
    pub run_id: RunId,
    /// Caller-supplied id, unique within the run.
    pub hook_id: String,
    /// Globally unique lookup token.
    pub token: String,
    /// Owner context string; possibly empty.
    pub owner_id: String,
    /// Project context string; possibly empty.
    pub project_id: String,
    /// Environment context string; possibly empty.
    pub environment: String,
    /// Opaque metadata.
    pub metadata: Option<JsonValue>,
    /// When the hook was created.
    pub created_at: DateTime<Utc>,
}

/// Request to register a hook under a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateHookRequest {
    /// Caller-supplied id, unique within the run.
    pub hook_id: String,
    /// Globally unique lookup token.
    pub token: String,
    /// Owner context string.
    #[serde(default)]
    pub owner_id: String,
    /// Project context string.
    #[serde(default)]
    pub project_id: String,
    /// Environment context string.
    #[serde(default)]
    pub environment: String,
    /// Opaque metadata.
    #[serde(default)]
    pub metadata: Option<JsonValue>,
}

/// Filter and pagination for hook listings.
#[derive(Debug, Clone, PartialEq)]
pub struct ListHooksParams {
    /// Run whose hooks to list.
    pub run_id: RunId,
    /// Page bounds; ordering is always by hook id descending.
    pub pagination: Pagination,
}

impl Hook {
    /// Materializes a new hook from a create request.
    #[must_use]
    pub fn create(run_id: RunId, request: CreateHookRequest, now: DateTime<Utc>) -> Self {
        Self {
            run_id,
            hook_id: request.hook_id,
            token: request.token,
            owner_id: request.owner_id,
            project_id: request.project_id,
            environment: request.environment,
            metadata: request.metadata,
            created_at: now,
        }
    }
}
