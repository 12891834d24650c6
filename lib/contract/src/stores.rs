//! Storage traits realized by every backend.
//!
//! Each trait is a seam: the contract lives here, the store-specific
//! plumbing lives in the backend crates. All operations are asynchronous
//! and surface [`WorldError`] taxonomy values.

use crate::event::{CreateEventRequest, Event, ListByCorrelationParams, ListEventsParams};
use crate::hook::{CreateHookRequest, Hook, ListHooksParams};
use crate::run::{CreateRunRequest, GetRunOptions, ListRunsParams, RunPatch, WorkflowRun};
use crate::step::{CreateStepRequest, ListStepsParams, Step, StepPatch};
use async_trait::async_trait;
use worldkit_core::{Page, RunId, WorldError};

/// CRUD and state machine for workflow runs.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Creates a run in `pending` with a generated id.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if the generated id already exists.
    async fn create(&self, request: CreateRunRequest) -> Result<WorkflowRun, WorldError>;

    /// Fetches a run by id.
    async fn get(&self, run_id: RunId, options: GetRunOptions) -> Result<WorkflowRun, WorldError>;

    /// Merges a patch over the run, deriving timestamps.
    async fn update(&self, run_id: RunId, patch: RunPatch) -> Result<WorkflowRun, WorldError>;

    /// Cancels the run. Illegal from a terminal status.
    async fn cancel(&self, run_id: RunId) -> Result<WorkflowRun, WorldError>;

    /// Pauses the run. Legal only from `pending` or `running`.
    async fn pause(&self, run_id: RunId) -> Result<WorkflowRun, WorldError>;

    /// Resumes a paused run; sets `started_at` if not already set.
    async fn resume(&self, run_id: RunId) -> Result<WorkflowRun, WorldError>;

    /// Lists runs newest-first, optionally filtered by name and status.
    async fn list(&self, params: ListRunsParams) -> Result<Page<WorkflowRun>, WorldError>;
}

/// CRUD and state machine for steps within runs.
#[async_trait]
pub trait StepStore: Send + Sync {
    /// Creates a step, idempotently on `(run_id, step_id)`: if the step
    /// already exists the stored record is returned unchanged.
    async fn create(&self, run_id: RunId, request: CreateStepRequest) -> Result<Step, WorldError>;

    /// Fetches a step. When `run_id` is `None` the store searches across
    /// runs; that is a slow path and may be a scan.
    async fn get(&self, run_id: Option<RunId>, step_id: &str) -> Result<Step, WorldError>;

    /// Merges a patch over the step, deriving timestamps.
    async fn update(
        &self,
        run_id: RunId,
        step_id: &str,
        patch: StepPatch,
    ) -> Result<Step, WorldError>;

    /// Lists a run's steps by step id descending.
    async fn list(&self, params: ListStepsParams) -> Result<Page<Step>, WorldError>;
}

/// Append-only event log with dual indexing.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends an event to a run.
    async fn create(&self, run_id: RunId, request: CreateEventRequest) -> Result<Event, WorldError>;

    /// Lists a run's events by event id, default ascending.
    async fn list(&self, params: ListEventsParams) -> Result<Page<Event>, WorldError>;

    /// Lists events across runs sharing a correlation id.
    async fn list_by_correlation_id(
        &self,
        params: ListByCorrelationParams,
    ) -> Result<Page<Event>, WorldError>;
}

/// Token-keyed registry of external-callback handles.
#[async_trait]
pub trait HookStore: Send + Sync {
    /// Registers a hook, idempotently on `hook_id`: an existing hook is
    /// returned unchanged, original token included.
    async fn create(&self, run_id: RunId, request: CreateHookRequest) -> Result<Hook, WorldError>;

    /// Fetches a hook by id. Backends without a flat hook-id index may
    /// answer `NotImplemented`.
    async fn get(&self, hook_id: &str) -> Result<Hook, WorldError>;

    /// Fetches a hook through the token index.
    async fn get_by_token(&self, token: &str) -> Result<Hook, WorldError>;

    /// Lists a run's hooks by hook id descending.
    async fn list(&self, params: ListHooksParams) -> Result<Page<Hook>, WorldError>;

    /// Deletes a hook and its token index entry, returning the removed hook.
    async fn dispose(&self, hook_id: &str) -> Result<Hook, WorldError>;
}
