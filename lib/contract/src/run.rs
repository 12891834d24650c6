//! Workflow run records and their state machine.
//!
//! All status transitions flow through [`WorkflowRun::apply`] so the derived
//! timestamp rules hold in every backend: `started_at` is set exactly once,
//! on the first transition to `running`; `completed_at` exactly once, on the
//! first transition to a terminal status; `updated_at` moves on every write.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use worldkit_core::{ErrorDetail, Pagination, RunId, WorldError};

/// Execution status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, not yet picked up.
    Pending,
    /// Actively executing.
    Running,
    /// Suspended; may be resumed.
    Paused,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled by the caller.
    Cancelled,
}

impl RunStatus {
    /// Returns the wire representation of the status.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parses the wire representation back into a status.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Returns true if no further transitions are legal from this status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// A single execution of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Run id (`wrun_` prefixed).
    pub run_id: RunId,
    /// Name of the workflow being executed.
    pub workflow_name: String,
    /// Deployment the run is bound to.
    pub deployment_id: String,
    /// Current status.
    pub status: RunStatus,
    /// Input value sequence. `None` when elided by `resolve_data`.
    pub input: Option<Vec<JsonValue>>,
    /// Output value sequence; absent until the run produces one.
    pub output: Option<Vec<JsonValue>>,
    /// Opaque key/value execution context.
    pub execution_context: Option<JsonValue>,
    /// Failure detail; present only for failed runs.
    pub error: Option<ErrorDetail>,
    /// When the run was created.
    pub created_at: DateTime<Utc>,
    /// When the run was last written.
    pub updated_at: DateTime<Utc>,
    /// When the run first transitioned to `running`.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run first reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Request to create a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateRunRequest {
    /// Name of the workflow to run.
    pub workflow_name: String,
    /// Deployment the run is bound to.
    #[serde(default)]
    pub deployment_id: String,
    /// Input value sequence.
    #[serde(default)]
    pub input: Vec<JsonValue>,
    /// Opaque execution context.
    #[serde(default)]
    pub execution_context: Option<JsonValue>,
}

/// Partial update applied over a run's current state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunPatch {
    /// New status; transitions derive timestamps.
    #[serde(default)]
    pub status: Option<RunStatus>,
    /// New output value sequence.
    #[serde(default)]
    pub output: Option<Vec<JsonValue>>,
    /// New execution context.
    #[serde(default)]
    pub execution_context: Option<JsonValue>,
    /// Failure detail.
    #[serde(default)]
    pub error: Option<ErrorDetail>,
}

impl RunPatch {
    /// A patch that only changes status.
    #[must_use]
    pub fn status(status: RunStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

/// How much of a run's data to materialize on read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveData {
    /// Return input and output in full.
    #[default]
    Full,
    /// Elide input and output; the store need not fetch them.
    None,
}

/// Options for [`stores::RunStore::get`](crate::stores::RunStore::get).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetRunOptions {
    /// Data resolution mode.
    pub resolve_data: ResolveData,
}

/// Filter and pagination for run listings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListRunsParams {
    /// Restrict to runs of this workflow.
    pub workflow_name: Option<String>,
    /// Restrict to runs in this status.
    pub status: Option<RunStatus>,
    /// Page bounds; ordering is always by run id descending.
    pub pagination: Pagination,
}

impl WorkflowRun {
    /// Materializes a new run in `pending` from a create request.
    #[must_use]
    pub fn create(run_id: RunId, request: CreateRunRequest, now: DateTime<Utc>) -> Self {
        Self {
            run_id,
            workflow_name: request.workflow_name,
            deployment_id: request.deployment_id,
            status: RunStatus::Pending,
            input: Some(request.input),
            output: None,
            execution_context: request.execution_context,
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Merges a patch over the run, deriving timestamps.
    pub fn apply(&mut self, patch: RunPatch, now: DateTime<Utc>) {
        if let Some(status) = patch.status {
            if status == RunStatus::Running && self.started_at.is_none() {
                self.started_at = Some(now);
            }
            if status.is_terminal() && self.completed_at.is_none() {
                self.completed_at = Some(now);
            }
            self.status = status;
        }
        if let Some(output) = patch.output {
            self.output = Some(output);
        }
        if let Some(context) = patch.execution_context {
            self.execution_context = Some(context);
        }
        if let Some(error) = patch.error {
            self.error = Some(error);
        }
        self.updated_at = now;
    }

    /// Returns the run with input and output elided.
    #[must_use]
    pub fn without_data(mut self) -> Self {
        self.input = None;
        self.output = None;
        self
    }

    /// Checks that the run may be cancelled.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` when the run is already terminal.
    pub fn ensure_cancellable(&self) -> Result<(), WorldError> {
        if self.status.is_terminal() {
            return Err(WorldError::invalid_state(format!(
                "cannot cancel run {} in terminal status {}",
                self.run_id,
                self.status.as_str()
            )));
        }
        Ok(())
    }

    /// Checks that the run may be paused.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the run is `pending` or `running`.
    pub fn ensure_pausable(&self) -> Result<(), WorldError> {
        match self.status {
            RunStatus::Pending | RunStatus::Running => Ok(()),
            other => Err(WorldError::invalid_state(format!(
                "cannot pause run {} in status {}",
                self.run_id,
                other.as_str()
            ))),
        }
    }

    /// Checks that the run may be resumed.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the run is `paused`.
    pub fn ensure_resumable(&self) -> Result<(), WorldError> {
        if self.status != RunStatus::Paused {
            return Err(WorldError::invalid_state(format!(
                "cannot resume run {} in status {}",
                self.run_id,
                self.status.as_str()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use worldkit_core::IdGenerator;

    fn new_run() -> WorkflowRun {
        let ids = IdGenerator::new();
        WorkflowRun::create(
            ids.run_id(),
            CreateRunRequest {
                workflow_name: "w".to_string(),
                deployment_id: "dep-1".to_string(),
                input: vec![serde_json::json!("a"), serde_json::json!("b")],
                execution_context: None,
            },
            Utc::now(),
        )
    }

    #[test]
    fn create_starts_pending_with_equal_timestamps() {
        let run = new_run();
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.created_at, run.updated_at);
        assert!(run.started_at.is_none());
        assert!(run.completed_at.is_none());
    }

    #[test]
    fn first_running_transition_sets_started_at_once() {
        let mut run = new_run();
        let t1 = run.created_at + chrono::Duration::seconds(1);
        run.apply(RunPatch::status(RunStatus::Running), t1);
        assert_eq!(run.started_at, Some(t1));

        // A later re-entry into running does not move the timestamp.
        let t2 = t1 + chrono::Duration::seconds(5);
        run.apply(RunPatch::status(RunStatus::Paused), t2);
        run.apply(RunPatch::status(RunStatus::Running), t2);
        assert_eq!(run.started_at, Some(t1));
        assert_eq!(run.updated_at, t2);
    }

    #[test]
    fn terminal_transition_sets_completed_at_and_keeps_output() {
        let mut run = new_run();
        let t1 = run.created_at + chrono::Duration::seconds(1);
        run.apply(RunPatch::status(RunStatus::Running), t1);

        let t2 = t1 + chrono::Duration::seconds(1);
        let patch = RunPatch {
            status: Some(RunStatus::Completed),
            output: Some(vec![serde_json::json!({"r": 42})]),
            ..RunPatch::default()
        };
        run.apply(patch, t2);

        assert_eq!(run.completed_at, Some(t2));
        assert_eq!(run.output, Some(vec![serde_json::json!({"r": 42})]));
        assert!(run.created_at <= run.updated_at);
        assert!(run.completed_at >= run.started_at);
    }

    #[test]
    fn cancel_guard_rejects_terminal() {
        let mut run = new_run();
        run.apply(RunPatch::status(RunStatus::Completed), Utc::now());
        let err = run.ensure_cancellable().unwrap_err();
        assert!(err.is_invalid_state());
    }

    #[test]
    fn pause_guard_rejects_completed() {
        let mut run = new_run();
        run.apply(RunPatch::status(RunStatus::Completed), Utc::now());
        assert!(run.ensure_pausable().unwrap_err().is_invalid_state());
    }

    #[test]
    fn resume_guard_requires_paused() {
        let run = new_run();
        assert!(run.ensure_resumable().unwrap_err().is_invalid_state());

        let mut paused = new_run();
        paused.apply(RunPatch::status(RunStatus::Paused), Utc::now());
        assert!(paused.ensure_resumable().is_ok());
    }

    #[test]
    fn without_data_elides_values_only() {
        let run = new_run().without_data();
        assert!(run.input.is_none());
        assert!(run.output.is_none());
        assert_eq!(run.workflow_name, "w");
    }

    #[test]
    fn status_wire_roundtrip() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Paused,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse("exploded"), None);
    }
}
