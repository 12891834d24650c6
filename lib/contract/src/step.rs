//! Steps: units of work scoped to a run, with their own lifecycle.
//!
//! Step ids are caller-supplied and unique within a run; re-creation of an
//! existing step during replay returns the stored record unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use worldkit_core::{ErrorDetail, Pagination, RunId};

/// Execution status of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Created, not yet picked up.
    Pending,
    /// Actively executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
}

impl StepStatus {
    /// Returns the wire representation of the status.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parses the wire representation back into a status.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Returns true if no further transitions are legal from this status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A unit of work within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Owning run.
    pub run_id: RunId,
    /// Caller-supplied id, unique within the run.
    pub step_id: String,
    /// Human-readable step name.
    pub step_name: String,
    /// Current status.
    pub status: StepStatus,
    /// Input value sequence.
    pub input: Option<Vec<JsonValue>>,
    /// Output value sequence; absent until produced.
    pub output: Option<Vec<JsonValue>>,
    /// Failure detail.
    pub error: Option<ErrorDetail>,
    /// Delivery attempt counter, starting at 1.
    pub attempt: u32,
    /// Earliest instant the next attempt should run.
    pub retry_after: Option<DateTime<Utc>>,
    /// When the step was created.
    pub created_at: DateTime<Utc>,
    /// When the step was last written.
    pub updated_at: DateTime<Utc>,
    /// When the step first transitioned to `running`.
    pub started_at: Option<DateTime<Utc>>,
    /// When the step first reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Request to create a step under a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateStepRequest {
    /// Caller-supplied id, unique within the run.
    pub step_id: String,
    /// Human-readable step name.
    pub step_name: String,
    /// Input value sequence.
    #[serde(default)]
    pub input: Vec<JsonValue>,
}

/// Partial update applied over a step's current state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepPatch {
    /// New status; transitions derive timestamps.
    #[serde(default)]
    pub status: Option<StepStatus>,
    /// New output value sequence.
    #[serde(default)]
    pub output: Option<Vec<JsonValue>>,
    /// Failure detail.
    #[serde(default)]
    pub error: Option<ErrorDetail>,
    /// New attempt count.
    #[serde(default)]
    pub attempt: Option<u32>,
    /// Earliest instant the next attempt should run.
    #[serde(default)]
    pub retry_after: Option<DateTime<Utc>>,
}

impl StepPatch {
    /// A patch that only changes status.
    #[must_use]
    pub fn status(status: StepStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

/// Filter and pagination for step listings.
#[derive(Debug, Clone, PartialEq)]
pub struct ListStepsParams {
    /// Run whose steps to list.
    pub run_id: RunId,
    /// Page bounds; ordering is always by step id descending.
    pub pagination: Pagination,
}

impl Step {
    /// Materializes a new step in `pending` with `attempt = 1`.
    #[must_use]
    pub fn create(run_id: RunId, request: CreateStepRequest, now: DateTime<Utc>) -> Self {
        Self {
            run_id,
            step_id: request.step_id,
            step_name: request.step_name,
            status: StepStatus::Pending,
            input: Some(request.input),
            output: None,
            error: None,
            attempt: 1,
            retry_after: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Merges a patch over the step, deriving timestamps.
    pub fn apply(&mut self, patch: StepPatch, now: DateTime<Utc>) {
        if let Some(status) = patch.status {
            if status == StepStatus::Running && self.started_at.is_none() {
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
        if let Some(error) = patch.error {
            self.error = Some(error);
        }
        if let Some(attempt) = patch.attempt {
            self.attempt = attempt;
        }
        if let Some(retry_after) = patch.retry_after {
            self.retry_after = Some(retry_after);
        }
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use worldkit_core::IdGenerator;

    fn new_step() -> Step {
        let ids = IdGenerator::new();
        Step::create(
            ids.run_id(),
            CreateStepRequest {
                step_id: "s1".to_string(),
                step_name: "first".to_string(),
                input: vec![],
            },
            Utc::now(),
        )
    }

    #[test]
    fn create_starts_pending_at_attempt_one() {
        let step = new_step();
        assert_eq!(step.status, StepStatus::Pending);
        assert_eq!(step.attempt, 1);
        assert!(step.started_at.is_none());
        assert!(step.completed_at.is_none());
    }

    #[test]
    fn failure_patch_sets_completed_at_and_error() {
        let mut step = new_step();
        let t1 = step.created_at + chrono::Duration::seconds(1);
        step.apply(StepPatch::status(StepStatus::Running), t1);
        assert_eq!(step.started_at, Some(t1));

        let t2 = t1 + chrono::Duration::seconds(1);
        let patch = StepPatch {
            status: Some(StepStatus::Failed),
            error: Some(ErrorDetail::new("boom").with_code("E1")),
            ..StepPatch::default()
        };
        step.apply(patch, t2);

        assert_eq!(step.completed_at, Some(t2));
        assert_eq!(step.error.as_ref().and_then(|e| e.code.as_deref()), Some("E1"));
    }

    #[test]
    fn attempt_and_retry_after_are_patchable() {
        let mut step = new_step();
        let later = step.created_at + chrono::Duration::seconds(30);
        let patch = StepPatch {
            attempt: Some(2),
            retry_after: Some(later),
            ..StepPatch::default()
        };
        step.apply(patch, Utc::now());
        assert_eq!(step.attempt, 2);
        assert_eq!(step.retry_after, Some(later));
    }

    #[test]
    fn started_at_is_write_once() {
        let mut step = new_step();
        let t1 = step.created_at + chrono::Duration::seconds(1);
        let t2 = t1 + chrono::Duration::seconds(1);
        step.apply(StepPatch::status(StepStatus::Running), t1);
        step.apply(StepPatch::status(StepStatus::Running), t2);
        assert_eq!(step.started_at, Some(t1));
    }
}
