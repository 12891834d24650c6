//! In-memory step storage and state machine.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use tokio::sync::RwLock;
use worldkit_contract::{CreateStepRequest, ListStepsParams, Step, StepPatch, StepStore};
use worldkit_core::{Page, RunId, WorldError};

/// Step storage backed by per-run ordered maps.
#[derive(Clone, Default)]
pub struct MemoryStepStore {
    steps: Arc<RwLock<HashMap<RunId, BTreeMap<String, Step>>>>,
}

#[async_trait]
impl StepStore for MemoryStepStore {
    async fn create(&self, run_id: RunId, request: CreateStepRequest) -> Result<Step, WorldError> {
        if request.step_id.is_empty() {
            return Err(WorldError::invalid_argument("step id must not be empty"));
        }

        let mut steps = self.steps.write().await;
        let run_steps = steps.entry(run_id).or_default();
        if let Some(existing) = run_steps.get(&request.step_id) {
            // Replay-safe: re-creation returns the stored record unchanged.
            return Ok(existing.clone());
        }
        let step = Step::create(run_id, request, Utc::now());
        run_steps.insert(step.step_id.clone(), step.clone());
        tracing::debug!(run_id = %run_id, step_id = %step.step_id, "created step");
        Ok(step)
    }

    async fn get(&self, run_id: Option<RunId>, step_id: &str) -> Result<Step, WorldError> {
        let steps = self.steps.read().await;
        let found = match run_id {
            Some(run_id) => steps.get(&run_id).and_then(|run_steps| run_steps.get(step_id)),
            // Cross-run lookup is the sanctioned slow path.
            None => steps.values().find_map(|run_steps| run_steps.get(step_id)),
        };
        found
            .cloned()
            .ok_or_else(|| WorldError::not_found("step", step_id))
    }

    async fn update(
        &self,
        run_id: RunId,
        step_id: &str,
        patch: StepPatch,
    ) -> Result<Step, WorldError> {
        let mut steps = self.steps.write().await;
        let step = steps
            .get_mut(&run_id)
            .and_then(|run_steps| run_steps.get_mut(step_id))
            .ok_or_else(|| WorldError::not_found("step", step_id))?;
        step.apply(patch, Utc::now());
        Ok(step.clone())
    }

    async fn list(&self, params: ListStepsParams) -> Result<Page<Step>, WorldError> {
        let limit = params.pagination.effective_limit();
        let cursor = params.pagination.decoded_cursor()?;

        let steps = self.steps.read().await;
        let Some(run_steps) = steps.get(&params.run_id) else {
            return Ok(Page::empty());
        };
        let upper = match cursor {
            Some(step_id) => Bound::Excluded(step_id),
            None => Bound::Unbounded,
        };
        let items: Vec<Step> = run_steps
            .range((Bound::Unbounded, upper))
            .rev()
            .take(limit + 1)
            .map(|(_, step)| step.clone())
            .collect();
        Ok(Page::from_overfetched(items, limit, |step| {
            step.step_id.clone()
        }))
    }
}
