//! In-memory run storage and state machine.

use crate::hooks::MemoryHookStore;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use worldkit_contract::{
    CreateRunRequest, GetRunOptions, ListRunsParams, ResolveData, RunPatch, RunStatus, RunStore,
    WorkflowRun,
};
use worldkit_core::{IdGenerator, Page, RunId, WorldError};

/// Run storage backed by an ordered in-process map.
#[derive(Clone)]
pub struct MemoryRunStore {
    ids: Arc<IdGenerator>,
    hooks: MemoryHookStore,
    runs: Arc<RwLock<BTreeMap<RunId, WorkflowRun>>>,
}

impl MemoryRunStore {
    pub fn new(ids: Arc<IdGenerator>, hooks: MemoryHookStore) -> Self {
        Self {
            ids,
            hooks,
            runs: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Applies a guarded mutation and handles terminal-status side effects.
    async fn mutate<F>(&self, run_id: RunId, mutation: F) -> Result<WorkflowRun, WorldError>
    where
        F: FnOnce(&WorkflowRun) -> Result<RunPatch, WorldError>,
    {
        let (run, reached_terminal) = {
            let mut runs = self.runs.write().await;
            let run = runs
                .get_mut(&run_id)
                .ok_or_else(|| WorldError::not_found("run", run_id))?;
            let was_terminal = run.status.is_terminal();
            let patch = mutation(run)?;
            run.apply(patch, Utc::now());
            (run.clone(), !was_terminal && run.status.is_terminal())
        };

        if reached_terminal {
            let disposed = self.hooks.dispose_for_run(run_id).await;
            if disposed > 0 {
                tracing::debug!(run_id = %run_id, hooks = disposed, "disposed hooks of terminated run");
            }
        }
        Ok(run)
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create(&self, request: CreateRunRequest) -> Result<WorkflowRun, WorldError> {
        if request.workflow_name.is_empty() {
            return Err(WorldError::invalid_argument("workflow name must not be empty"));
        }

        let run_id = self.ids.run_id();
        let run = WorkflowRun::create(run_id, request, Utc::now());

        let mut runs = self.runs.write().await;
        if runs.contains_key(&run_id) {
            return Err(WorldError::conflict("run", run_id));
        }
        runs.insert(run_id, run.clone());
        tracing::debug!(run_id = %run_id, workflow_name = %run.workflow_name, "created run");
        Ok(run)
    }

    async fn get(&self, run_id: RunId, options: GetRunOptions) -> Result<WorkflowRun, WorldError> {
        let runs = self.runs.read().await;
        let run = runs
            .get(&run_id)
            .cloned()
            .ok_or_else(|| WorldError::not_found("run", run_id))?;
        Ok(match options.resolve_data {
            ResolveData::None => run.without_data(),
            ResolveData::Full => run,
        })
    }

    async fn update(&self, run_id: RunId, patch: RunPatch) -> Result<WorkflowRun, WorldError> {
        self.mutate(run_id, |_| Ok(patch)).await
    }

    async fn cancel(&self, run_id: RunId) -> Result<WorkflowRun, WorldError> {
        self.mutate(run_id, |run| {
            run.ensure_cancellable()?;
            Ok(RunPatch::status(RunStatus::Cancelled))
        })
        .await
    }

    async fn pause(&self, run_id: RunId) -> Result<WorkflowRun, WorldError> {
        self.mutate(run_id, |run| {
            run.ensure_pausable()?;
            Ok(RunPatch::status(RunStatus::Paused))
        })
        .await
    }

    async fn resume(&self, run_id: RunId) -> Result<WorkflowRun, WorldError> {
        self.mutate(run_id, |run| {
            run.ensure_resumable()?;
            // Re-entering running sets started_at if the run was paused
            // straight out of pending.
            Ok(RunPatch::status(RunStatus::Running))
        })
        .await
    }

    async fn list(&self, params: ListRunsParams) -> Result<Page<WorkflowRun>, WorldError> {
        let limit = params.pagination.effective_limit();
        let cursor = params
            .pagination
            .decoded_cursor()?
            .map(|raw| {
                RunId::from_str(&raw)
                    .map_err(|e| WorldError::invalid_argument(format!("invalid cursor: {e}")))
            })
            .transpose()?;

        let runs = self.runs.read().await;
        let upper = match cursor {
            Some(run_id) => Bound::Excluded(run_id),
            None => Bound::Unbounded,
        };
        let items: Vec<WorkflowRun> = runs
            .range((Bound::Unbounded, upper))
            .rev()
            .map(|(_, run)| run)
            .filter(|run| {
                params
                    .workflow_name
                    .as_deref()
                    .is_none_or(|name| run.workflow_name == name)
            })
            .filter(|run| params.status.is_none_or(|status| run.status == status))
            .take(limit + 1)
            .cloned()
            .collect();
        Ok(Page::from_overfetched(items, limit, |run| {
            run.run_id.to_string()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use worldkit_core::Pagination;

    fn store() -> MemoryRunStore {
        MemoryRunStore::new(Arc::new(IdGenerator::new()), MemoryHookStore::default())
    }

    fn request(workflow_name: &str) -> CreateRunRequest {
        CreateRunRequest {
            workflow_name: workflow_name.to_string(),
            deployment_id: "dep-1".to_string(),
            input: vec![serde_json::json!("a")],
            execution_context: None,
        }
    }

    #[tokio::test]
    async fn create_then_get_roundtrip() {
        let store = store();
        let created = store.create(request("w")).await.expect("create");
        let fetched = store
            .get(created.run_id, GetRunOptions::default())
            .await
            .expect("get");
        assert_eq!(created, fetched);
        assert_eq!(fetched.status, RunStatus::Pending);
    }

    #[tokio::test]
    async fn get_without_data_elides_input_and_output() {
        let store = store();
        let created = store.create(request("w")).await.expect("create");
        let fetched = store
            .get(
                created.run_id,
                GetRunOptions {
                    resolve_data: ResolveData::None,
                },
            )
            .await
            .expect("get");
        assert!(fetched.input.is_none());
        assert!(fetched.output.is_none());
        assert_eq!(fetched.workflow_name, "w");
    }

    #[tokio::test]
    async fn get_missing_run_is_not_found() {
        let store = store();
        let other = IdGenerator::new().run_id();
        let err = store.get(other, GetRunOptions::default()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn cancel_terminal_run_is_invalid_state() {
        let store = store();
        let run = store.create(request("w")).await.expect("create");
        store
            .update(run.run_id, RunPatch::status(RunStatus::Completed))
            .await
            .expect("complete");
        let err = store.cancel(run.run_id).await.unwrap_err();
        assert!(err.is_invalid_state());
    }

    #[tokio::test]
    async fn resume_requires_paused() {
        let store = store();
        let run = store.create(request("w")).await.expect("create");
        assert!(store.resume(run.run_id).await.unwrap_err().is_invalid_state());

        store.pause(run.run_id).await.expect("pause");
        let resumed = store.resume(run.run_id).await.expect("resume");
        assert_eq!(resumed.status, RunStatus::Running);
        assert!(resumed.started_at.is_some());
    }

    #[tokio::test]
    async fn list_is_newest_first_with_cursor() {
        let store = store();
        let mut created = Vec::new();
        for _ in 0..5 {
            created.push(store.create(request("w")).await.expect("create").run_id);
        }

        let first = store
            .list(ListRunsParams {
                pagination: Pagination {
                    limit: Some(3),
                    cursor: None,
                },
                ..ListRunsParams::default()
            })
            .await
            .expect("list");
        assert_eq!(first.data.len(), 3);
        assert!(first.has_more);
        assert_eq!(first.data[0].run_id, created[4]);

        let second = store
            .list(ListRunsParams {
                pagination: Pagination {
                    limit: Some(3),
                    cursor: first.cursor.clone(),
                },
                ..ListRunsParams::default()
            })
            .await
            .expect("list");
        assert_eq!(second.data.len(), 2);
        assert!(!second.has_more);
        assert_eq!(second.data[1].run_id, created[0]);
    }

    #[tokio::test]
    async fn list_filters_by_name_and_status() {
        let store = store();
        let kept = store.create(request("keep")).await.expect("create");
        store.create(request("other")).await.expect("create");
        store
            .update(kept.run_id, RunPatch::status(RunStatus::Running))
            .await
            .expect("update");

        let page = store
            .list(ListRunsParams {
                workflow_name: Some("keep".to_string()),
                status: Some(RunStatus::Running),
                pagination: Pagination::default(),
            })
            .await
            .expect("list");
        assert_eq!(page.data.len(), 1);
        assert_eq!(page.data[0].run_id, kept.run_id);
    }

    #[tokio::test]
    async fn terminal_update_disposes_hooks() {
        let ids = Arc::new(IdGenerator::new());
        let hooks = MemoryHookStore::default();
        let store = MemoryRunStore::new(Arc::clone(&ids), hooks.clone());

        let run = store.create(request("w")).await.expect("create");
        use worldkit_contract::{CreateHookRequest, HookStore};
        hooks
            .create(
                run.run_id,
                CreateHookRequest {
                    hook_id: "h".to_string(),
                    token: "t".to_string(),
                    ..CreateHookRequest::default()
                },
            )
            .await
            .expect("hook");

        store.cancel(run.run_id).await.expect("cancel");
        assert!(hooks.get_by_token("t").await.unwrap_err().is_not_found());
    }
}
