//! In-memory hook registry with a token secondary index.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use tokio::sync::RwLock;
use worldkit_contract::{CreateHookRequest, Hook, HookStore, ListHooksParams};
use worldkit_core::{Page, RunId, WorldError};

#[derive(Default)]
struct HookState {
    by_run: HashMap<RunId, BTreeMap<String, Hook>>,
    /// token -> (run, hook id); at most one hook per token.
    by_token: HashMap<String, (RunId, String)>,
}

/// Hook registry backed by process memory.
#[derive(Clone, Default)]
pub struct MemoryHookStore {
    state: Arc<RwLock<HookState>>,
}

impl MemoryHookStore {
    /// Drops every hook owned by a run, along with the token index entries.
    ///
    /// Called by the run store when a run reaches a terminal status, so the
    /// registry does not accumulate dead handles.
    pub(crate) async fn dispose_for_run(&self, run_id: RunId) -> usize {
        let mut state = self.state.write().await;
        let Some(hooks) = state.by_run.remove(&run_id) else {
            return 0;
        };
        for hook in hooks.values() {
            state.by_token.remove(&hook.token);
        }
        hooks.len()
    }
}

#[async_trait]
impl HookStore for MemoryHookStore {
    async fn create(&self, run_id: RunId, request: CreateHookRequest) -> Result<Hook, WorldError> {
        if request.hook_id.is_empty() {
            return Err(WorldError::invalid_argument("hook id must not be empty"));
        }
        if request.token.is_empty() {
            return Err(WorldError::invalid_argument("hook token must not be empty"));
        }

        let mut state = self.state.write().await;
        if let Some(existing) = state
            .by_run
            .get(&run_id)
            .and_then(|hooks| hooks.get(&request.hook_id))
        {
            // Replay-safe: the stored record wins, original token included.
            return Ok(existing.clone());
        }
        if state.by_token.contains_key(&request.token) {
            return Err(WorldError::conflict("hook token", &request.token));
        }

        let hook = Hook::create(run_id, request, Utc::now());
        state
            .by_token
            .insert(hook.token.clone(), (run_id, hook.hook_id.clone()));
        state
            .by_run
            .entry(run_id)
            .or_default()
            .insert(hook.hook_id.clone(), hook.clone());
        tracing::debug!(run_id = %run_id, hook_id = %hook.hook_id, "registered hook");
        Ok(hook)
    }

    async fn get(&self, hook_id: &str) -> Result<Hook, WorldError> {
        let state = self.state.read().await;
        state
            .by_run
            .values()
            .find_map(|hooks| hooks.get(hook_id))
            .cloned()
            .ok_or_else(|| WorldError::not_found("hook", hook_id))
    }

    async fn get_by_token(&self, token: &str) -> Result<Hook, WorldError> {
        let state = self.state.read().await;
        let Some((run_id, hook_id)) = state.by_token.get(token) else {
            return Err(WorldError::not_found("hook token", token));
        };
        state
            .by_run
            .get(run_id)
            .and_then(|hooks| hooks.get(hook_id))
            .cloned()
            .ok_or_else(|| WorldError::internal(format!("token index points at missing hook {hook_id}")))
    }

    async fn list(&self, params: ListHooksParams) -> Result<Page<Hook>, WorldError> {
        let limit = params.pagination.effective_limit();
        let cursor = params.pagination.decoded_cursor()?;

        let state = self.state.read().await;
        let Some(hooks) = state.by_run.get(&params.run_id) else {
            return Ok(Page::empty());
        };
        let upper = match cursor {
            Some(hook_id) => Bound::Excluded(hook_id),
            None => Bound::Unbounded,
        };
        let items: Vec<Hook> = hooks
            .range((Bound::Unbounded, upper))
            .rev()
            .take(limit + 1)
            .map(|(_, hook)| hook.clone())
            .collect();
        Ok(Page::from_overfetched(items, limit, |hook| {
            hook.hook_id.clone()
        }))
    }

    async fn dispose(&self, hook_id: &str) -> Result<Hook, WorldError> {
        let mut state = self.state.write().await;
        let run_id = state
            .by_run
            .iter()
            .find(|(_, hooks)| hooks.contains_key(hook_id))
            .map(|(run_id, _)| *run_id)
            .ok_or_else(|| WorldError::not_found("hook", hook_id))?;

        let hook = state
            .by_run
            .get_mut(&run_id)
            .and_then(|hooks| hooks.remove(hook_id))
            .ok_or_else(|| WorldError::not_found("hook", hook_id))?;
        state.by_token.remove(&hook.token);
        tracing::debug!(run_id = %run_id, hook_id = %hook_id, "disposed hook");
        Ok(hook)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use worldkit_core::{IdGenerator, Pagination};

    fn request(hook_id: &str, token: &str) -> CreateHookRequest {
        CreateHookRequest {
            hook_id: hook_id.to_string(),
            token: token.to_string(),
            ..CreateHookRequest::default()
        }
    }

    #[tokio::test]
    async fn create_then_lookup_by_token_and_id() {
        let ids = IdGenerator::new();
        let store = MemoryHookStore::default();
        let run_id = ids.run_id();

        let created = store.create(run_id, request("h", "t")).await.expect("create");
        assert_eq!(store.get_by_token("t").await.expect("by token"), created);
        assert_eq!(store.get("h").await.expect("by id"), created);
    }

    #[tokio::test]
    async fn create_is_idempotent_and_keeps_original_token() {
        let ids = IdGenerator::new();
        let store = MemoryHookStore::default();
        let run_id = ids.run_id();

        let first = store.create(run_id, request("h", "t1")).await.expect("create");
        let second = store.create(run_id, request("h", "t2")).await.expect("re-create");
        assert_eq!(first, second);
        assert_eq!(second.token, "t1");
        assert!(store.get_by_token("t2").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn token_collision_across_hooks_is_conflict() {
        let ids = IdGenerator::new();
        let store = MemoryHookStore::default();
        let run_id = ids.run_id();

        store.create(run_id, request("h1", "t")).await.expect("create");
        let err = store.create(run_id, request("h2", "t")).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn dispose_removes_both_indexes() {
        let ids = IdGenerator::new();
        let store = MemoryHookStore::default();
        let run_id = ids.run_id();

        store.create(run_id, request("h", "t")).await.expect("create");
        store.dispose("h").await.expect("dispose");
        assert!(store.get("h").await.unwrap_err().is_not_found());
        assert!(store.get_by_token("t").await.unwrap_err().is_not_found());
        assert!(store.dispose("h").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn list_orders_by_hook_id_descending() {
        let ids = IdGenerator::new();
        let store = MemoryHookStore::default();
        let run_id = ids.run_id();

        for (hook_id, token) in [("a", "t1"), ("b", "t2"), ("c", "t3")] {
            store.create(run_id, request(hook_id, token)).await.expect("create");
        }
        let page = store
            .list(ListHooksParams {
                run_id,
                pagination: Pagination::default(),
            })
            .await
            .expect("list");
        let ordered: Vec<&str> = page.data.iter().map(|h| h.hook_id.as_str()).collect();
        assert_eq!(ordered, vec!["c", "b", "a"]);
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn dispose_for_run_clears_the_registry() {
        let ids = IdGenerator::new();
        let store = MemoryHookStore::default();
        let run_id = ids.run_id();

        store.create(run_id, request("h1", "t1")).await.expect("create");
        store.create(run_id, request("h2", "t2")).await.expect("create");
        assert_eq!(store.dispose_for_run(run_id).await, 2);
        assert!(store.get_by_token("t1").await.unwrap_err().is_not_found());
        assert!(store.get_by_token("t2").await.unwrap_err().is_not_found());
    }
}
