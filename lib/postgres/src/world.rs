//! The Postgres-backed World aggregation.

use crate::events::PostgresEventStore;
use crate::hooks::PostgresHookStore;
use crate::runs::PostgresRunStore;
use crate::steps::PostgresStepStore;
use crate::streamer::PostgresStreamer;
use sqlx::PgPool;
use std::sync::Arc;
use worldkit_contract::{EventStore, HookStore, Queue, RunStore, StepStore, Streamer, World};
use worldkit_core::IdGenerator;

/// A World storing entities and stream chunks in PostgreSQL.
///
/// The queue is injected: production deployments hand in the NATS JetStream
/// queue, tests may hand in an in-process one. Either way the observable
/// contract is the same.
pub struct PostgresWorld {
    runs: PostgresRunStore,
    steps: PostgresStepStore,
    events: PostgresEventStore,
    hooks: PostgresHookStore,
    streamer: PostgresStreamer,
    queue: Arc<dyn Queue>,
}

impl PostgresWorld {
    /// Builds a World over an existing pool. Call [`crate::migrate`] first.
    #[must_use]
    pub fn new(pool: PgPool, queue: Arc<dyn Queue>) -> Self {
        let ids = Arc::new(IdGenerator::new());
        Self {
            runs: PostgresRunStore::new(pool.clone(), Arc::clone(&ids)),
            steps: PostgresStepStore::new(pool.clone()),
            events: PostgresEventStore::new(pool.clone(), Arc::clone(&ids)),
            hooks: PostgresHookStore::new(pool.clone()),
            streamer: PostgresStreamer::new(pool, ids),
            queue,
        }
    }
}

impl World for PostgresWorld {
    fn runs(&self) -> &dyn RunStore {
        &self.runs
    }

    fn steps(&self) -> &dyn StepStore {
        &self.steps
    }

    fn events(&self) -> &dyn EventStore {
        &self.events
    }

    fn hooks(&self) -> &dyn HookStore {
        &self.hooks
    }

    fn streamer(&self) -> &dyn Streamer {
        &self.streamer
    }

    fn queue(&self) -> &dyn Queue {
        self.queue.as_ref()
    }
}
