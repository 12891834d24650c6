//! The in-memory World aggregation.

use crate::events::MemoryEventStore;
use crate::hooks::MemoryHookStore;
use crate::queue::MemoryQueue;
use crate::runs::MemoryRunStore;
use crate::steps::MemoryStepStore;
use crate::streamer::MemoryStreamer;
use std::sync::Arc;
use worldkit_contract::{EventStore, HookStore, Queue, RunStore, StepStore, Streamer, World};
use worldkit_core::IdGenerator;

/// A complete World held in process memory.
///
/// All subsystems share one id generator, so ids across entity kinds follow
/// a single monotonic clock.
pub struct MemoryWorld {
    runs: MemoryRunStore,
    steps: MemoryStepStore,
    events: MemoryEventStore,
    hooks: MemoryHookStore,
    streamer: MemoryStreamer,
    queue: MemoryQueue,
}

impl MemoryWorld {
    /// Builds a fresh, empty World.
    #[must_use]
    pub fn new(deployment_id: impl Into<String>) -> Self {
        let ids = Arc::new(IdGenerator::new());
        let hooks = MemoryHookStore::default();
        Self {
            runs: MemoryRunStore::new(Arc::clone(&ids), hooks.clone()),
            steps: MemoryStepStore::default(),
            events: MemoryEventStore::new(Arc::clone(&ids)),
            hooks,
            streamer: MemoryStreamer::new(Arc::clone(&ids)),
            queue: MemoryQueue::new(deployment_id, ids),
        }
    }
}

impl World for MemoryWorld {
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
        &self.queue
    }
}
