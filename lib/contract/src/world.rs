//! The aggregate World surface.

use crate::queue::Queue;
use crate::stores::{EventStore, HookStore, RunStore, StepStore};
use crate::stream::Streamer;

/// The uniform surface a workflow runtime consumes: storage, streaming, and
/// queuing behind one object. Each backend crate supplies a concrete type
/// implementing this trait; observable behavior is backend-independent.
pub trait World: Send + Sync {
    /// Run storage and state machine.
    fn runs(&self) -> &dyn RunStore;

    /// Step storage and state machine.
    fn steps(&self) -> &dyn StepStore;

    /// Append-only event log.
    fn events(&self) -> &dyn EventStore;

    /// Hook registry.
    fn hooks(&self) -> &dyn HookStore;

    /// Chunked byte transport.
    fn streamer(&self) -> &dyn Streamer;

    /// Message queue.
    fn queue(&self) -> &dyn Queue;

    /// Identifies the process/binding for logging and routing.
    fn deployment_id(&self) -> &str {
        self.queue().deployment_id()
    }
}
