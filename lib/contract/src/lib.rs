//! The World contract for durable workflow backends.
//!
//! A **World** is the uniform surface an upstream workflow runtime consumes
//! to persist run state, enqueue scheduled work, and stream byte output.
//! This crate defines that surface:
//!
//! - **Entities**: runs, steps, events, hooks, stream chunks, queue messages
//! - **State machines**: status transitions with derived timestamps
//! - **Traits**: one per subsystem, plus the [`World`] aggregation
//!
//! Backend crates (`worldkit-memory`, `worldkit-postgres`, `worldkit-nats`)
//! implement these traits over their respective stores; the observable
//! behavior is backend-independent.

pub mod event;
pub mod hook;
pub mod queue;
pub mod run;
pub mod step;
pub mod stores;
pub mod stream;
pub mod world;

pub use event::{CreateEventRequest, Event, ListByCorrelationParams, ListEventsParams};
pub use hook::{CreateHookRequest, Hook, ListHooksParams};
pub use queue::{
    EnqueueOptions, Enqueued, MessageContext, MessageHandler, Queue, QueueKind, QueueName,
};
pub use run::{
    CreateRunRequest, GetRunOptions, ListRunsParams, ResolveData, RunPatch, RunStatus, WorkflowRun,
};
pub use step::{CreateStepRequest, ListStepsParams, Step, StepPatch, StepStatus};
pub use stores::{EventStore, HookStore, RunStore, StepStore};
pub use stream::{ByteStream, ReadStreamOptions, RunIdHandle, StreamChunk, StreamPayload, Streamer};
pub use world::World;
