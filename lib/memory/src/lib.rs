//! In-process reference backend for the World contract.
//!
//! Everything lives in process memory behind async locks: runs, steps,
//! events, and hooks in ordered maps; streams as chunk vectors with a
//! broadcast notification channel; the queue as an in-process delivery loop
//! with retry and idempotency-key deduplication.
//!
//! This backend is the conformance baseline the other backends are measured
//! against, and doubles as the test-mode World for consumers that do not
//! want external infrastructure in their test runs.

pub mod events;
pub mod hooks;
pub mod queue;
pub mod runs;
pub mod steps;
pub mod streamer;
pub mod world;

pub use events::MemoryEventStore;
pub use hooks::MemoryHookStore;
pub use queue::MemoryQueue;
pub use runs::MemoryRunStore;
pub use steps::MemoryStepStore;
pub use streamer::MemoryStreamer;
pub use world::MemoryWorld;
