//! NATS JetStream backend for the World queue contract.
//!
//! Messages are published onto a work-queue retention stream with the
//! message id as the `Nats-Msg-Id` header, so idempotent enqueues
//! deduplicate natively inside the broker's duplicate window. Delivery runs
//! through a durable pull consumer whose delivery count maps directly onto
//! the contract's attempt metadata.

pub mod queue;

pub use queue::{NatsQueue, NatsQueueConfig};
