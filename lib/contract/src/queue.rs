//! The queue contract: prefix-typed message dispatch with retry and
//! idempotency metadata.
//!
//! Queue names carry a reserved prefix identifying their kind; messages are
//! delivered at least once to the handler registered for that kind. Handler
//! failures are retried with an incremented attempt counter and are never
//! surfaced to the enqueuer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::Arc;
use worldkit_core::{MessageId, WorldError};

/// Reserved prefix for workflow-level queues.
pub const WORKFLOW_QUEUE_PREFIX: &str = "__wkf_workflow_";

/// Reserved prefix for step-level queues.
pub const STEP_QUEUE_PREFIX: &str = "__wkf_step_";

/// Minimum delivery attempts before a message may fail permanently.
pub const MIN_DELIVERY_ATTEMPTS: u32 = 3;

/// The kind encoded in a queue name's reserved prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    /// Workflow-level messages.
    Workflow,
    /// Step-level messages.
    Step,
}

impl QueueKind {
    /// Returns the reserved name prefix for this kind.
    #[must_use]
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Workflow => WORKFLOW_QUEUE_PREFIX,
            Self::Step => STEP_QUEUE_PREFIX,
        }
    }
}

/// A validated, prefix-typed queue name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueName(String);

impl QueueName {
    /// Validates a raw queue name.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when the name does not begin with a
    /// recognized prefix.
    pub fn parse(name: &str) -> Result<Self, WorldError> {
        if name.starts_with(WORKFLOW_QUEUE_PREFIX) || name.starts_with(STEP_QUEUE_PREFIX) {
            Ok(Self(name.to_string()))
        } else {
            Err(WorldError::invalid_argument(format!(
                "queue name '{name}' does not begin with a recognized prefix"
            )))
        }
    }

    /// Returns the kind encoded in the name's prefix.
    #[must_use]
    pub fn kind(&self) -> QueueKind {
        if self.0.starts_with(STEP_QUEUE_PREFIX) {
            QueueKind::Step
        } else {
            QueueKind::Workflow
        }
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Delivery metadata handed to a handler alongside the payload.
#[derive(Debug, Clone)]
pub struct MessageContext {
    /// The message being delivered.
    pub message_id: MessageId,
    /// Queue the message was enqueued on.
    pub queue_name: QueueName,
    /// Delivery attempt, starting at 1.
    pub attempt: u32,
}

/// Receives messages for one queue kind.
///
/// Handlers signal success by returning `Ok(())` and failure by returning
/// any error; a failure triggers redelivery with an incremented attempt.
/// Handlers must be idempotent on message id (or idempotency key).
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Processes one delivery.
    async fn handle(&self, payload: JsonValue, context: MessageContext) -> Result<(), WorldError>;
}

/// Options for [`Queue::enqueue`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Deduplication key: a second enqueue with the same key within the
    /// dedup window is a no-op returning the original message id.
    pub idempotency_key: Option<String>,
}

/// Result of an enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enqueued {
    /// The assigned (or deduplicated) message id.
    pub message_id: MessageId,
}

/// At-least-once message dispatch to registered handlers.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Accepts a message for delivery.
    async fn enqueue(
        &self,
        queue_name: &QueueName,
        payload: JsonValue,
        options: EnqueueOptions,
    ) -> Result<Enqueued, WorldError>;

    /// Installs the handler for every queue of the given kind. Exactly one
    /// handler per kind.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` when a handler is already registered for the kind.
    fn register_handler(
        &self,
        kind: QueueKind,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), WorldError>;

    /// Begins delivery; returns once the delivery subsystem is ready.
    async fn start(&self) -> Result<(), WorldError>;

    /// Identifies the process/binding for logging and routing.
    fn deployment_id(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_prefix_parses() {
        let name = QueueName::parse("__wkf_workflow_orders").expect("should parse");
        assert_eq!(name.kind(), QueueKind::Workflow);
        assert_eq!(name.as_str(), "__wkf_workflow_orders");
    }

    #[test]
    fn step_prefix_parses() {
        let name = QueueName::parse("__wkf_step_X").expect("should parse");
        assert_eq!(name.kind(), QueueKind::Step);
    }

    #[test]
    fn unrecognized_prefix_is_rejected() {
        let err = QueueName::parse("orders").unwrap_err();
        assert!(matches!(err, WorldError::InvalidArgument { .. }));

        let err = QueueName::parse("__wkf_other_x").unwrap_err();
        assert!(matches!(err, WorldError::InvalidArgument { .. }));
    }

    #[test]
    fn kind_prefix_roundtrip() {
        assert_eq!(QueueKind::Workflow.prefix(), WORKFLOW_QUEUE_PREFIX);
        assert_eq!(QueueKind::Step.prefix(), STEP_QUEUE_PREFIX);
    }
}
