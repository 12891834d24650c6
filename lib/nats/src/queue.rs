//! JetStream-backed queue implementation.

use async_nats::jetstream;
use async_nats::jetstream::AckKind;
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock as StdRwLock};
use std::time::Duration;
use worldkit_contract::{
    EnqueueOptions, Enqueued, MessageContext, MessageHandler, Queue, QueueKind, QueueName,
};
use worldkit_core::{IdGenerator, MessageId, WorldError};

/// Subject prefix for queue messages.
const QUEUE_SUBJECT_PREFIX: &str = "world.queue";

/// Stream name for queue messages.
const QUEUE_STREAM_NAME: &str = "WORLD_QUEUE";

/// Broker-side deduplication window for `Nats-Msg-Id`.
const DUPLICATE_WINDOW: Duration = Duration::from_secs(120);

/// Deliveries per message before the broker stops redelivering.
const DEFAULT_MAX_DELIVER: i64 = 5;

/// Redelivery delay requested when a handler fails.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Configuration for the JetStream queue.
#[derive(Debug, Clone)]
pub struct NatsQueueConfig {
    /// NATS server URL.
    pub url: String,
    /// Deployment identity, used for the durable consumer name and logging.
    pub deployment_id: String,
    /// Stream name (defaults to WORLD_QUEUE).
    pub stream_name: Option<String>,
    /// Deliveries per message before permanent failure (defaults to 5,
    /// never below the contract's minimum of 3).
    pub max_deliver: Option<i64>,
}

impl NatsQueueConfig {
    /// Creates a config with the given NATS URL and deployment identity.
    #[must_use]
    pub fn new(url: impl Into<String>, deployment_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            deployment_id: deployment_id.into(),
            stream_name: None,
            max_deliver: None,
        }
    }

    fn stream(&self) -> &str {
        self.stream_name.as_deref().unwrap_or(QUEUE_STREAM_NAME)
    }

    fn max_deliver(&self) -> i64 {
        self.max_deliver
            .unwrap_or(DEFAULT_MAX_DELIVER)
            .max(i64::from(worldkit_contract::queue::MIN_DELIVERY_ATTEMPTS))
    }
}

/// The envelope a message travels in on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct WireMessage {
    message_id: MessageId,
    queue_name: QueueName,
    payload: JsonValue,
}

type HandlerMap = HashMap<QueueKind, Arc<dyn MessageHandler>>;

/// Queue over a JetStream work-queue stream.
pub struct NatsQueue {
    jetstream: jetstream::Context,
    config: NatsQueueConfig,
    ids: Arc<IdGenerator>,
    handlers: Arc<StdRwLock<HandlerMap>>,
}

impl NatsQueue {
    /// Connects to NATS and ensures the queue stream exists.
    ///
    /// # Errors
    ///
    /// Returns `Internal` when the connection or stream setup fails.
    pub async fn connect(config: NatsQueueConfig) -> Result<Self, WorldError> {
        let client = async_nats::connect(&config.url)
            .await
            .map_err(WorldError::internal)?;
        let jetstream = jetstream::new(client);

        let stream_config = jetstream::stream::Config {
            name: config.stream().to_string(),
            subjects: vec![format!("{QUEUE_SUBJECT_PREFIX}.>")],
            storage: jetstream::stream::StorageType::File,
            retention: jetstream::stream::RetentionPolicy::WorkQueue,
            duplicate_window: DUPLICATE_WINDOW,
            ..Default::default()
        };
        jetstream
            .get_or_create_stream(stream_config)
            .await
            .map_err(|e| WorldError::internal(format!("failed to create queue stream: {e}")))?;

        Ok(Self {
            jetstream,
            config,
            ids: Arc::new(IdGenerator::new()),
            handlers: Arc::new(StdRwLock::new(HashMap::new())),
        })
    }

    /// Returns the subject a queue's messages are published on.
    fn subject(queue_name: &QueueName) -> String {
        format!("{QUEUE_SUBJECT_PREFIX}.{queue_name}")
    }
}

#[async_trait]
impl Queue for NatsQueue {
    async fn enqueue(
        &self,
        queue_name: &QueueName,
        payload: JsonValue,
        options: EnqueueOptions,
    ) -> Result<Enqueued, WorldError> {
        // With an idempotency key the message id is derived from it, so the
        // broker's Nats-Msg-Id dedup drops the duplicate and the caller gets
        // the original id back either way.
        let message_id = match &options.idempotency_key {
            Some(key) => MessageId::from_idempotency_key(key),
            None => self.ids.message_id(),
        };

        let wire = WireMessage {
            message_id: message_id.clone(),
            queue_name: queue_name.clone(),
            payload,
        };
        let bytes = serde_json::to_vec(&wire).map_err(WorldError::internal)?;

        let mut headers = async_nats::HeaderMap::new();
        headers.insert(async_nats::header::NATS_MESSAGE_ID, message_id.as_str());

        let ack = self
            .jetstream
            .publish_with_headers(Self::subject(queue_name), headers, bytes.into())
            .await
            .map_err(WorldError::internal)?
            .await
            .map_err(WorldError::internal)?;

        if ack.duplicate {
            tracing::debug!(
                queue = %queue_name,
                message_id = %message_id,
                "duplicate enqueue suppressed by broker dedup"
            );
        }
        Ok(Enqueued { message_id })
    }

    fn register_handler(
        &self,
        kind: QueueKind,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), WorldError> {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if handlers.contains_key(&kind) {
            return Err(WorldError::conflict("queue handler", kind.prefix()));
        }
        handlers.insert(kind, handler);
        Ok(())
    }

    async fn start(&self) -> Result<(), WorldError> {
        let stream = self
            .jetstream
            .get_stream(self.config.stream())
            .await
            .map_err(|e| WorldError::internal(format!("failed to get queue stream: {e}")))?;

        let consumer = stream
            .get_or_create_consumer(
                &format!("worldd-{}", self.config.deployment_id),
                jetstream::consumer::pull::Config {
                    durable_name: Some(format!("worldd-{}", self.config.deployment_id)),
                    max_deliver: self.config.max_deliver(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| WorldError::internal(format!("failed to create consumer: {e}")))?;

        let handlers = Arc::clone(&self.handlers);
        let deployment_id = self.config.deployment_id.clone();
        tokio::spawn(async move {
            let mut messages = match consumer.messages().await {
                Ok(messages) => messages,
                Err(error) => {
                    tracing::error!(error = %error, "failed to open queue message stream");
                    return;
                }
            };
            while let Some(message) = messages.next().await {
                let message = match message {
                    Ok(message) => message,
                    Err(error) => {
                        tracing::warn!(error = %error, "queue message stream error");
                        continue;
                    }
                };
                deliver(&handlers, &deployment_id, message).await;
            }
            tracing::warn!(deployment_id = %deployment_id, "queue message stream ended");
        });

        tracing::info!(deployment_id = %self.config.deployment_id, "queue delivery started");
        Ok(())
    }

    fn deployment_id(&self) -> &str {
        &self.config.deployment_id
    }
}

/// Processes one JetStream delivery: decode, dispatch, ack or nak.
async fn deliver(
    handlers: &Arc<StdRwLock<HandlerMap>>,
    deployment_id: &str,
    message: jetstream::Message,
) {
    let attempt = message
        .info()
        .map(|info| u32::try_from(info.delivered).unwrap_or(u32::MAX))
        .unwrap_or(1);

    let wire: WireMessage = match serde_json::from_slice(&message.payload) {
        Ok(wire) => wire,
        Err(error) => {
            tracing::error!(error = %error, "undecodable queue message; terminating delivery");
            if let Err(error) = message.ack_with(AckKind::Term).await {
                tracing::warn!(error = %error, "failed to terminate message");
            }
            return;
        }
    };

    let handler = handlers
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&wire.queue_name.kind())
        .cloned();
    let Some(handler) = handler else {
        tracing::warn!(queue = %wire.queue_name, "no handler registered for queue kind");
        if let Err(error) = message.ack_with(AckKind::Nak(Some(RETRY_DELAY))).await {
            tracing::warn!(error = %error, "failed to nak message");
        }
        return;
    };

    let context = MessageContext {
        message_id: wire.message_id.clone(),
        queue_name: wire.queue_name.clone(),
        attempt,
    };
    match handler.handle(wire.payload, context).await {
        Ok(()) => {
            tracing::debug!(
                deployment_id = %deployment_id,
                message_id = %wire.message_id,
                attempt,
                "message handled"
            );
            if let Err(error) = message.ack().await {
                tracing::warn!(error = %error, "failed to ack message");
            }
        }
        Err(error) => {
            tracing::warn!(
                message_id = %wire.message_id,
                attempt,
                error = %error,
                "queue handler failed"
            );
            // Redelivery bumps the broker-side delivery count, which is the
            // next attempt number; max_deliver bounds permanent failure.
            if let Err(error) = message.ack_with(AckKind::Nak(Some(RETRY_DELAY))).await {
                tracing::warn!(error = %error, "failed to nak message");
            }
        }
    }
}
