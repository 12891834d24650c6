//! In-process queue with at-least-once delivery, retry, and idempotency.
//!
//! Enqueued messages flow through an unbounded channel into a delivery loop
//! started by [`MemoryQueue::start`]. Failed deliveries are re-enqueued with
//! an incremented attempt and exponential backoff; idempotency keys are held
//! in a dedup set until the message settles.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock as StdRwLock};
use tokio::sync::mpsc;
use tokio::time::Duration;
use worldkit_contract::{
    EnqueueOptions, Enqueued, MessageContext, MessageHandler, Queue, QueueKind, QueueName,
};
use worldkit_core::{IdGenerator, MessageId, WorldError};

/// Deliveries per message before it fails permanently.
const MAX_DELIVERY_ATTEMPTS: u32 = 5;

/// Base delay for the exponential retry backoff.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

struct Delivery {
    message_id: MessageId,
    queue_name: QueueName,
    payload: JsonValue,
    attempt: u32,
    idempotency_key: Option<String>,
}

type HandlerMap = HashMap<QueueKind, Arc<dyn MessageHandler>>;
type DedupMap = HashMap<String, MessageId>;

/// Queue backed by an in-process delivery loop.
pub struct MemoryQueue {
    deployment_id: String,
    ids: Arc<IdGenerator>,
    handlers: Arc<StdRwLock<HandlerMap>>,
    inflight: Arc<StdMutex<DedupMap>>,
    tx: mpsc::UnboundedSender<Delivery>,
    rx: StdMutex<Option<mpsc::UnboundedReceiver<Delivery>>>,
}

impl MemoryQueue {
    pub fn new(deployment_id: impl Into<String>, ids: Arc<IdGenerator>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            deployment_id: deployment_id.into(),
            ids,
            handlers: Arc::new(StdRwLock::new(HashMap::new())),
            inflight: Arc::new(StdMutex::new(HashMap::new())),
            tx,
            rx: StdMutex::new(Some(rx)),
        }
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn enqueue(
        &self,
        queue_name: &QueueName,
        payload: JsonValue,
        options: EnqueueOptions,
    ) -> Result<Enqueued, WorldError> {
        let message_id = match &options.idempotency_key {
            Some(key) => {
                let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(existing) = inflight.get(key) {
                    tracing::debug!(
                        queue = %queue_name,
                        message_id = %existing,
                        "duplicate enqueue suppressed by idempotency key"
                    );
                    return Ok(Enqueued {
                        message_id: existing.clone(),
                    });
                }
                let message_id = MessageId::from_idempotency_key(key);
                inflight.insert(key.clone(), message_id.clone());
                message_id
            }
            None => self.ids.message_id(),
        };

        let delivery = Delivery {
            message_id: message_id.clone(),
            queue_name: queue_name.clone(),
            payload,
            attempt: 1,
            idempotency_key: options.idempotency_key,
        };
        self.tx
            .send(delivery)
            .map_err(|_| WorldError::internal("queue delivery loop is gone"))?;
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
        let receiver = self
            .rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut receiver) = receiver else {
            // Delivery loop already running.
            return Ok(());
        };

        let worker = DeliveryWorker {
            deployment_id: self.deployment_id.clone(),
            handlers: Arc::clone(&self.handlers),
            inflight: Arc::clone(&self.inflight),
            tx: self.tx.clone(),
        };
        tokio::spawn(async move {
            while let Some(delivery) = receiver.recv().await {
                let worker = worker.clone();
                tokio::spawn(async move { worker.deliver(delivery).await });
            }
        });
        tracing::info!(deployment_id = %self.deployment_id, "queue delivery started");
        Ok(())
    }

    fn deployment_id(&self) -> &str {
        &self.deployment_id
    }
}

#[derive(Clone)]
struct DeliveryWorker {
    deployment_id: String,
    handlers: Arc<StdRwLock<HandlerMap>>,
    inflight: Arc<StdMutex<DedupMap>>,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl DeliveryWorker {
    async fn deliver(&self, delivery: Delivery) {
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&delivery.queue_name.kind())
            .cloned();
        let Some(handler) = handler else {
            tracing::warn!(
                queue = %delivery.queue_name,
                attempt = delivery.attempt,
                "no handler registered for queue kind; retrying"
            );
            self.retry(delivery);
            return;
        };

        let context = MessageContext {
            message_id: delivery.message_id.clone(),
            queue_name: delivery.queue_name.clone(),
            attempt: delivery.attempt,
        };
        match handler.handle(delivery.payload.clone(), context).await {
            Ok(()) => {
                tracing::debug!(
                    deployment_id = %self.deployment_id,
                    message_id = %delivery.message_id,
                    attempt = delivery.attempt,
                    "message handled"
                );
                self.settle(&delivery);
            }
            Err(error) => {
                tracing::warn!(
                    message_id = %delivery.message_id,
                    attempt = delivery.attempt,
                    error = %error,
                    "queue handler failed"
                );
                self.retry(delivery);
            }
        }
    }

    fn retry(&self, mut delivery: Delivery) {
        if delivery.attempt >= MAX_DELIVERY_ATTEMPTS {
            tracing::error!(
                message_id = %delivery.message_id,
                queue = %delivery.queue_name,
                attempts = delivery.attempt,
                "message failed permanently"
            );
            self.settle(&delivery);
            return;
        }

        let delay = RETRY_BASE_DELAY * 2u32.pow(delivery.attempt - 1);
        delivery.attempt += 1;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(delivery);
        });
    }

    /// Releases the idempotency key once the message has settled, success
    /// or permanent failure.
    fn settle(&self, delivery: &Delivery) {
        if let Some(key) = &delivery.idempotency_key {
            self.inflight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Notify;
    use tokio::time::{sleep, timeout};

    struct RecordingHandler {
        contexts: StdMutex<Vec<MessageContext>>,
        payloads: StdMutex<Vec<JsonValue>>,
        fail_attempts: u32,
        notify: Notify,
    }

    impl RecordingHandler {
        fn new(fail_attempts: u32) -> Arc<Self> {
            Arc::new(Self {
                contexts: StdMutex::new(Vec::new()),
                payloads: StdMutex::new(Vec::new()),
                fail_attempts,
                notify: Notify::new(),
            })
        }

        fn calls(&self) -> Vec<MessageContext> {
            self.contexts.lock().unwrap_or_else(PoisonError::into_inner).clone()
        }
    }

    #[async_trait]
    impl MessageHandler for RecordingHandler {
        async fn handle(&self, payload: JsonValue, context: MessageContext) -> Result<(), WorldError> {
            let attempt = context.attempt;
            self.contexts.lock().unwrap_or_else(PoisonError::into_inner).push(context);
            self.payloads.lock().unwrap_or_else(PoisonError::into_inner).push(payload);
            self.notify.notify_waiters();
            if attempt <= self.fail_attempts {
                return Err(WorldError::internal("induced failure"));
            }
            Ok(())
        }
    }

    fn queue() -> MemoryQueue {
        MemoryQueue::new("test-deployment", Arc::new(IdGenerator::new()))
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        timeout(Duration::from_secs(2), async {
            while !condition() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition should hold before the timeout");
    }

    #[tokio::test]
    async fn delivers_with_first_attempt_metadata() {
        let queue = queue();
        let handler = RecordingHandler::new(0);
        queue
            .register_handler(QueueKind::Step, handler.clone())
            .expect("register");
        queue.start().await.expect("start");

        let name = QueueName::parse("__wkf_step_X").expect("name");
        let enqueued = queue
            .enqueue(&name, serde_json::json!({"p": 1}), EnqueueOptions::default())
            .await
            .expect("enqueue");

        wait_for(|| !handler.calls().is_empty()).await;
        let calls = handler.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].attempt, 1);
        assert_eq!(calls[0].queue_name, name);
        assert_eq!(calls[0].message_id, enqueued.message_id);

        let payloads = handler
            .payloads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        assert_eq!(payloads, vec![serde_json::json!({"p": 1})]);
    }

    #[tokio::test]
    async fn failed_delivery_retries_with_incremented_attempt() {
        let queue = queue();
        let handler = RecordingHandler::new(2);
        queue
            .register_handler(QueueKind::Workflow, handler.clone())
            .expect("register");
        queue.start().await.expect("start");

        let name = QueueName::parse("__wkf_workflow_w").expect("name");
        queue
            .enqueue(&name, JsonValue::Null, EnqueueOptions::default())
            .await
            .expect("enqueue");

        wait_for(|| handler.calls().len() >= 3).await;
        let attempts: Vec<u32> = handler.calls().iter().map(|c| c.attempt).collect();
        assert_eq!(&attempts[..3], &[1, 2, 3]);
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_is_suppressed() {
        let queue = queue();
        let handler = RecordingHandler::new(0);
        queue
            .register_handler(QueueKind::Step, handler.clone())
            .expect("register");
        queue.start().await.expect("start");

        let name = QueueName::parse("__wkf_step_X").expect("name");
        let options = EnqueueOptions {
            idempotency_key: Some("k1".to_string()),
        };
        let first = queue
            .enqueue(&name, JsonValue::Null, options.clone())
            .await
            .expect("enqueue");
        let second = queue
            .enqueue(&name, JsonValue::Null, options)
            .await
            .expect("enqueue");
        assert_eq!(first.message_id, second.message_id);
        assert_eq!(first.message_id.as_str(), "msg_k1");

        wait_for(|| !handler.calls().is_empty()).await;
        sleep(Duration::from_millis(100)).await;
        assert_eq!(handler.calls().len(), 1);
    }

    #[tokio::test]
    async fn key_is_released_after_settlement() {
        let queue = queue();
        let handler = RecordingHandler::new(0);
        queue
            .register_handler(QueueKind::Step, handler.clone())
            .expect("register");
        queue.start().await.expect("start");

        let name = QueueName::parse("__wkf_step_X").expect("name");
        let options = EnqueueOptions {
            idempotency_key: Some("k1".to_string()),
        };
        queue
            .enqueue(&name, JsonValue::Null, options.clone())
            .await
            .expect("enqueue");
        wait_for(|| !handler.calls().is_empty()).await;

        // Once the first delivery settled, the key may be reused.
        wait_for(|| {
            queue
                .inflight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_empty()
        })
        .await;
        queue
            .enqueue(&name, JsonValue::Null, options)
            .await
            .expect("enqueue");
        wait_for(|| handler.calls().len() >= 2).await;
    }

    #[tokio::test]
    async fn second_handler_for_a_kind_is_a_conflict() {
        let queue = queue();
        queue
            .register_handler(QueueKind::Step, RecordingHandler::new(0))
            .expect("register");
        let err = queue
            .register_handler(QueueKind::Step, RecordingHandler::new(0))
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let queue = queue();
        queue.start().await.expect("start");
        queue.start().await.expect("second start");
        assert_eq!(queue.deployment_id(), "test-deployment");
    }
}
