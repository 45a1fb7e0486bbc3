//! Base consumer protocol: crash-resume idempotency, dead-lettering after
//! exhausted attempts, and leaving bridge-reserved kinds untouched.

mod common;

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use test_log::test;
use tokio::sync::watch;

use common::{open_store, routed};
use switchyard::bus::envelope::{Message, MessageKind, QueueName, SenderRole};
use switchyard::consumers::{Consumer, ConsumerConfig, MessageHandler};
use switchyard::domain_types::{ConsumerName, TraceId};
use switchyard::error::HandlerError;
use switchyard::time_provider::mock_time_provider;

/// Handler that counts successful side effects and can fail on demand.
struct CountingHandler {
    kinds: Vec<MessageKind>,
    effects: AtomicU32,
    fail_always: bool,
}

impl CountingHandler {
    fn succeeding(kinds: Vec<MessageKind>) -> Self {
        Self {
            kinds,
            effects: AtomicU32::new(0),
            fail_always: false,
        }
    }

    fn failing(kinds: Vec<MessageKind>) -> Self {
        Self {
            kinds,
            effects: AtomicU32::new(0),
            fail_always: true,
        }
    }

    fn effects(&self) -> u32 {
        self.effects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageHandler for CountingHandler {
    fn handled_kinds(&self) -> &[MessageKind] {
        &self.kinds
    }

    async fn handle(&self, _message: &Message) -> Result<(), HandlerError> {
        if self.fail_always {
            return Err(HandlerError::Payload {
                detail: "scripted failure".to_string(),
            });
        }
        self.effects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn config(name: &str, queue: QueueName) -> ConsumerConfig {
    ConsumerConfig::new(ConsumerName::try_new(name.to_string()).unwrap(), queue)
}

async fn drain(
    consumer: Arc<Consumer>,
    store: &switchyard::bus::store::QueueStore,
    queue: QueueName,
    until_pending: u64,
) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = {
        let consumer = Arc::clone(&consumer);
        tokio::spawn(async move { consumer.run(shutdown_rx).await })
    };

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        if store.pending_count(queue).await.unwrap() <= until_pending {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "queue did not drain in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    shutdown_tx.send(true).unwrap();
    task.await.unwrap().unwrap();
}

#[test(tokio::test)]
async fn test_crash_after_mark_processed_does_not_repeat_side_effects() {
    let time = mock_time_provider();
    let (store, _dir) = open_store(Arc::clone(&time) as _).await;
    let name = ConsumerName::try_new("proxy".to_string()).unwrap();

    let message = routed(
        MessageKind::UserMessage,
        SenderRole::User,
        TraceId::generate(),
        json!({"text": "hi"}),
    );
    store.enqueue(&message).await.unwrap();

    // Simulate the crashed predecessor: it leased the message, committed
    // its side effects to the ledger, and died before acking.
    let leased = store
        .lease(QueueName::Proxy, Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();
    store.mark_processed(&name, leased.id).await.unwrap();
    time.advance(Duration::from_secs(61));
    assert_eq!(store.requeue_expired().await.unwrap(), 1);

    // The restarted consumer sees the ledger entry, skips the handler, and
    // acks: external effects stay at exactly one (zero from this handler).
    let handler = Arc::new(CountingHandler::succeeding(vec![MessageKind::UserMessage]));
    let consumer = Arc::new(Consumer::new(
        Arc::clone(&store),
        Arc::clone(&handler) as _,
        config("proxy", QueueName::Proxy),
        time,
    ));
    drain(consumer, &store, QueueName::Proxy, 0).await;

    assert_eq!(handler.effects(), 0);
    assert_eq!(store.pending_count(QueueName::Proxy).await.unwrap(), 0);
}

#[test(tokio::test)]
async fn test_fresh_message_is_processed_exactly_once() {
    let time = mock_time_provider();
    let (store, _dir) = open_store(Arc::clone(&time) as _).await;
    store
        .enqueue(&routed(
            MessageKind::UserMessage,
            SenderRole::User,
            TraceId::generate(),
            json!({"text": "hi"}),
        ))
        .await
        .unwrap();

    let handler = Arc::new(CountingHandler::succeeding(vec![MessageKind::UserMessage]));
    let consumer = Arc::new(Consumer::new(
        Arc::clone(&store),
        Arc::clone(&handler) as _,
        config("proxy", QueueName::Proxy),
        time,
    ));
    drain(consumer, &store, QueueName::Proxy, 0).await;

    assert_eq!(handler.effects(), 1);
}

#[test(tokio::test)]
async fn test_persistent_handler_failure_dead_letters_after_max_attempts() {
    let time = mock_time_provider();
    let (store, _dir) = open_store(Arc::clone(&time) as _).await;
    store
        .enqueue(&routed(
            MessageKind::UserMessage,
            SenderRole::User,
            TraceId::generate(),
            json!({"text": "doomed"}),
        ))
        .await
        .unwrap();

    let handler = Arc::new(CountingHandler::failing(vec![MessageKind::UserMessage]));
    let consumer = Arc::new(Consumer::new(
        Arc::clone(&store),
        Arc::clone(&handler) as _,
        config("proxy", QueueName::Proxy),
        time,
    ));
    drain(consumer, &store, QueueName::Proxy, 0).await;

    assert_eq!(handler.effects(), 0);
    assert_eq!(store.pending_count(QueueName::Proxy).await.unwrap(), 0);
    assert_eq!(store.dead_letter_count(QueueName::Proxy).await.unwrap(), 1);
}

#[test(tokio::test)]
async fn test_bridge_reserved_kind_is_left_untouched() {
    let time = mock_time_provider();
    let (store, _dir) = open_store(Arc::clone(&time) as _).await;
    let trace = TraceId::generate();

    store
        .enqueue(&routed(
            MessageKind::AgentResponse,
            SenderRole::Proxy,
            trace,
            json!({"text": "terminal"}),
        ))
        .await
        .unwrap();
    store
        .enqueue(&routed(
            MessageKind::UserMessage,
            SenderRole::User,
            trace,
            json!({"text": "work"}),
        ))
        .await
        .unwrap();

    let handler = Arc::new(CountingHandler::succeeding(vec![MessageKind::UserMessage]));
    let consumer = Arc::new(Consumer::new(
        Arc::clone(&store),
        Arc::clone(&handler) as _,
        config("proxy", QueueName::Proxy),
        Arc::clone(&time) as _,
    ));
    drain(consumer, &store, QueueName::Proxy, 1).await;

    assert_eq!(handler.effects(), 1);

    // The terminal reply is still available, never nacked, and collectable.
    let terminal = store
        .lease_filtered(
            QueueName::Proxy,
            trace,
            MessageKind::AgentResponse,
            Duration::from_secs(60),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(terminal.attempt_count, 0);
}
