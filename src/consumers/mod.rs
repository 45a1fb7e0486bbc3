//! Consumers: the shared lease loop and the per-queue handlers.
//!
//! Every consumer runs the same per-iteration protocol: lease, defend
//! against unhandled kinds, dead-letter exhausted messages, skip
//! already-processed ones, heartbeat while handling, then mark-processed and
//! ack on success or nack on failure. Kind-specific behavior lives in a
//! [`MessageHandler`] implementation per queue.

pub mod executor;
pub mod planner;
pub mod proxy;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::envelope::{Message, MessageKind, QueueName};
use crate::bus::store::QueueStore;
use crate::domain_types::{ConsumerName, LeaseId, MessageId};
use crate::error::{HandlerError, StoreError};
use crate::time_provider::SharedTimeProvider;

/// Fixed allowlist every research invocation is clamped to, regardless of
/// the message's own allowlist.
pub const RESEARCH_TOOL_ALLOWLIST: [&str; 3] = ["web_search", "read_file", "memory_search"];

/// Dead-letter reason for messages that exhausted their attempts.
pub const REASON_MAX_ATTEMPTS: &str = "max_attempts_exceeded";

/// Exponential idle backoff for empty polls.
#[derive(Debug, Clone, Copy)]
pub struct IdleBackoff {
    /// First delay after an empty poll.
    pub base: Duration,
    /// Multiplier applied per consecutive empty poll.
    pub multiplier: u32,
    /// Delay ceiling.
    pub cap: Duration,
}

impl Default for IdleBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            multiplier: 2,
            cap: Duration::from_secs(5),
        }
    }
}

impl IdleBackoff {
    /// Next delay after another empty poll.
    #[must_use]
    pub fn next(&self, current: Duration) -> Duration {
        current
            .saturating_mul(self.multiplier.max(1))
            .min(self.cap)
    }
}

/// Loop parameters shared by all consumers.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Name registered in the idempotency ledger.
    pub name: ConsumerName,
    /// Queue this consumer polls.
    pub queue: QueueName,
    /// Lease taken per message.
    pub lease_duration: Duration,
    /// Interval between lease extensions while handling.
    pub heartbeat_interval: Duration,
    /// Attempts before dead-lettering.
    pub max_attempts: u32,
    /// Idle backoff schedule.
    pub idle_backoff: IdleBackoff,
}

impl ConsumerConfig {
    /// Config with the documented defaults: 60 s lease, 20 s heartbeat,
    /// 5 attempts, 100 ms–5 s idle backoff.
    #[must_use]
    pub fn new(name: ConsumerName, queue: QueueName) -> Self {
        Self {
            name,
            queue,
            lease_duration: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(20),
            max_attempts: 5,
            idle_backoff: IdleBackoff::default(),
        }
    }
}

/// Kind-specific message handling for one queue.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Kinds this consumer processes; the lease loop polls only these.
    fn handled_kinds(&self) -> &[MessageKind];

    /// Processes one message. Success leads to mark-processed + ack;
    /// failure leads to nack and a later retry.
    async fn handle(&self, message: &Message) -> Result<(), HandlerError>;
}

/// The shared lease loop around a [`MessageHandler`].
pub struct Consumer {
    store: Arc<QueueStore>,
    handler: Arc<dyn MessageHandler>,
    config: ConsumerConfig,
    time: SharedTimeProvider,
}

impl Consumer {
    /// Builds a consumer.
    #[must_use]
    pub fn new(
        store: Arc<QueueStore>,
        handler: Arc<dyn MessageHandler>,
        config: ConsumerConfig,
        time: SharedTimeProvider,
    ) -> Self {
        Self {
            store,
            handler,
            config,
            time,
        }
    }

    /// The consumer's registered name.
    #[must_use]
    pub fn name(&self) -> &ConsumerName {
        &self.config.name
    }

    /// Runs the lease loop until shutdown is signalled. Returns `Err` only
    /// on store failure, which the orchestrator treats as fatal to this
    /// incarnation and restarts after a backoff.
    ///
    /// # Errors
    ///
    /// Returns the store error that aborted the loop.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), StoreError> {
        info!(consumer = %self.config.name, queue = %self.config.queue, "consumer started");
        let mut idle_delay = self.config.idle_backoff.base;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let leased = self
                .store
                .lease_handled(
                    self.config.queue,
                    self.handler.handled_kinds(),
                    self.config.lease_duration,
                )
                .await?;

            let Some(message) = leased else {
                tokio::select! {
                    () = self.time.sleep(idle_delay) => {}
                    _ = shutdown.changed() => {}
                }
                idle_delay = self.config.idle_backoff.next(idle_delay);
                continue;
            };

            idle_delay = self.config.idle_backoff.base;
            self.process(&message).await?;
        }

        info!(consumer = %self.config.name, "consumer stopped");
        Ok(())
    }

    /// One iteration of the per-message protocol. Handler failures nack;
    /// only store failures propagate.
    async fn process(&self, message: &Message) -> Result<(), StoreError> {
        // The filtered lease makes this unreachable under the static router;
        // a misrouted message still must not wedge the queue.
        if !self.handler.handled_kinds().contains(&message.kind) {
            warn!(
                consumer = %self.config.name,
                message_id = %message.id,
                kind = %message.kind,
                outcome = "unhandled_kind",
                "leased a kind this consumer does not handle"
            );
            return self.store.nack(message.id).await;
        }

        if message.attempt_count >= self.config.max_attempts {
            return self.store.dead_letter(message.id, REASON_MAX_ATTEMPTS).await;
        }

        // Side effects already committed on a prior attempt that died
        // before acking.
        if self.store.has_processed(&self.config.name, message.id).await? {
            debug!(
                consumer = %self.config.name,
                message_id = %message.id,
                outcome = "already_processed",
                "skipping replayed message"
            );
            return self.store.ack(message.id).await;
        }

        let heartbeat = message
            .lease_id
            .map(|lease_id| self.spawn_heartbeat(message.id, lease_id));

        let started = self.time.instant();
        let result = self.handler.handle(message).await;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        if let Some(task) = heartbeat {
            task.abort();
        }

        match result {
            Ok(()) => {
                self.store
                    .mark_processed(&self.config.name, message.id)
                    .await?;
                self.store.ack(message.id).await?;
                info!(
                    consumer = %self.config.name,
                    message_id = %message.id,
                    kind = %message.kind,
                    trace_id = %message.trace_id,
                    attempt_count = message.attempt_count,
                    elapsed_ms,
                    outcome = "ok",
                    "message processed"
                );
            }
            Err(error) => {
                warn!(
                    consumer = %self.config.name,
                    message_id = %message.id,
                    kind = %message.kind,
                    trace_id = %message.trace_id,
                    attempt_count = message.attempt_count,
                    elapsed_ms,
                    outcome = "handler_error",
                    error = %error,
                    "handler failed; nacking"
                );
                self.store.nack(message.id).await?;
            }
        }

        Ok(())
    }

    /// Extends the lease every heartbeat interval until aborted. The
    /// heartbeat is bound to the lease this iteration took; the store
    /// ignores extensions for a lease that is no longer ours.
    fn spawn_heartbeat(&self, id: MessageId, lease_id: LeaseId) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let time = Arc::clone(&self.time);
        let interval = self.config.heartbeat_interval;
        let extend = self.config.lease_duration;
        tokio::spawn(async move {
            loop {
                time.sleep(interval).await;
                if let Err(error) = store.heartbeat(id, lease_id, extend).await {
                    warn!(message_id = %id, error = %error, "heartbeat failed; stopping");
                    break;
                }
            }
        })
    }
}

/// Filters an agent's base toolset by a message allowlist. An empty
/// allowlist leaves the toolset unrestricted; a non-empty one removes every
/// tool not named, so the agent cannot observe filtered-out tools.
#[must_use]
pub fn apply_allowlist(base_tools: &[&str], allowlist: &[String]) -> Vec<String> {
    if allowlist.is_empty() {
        return base_tools.iter().map(ToString::to_string).collect();
    }
    base_tools
        .iter()
        .filter(|tool| allowlist.iter().any(|allowed| allowed == *tool))
        .map(ToString::to_string)
        .collect()
}

/// Clamps a toolset to the fixed research allowlist.
#[must_use]
pub fn clamp_to_research_allowlist(tools: &[String]) -> Vec<String> {
    tools
        .iter()
        .filter(|tool| RESEARCH_TOOL_ALLOWLIST.contains(&tool.as_str()))
        .cloned()
        .collect()
}
