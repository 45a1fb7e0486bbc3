//! Cross-queue request/response managers.
//!
//! Three flows share one shape: enqueue a request through the router, then
//! poll a reply queue with a filtered lease until a deadline. All
//! communication goes through the store, which is what breaks the logical
//! cycle between these managers and the executor consumer.

use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::bus::envelope::{
    ApprovalRequestBody, Message, MessageKind, PlanRequestBody, QueueName, ReplanRequestBody,
    SenderRole,
};
use crate::bus::router;
use crate::bus::store::QueueStore;
use crate::error::{ErrorPayload, StoreError};
use crate::time_provider::SharedTimeProvider;
use crate::work::Gate;

/// How long the cascade waits for planner guidance.
pub const CONSULT_TIMEOUT: Duration = Duration::from_secs(90);

/// Poll interval while waiting for a reply on the runtime queue.
pub const REPLY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Maximum replans per trace; with the original plan this allows three
/// distinct strategies.
pub const MAX_REPLAN_DEPTH: u32 = 2;

const REPLY_LEASE: Duration = Duration::from_secs(60);

/// Polls a reply queue for a trace-and-kind match until the deadline.
/// Non-matching messages are never leased, so concurrent traces cannot
/// disturb each other. The reply is acked before being returned.
///
/// The deadline is judged by the injected clock, like lease expiry.
async fn poll_reply(
    store: &QueueStore,
    time: &SharedTimeProvider,
    queue: QueueName,
    origin: &Message,
    kind: MessageKind,
    timeout: Duration,
) -> Result<Option<Message>, StoreError> {
    let deadline = time.now()
        + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::seconds(90));
    loop {
        if let Some(reply) = store
            .lease_filtered(queue, origin.trace_id, kind, REPLY_LEASE)
            .await?
        {
            store.ack(reply.id).await?;
            return Ok(Some(reply));
        }
        if time.now() >= deadline {
            return Ok(None);
        }
        time.sleep(REPLY_POLL_INTERVAL).await;
    }
}

/// Asks the planner for guidance after executor failures.
#[derive(Clone)]
pub struct ConsultManager {
    store: Arc<QueueStore>,
    time: SharedTimeProvider,
}

impl ConsultManager {
    /// Creates a consult manager over the shared store.
    #[must_use]
    pub fn new(store: Arc<QueueStore>, time: SharedTimeProvider) -> Self {
        Self { store, time }
    }

    /// Sends a `plan_request` marked `consult: true` and waits up to
    /// [`CONSULT_TIMEOUT`] for the matching `planner_guidance` reply on the
    /// runtime queue. Returns the guidance payload, or `None` on timeout.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub async fn request_guidance(
        &self,
        origin: &Message,
        description: &str,
        failure: &ErrorPayload,
    ) -> Result<Option<Value>, StoreError> {
        let body = PlanRequestBody {
            description: description.to_string(),
            consult: true,
            autonomous: false,
            goal_id: None,
            context: json!({ "failure": failure }),
        };
        let request = origin.derived(
            MessageKind::PlanRequest,
            SenderRole::Runtime,
            serde_json::to_value(&body)?,
        );
        info!(
            message_id = %request.id,
            trace_id = %request.trace_id,
            kind = %request.kind,
            outcome = "consult_requested",
            "cascade consulting planner"
        );
        self.store.enqueue(&router::stamp(request)).await?;

        let reply = poll_reply(
            &self.store,
            &self.time,
            QueueName::Runtime,
            origin,
            MessageKind::PlannerGuidance,
            CONSULT_TIMEOUT,
        )
        .await?;

        match reply {
            Some(message) => {
                debug!(trace_id = %origin.trace_id, outcome = "guidance_received", "consult answered");
                Ok(Some(message.payload))
            }
            None => {
                debug!(trace_id = %origin.trace_id, outcome = "consult_timeout", "consult timed out");
                Ok(None)
            }
        }
    }
}

/// Dispatches replan requests, bounded by [`MAX_REPLAN_DEPTH`].
#[derive(Clone)]
pub struct ReplanManager {
    store: Arc<QueueStore>,
}

impl ReplanManager {
    /// Creates a replan manager over the shared store.
    #[must_use]
    pub fn new(store: Arc<QueueStore>) -> Self {
        Self { store }
    }

    /// Sends a `replan_request` carrying the full failure history, unless
    /// the depth bound is exhausted. Returns whether a replan was
    /// dispatched.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub async fn dispatch_replan(
        &self,
        origin: &Message,
        description: &str,
        failure_history: Vec<Value>,
        next_depth: u32,
    ) -> Result<bool, StoreError> {
        if next_depth > MAX_REPLAN_DEPTH {
            info!(
                trace_id = %origin.trace_id,
                replan_depth = next_depth,
                outcome = "replan_exhausted",
                "replan depth bound reached"
            );
            return Ok(false);
        }

        let body = ReplanRequestBody {
            description: description.to_string(),
            failure_history,
            replan_depth: next_depth,
        };
        let request = origin.derived(
            MessageKind::ReplanRequest,
            SenderRole::Runtime,
            serde_json::to_value(&body)?,
        );
        info!(
            message_id = %request.id,
            trace_id = %request.trace_id,
            replan_depth = next_depth,
            outcome = "replan_dispatched",
            "replan requested"
        );
        self.store.enqueue(&router::stamp(request)).await?;
        Ok(true)
    }
}

/// Raises gate approval requests to the user and waits for the decision.
#[derive(Clone)]
pub struct ApprovalRelay {
    store: Arc<QueueStore>,
    time: SharedTimeProvider,
}

impl ApprovalRelay {
    /// Creates an approval relay over the shared store.
    #[must_use]
    pub fn new(store: Arc<QueueStore>, time: SharedTimeProvider) -> Self {
        Self { store, time }
    }

    /// Emits an `approval_request` for a gate and polls the runtime queue
    /// for the matching `approval_result`. Deny and timeout both return
    /// `false`.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub async fn request_gate_approval(
        &self,
        origin: &Message,
        gate: &Gate,
    ) -> Result<bool, StoreError> {
        let body = ApprovalRequestBody {
            reason: format!("gate '{}' requires approval", gate.label),
            gate_label: Some(gate.label.clone()),
        };
        let request = origin.derived(
            MessageKind::ApprovalRequest,
            SenderRole::Runtime,
            serde_json::to_value(&body)?,
        );
        self.store.enqueue(&router::stamp(request)).await?;

        let reply = poll_reply(
            &self.store,
            &self.time,
            QueueName::Runtime,
            origin,
            MessageKind::ApprovalResult,
            CONSULT_TIMEOUT,
        )
        .await?;

        let approved = reply
            .and_then(|message| message.payload.get("approved").and_then(Value::as_bool))
            .unwrap_or(false);
        info!(
            trace_id = %origin.trace_id,
            gate = %gate.label,
            outcome = if approved { "gate_approved" } else { "gate_denied" },
            "gate approval decision"
        );
        Ok(approved)
    }
}
