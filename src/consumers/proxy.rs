//! Proxy consumer: the user-facing end of the bus.
//!
//! Routes user turns either directly back to the channel or onward to the
//! planner, shepherds plan approval, and forwards status traffic to the UI
//! surfaces. Terminal `agent_response` messages are reserved for the bridge
//! and are never polled here.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use crate::bus::envelope::{
    AgentResponseBody, ExecutionRequestBody, ExecutionStatusBody, Message, MessageKind,
    PlanRequestBody, PlanResultBody, SenderRole, UserTurn,
};
use crate::bus::router;
use crate::bus::store::QueueStore;
use crate::consumers::{MessageHandler, apply_allowlist};
use crate::error::{AgentError, HandlerError};
use crate::traits::{AgentCall, AgentInvoker, ChannelPort, surfaces_for};

/// Tools the proxy agent may be offered before per-message filtering.
const PROXY_TOOLS: [&str; 4] = ["memory_search", "memory_store", "web_search", "read_file"];

const HANDLED: [MessageKind; 5] = [
    MessageKind::UserMessage,
    MessageKind::PlanResult,
    MessageKind::ExecutionStatus,
    MessageKind::ApprovalRequest,
    MessageKind::SystemEvent,
];

/// Route decision the proxy agent returns for a user turn.
#[derive(Debug, Deserialize)]
struct ProxyDecision {
    route: String,
    #[serde(default)]
    response: String,
    #[serde(default)]
    memory_ops: Vec<Value>,
    #[serde(default)]
    description: Option<String>,
}

/// Handler for `proxy_queue`.
pub struct ProxyConsumer {
    store: Arc<QueueStore>,
    agent: Arc<dyn AgentInvoker>,
    channel: Arc<dyn ChannelPort>,
}

impl ProxyConsumer {
    /// Builds the proxy handler.
    #[must_use]
    pub fn new(
        store: Arc<QueueStore>,
        agent: Arc<dyn AgentInvoker>,
        channel: Arc<dyn ChannelPort>,
    ) -> Self {
        Self {
            store,
            agent,
            channel,
        }
    }

    async fn handle_user_message(&self, message: &Message) -> Result<(), HandlerError> {
        let turn: UserTurn = message.typed_payload().map_err(|e| HandlerError::payload(&e))?;
        let tools = apply_allowlist(&PROXY_TOOLS, &message.tool_allowlist);
        let reply = self
            .agent
            .invoke(AgentCall::new(turn.text.clone(), tools))
            .await?;

        let decision: ProxyDecision =
            serde_json::from_value(reply.output.clone()).map_err(|e| {
                HandlerError::Agent(AgentError::MalformedOutput {
                    detail: e.to_string(),
                })
            })?;

        match decision.route.as_str() {
            "planner" => {
                let body = PlanRequestBody {
                    description: decision.description.unwrap_or(turn.text),
                    consult: false,
                    autonomous: false,
                    goal_id: None,
                    context: turn.metadata,
                };
                let request = message.derived(
                    MessageKind::PlanRequest,
                    SenderRole::Proxy,
                    serde_json::to_value(&body).map_err(|e| HandlerError::payload(&e))?,
                );
                info!(
                    trace_id = %message.trace_id,
                    outcome = "routed_to_planner",
                    "user turn needs a plan"
                );
                self.store.enqueue(&router::stamp(request)).await?;
            }
            "direct" => {
                let body = AgentResponseBody {
                    text: decision.response,
                    memory_ops: decision.memory_ops,
                };
                let response = message.derived(
                    MessageKind::AgentResponse,
                    SenderRole::Proxy,
                    serde_json::to_value(&body).map_err(|e| HandlerError::payload(&e))?,
                );
                debug!(trace_id = %message.trace_id, outcome = "direct_reply", "answered directly");
                self.store.enqueue(&router::stamp(response)).await?;
            }
            other => {
                return Err(HandlerError::Agent(AgentError::MalformedOutput {
                    detail: format!("unknown route decision '{other}'"),
                }));
            }
        }
        Ok(())
    }

    async fn handle_plan_result(&self, message: &Message) -> Result<(), HandlerError> {
        let body: PlanResultBody = message.typed_payload().map_err(|e| HandlerError::payload(&e))?;
        let decision = self
            .channel
            .request_approval(message.trace_id, &message.payload)
            .await?;

        if let (true, Some(token)) = (decision.approved, decision.token) {
            let mut work_items = body.work_items;
            for item in &mut work_items {
                if item.approval_token.is_none() {
                    item.approval_token = Some(token.clone());
                }
            }
            let request_body = ExecutionRequestBody {
                work_items,
                description: String::new(),
                replan_depth: body.replan_depth,
            };
            let request = message
                .derived(
                    MessageKind::ExecutionRequest,
                    SenderRole::Proxy,
                    serde_json::to_value(&request_body).map_err(|e| HandlerError::payload(&e))?,
                )
                .with_approval_token(token);
            info!(
                trace_id = %message.trace_id,
                outcome = "plan_approved",
                "plan approved; dispatching execution"
            );
            self.store.enqueue(&router::stamp(request)).await?;
        } else {
            let response_body = AgentResponseBody {
                text: "The plan was not approved, so nothing was executed.".to_string(),
                memory_ops: Vec::new(),
            };
            let response = message.derived(
                MessageKind::AgentResponse,
                SenderRole::Proxy,
                serde_json::to_value(&response_body).map_err(|e| HandlerError::payload(&e))?,
            );
            info!(trace_id = %message.trace_id, outcome = "plan_declined", "plan declined");
            self.store.enqueue(&router::stamp(response)).await?;
        }
        Ok(())
    }

    async fn handle_execution_status(&self, message: &Message) -> Result<(), HandlerError> {
        let body: ExecutionStatusBody =
            message.typed_payload().map_err(|e| HandlerError::payload(&e))?;
        self.channel
            .route_status(message.trace_id, &message.payload, surfaces_for(body.status))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for ProxyConsumer {
    fn handled_kinds(&self) -> &[MessageKind] {
        &HANDLED
    }

    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        match message.kind {
            MessageKind::UserMessage => self.handle_user_message(message).await,
            MessageKind::PlanResult => self.handle_plan_result(message).await,
            MessageKind::ExecutionStatus => self.handle_execution_status(message).await,
            MessageKind::ApprovalRequest | MessageKind::SystemEvent => {
                // Informational pass-through to the channel.
                self.channel
                    .render_card(message.trace_id, &message.payload)
                    .await?;
                Ok(())
            }
            other => Err(HandlerError::Payload {
                detail: format!("proxy consumer cannot handle kind '{other}'"),
            }),
        }
    }
}
