//! Planner consumer: plans, consults, research orchestration, and replans.
//!
//! Plan requests reset the per-trace research state machine. When the
//! planner wants research, the requests are dispatched through the tracker
//! (which enforces dedup and caps) and the handler completes; the plan is
//! finalized later, when results arrive or the research deadline passes.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{info, warn};

use crate::bus::envelope::{
    GuidanceBody, Message, MessageKind, PlanRequestBody, PlanResultBody, ReplanRequestBody,
    ResearchRequestBody, ResearchResultBody, SenderRole,
};
use crate::bus::router;
use crate::bus::store::QueueStore;
use crate::consumers::{MessageHandler, apply_allowlist};
use crate::error::HandlerError;
use crate::research::{Advance, DeadlineCheck, ResearchContext, ResearchTracker};
use crate::time_provider::SharedTimeProvider;
use crate::traits::{AgentCall, AgentInvoker};
use crate::work::WorkItem;

/// Tools the planner agent may be offered before per-message filtering.
const PLANNER_TOOLS: [&str; 3] = ["memory_search", "read_file", "web_search"];

const HANDLED: [MessageKind; 3] = [
    MessageKind::PlanRequest,
    MessageKind::ResearchResult,
    MessageKind::ReplanRequest,
];

/// Structured output the planner agent returns.
#[derive(Debug, Default, Deserialize)]
struct PlannerOutput {
    /// Research the planner wants before committing to a plan.
    #[serde(default)]
    research: Vec<crate::research::ResearchIntent>,
    /// The plan, when the planner is ready to produce one.
    #[serde(default)]
    plan: Value,
    /// Work items realizing the plan.
    #[serde(default)]
    work_items: Vec<WorkItem>,
    /// Guidance text, for consult requests.
    #[serde(default)]
    guidance: String,
}

/// Handler for `planner_queue`.
pub struct PlannerConsumer {
    store: Arc<QueueStore>,
    agent: Arc<dyn AgentInvoker>,
    research: Arc<ResearchTracker>,
    time: SharedTimeProvider,
}

impl PlannerConsumer {
    /// Builds the planner handler.
    #[must_use]
    pub fn new(
        store: Arc<QueueStore>,
        agent: Arc<dyn AgentInvoker>,
        research: Arc<ResearchTracker>,
        time: SharedTimeProvider,
    ) -> Self {
        Self {
            store,
            agent,
            research,
            time,
        }
    }

    async fn invoke_planner(
        &self,
        message: &Message,
        prompt: String,
    ) -> Result<(PlannerOutput, u64), HandlerError> {
        let tools = apply_allowlist(&PLANNER_TOOLS, &message.tool_allowlist);
        let reply = self.agent.invoke(AgentCall::new(prompt, tools)).await?;
        let output: PlannerOutput = serde_json::from_value(reply.output.clone())
            .unwrap_or_default();
        Ok((output, reply.tokens_used))
    }

    async fn handle_plan_request(&self, message: &Message) -> Result<(), HandlerError> {
        let body: PlanRequestBody =
            message.typed_payload().map_err(|e| HandlerError::payload(&e))?;

        if body.consult {
            return self.handle_consult(message, &body).await;
        }

        self.research.reset(message.trace_id, body.description.clone());
        let (output, _tokens) = self
            .invoke_planner(message, planning_prompt(&body))
            .await?;

        if output.research.is_empty() {
            return self
                .emit_plan_result(message, output, false, false, 0)
                .await;
        }
        self.dispatch_research(message, output.research).await
    }

    /// Dispatches research intents through the tracker (dedup and caps) and
    /// arms the deadline watchdog. When everything collapses onto prior
    /// requests, the plan finalizes immediately.
    async fn dispatch_research(
        &self,
        message: &Message,
        intents: Vec<crate::research::ResearchIntent>,
    ) -> Result<(), HandlerError> {
        let accepted = self
            .research
            .begin_dispatch(message.trace_id, intents, self.time.now());
        if accepted.is_empty() {
            let context = ResearchContext::default();
            return self.finalize_with_research(message, &context).await;
        }

        for (intent, digest) in accepted {
            let request_body = ResearchRequestBody {
                query: intent.query,
                return_format: intent.return_format,
                max_tokens: intent.max_tokens,
                query_digest: digest,
            };
            let request = message.derived(
                MessageKind::ResearchRequest,
                SenderRole::Planner,
                serde_json::to_value(&request_body).map_err(|e| HandlerError::payload(&e))?,
            );
            self.store.enqueue(&router::stamp(request)).await?;
        }
        info!(
            trace_id = %message.trace_id,
            in_flight = self.research.in_flight(message.trace_id),
            outcome = "research_dispatched",
            "plan deferred for research"
        );

        self.spawn_research_watchdog(message.clone());
        Ok(())
    }

    async fn handle_consult(
        &self,
        message: &Message,
        body: &PlanRequestBody,
    ) -> Result<(), HandlerError> {
        let prompt = format!(
            "An executor attempt failed. Advise a concrete adjustment for the retry.\n\
             Task: {}\nFailure context: {}",
            body.description, body.context
        );
        let (output, tokens_used) = self.invoke_planner(message, prompt).await?;
        let guidance = GuidanceBody {
            guidance: output.guidance,
            tokens_used,
        };
        let reply = message.derived(
            MessageKind::PlannerGuidance,
            SenderRole::Planner,
            serde_json::to_value(&guidance).map_err(|e| HandlerError::payload(&e))?,
        );
        info!(trace_id = %message.trace_id, outcome = "guidance_sent", "consult answered");
        self.store.enqueue(&router::stamp(reply)).await?;
        Ok(())
    }

    async fn handle_research_result(&self, message: &Message) -> Result<(), HandlerError> {
        let body: ResearchResultBody =
            message.typed_payload().map_err(|e| HandlerError::payload(&e))?;

        let content = if body.failed {
            json!({ "failed": true, "content": body.content })
        } else {
            body.content
        };

        let advance = self.research.record_result(
            message.trace_id,
            message.id,
            &body.query_digest,
            content,
            self.time.now(),
        );

        match advance {
            Advance::Pending => Ok(()),
            Advance::Finalize(context) => self.finalize_with_research(message, &context).await,
        }
    }

    async fn handle_replan_request(&self, message: &Message) -> Result<(), HandlerError> {
        let body: ReplanRequestBody =
            message.typed_payload().map_err(|e| HandlerError::payload(&e))?;
        // No tracker reset here: the research request cap spans replans.
        self.research
            .mark_replan(message.trace_id, body.description.clone(), body.replan_depth);
        let prompt = format!(
            "Previous strategies for this task failed. Produce an alternative plan that \
             avoids the failed approach.\nTask: {}\nFailure history: {}",
            body.description,
            Value::Array(body.failure_history.clone())
        );
        let (output, _tokens) = self.invoke_planner(message, prompt).await?;
        info!(
            trace_id = %message.trace_id,
            replan_depth = body.replan_depth,
            outcome = "replanned",
            "alternative plan produced"
        );
        if output.research.is_empty() {
            return self
                .emit_plan_result(message, output, false, true, body.replan_depth)
                .await;
        }
        self.dispatch_research(message, output.research).await
    }

    async fn finalize_with_research(
        &self,
        message: &Message,
        context: &ResearchContext,
    ) -> Result<(), HandlerError> {
        let description = self.research.description(message.trace_id);
        let (is_replan, replan_depth) = self.research.replan_info(message.trace_id);
        let research: Vec<&Value> = context.results.iter().map(|(_, value)| value).collect();
        let prompt = format!(
            "Produce the final plan.\nTask: {description}\nResearch findings: {}",
            serde_json::to_value(&research).map_err(|e| HandlerError::payload(&e))?
        );
        let (output, _tokens) = self.invoke_planner(message, prompt).await?;
        self.emit_plan_result(message, output, context.partial, is_replan, replan_depth)
            .await
    }

    async fn emit_plan_result(
        &self,
        message: &Message,
        output: PlannerOutput,
        partial_research: bool,
        is_replan: bool,
        replan_depth: u32,
    ) -> Result<(), HandlerError> {
        let body = PlanResultBody {
            plan: output.plan,
            work_items: output.work_items,
            partial_research,
            is_replan,
            replan_depth,
        };
        let result = message.derived(
            MessageKind::PlanResult,
            SenderRole::Planner,
            serde_json::to_value(&body).map_err(|e| HandlerError::payload(&e))?,
        );
        info!(
            trace_id = %message.trace_id,
            partial_research,
            is_replan,
            outcome = "plan_emitted",
            "plan result enqueued"
        );
        self.store.enqueue(&router::stamp(result)).await?;
        Ok(())
    }

    /// Covers the zero-results case: if no research result ever arrives, the
    /// deadline still finalizes the plan with `partial_research: true`. The
    /// deadline is judged by the injected clock, so the watchdog re-arms
    /// until the clock actually passes it.
    fn spawn_research_watchdog(&self, origin: Message) {
        let store = Arc::clone(&self.store);
        let agent = Arc::clone(&self.agent);
        let research = Arc::clone(&self.research);
        let time = Arc::clone(&self.time);
        tokio::spawn(async move {
            let context = loop {
                match research.check_deadline(origin.trace_id, time.now()) {
                    DeadlineCheck::Settled => return,
                    DeadlineCheck::Expired(context) => break context,
                    DeadlineCheck::Pending(remaining) => time.sleep(remaining).await,
                }
            };
            let handler = PlannerConsumer {
                store,
                agent,
                research,
                time,
            };
            if let Err(error) = handler.finalize_with_research(&origin, &context).await {
                warn!(
                    trace_id = %origin.trace_id,
                    error = %error,
                    "research deadline finalization failed"
                );
            }
        });
    }
}

fn planning_prompt(body: &PlanRequestBody) -> String {
    if body.autonomous {
        format!(
            "Plan the following autonomous goal.\nGoal: {}\nContext: {}",
            body.description, body.context
        )
    } else {
        format!(
            "Plan the following task.\nTask: {}\nContext: {}",
            body.description, body.context
        )
    }
}

#[async_trait]
impl MessageHandler for PlannerConsumer {
    fn handled_kinds(&self) -> &[MessageKind] {
        &HANDLED
    }

    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        match message.kind {
            MessageKind::PlanRequest => self.handle_plan_request(message).await,
            MessageKind::ResearchResult => self.handle_research_result(message).await,
            MessageKind::ReplanRequest => self.handle_replan_request(message).await,
            other => Err(HandlerError::Payload {
                detail: format!("planner consumer cannot handle kind '{other}'"),
            }),
        }
    }
}
