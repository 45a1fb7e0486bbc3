//! Executor consumer: approved execution and research mode.
//!
//! Execution requests carrying work items run through wave scheduling,
//! conflict-aware dispatch into the pool, and the per-item executor.
//! Requests without items take the direct path: one agent invocation wrapped
//! in the self-healing cascade. Research requests run the executor agent in
//! research mode with the clamped allowlist.

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{info, warn};

use crate::bus::envelope::{
    ExecutionRequestBody, ExecutionStatusBody, Message, MessageKind, ResearchRequestBody,
    ResearchResultBody, SenderRole,
};
use crate::bus::router;
use crate::bus::store::QueueStore;
use crate::consult::{ConsultManager, ReplanManager};
use crate::consumers::{MessageHandler, apply_allowlist, clamp_to_research_allowlist};
use crate::domain_types::TaskId;
use crate::error::{ErrorPayload, FailureKind, HandlerError};
use crate::traits::{AgentCall, AgentInvoker};
use crate::work::item_executor::{EXECUTOR_TOOLS, ItemOutcome, WorkItemExecutor};
use crate::work::pool::{ExecutorPool, PriorityClass, conflict_groups};
use crate::work::runner::Runner;
use crate::work::{BudgetUsed, OnFailure, WorkItem, WorkStatus, build_waves};
use std::sync::Mutex as StdMutex;

const HANDLED: [MessageKind; 2] = [MessageKind::ExecutionRequest, MessageKind::ResearchRequest];

/// Prompt prefix for research-mode invocations.
const RESEARCH_MODE_MARKER: &str = "RESEARCH MODE";

/// Direct-path attempts before the cascade consults the planner.
const DIRECT_ATTEMPTS: u32 = 2;

/// Handler for `executor_queue`.
pub struct ExecutorConsumer {
    store: Arc<QueueStore>,
    agent: Arc<dyn AgentInvoker>,
    work: Option<Arc<WorkItemExecutor>>,
    pool: ExecutorPool,
    consult: ConsultManager,
    replan: ReplanManager,
    runner: Runner,
}

impl ExecutorConsumer {
    /// Builds the executor handler. When `work` is `None`, every execution
    /// request takes the direct path.
    #[must_use]
    pub fn new(
        store: Arc<QueueStore>,
        agent: Arc<dyn AgentInvoker>,
        work: Option<Arc<WorkItemExecutor>>,
        pool: ExecutorPool,
        consult: ConsultManager,
        replan: ReplanManager,
        runner: Runner,
    ) -> Self {
        Self {
            store,
            agent,
            work,
            pool,
            consult,
            replan,
            runner,
        }
    }

    async fn handle_execution_request(&self, message: &Message) -> Result<(), HandlerError> {
        let body: ExecutionRequestBody =
            message.typed_payload().map_err(|e| HandlerError::payload(&e))?;

        match (&self.work, body.work_items.is_empty()) {
            (Some(work), false) => {
                self.run_work_items(message, &body, Arc::clone(work)).await
            }
            _ => self.direct_execute(message, &body).await,
        }
    }

    /// Wave scheduling: items whose dependencies are complete dispatch
    /// together; within a wave, conflict groups serialize and disjoint
    /// groups run concurrently under the pool's caps.
    async fn run_work_items(
        &self,
        message: &Message,
        body: &ExecutionRequestBody,
        work: Arc<WorkItemExecutor>,
    ) -> Result<(), HandlerError> {
        let waves = match build_waves(&body.work_items) {
            Ok(waves) => waves,
            Err(error) => {
                warn!(
                    trace_id = %message.trace_id,
                    error = %error,
                    outcome = "structural_error",
                    "execution request has a broken dependency graph"
                );
                for item in &body.work_items {
                    self.emit_status(
                        message,
                        Some(item),
                        &ExecutionStatusBody {
                            work_item_id: Some(item.id.clone()),
                            status: WorkStatus::Failed,
                            detail: Some(error.to_string()),
                            escalated: false,
                            replan_dispatched: false,
                            error: None,
                            budget_used: None,
                            plan_budget_used: None,
                        },
                    )
                    .await?;
                }
                return Ok(());
            }
        };

        for wave in waves {
            let groups = conflict_groups(&wave);
            let group_runs = groups.into_iter().map(|group| {
                let wave = &wave;
                let work = Arc::clone(&work);
                async move {
                    for index in group {
                        let item = &wave[index];
                        if let Err(error) = self
                            .run_item(message, item, body.replan_depth, Arc::clone(&work))
                            .await
                        {
                            return Err(error);
                        }
                    }
                    Ok(())
                }
            });

            for result in join_all(group_runs).await {
                result?;
            }
        }
        Ok(())
    }

    async fn run_item(
        &self,
        message: &Message,
        item: &WorkItem,
        replan_depth: u32,
        work: Arc<WorkItemExecutor>,
    ) -> Result<(), HandlerError> {
        self.emit_status(
            message,
            Some(item),
            &ExecutionStatusBody {
                work_item_id: Some(item.id.clone()),
                status: WorkStatus::Running,
                detail: None,
                escalated: false,
                replan_dispatched: false,
                error: None,
                budget_used: None,
                plan_budget_used: None,
            },
        )
        .await?;

        let task_id =
            TaskId::try_new(item.id.to_string()).map_err(|error| HandlerError::Internal {
                detail: format!("work item id unusable as task id: {error}"),
            })?;
        let cancel = self.pool.register_cancel(task_id.clone());

        let permit = self
            .pool
            .acquire(&item.scope_id, PriorityClass::ApprovedExecution)
            .await
            .map_err(|error| HandlerError::Internal {
                detail: error.to_string(),
            })?;
        let outcome = work.execute(message, item, replan_depth, cancel).await;
        drop(permit);
        self.pool.clear_cancel(&task_id);

        let outcome = outcome?;
        self.emit_item_outcome(message, item, &outcome).await
    }

    async fn emit_item_outcome(
        &self,
        message: &Message,
        item: &WorkItem,
        outcome: &ItemOutcome,
    ) -> Result<(), HandlerError> {
        self.emit_status(
            message,
            Some(item),
            &ExecutionStatusBody {
                work_item_id: Some(item.id.clone()),
                status: outcome.status,
                detail: outcome.error.as_ref().map(|error| error.message.clone()),
                escalated: outcome.escalated,
                replan_dispatched: outcome.replan_dispatched,
                error: outcome.error.clone(),
                budget_used: Some(outcome.budget_used),
                plan_budget_used: Some(outcome.plan_budget_used),
            },
        )
        .await
    }

    /// The direct path: retried executor invocations under the runner's
    /// backoff, then the cascade on persistent failure.
    async fn direct_execute(
        &self,
        message: &Message,
        body: &ExecutionRequestBody,
    ) -> Result<(), HandlerError> {
        let description = if body.description.is_empty() {
            message.payload.to_string()
        } else {
            body.description.clone()
        };
        let tools = apply_allowlist(&EXECUTOR_TOOLS, &message.tool_allowlist);
        let mut plan_budget_used = BudgetUsed::default();

        // Shared between retry closures; the runner owns the backoff.
        let attempt_state: Arc<StdMutex<(BudgetUsed, Vec<Value>)>> =
            Arc::new(StdMutex::new((BudgetUsed::default(), Vec::new())));

        let outcome = self
            .runner
            .run(OnFailure::Retry, DIRECT_ATTEMPTS, |_| {
                let agent = Arc::clone(&self.agent);
                let state = Arc::clone(&attempt_state);
                let call = AgentCall::new(description.clone(), tools.clone());
                async move {
                    // Transport errors are retryable in this path; they are
                    // folded into the domain taxonomy instead of nacking.
                    let reply = agent.invoke(call).await.map_err(|error| {
                        ErrorPayload::new(
                            FailureKind::ToolFailure,
                            error.to_string(),
                            "executor",
                            true,
                        )
                    })?;
                    let mut state = state.lock().expect("attempt state lock poisoned");
                    state.0.executor_runs += 1;
                    state.0.tokens += reply.tokens_used;
                    match reply.failure {
                        None => Ok(()),
                        Some(failure) => {
                            state.1.push(json!(failure));
                            Err(failure)
                        }
                    }
                }
            })
            .await;

        let (mut budget_used, mut history) = {
            let state = attempt_state.lock().expect("attempt state lock poisoned");
            (state.0, state.1.clone())
        };
        budget_used.attempts = outcome.attempts;

        if outcome.status == WorkStatus::Done {
            return self
                .emit_direct_status(message, WorkStatus::Done, None, budget_used, plan_budget_used)
                .await;
        }
        let failure = outcome.last_error.unwrap_or_else(|| {
            ErrorPayload::new(
                FailureKind::ToolFailure,
                "executor failed without detail",
                "executor",
                true,
            )
        });

        // Self-healing cascade: consult, guided retry, replan, escalate.
        plan_budget_used.planner_calls += 1;
        let guidance = self
            .consult
            .request_guidance(message, &description, &failure)
            .await?;

        let mut last_error = failure;

        if let Some(payload) = guidance {
            plan_budget_used.tokens += payload
                .get("tokens_used")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            let text = payload
                .get("guidance")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let prompt = format!("{description}\n\nPlanner guidance: {text}");
            let retry = self.agent.invoke(AgentCall::new(prompt, tools)).await?;
            budget_used.executor_runs += 1;
            budget_used.tokens += retry.tokens_used;

            match retry.failure {
                None => {
                    info!(
                        trace_id = %message.trace_id,
                        outcome = "guided_retry_succeeded",
                        "cascade recovered via planner guidance"
                    );
                    return self
                        .emit_direct_status(
                            message,
                            WorkStatus::Done,
                            None,
                            budget_used,
                            plan_budget_used,
                        )
                        .await;
                }
                Some(failure) => {
                    history.push(json!(failure));
                    last_error = failure;
                }
            }
        }

        let next_depth = body.replan_depth + 1;
        let replanned = self
            .replan
            .dispatch_replan(message, &description, history, next_depth)
            .await?;
        if replanned {
            plan_budget_used.planner_calls += 1;
            return self
                .emit_direct_status_full(
                    message,
                    WorkStatus::Failed,
                    Some(last_error),
                    false,
                    true,
                    budget_used,
                    plan_budget_used,
                )
                .await;
        }

        self.emit_direct_status_full(
            message,
            WorkStatus::Failed,
            Some(last_error),
            true,
            false,
            budget_used,
            plan_budget_used,
        )
        .await
    }

    async fn emit_direct_status(
        &self,
        message: &Message,
        status: WorkStatus,
        error: Option<ErrorPayload>,
        budget_used: BudgetUsed,
        plan_budget_used: BudgetUsed,
    ) -> Result<(), HandlerError> {
        self.emit_direct_status_full(
            message,
            status,
            error,
            false,
            false,
            budget_used,
            plan_budget_used,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn emit_direct_status_full(
        &self,
        message: &Message,
        status: WorkStatus,
        error: Option<ErrorPayload>,
        escalated: bool,
        replan_dispatched: bool,
        budget_used: BudgetUsed,
        plan_budget_used: BudgetUsed,
    ) -> Result<(), HandlerError> {
        self.emit_status(
            message,
            None,
            &ExecutionStatusBody {
                work_item_id: None,
                status,
                detail: error.as_ref().map(|failure| failure.message.clone()),
                escalated,
                replan_dispatched,
                error,
                budget_used: Some(budget_used),
                plan_budget_used: Some(plan_budget_used),
            },
        )
        .await
    }

    async fn emit_status(
        &self,
        message: &Message,
        item: Option<&WorkItem>,
        body: &ExecutionStatusBody,
    ) -> Result<(), HandlerError> {
        let mut status = message.derived(
            MessageKind::ExecutionStatus,
            SenderRole::Executor,
            serde_json::to_value(body).map_err(|e| HandlerError::payload(&e))?,
        );
        if let Some(item) = item {
            status.work_item_id = Some(item.id.clone());
        }
        info!(
            trace_id = %message.trace_id,
            status = %body.status,
            escalated = body.escalated,
            outcome = "status_emitted",
            "execution status enqueued"
        );
        self.store.enqueue(&router::stamp(status)).await?;
        Ok(())
    }

    async fn handle_research_request(&self, message: &Message) -> Result<(), HandlerError> {
        let body: ResearchRequestBody =
            message.typed_payload().map_err(|e| HandlerError::payload(&e))?;

        // Research runs with the fixed allowlist no matter what the message
        // grants.
        let tools =
            clamp_to_research_allowlist(&apply_allowlist(&EXECUTOR_TOOLS, &message.tool_allowlist));
        let prompt = format!(
            "{RESEARCH_MODE_MARKER}\nAnswer the research question below. \
             Respond in the requested format and stay within {} tokens.\nQuestion: {}\nFormat: {}",
            body.max_tokens, body.query, body.return_format
        );

        let reply = self.agent.invoke(AgentCall::new(prompt, tools)).await?;
        let result_body = ResearchResultBody {
            query_digest: body.query_digest,
            content: reply.output.clone(),
            tokens_used: reply.tokens_used,
            failed: reply.is_failure(),
        };
        let result = message.derived(
            MessageKind::ResearchResult,
            SenderRole::Executor,
            serde_json::to_value(&result_body).map_err(|e| HandlerError::payload(&e))?,
        );
        info!(
            trace_id = %message.trace_id,
            failed = result_body.failed,
            outcome = "research_answered",
            "research result enqueued"
        );
        self.store.enqueue(&router::stamp(result)).await?;
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for ExecutorConsumer {
    fn handled_kinds(&self) -> &[MessageKind] {
        &HANDLED
    }

    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        match message.kind {
            MessageKind::ExecutionRequest => self.handle_execution_request(message).await,
            MessageKind::ResearchRequest => self.handle_research_request(message).await,
            other => Err(HandlerError::Payload {
                detail: format!("executor consumer cannot handle kind '{other}'"),
            }),
        }
    }
}
