//! Per-item execution: approval binding, gates, the attempt loop,
//! verification, and the mirrored self-healing cascade.

use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::bus::envelope::Message;
use crate::consult::{ApprovalRelay, ConsultManager, ReplanManager};
use crate::consumers::apply_allowlist;
use crate::error::{ErrorPayload, FailureKind, HandlerError};
use crate::time_provider::SharedTimeProvider;
use crate::traits::{AgentCall, AgentInvoker, ApprovalVerifier, SandboxManager, VerificationRunner};
use crate::work::{
    BudgetUsed, ExecutorType, Gate, GateAction, GateTrigger, OnFailure, WorkItem, WorkStatus,
};

/// Tools the executor agent may be offered before per-message filtering.
pub(crate) const EXECUTOR_TOOLS: [&str; 5] = [
    "shell_exec",
    "read_file",
    "write_file",
    "web_search",
    "memory_search",
];

/// Final accounting for one work item.
#[derive(Debug, Clone)]
pub struct ItemOutcome {
    /// Terminal status.
    pub status: WorkStatus,
    /// True when every recovery step was exhausted.
    pub escalated: bool,
    /// True when a replan was dispatched instead of escalating.
    pub replan_dispatched: bool,
    /// Failure behind a non-`done` status.
    pub error: Option<ErrorPayload>,
    /// Consumption charged to the work item.
    pub budget_used: BudgetUsed,
    /// Consumption charged to the plan (consult/replan work).
    pub plan_budget_used: BudgetUsed,
}

impl ItemOutcome {
    fn done(budget_used: BudgetUsed, plan_budget_used: BudgetUsed) -> Self {
        Self {
            status: WorkStatus::Done,
            escalated: false,
            replan_dispatched: false,
            error: None,
            budget_used,
            plan_budget_used,
        }
    }

    fn blocked(error: ErrorPayload, budget_used: BudgetUsed) -> Self {
        Self {
            status: WorkStatus::Blocked,
            escalated: false,
            replan_dispatched: false,
            error: Some(error),
            budget_used,
            plan_budget_used: BudgetUsed::default(),
        }
    }
}

/// Executes one work item end to end.
pub struct WorkItemExecutor {
    agent: Arc<dyn AgentInvoker>,
    approvals: Arc<dyn ApprovalVerifier>,
    verifier: Arc<dyn VerificationRunner>,
    sandbox: Arc<dyn SandboxManager>,
    consult: ConsultManager,
    replan: ReplanManager,
    relay: ApprovalRelay,
    time: SharedTimeProvider,
    artifacts_root: PathBuf,
}

impl WorkItemExecutor {
    /// Builds the work-item executor.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent: Arc<dyn AgentInvoker>,
        approvals: Arc<dyn ApprovalVerifier>,
        verifier: Arc<dyn VerificationRunner>,
        sandbox: Arc<dyn SandboxManager>,
        consult: ConsultManager,
        replan: ReplanManager,
        relay: ApprovalRelay,
        time: SharedTimeProvider,
        artifacts_root: PathBuf,
    ) -> Self {
        Self {
            agent,
            approvals,
            verifier,
            sandbox,
            consult,
            replan,
            relay,
            time,
            artifacts_root,
        }
    }

    /// Runs the item: approval, `on_tool_call` gates, the budgeted attempt
    /// loop with verification, and the cascade on exhaustion.
    ///
    /// # Errors
    ///
    /// Returns an error on seam or store failure; domain failures are
    /// reported in the outcome instead.
    pub async fn execute(
        &self,
        origin: &Message,
        item: &WorkItem,
        replan_depth: u32,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<ItemOutcome, HandlerError> {
        let mut budget_used = BudgetUsed::default();
        let mut plan_budget_used = BudgetUsed::default();

        // Every side-effecting action is gated on a verified approval token.
        let Some(token) = item
            .approval_token
            .clone()
            .or_else(|| origin.approval_token.clone())
        else {
            return Ok(ItemOutcome::blocked(
                ErrorPayload::new(
                    FailureKind::ApprovalDenied,
                    "work item carries no approval token",
                    "runtime",
                    false,
                ),
                budget_used,
            ));
        };
        let check = self.approvals.check(&token, item).await?;
        if !check.ok {
            info!(
                trace_id = %origin.trace_id,
                work_item = %item.id,
                outcome = "approval_rejected",
                "approval token failed verification"
            );
            return Ok(ItemOutcome::blocked(
                ErrorPayload::new(
                    FailureKind::ApprovalDenied,
                    check
                        .reason
                        .unwrap_or_else(|| "approval token rejected".to_string()),
                    "runtime",
                    false,
                ),
                budget_used,
            ));
        }

        for gate in item.gates_for(GateTrigger::OnToolCall) {
            if let Some(blocked) = self.evaluate_gate(origin, item, gate).await? {
                return Ok(ItemOutcome::blocked(blocked, budget_used));
            }
        }

        let started = self.time.instant();
        let mut history: Vec<Value> = Vec::new();
        let mut last_error: Option<ErrorPayload> = None;

        // The item's failure policy bounds the inner loop; only the
        // recovering policies enter the cascade afterwards.
        let allowed_attempts = match item.on_failure {
            OnFailure::Retry => item.budget.max_attempts,
            OnFailure::Escalate => item.budget.max_attempts.min(2),
            OnFailure::Report | OnFailure::Pause => 1,
        };

        while budget_used.attempts < allowed_attempts && !budget_used.exceeds(&item.budget) {
            if *cancel.borrow() {
                return Ok(self.cancelled(budget_used, plan_budget_used));
            }

            let attempt = self
                .run_once(origin, item, None, &mut budget_used, &mut cancel)
                .await?;
            budget_used.wall_seconds = started.elapsed().as_secs();

            match attempt {
                Ok(()) => return Ok(ItemOutcome::done(budget_used, plan_budget_used)),
                Err(failure) => {
                    if failure.message == "cancelled" {
                        return Ok(self.cancelled(budget_used, plan_budget_used));
                    }
                    history.push(json!(failure));
                    for gate in item.gates_for(GateTrigger::AfterStep) {
                        if let Some(blocked) = self.evaluate_gate(origin, item, gate).await? {
                            return Ok(ItemOutcome::blocked(blocked, budget_used));
                        }
                    }
                    last_error = Some(failure);
                }
            }
        }

        let exhausted = last_error.unwrap_or_else(|| {
            ErrorPayload::new(
                FailureKind::BudgetExceeded,
                "budget exhausted before any attempt ran",
                "runtime",
                false,
            )
        });

        match item.on_failure {
            OnFailure::Report => Ok(ItemOutcome {
                status: WorkStatus::Failed,
                escalated: false,
                replan_dispatched: false,
                error: Some(exhausted),
                budget_used,
                plan_budget_used,
            }),
            OnFailure::Pause => Ok(ItemOutcome {
                status: WorkStatus::Stuck,
                escalated: false,
                replan_dispatched: false,
                error: Some(exhausted),
                budget_used,
                plan_budget_used,
            }),
            OnFailure::Retry | OnFailure::Escalate => {
                self.cascade(
                    origin,
                    item,
                    replan_depth,
                    exhausted,
                    history,
                    budget_used,
                    plan_budget_used,
                    &mut cancel,
                )
                .await
            }
        }
    }

    /// The mirrored cascade: consult, guided retry, replan, escalate.
    #[allow(clippy::too_many_arguments)]
    async fn cascade(
        &self,
        origin: &Message,
        item: &WorkItem,
        replan_depth: u32,
        failure: ErrorPayload,
        mut history: Vec<Value>,
        mut budget_used: BudgetUsed,
        mut plan_budget_used: BudgetUsed,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<ItemOutcome, HandlerError> {
        plan_budget_used.planner_calls += 1;
        let guidance = self
            .consult
            .request_guidance(origin, &item.description, &failure)
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
                .unwrap_or_default()
                .to_string();

            let retry = self
                .run_once(origin, item, Some(&text), &mut budget_used, cancel)
                .await?;
            match retry {
                Ok(()) => {
                    info!(
                        trace_id = %origin.trace_id,
                        work_item = %item.id,
                        outcome = "guided_retry_succeeded",
                        "cascade recovered via planner guidance"
                    );
                    return Ok(ItemOutcome::done(budget_used, plan_budget_used));
                }
                Err(failure) => {
                    history.push(json!(failure));
                    last_error = failure;
                }
            }
        }

        let next_depth = replan_depth + 1;
        let replanned = self
            .replan
            .dispatch_replan(origin, &item.description, history, next_depth)
            .await?;
        if replanned {
            plan_budget_used.planner_calls += 1;
            return Ok(ItemOutcome {
                status: WorkStatus::Failed,
                escalated: false,
                replan_dispatched: true,
                error: Some(last_error),
                budget_used,
                plan_budget_used,
            });
        }

        warn!(
            trace_id = %origin.trace_id,
            work_item = %item.id,
            outcome = "escalated",
            "cascade exhausted; escalating"
        );
        Ok(ItemOutcome {
            status: WorkStatus::Failed,
            escalated: true,
            replan_dispatched: false,
            error: Some(last_error),
            budget_used,
            plan_budget_used,
        })
    }

    /// One executor run plus verification. `Ok(Ok(()))` means verified done;
    /// `Ok(Err(_))` is a domain failure that feeds the retry loop.
    async fn run_once(
        &self,
        origin: &Message,
        item: &WorkItem,
        guidance: Option<&str>,
        budget_used: &mut BudgetUsed,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Result<(), ErrorPayload>, HandlerError> {
        budget_used.attempts += 1;
        budget_used.executor_runs += 1;

        let prompt = match guidance {
            Some(text) => format!("{}\n\nPlanner guidance: {text}", item.description),
            None => item.description.clone(),
        };
        let tools = apply_allowlist(&EXECUTOR_TOOLS, &origin.tool_allowlist);
        let mut call = AgentCall::new(prompt, tools);

        // Shell and python items run inside a sandbox created for the item's
        // scope; the handle travels in the invocation options.
        let sandbox = match item.executor {
            ExecutorType::Shell | ExecutorType::Python => {
                Some(self.sandbox.create(&item.scope_id).await?)
            }
            ExecutorType::Skill => None,
        };
        if let Some(handle) = &sandbox {
            call = call.with_options(json!({
                "sandbox": handle.0,
                "executor": item.executor,
            }));
        }

        let reply = tokio::select! {
            reply = self.agent.invoke(call) => {
                match reply {
                    Ok(reply) => reply,
                    Err(error) => {
                        if let Some(handle) = &sandbox {
                            let _ = self.sandbox.destroy(handle).await;
                        }
                        return Err(error.into());
                    }
                }
            }
            _ = cancel.changed() => {
                if let Some(handle) = &sandbox {
                    let _ = self.sandbox.destroy(handle).await;
                }
                return Ok(Err(ErrorPayload::new(
                    FailureKind::ToolFailure,
                    "cancelled",
                    "runtime",
                    false,
                )));
            }
        };

        if let Some(handle) = &sandbox {
            self.sandbox.destroy(handle).await?;
        }

        budget_used.tokens += reply.tokens_used;

        if let Some(failure) = reply.failure {
            debug!(
                trace_id = %origin.trace_id,
                work_item = %item.id,
                attempt_count = budget_used.attempts,
                outcome = "attempt_failed",
                "executor attempt reported failure"
            );
            return Ok(Err(failure));
        }

        // No checks defined means verification is vacuously satisfied.
        if item.checks.is_empty() {
            return Ok(Ok(()));
        }

        let report = self.verifier.run(item, &self.artifacts_root).await?;
        info!(
            trace_id = %origin.trace_id,
            work_item = %item.id,
            pass = report.pass,
            outcome = "verification",
            "verification finished"
        );
        if report.pass {
            Ok(Ok(()))
        } else {
            Ok(Err(ErrorPayload::new(
                FailureKind::VerificationFailed,
                format!("checks failed: {}", report.fails.join(", ")),
                "executor",
                true,
            )
            .with_detail(json!({ "fails": report.fails }))))
        }
    }

    /// Evaluates one gate; `Some` is the blocking failure.
    async fn evaluate_gate(
        &self,
        origin: &Message,
        item: &WorkItem,
        gate: &Gate,
    ) -> Result<Option<ErrorPayload>, HandlerError> {
        let decision = match gate.action {
            GateAction::Continue => "continue",
            GateAction::Block => "block",
            GateAction::RequireApproval => {
                if self.relay.request_gate_approval(origin, gate).await? {
                    "approved"
                } else {
                    "denied"
                }
            }
        };
        info!(
            trace_id = %origin.trace_id,
            work_item = %item.id,
            gate = %gate.label,
            outcome = decision,
            "gate decision"
        );

        match decision {
            "block" | "denied" => Ok(Some(ErrorPayload::new(
                FailureKind::GateBlocked,
                format!("gate '{}' blocked execution", gate.label),
                "runtime",
                false,
            ))),
            _ => Ok(None),
        }
    }

    fn cancelled(&self, budget_used: BudgetUsed, plan_budget_used: BudgetUsed) -> ItemOutcome {
        ItemOutcome {
            status: WorkStatus::Failed,
            escalated: false,
            replan_dispatched: false,
            error: Some(ErrorPayload::new(
                FailureKind::ToolFailure,
                "cancelled",
                "runtime",
                false,
            )),
            budget_used,
            plan_budget_used,
        }
    }
}
