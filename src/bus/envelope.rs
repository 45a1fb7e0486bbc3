//! Message envelope shared by every message on the bus.
//!
//! One envelope carries all thirteen message kinds; the `kind` discriminator
//! determines the payload schema. Context fields (scope, taint, task chain,
//! approval token, tool allowlist) propagate from a message to the messages
//! derived from it, so downstream consumers inherit the isolation and trust
//! decisions made upstream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::domain_types::{
    ApprovalToken, LeaseId, MessageId, ScopeId, TaskId, TraceId, WorkItemId,
};
use crate::error::ErrorPayload;
use crate::work::{BudgetUsed, WorkItem, WorkStatus};

/// Default delivery attempts before a message is dead-lettered.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// A wire-level name did not match any member of a closed set.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown {what}: {value}")]
pub struct UnknownNameError {
    /// Which closed set was being parsed.
    pub what: &'static str,
    /// The rejected value.
    pub value: String,
}

/// Destination queues. One consumer owns each queue; the runtime queue is
/// polled by cross-queue managers rather than a dedicated consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueName {
    /// `proxy_queue` — user-facing proxy consumer, plus terminal replies
    /// awaiting the bridge.
    #[serde(rename = "proxy_queue")]
    Proxy,
    /// `planner_queue` — planner consumer.
    #[serde(rename = "planner_queue")]
    Planner,
    /// `executor_queue` — executor consumer.
    #[serde(rename = "executor_queue")]
    Executor,
    /// `runtime_queue` — replies collected by the consult and approval
    /// relays.
    #[serde(rename = "runtime_queue")]
    Runtime,
}

impl QueueName {
    /// Wire name of the queue.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Proxy => "proxy_queue",
            Self::Planner => "planner_queue",
            Self::Executor => "executor_queue",
            Self::Runtime => "runtime_queue",
        }
    }

    /// Parses a wire name.
    ///
    /// # Errors
    ///
    /// Returns an error for names outside the closed set.
    pub fn parse(value: &str) -> Result<Self, UnknownNameError> {
        match value {
            "proxy_queue" => Ok(Self::Proxy),
            "planner_queue" => Ok(Self::Planner),
            "executor_queue" => Ok(Self::Executor),
            "runtime_queue" => Ok(Self::Runtime),
            unknown => Err(UnknownNameError {
                what: "queue",
                value: unknown.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of message kinds on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// User turn entering the system.
    UserMessage,
    /// Terminal reply collected by the bridge.
    AgentResponse,
    /// Request for a plan (or, with `consult: true`, for guidance).
    PlanRequest,
    /// Plan produced by the planner.
    PlanResult,
    /// Approved work dispatched to the executor.
    ExecutionRequest,
    /// Progress or terminal status of execution.
    ExecutionStatus,
    /// Bounded research task for the executor.
    ResearchRequest,
    /// Research findings returned to the planner.
    ResearchResult,
    /// Consult reply from the planner to the runtime.
    PlannerGuidance,
    /// Request for an alternative plan after failures.
    ReplanRequest,
    /// Approval prompt surfaced to the user.
    ApprovalRequest,
    /// Approval decision returned to the runtime.
    ApprovalResult,
    /// Informational runtime event for the channel.
    SystemEvent,
}

impl MessageKind {
    /// All kinds, in routing-table order.
    pub const ALL: [Self; 13] = [
        Self::UserMessage,
        Self::AgentResponse,
        Self::PlanRequest,
        Self::PlanResult,
        Self::ExecutionRequest,
        Self::ExecutionStatus,
        Self::ResearchRequest,
        Self::ResearchResult,
        Self::PlannerGuidance,
        Self::ReplanRequest,
        Self::ApprovalRequest,
        Self::ApprovalResult,
        Self::SystemEvent,
    ];

    /// Wire name of the kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserMessage => "user_message",
            Self::AgentResponse => "agent_response",
            Self::PlanRequest => "plan_request",
            Self::PlanResult => "plan_result",
            Self::ExecutionRequest => "execution_request",
            Self::ExecutionStatus => "execution_status",
            Self::ResearchRequest => "research_request",
            Self::ResearchResult => "research_result",
            Self::PlannerGuidance => "planner_guidance",
            Self::ReplanRequest => "replan_request",
            Self::ApprovalRequest => "approval_request",
            Self::ApprovalResult => "approval_result",
            Self::SystemEvent => "system_event",
        }
    }

    /// Parses a wire name.
    ///
    /// # Errors
    ///
    /// Returns an error for names outside the closed set.
    pub fn parse(value: &str) -> Result<Self, UnknownNameError> {
        match value {
            "user_message" => Ok(Self::UserMessage),
            "agent_response" => Ok(Self::AgentResponse),
            "plan_request" => Ok(Self::PlanRequest),
            "plan_result" => Ok(Self::PlanResult),
            "execution_request" => Ok(Self::ExecutionRequest),
            "execution_status" => Ok(Self::ExecutionStatus),
            "research_request" => Ok(Self::ResearchRequest),
            "research_result" => Ok(Self::ResearchResult),
            "planner_guidance" => Ok(Self::PlannerGuidance),
            "replan_request" => Ok(Self::ReplanRequest),
            "approval_request" => Ok(Self::ApprovalRequest),
            "approval_result" => Ok(Self::ApprovalResult),
            "system_event" => Ok(Self::SystemEvent),
            unknown => Err(UnknownNameError {
                what: "message kind",
                value: unknown.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Origin role of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderRole {
    /// The human user.
    User,
    /// The proxy agent.
    Proxy,
    /// The planner agent.
    Planner,
    /// The executor agent.
    Executor,
    /// The runtime itself (bridge, cascade, managers).
    Runtime,
}

impl SenderRole {
    /// Wire name of the role.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Proxy => "proxy",
            Self::Planner => "planner",
            Self::Executor => "executor",
            Self::Runtime => "runtime",
        }
    }

    /// Parses a wire name.
    ///
    /// # Errors
    ///
    /// Returns an error for names outside the closed set.
    pub fn parse(value: &str) -> Result<Self, UnknownNameError> {
        match value {
            "user" => Ok(Self::User),
            "proxy" => Ok(Self::Proxy),
            "planner" => Ok(Self::Planner),
            "executor" => Ok(Self::Executor),
            "runtime" => Ok(Self::Runtime),
            unknown => Err(UnknownNameError {
                what: "sender role",
                value: unknown.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for SenderRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trust classification of the data a message carries.
///
/// Taint propagates monotonically upward: a derived message is never less
/// tainted than its origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Taint {
    /// Trusted owner data.
    Owner,
    /// Authenticated third-party data.
    Auth,
    /// Untrusted external data.
    External,
}

impl Taint {
    /// Wire name of the taint level.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Auth => "auth",
            Self::External => "external",
        }
    }

    /// Parses a wire name.
    ///
    /// # Errors
    ///
    /// Returns an error for names outside the closed set.
    pub fn parse(value: &str) -> Result<Self, UnknownNameError> {
        match value {
            "owner" => Ok(Self::Owner),
            "auth" => Ok(Self::Auth),
            "external" => Ok(Self::External),
            unknown => Err(UnknownNameError {
                what: "taint",
                value: unknown.to_string(),
            }),
        }
    }
}

/// Urgency hint for channel surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    /// Quiet background activity.
    Background,
    /// Default informational traffic.
    #[default]
    Informational,
    /// Requires user attention.
    NeedsAttention,
}

impl Urgency {
    /// Wire name of the urgency level.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Background => "background",
            Self::Informational => "informational",
            Self::NeedsAttention => "needs_attention",
        }
    }

    /// Parses a wire name.
    ///
    /// # Errors
    ///
    /// Returns an error for names outside the closed set.
    pub fn parse(value: &str) -> Result<Self, UnknownNameError> {
        match value {
            "background" => Ok(Self::Background),
            "informational" => Ok(Self::Informational),
            "needs_attention" => Ok(Self::NeedsAttention),
            unknown => Err(UnknownNameError {
                what: "urgency",
                value: unknown.to_string(),
            }),
        }
    }
}

/// The message envelope.
///
/// A message is in exactly one of four states: available, leased,
/// acked-and-deleted, or dead-lettered. Lease fields are set only while
/// leased; `attempt_count` grows monotonically across nacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Globally unique ID, assigned at construction.
    pub id: MessageId,
    /// Destination queue; stamped by the router before enqueue.
    pub queue_name: Option<QueueName>,
    /// Payload discriminator.
    pub kind: MessageKind,
    /// Origin role.
    pub sender: SenderRole,
    /// Correlation ID, never changed after creation.
    pub trace_id: TraceId,
    /// Structured body; schema determined by `kind`.
    pub payload: Value,
    /// UTC construction timestamp; FIFO order key.
    pub created_at: DateTime<Utc>,
    /// Current lease, if any.
    pub lease_id: Option<LeaseId>,
    /// Lease expiry, if leased.
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Number of leases that ended in a nack.
    pub attempt_count: u32,
    /// Attempts allowed before dead-lettering.
    pub max_attempts: u32,
    /// Isolation domain.
    pub scope_id: Option<ScopeId>,
    /// Trust level of the carried data.
    pub taint: Option<Taint>,
    /// Task this message belongs to.
    pub task_id: Option<TaskId>,
    /// Parent task, for follow-up linkage.
    pub parent_task_id: Option<TaskId>,
    /// Work item this message concerns.
    pub work_item_id: Option<WorkItemId>,
    /// Approval token gating side effects downstream.
    pub approval_token: Option<ApprovalToken>,
    /// Tool names the receiving agent may be offered; empty means
    /// unrestricted.
    pub tool_allowlist: Vec<String>,
    /// Channel urgency hint.
    pub urgency: Urgency,
}

impl Message {
    /// Builds a new unrouted message with a fresh ID.
    #[must_use]
    pub fn new(kind: MessageKind, sender: SenderRole, trace_id: TraceId, payload: Value) -> Self {
        Self {
            id: MessageId::generate(),
            queue_name: None,
            kind,
            sender,
            trace_id,
            payload,
            created_at: Utc::now(),
            lease_id: None,
            lease_expires_at: None,
            attempt_count: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            scope_id: None,
            taint: None,
            task_id: None,
            parent_task_id: None,
            work_item_id: None,
            approval_token: None,
            tool_allowlist: Vec::new(),
            urgency: Urgency::default(),
        }
    }

    /// Builds a message derived from this one: same trace, with scope,
    /// taint, task chain, work item, and urgency carried over.
    ///
    /// Approval tokens and tool allowlists do not propagate; they are
    /// per-message grants.
    #[must_use]
    pub fn derived(&self, kind: MessageKind, sender: SenderRole, payload: Value) -> Self {
        let mut message = Self::new(kind, sender, self.trace_id, payload);
        message.scope_id = self.scope_id.clone();
        message.taint = self.taint;
        message.task_id = self.task_id.clone();
        message.parent_task_id = self.parent_task_id.clone();
        message.work_item_id = self.work_item_id.clone();
        message.urgency = self.urgency;
        message
    }

    /// Sets the isolation scope.
    #[must_use]
    pub fn with_scope(mut self, scope_id: ScopeId) -> Self {
        self.scope_id = Some(scope_id);
        self
    }

    /// Sets the taint level.
    #[must_use]
    pub fn with_taint(mut self, taint: Taint) -> Self {
        self.taint = Some(taint);
        self
    }

    /// Sets the task chain.
    #[must_use]
    pub fn with_task(mut self, task_id: TaskId, parent_task_id: Option<TaskId>) -> Self {
        self.task_id = Some(task_id);
        self.parent_task_id = parent_task_id;
        self
    }

    /// Sets the work item reference.
    #[must_use]
    pub fn with_work_item(mut self, work_item_id: WorkItemId) -> Self {
        self.work_item_id = Some(work_item_id);
        self
    }

    /// Sets the approval token.
    #[must_use]
    pub fn with_approval_token(mut self, token: ApprovalToken) -> Self {
        self.approval_token = Some(token);
        self
    }

    /// Sets the tool allowlist.
    #[must_use]
    pub fn with_allowlist(mut self, tool_allowlist: Vec<String>) -> Self {
        self.tool_allowlist = tool_allowlist;
        self
    }

    /// Sets the urgency hint.
    #[must_use]
    pub fn with_urgency(mut self, urgency: Urgency) -> Self {
        self.urgency = urgency;
        self
    }

    /// Decodes the payload into the typed body its kind requires.
    ///
    /// # Errors
    ///
    /// Returns the serde error if the payload does not match `T`.
    pub fn typed_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

// ---------------------------------------------------------------------------
// Typed payload bodies
// ---------------------------------------------------------------------------

/// Body of a `user_message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserTurn {
    /// The user's text.
    pub text: String,
    /// Channel metadata, passed through verbatim.
    #[serde(default)]
    pub metadata: Value,
}

/// Body of a `plan_request`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRequestBody {
    /// What to plan for.
    pub description: String,
    /// When true the planner answers with `planner_guidance` on the runtime
    /// queue instead of a `plan_result`.
    #[serde(default)]
    pub consult: bool,
    /// Set by `dispatch_goal`: no user turn originated this request.
    #[serde(default)]
    pub autonomous: bool,
    /// Goal reference for autonomous requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal_id: Option<String>,
    /// Free-form context (failure summaries for consults, channel metadata
    /// for turns).
    #[serde(default)]
    pub context: Value,
}

/// Body of a `plan_result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanResultBody {
    /// The plan as produced by the planner.
    #[serde(default)]
    pub plan: Value,
    /// Serialized work items ready for execution once approved.
    #[serde(default)]
    pub work_items: Vec<WorkItem>,
    /// True when the plan was finalized with missing research results.
    #[serde(default)]
    pub partial_research: bool,
    /// True when this plan replaces a failed strategy.
    #[serde(default)]
    pub is_replan: bool,
    /// How many replans preceded this plan.
    #[serde(default)]
    pub replan_depth: u32,
}

/// Body of an `execution_request`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequestBody {
    /// Work items to execute; empty means the description-only direct path.
    #[serde(default)]
    pub work_items: Vec<WorkItem>,
    /// Free-form description for the direct path.
    #[serde(default)]
    pub description: String,
    /// Replan generation this request belongs to.
    #[serde(default)]
    pub replan_depth: u32,
}

/// Body of an `execution_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStatusBody {
    /// Work item the status concerns, when item-scoped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_item_id: Option<WorkItemId>,
    /// Current status.
    pub status: WorkStatus,
    /// Human-readable detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// True when the cascade exhausted every recovery step.
    #[serde(default)]
    pub escalated: bool,
    /// True when a replan was dispatched instead of escalating.
    #[serde(default)]
    pub replan_dispatched: bool,
    /// Domain failure that produced a non-`done` status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    /// Budget consumed by executor attempts for this item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_used: Option<BudgetUsed>,
    /// Budget consumed by consult/replan planner work.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_budget_used: Option<BudgetUsed>,
}

/// Body of a `research_request`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchRequestBody {
    /// The research question.
    pub query: String,
    /// Requested answer shape.
    #[serde(default)]
    pub return_format: String,
    /// Token ceiling for the answer.
    #[serde(default)]
    pub max_tokens: u64,
    /// Canonical digest of `(query, return_format, max_tokens)`; echoed back
    /// in the result so the planner can correlate without re-hashing.
    pub query_digest: String,
}

/// Body of a `research_result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchResultBody {
    /// Digest of the originating request.
    pub query_digest: String,
    /// Research findings.
    #[serde(default)]
    pub content: Value,
    /// Tokens the research consumed.
    #[serde(default)]
    pub tokens_used: u64,
    /// True when research failed; the content then carries the error text.
    #[serde(default)]
    pub failed: bool,
}

/// Body of a `planner_guidance` consult reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuidanceBody {
    /// The planner's advice for the retry.
    pub guidance: String,
    /// Tokens the consult consumed; charged to the plan budget.
    #[serde(default)]
    pub tokens_used: u64,
}

/// Body of a `replan_request`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplanRequestBody {
    /// What was being attempted.
    pub description: String,
    /// Every failure observed so far, oldest first.
    #[serde(default)]
    pub failure_history: Vec<Value>,
    /// Depth of this replan (1-based).
    pub replan_depth: u32,
}

/// Body of an `approval_request`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequestBody {
    /// Why approval is being asked for.
    pub reason: String,
    /// Gate that raised the request, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_label: Option<String>,
}

/// Body of an `approval_result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalResultBody {
    /// The user's decision.
    pub approved: bool,
    /// Token minted on approval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Body of an `agent_response`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponseBody {
    /// Text for the user.
    pub text: String,
    /// Memory operations the proxy requested.
    #[serde(default)]
    pub memory_ops: Vec<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_parse_rejects_unknown() {
        for kind in MessageKind::ALL {
            assert_eq!(MessageKind::parse(kind.as_str()).unwrap(), kind);
        }
        assert!(MessageKind::parse("gossip").is_err());
    }

    #[test]
    fn derived_propagates_context_but_not_grants() {
        let origin = Message::new(
            MessageKind::UserMessage,
            SenderRole::User,
            TraceId::generate(),
            json!({"text": "hi"}),
        )
        .with_scope(ScopeId::try_new("scope-1".to_string()).unwrap())
        .with_taint(Taint::External)
        .with_allowlist(vec!["web_search".to_string()])
        .with_approval_token(ApprovalToken::try_new("tkn".to_string()).unwrap());

        let derived = origin.derived(MessageKind::PlanRequest, SenderRole::Proxy, json!({}));

        assert_eq!(derived.trace_id, origin.trace_id);
        assert_eq!(derived.scope_id, origin.scope_id);
        assert_eq!(derived.taint, Some(Taint::External));
        assert_ne!(derived.id, origin.id);
        assert!(derived.tool_allowlist.is_empty());
        assert!(derived.approval_token.is_none());
    }

    #[test]
    fn urgency_defaults_to_informational() {
        assert_eq!(Urgency::default(), Urgency::Informational);
    }
}
