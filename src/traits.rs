//! External seams: the capabilities the core consumes but does not implement.
//!
//! Agents, the user-facing channel, approval verification, post-execution
//! verification, and sandboxing are all collaborators behind async traits.
//! Consumers are responsible for toolset filtering before any agent
//! invocation; the invoker receives only the tools the agent may see.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

use crate::domain_types::{ApprovalToken, ScopeId, TraceId};
use crate::error::{
    AgentError, ApprovalError, ChannelError, ErrorPayload, SandboxError, VerificationError,
};
use crate::work::{WorkItem, WorkStatus};

/// One agent invocation.
#[derive(Debug, Clone)]
pub struct AgentCall {
    /// Prompt text for the agent.
    pub prompt: String,
    /// Names of the tools the agent may be offered, post-filtering.
    pub tools: Vec<String>,
    /// Invoker-specific options (model hints, sandbox handles, ...).
    pub options: Value,
}

impl AgentCall {
    /// Builds a call with empty options.
    #[must_use]
    pub fn new(prompt: impl Into<String>, tools: Vec<String>) -> Self {
        Self {
            prompt: prompt.into(),
            tools,
            options: Value::Null,
        }
    }

    /// Attaches invoker options.
    #[must_use]
    pub fn with_options(mut self, options: Value) -> Self {
        self.options = options;
        self
    }
}

/// Structured output of an agent invocation.
///
/// A reply can succeed at the transport level while reporting a *domain*
/// failure; the latter drives the self-healing cascade rather than a nack.
#[derive(Debug, Clone)]
pub struct AgentReply {
    /// Structured output; schema is agreed between consumer and agent.
    pub output: Value,
    /// Tokens the invocation consumed, for budget attribution.
    pub tokens_used: u64,
    /// Domain failure the agent (or its self-verification) reported.
    pub failure: Option<ErrorPayload>,
}

impl AgentReply {
    /// A successful reply.
    #[must_use]
    pub fn ok(output: Value, tokens_used: u64) -> Self {
        Self {
            output,
            tokens_used,
            failure: None,
        }
    }

    /// A reply carrying a domain failure.
    #[must_use]
    pub fn failed(failure: ErrorPayload, tokens_used: u64) -> Self {
        Self {
            output: Value::Null,
            tokens_used,
            failure: Some(failure),
        }
    }

    /// Whether this reply reports a domain failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.failure.is_some()
    }
}

/// Capability to invoke one agent kind.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    /// Runs the agent to completion and returns its structured output.
    async fn invoke(&self, call: AgentCall) -> Result<AgentReply, AgentError>;
}

/// Decision returned by the channel's approval prompt.
#[derive(Debug, Clone)]
pub struct ApprovalDecision {
    /// Whether the user approved.
    pub approved: bool,
    /// Token minted on approval; binds the execution to the approved plan.
    pub token: Option<ApprovalToken>,
}

/// UI surface a status update is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusSurface {
    /// Quiet progress surface.
    Activity,
    /// The main conversation stream.
    Stream,
}

/// Surface mapping for a status: `running` stays on the activity surface,
/// every terminal status also reaches the stream.
#[must_use]
pub fn surfaces_for(status: WorkStatus) -> &'static [StatusSurface] {
    match status {
        WorkStatus::Running => &[StatusSurface::Activity],
        WorkStatus::Done
        | WorkStatus::Failed
        | WorkStatus::Stuck
        | WorkStatus::Blocked
        | WorkStatus::VerificationFailed => &[StatusSurface::Stream, StatusSurface::Activity],
    }
}

/// The user-facing channel collaborator.
#[async_trait]
pub trait ChannelPort: Send + Sync {
    /// Renders an approval request and returns the user's decision.
    async fn request_approval(
        &self,
        trace_id: TraceId,
        plan: &Value,
    ) -> Result<ApprovalDecision, ChannelError>;

    /// Renders an arbitrary card.
    async fn render_card(&self, trace_id: TraceId, card: &Value) -> Result<(), ChannelError>;

    /// Routes an execution status to the given UI surfaces.
    async fn route_status(
        &self,
        trace_id: TraceId,
        status: &Value,
        surfaces: &[StatusSurface],
    ) -> Result<(), ChannelError>;
}

/// Result of verifying an approval token against a work item.
#[derive(Debug, Clone)]
pub struct ApprovalOutcome {
    /// Whether the token is valid for this work item.
    pub ok: bool,
    /// Why verification failed, when it did.
    pub reason: Option<String>,
}

/// Verifier for approval tokens. Enforces cryptographic binding to the work
/// item's plan hash, replay protection, and expiry.
#[async_trait]
pub trait ApprovalVerifier: Send + Sync {
    /// Checks a token against a work item.
    async fn check(
        &self,
        token: &ApprovalToken,
        work_item: &WorkItem,
    ) -> Result<ApprovalOutcome, ApprovalError>;
}

/// Outcome of the deterministic post-execution checks.
#[derive(Debug, Clone)]
pub struct VerificationReport {
    /// Whether every check passed.
    pub pass: bool,
    /// Names of the checks that failed.
    pub fails: Vec<String>,
}

/// Runs a work item's verification checks over filesystem artifacts,
/// outside the agent.
#[async_trait]
pub trait VerificationRunner: Send + Sync {
    /// Runs all checks for the item under `artifacts_root`.
    async fn run(
        &self,
        work_item: &WorkItem,
        artifacts_root: &Path,
    ) -> Result<VerificationReport, VerificationError>;
}

/// Handle to a created sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxHandle(pub String);

/// Output of a sandboxed command.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    /// Process exit code.
    pub exit_code: i32,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

/// Sandbox lifecycle for shell/python executor types.
#[async_trait]
pub trait SandboxManager: Send + Sync {
    /// Creates a sandbox for a scope.
    async fn create(&self, scope: &ScopeId) -> Result<SandboxHandle, SandboxError>;

    /// Executes a command inside a sandbox.
    async fn exec(&self, sandbox: &SandboxHandle, command: &str)
    -> Result<ExecOutput, SandboxError>;

    /// Destroys a sandbox.
    async fn destroy(&self, sandbox: &SandboxHandle) -> Result<(), SandboxError>;
}
