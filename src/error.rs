//! Error types for switchyard subsystems and the wire-level failure taxonomy.
//!
//! Two distinct families live here. The `thiserror` enums are infrastructure
//! errors that flow through `Result` returns inside the process. The
//! [`ErrorPayload`] taxonomy is a closed, serializable set of *domain*
//! failures reported by agents, gates, and verifiers; it rides inside message
//! payloads and drives the self-healing cascade rather than dead-lettering.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::domain_types::MessageId;

/// Closed taxonomy of domain failures carried in [`ErrorPayload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A tool invoked by an agent failed.
    ToolFailure,
    /// A budget axis was exhausted.
    BudgetExceeded,
    /// A gate evaluated to block.
    GateBlocked,
    /// An approval was denied or could not be verified.
    ApprovalDenied,
    /// Post-execution verification did not pass.
    VerificationFailed,
    /// An operation exceeded its deadline.
    Timeout,
}

impl FailureKind {
    /// Wire name of the failure kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ToolFailure => "tool_failure",
            Self::BudgetExceeded => "budget_exceeded",
            Self::GateBlocked => "gate_blocked",
            Self::ApprovalDenied => "approval_denied",
            Self::VerificationFailed => "verification_failed",
            Self::Timeout => "timeout",
        }
    }
}

/// Structured domain failure reported by an agent, gate, or verifier.
///
/// These are not process errors: they are handled by the cascade
/// (retry, consult, replan, escalate) and always surface to the channel as an
/// `execution_status` or `agent_response` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Which member of the closed taxonomy this failure is.
    pub kind: FailureKind,
    /// Human-readable description.
    pub message: String,
    /// Role of the agent that originated the failure.
    pub origin_agent: String,
    /// Whether a retry of the same step can plausibly succeed.
    pub retryable: bool,
    /// Optional structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl ErrorPayload {
    /// Creates a failure payload with no structured detail.
    #[must_use]
    pub fn new(
        kind: FailureKind,
        message: impl Into<String>,
        origin_agent: impl Into<String>,
        retryable: bool,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            origin_agent: origin_agent.into(),
            retryable,
            detail: None,
        }
    }

    /// Attaches structured detail.
    #[must_use]
    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }

    /// Shorthand for a timeout failure, which is always retryable.
    #[must_use]
    pub fn timeout(message: impl Into<String>, origin_agent: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message, origin_agent, true)
    }
}

/// Errors from the durable queue store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying database error.
    #[error("database error: {source}")]
    Database {
        /// Error from `SQLx`.
        #[source]
        source: sqlx::Error,
    },

    /// Payload or allowlist serialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Error from `serde_json`.
        #[source]
        source: serde_json::Error,
    },

    /// `enqueue` was called before the router stamped a destination queue.
    #[error("message {message_id} has no destination queue; route it before enqueue")]
    Unrouted {
        /// The unrouted message.
        message_id: MessageId,
    },

    /// A message with this ID already exists in `queue_messages` or
    /// `dead_letters`.
    #[error("duplicate message id {message_id}")]
    DuplicateId {
        /// The conflicting ID.
        message_id: MessageId,
    },

    /// A persisted row could not be decoded back into an envelope.
    #[error("corrupt row for message {message_id}: {detail}")]
    CorruptRow {
        /// Raw ID of the offending row.
        message_id: String,
        /// What failed to decode.
        detail: String,
    },
}

impl From<sqlx::Error> for StoreError {
    fn from(source: sqlx::Error) -> Self {
        Self::Database { source }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(source: serde_json::Error) -> Self {
        Self::Serialization { source }
    }
}

/// Errors from the agent invocation seam.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The invocation itself failed (transport, model, or capability error).
    #[error("agent invocation failed: {message}")]
    Invocation {
        /// Description from the invoker.
        message: String,
    },

    /// The agent returned output the consumer could not interpret.
    #[error("agent produced malformed output: {detail}")]
    MalformedOutput {
        /// What failed to parse.
        detail: String,
    },
}

/// Errors from the channel seam.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The channel collaborator is unavailable.
    #[error("channel unavailable: {message}")]
    Unavailable {
        /// Description from the channel adapter.
        message: String,
    },
}

/// Errors from the approval verifier seam.
#[derive(Debug, Error)]
pub enum ApprovalError {
    /// The verifier could not evaluate the token at all.
    #[error("approval check failed: {message}")]
    Check {
        /// Description from the verifier.
        message: String,
    },
}

/// Errors from the verification runner seam.
#[derive(Debug, Error)]
pub enum VerificationError {
    /// The checks could not be executed.
    #[error("verification run failed: {message}")]
    Run {
        /// Description from the runner.
        message: String,
    },
}

/// Errors from the sandbox manager seam.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Sandbox lifecycle or exec failure.
    #[error("sandbox error: {message}")]
    Sandbox {
        /// Description from the backend.
        message: String,
    },
}

/// Errors surfaced by a kind-specific message handler.
///
/// A handler error causes the consumer loop to nack the message; retries and
/// dead-lettering are governed by the envelope's attempt accounting.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Store operation failed mid-handler.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Agent seam failed.
    #[error(transparent)]
    Agent(#[from] AgentError),

    /// Channel seam failed.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Approval verifier seam failed.
    #[error(transparent)]
    Approval(#[from] ApprovalError),

    /// Verification runner seam failed.
    #[error(transparent)]
    Verification(#[from] VerificationError),

    /// Sandbox seam failed.
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    /// The message payload did not match the schema its kind requires.
    #[error("malformed payload: {detail}")]
    Payload {
        /// What failed to decode.
        detail: String,
    },

    /// Runtime invariant violation inside the handler.
    #[error("{detail}")]
    Internal {
        /// What went wrong.
        detail: String,
    },
}

impl HandlerError {
    /// Builds a payload-decoding error from a serde failure.
    #[must_use]
    pub fn payload(error: &serde_json::Error) -> Self {
        Self::Payload {
            detail: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_kind_serializes_snake_case() {
        let json = serde_json::to_string(&FailureKind::VerificationFailed).unwrap();
        assert_eq!(json, "\"verification_failed\"");
    }

    #[test]
    fn error_payload_roundtrips_detail() {
        let payload = ErrorPayload::new(FailureKind::ToolFailure, "rm failed", "executor", true)
            .with_detail(serde_json::json!({"exit_code": 1}));
        let back: ErrorPayload =
            serde_json::from_value(serde_json::to_value(&payload).unwrap()).unwrap();
        assert_eq!(back, payload);
    }
}
