//! Static routing from message kind to destination queue.
//!
//! The table is total over the closed kind set, so routing cannot fail;
//! unknown kinds are rejected earlier, when the wire name is parsed.

use crate::bus::envelope::{Message, MessageKind, QueueName};

/// Maps a message kind to the queue that consumes it.
#[must_use]
pub fn route(kind: MessageKind) -> QueueName {
    match kind {
        MessageKind::UserMessage
        | MessageKind::AgentResponse
        | MessageKind::PlanResult
        | MessageKind::ExecutionStatus
        | MessageKind::ApprovalRequest
        | MessageKind::SystemEvent => QueueName::Proxy,
        MessageKind::PlanRequest | MessageKind::ResearchResult | MessageKind::ReplanRequest => {
            QueueName::Planner
        }
        MessageKind::ExecutionRequest | MessageKind::ResearchRequest => QueueName::Executor,
        MessageKind::PlannerGuidance | MessageKind::ApprovalResult => QueueName::Runtime,
    }
}

/// Stamps the destination queue on a message prior to enqueue.
#[must_use]
pub fn stamp(mut message: Message) -> Message {
    message.queue_name = Some(route(message.kind));
    message
}
