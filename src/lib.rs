//! # Switchyard — durable queue-and-work orchestration core
//!
//! Switchyard is the message bus and scheduling core of a multi-agent
//! runtime. Three cooperating agents (a user-facing proxy, a planner, and an
//! executor) communicate exclusively through durable SQLite-backed queues
//! with at-least-once delivery, lease-based work stealing, and per-consumer
//! idempotency. On top of the bus sit the bounded research sub-protocol, a
//! self-healing failure cascade (retry, consult, replan, escalate) with
//! separate budget attribution, and a concurrency-capped work-item pipeline
//! with conflict detection over shared artifact paths.
//!
//! Agent implementations, channel adapters, approval cryptography,
//! verification, and sandboxing are external collaborators behind the traits
//! in [`traits`]; the core injects nothing ambient and owns no globals.
//!
//! ## Shape of the system
//!
//! Producers route messages through [`bus::router`] into the
//! [`bus::store::QueueStore`]; consumers lease from their queue and may
//! produce new messages routed back through the same table. The
//! [`orchestrator::Bridge`] is the embedding runtime's seam: dispatch a turn
//! or a goal, then collect the trace's terminal reply with a filtered lease
//! that never disturbs concurrent traces.

pub mod bus;
pub mod consult;
pub mod consumers;
pub mod database;
pub mod domain_types;
pub mod error;
pub mod observability;
pub mod orchestrator;
pub mod research;
pub mod time_provider;
pub mod traits;
pub mod work;

pub use crate::bus::envelope::{Message, MessageKind, QueueName, SenderRole, Taint, Urgency};
pub use crate::bus::store::QueueStore;
pub use crate::database::{DatabaseConfig, DatabaseConnection, DatabasePath};
pub use crate::domain_types::{MessageId, TraceId};
pub use crate::error::{ErrorPayload, FailureKind};
pub use crate::orchestrator::{Bridge, Orchestrator, RuntimeConfig, RuntimeSeams, build_runtime};
pub use crate::work::{Budget, BudgetUsed, WorkItem, WorkStatus};
