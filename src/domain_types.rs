//! Strongly-typed domain values shared across the crate.
//!
//! Identifier and bounded-scalar newtypes prevent primitive obsession at the
//! seams between the store, the consumers, and the work pipeline.

use nutype::nutype;
use uuid::Uuid;

/// Globally unique message identifier; doubles as the idempotency key.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct MessageId(Uuid);

impl MessageId {
    /// Creates a new random message ID.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Opaque correlation identifier propagated verbatim across every message
/// derived from one user-visible interaction.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct TraceId(Uuid);

impl TraceId {
    /// Creates a new random trace ID.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Identifier of one temporary exclusive claim on a message.
///
/// A fresh lease ID is minted on every successful lease; heartbeats are bound
/// to it so a stale holder cannot extend a lease it no longer owns.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct LeaseId(Uuid);

impl LeaseId {
    /// Mints a fresh lease ID.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Name a consumer registers under in the idempotency ledger.
#[nutype(
    validate(len_char_min = 1, len_char_max = 64),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct ConsumerName(String);

/// Isolation domain for work; shared-resource semaphores are partitioned by
/// scope.
#[nutype(
    validate(len_char_min = 1, len_char_max = 128),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct ScopeId(String);

/// Identifier of a task in the caller's task graph.
#[nutype(
    validate(len_char_min = 1, len_char_max = 128),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct TaskId(String);

/// Identifier of a single work item inside an execution request.
#[nutype(
    validate(len_char_min = 1, len_char_max = 128),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct WorkItemId(String);

/// Opaque approval token binding a side-effecting action to an approved plan.
///
/// The token's cryptographic binding, replay protection, and expiry are
/// enforced by the external [`ApprovalVerifier`](crate::traits::ApprovalVerifier);
/// at this layer it is an opaque string.
#[nutype(
    validate(len_char_min = 1),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct ApprovalToken(String);

/// Identifier of an autonomous goal dispatched through the bridge.
#[nutype(
    validate(len_char_min = 1, len_char_max = 128),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct GoalId(String);

/// Bounded concurrency cap for the executor pool semaphores.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 256),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct ConcurrencyLimit(usize);

impl ConcurrencyLimit {
    /// Gets the value as usize for use with tokio semaphores.
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_across_generation() {
        assert_ne!(MessageId::generate(), MessageId::generate());
        assert_ne!(TraceId::generate(), TraceId::generate());
        assert_ne!(LeaseId::generate(), LeaseId::generate());
    }

    #[test]
    fn consumer_name_rejects_empty() {
        assert!(ConsumerName::try_new(String::new()).is_err());
        assert!(ConsumerName::try_new("proxy".to_string()).is_ok());
    }

    #[test]
    fn concurrency_limit_rejects_zero() {
        assert!(ConcurrencyLimit::try_new(0).is_err());
        assert_eq!(ConcurrencyLimit::try_new(16).unwrap().as_usize(), 16);
    }
}
