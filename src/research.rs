//! Bounded research sub-protocol, tracked per trace.
//!
//! The planner may fan research questions out to the executor, but the
//! protocol is capped: at most three requests in flight, at most five
//! dispatched per trace, and 120 seconds per request. Duplicate questions
//! collapse onto one request via a canonical SHA-256 digest, and replayed
//! results are dropped by message ID.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::debug;

use crate::domain_types::{MessageId, TraceId};

/// Maximum research requests in flight per trace.
pub const MAX_IN_FLIGHT: usize = 3;

/// Maximum research requests dispatched per trace, across all rounds.
pub const MAX_REQUESTS_PER_TRACE: u32 = 5;

/// Per-request timeout.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// One research question the planner wants answered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResearchIntent {
    /// The question.
    pub query: String,
    /// Requested answer shape.
    #[serde(default)]
    pub return_format: String,
    /// Token ceiling for the answer.
    #[serde(default)]
    pub max_tokens: u64,
}

impl ResearchIntent {
    /// Canonical SHA-256 digest over `(query, return_format, max_tokens)`;
    /// the dedup key.
    #[must_use]
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.query.as_bytes());
        hasher.update([0x1f]);
        hasher.update(self.return_format.as_bytes());
        hasher.update([0x1f]);
        hasher.update(self.max_tokens.to_be_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Lifecycle of one trace's research.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResearchPhase {
    /// No research dispatched yet.
    #[default]
    Planning,
    /// Requests outstanding.
    AwaitingResearch,
    /// Every outstanding request resolved or timed out with at least one
    /// result present.
    ReadyToFinalize,
    /// Terminal: deadline passed or cap exceeded with results missing.
    Expired,
}

/// What the planner should do after feeding a result in.
#[derive(Debug, Clone, PartialEq)]
pub enum Advance {
    /// Keep waiting.
    Pending,
    /// Finalize the plan with the collected context.
    Finalize(ResearchContext),
}

/// Collected research results for plan finalization.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResearchContext {
    /// `(digest, content)` pairs in dispatch order.
    pub results: Vec<(String, Value)>,
    /// True when some dispatched request never produced a result.
    pub partial: bool,
}

/// Result of a deadline check.
#[derive(Debug, Clone, PartialEq)]
pub enum DeadlineCheck {
    /// Still awaiting; retry after the given duration.
    Pending(Duration),
    /// The deadline passed; finalize with this partial context.
    Expired(ResearchContext),
    /// The trace already finalized or holds no outstanding research.
    Settled,
}

struct PendingRequest {
    dispatched_at: DateTime<Utc>,
}

#[derive(Default)]
struct TraceResearch {
    phase: ResearchPhase,
    description: String,
    is_replan: bool,
    replan_depth: u32,
    dispatched_total: u32,
    dispatch_order: Vec<String>,
    in_flight: HashMap<String, PendingRequest>,
    results: HashMap<String, Value>,
    timed_out: HashSet<String>,
    seen_result_ids: HashSet<MessageId>,
}

impl TraceResearch {
    fn context(&self) -> ResearchContext {
        let results = self
            .dispatch_order
            .iter()
            .filter_map(|digest| {
                self.results
                    .get(digest)
                    .map(|content| (digest.clone(), content.clone()))
            })
            .collect();
        ResearchContext {
            results,
            partial: !self.timed_out.is_empty() || !self.in_flight.is_empty(),
        }
    }

    fn sweep_timeouts(&mut self, now: DateTime<Utc>) {
        let deadline = chrono::Duration::from_std(REQUEST_TIMEOUT)
            .unwrap_or_else(|_| chrono::Duration::seconds(120));
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, pending)| now - pending.dispatched_at > deadline)
            .map(|(digest, _)| digest.clone())
            .collect();
        for digest in expired {
            self.in_flight.remove(&digest);
            self.timed_out.insert(digest);
        }
    }
}

/// Per-trace research state machine.
#[derive(Default)]
pub struct ResearchTracker {
    traces: DashMap<TraceId, TraceResearch>,
}

impl ResearchTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets a trace's research state and remembers the request it serves.
    pub fn reset(&self, trace_id: TraceId, description: impl Into<String>) {
        let mut state = TraceResearch::default();
        state.description = description.into();
        self.traces.insert(trace_id, state);
    }

    /// Records that the trace is now serving a replan, without resetting the
    /// dispatch counters: the per-trace request cap spans replans.
    pub fn mark_replan(&self, trace_id: TraceId, description: impl Into<String>, depth: u32) {
        let mut state = self.traces.entry(trace_id).or_default();
        state.description = description.into();
        state.is_replan = true;
        state.replan_depth = depth;
    }

    /// Original request description for a trace.
    #[must_use]
    pub fn description(&self, trace_id: TraceId) -> String {
        self.traces
            .get(&trace_id)
            .map(|state| state.description.clone())
            .unwrap_or_default()
    }

    /// `(is_replan, replan_depth)` for a trace, for plan-result flags.
    #[must_use]
    pub fn replan_info(&self, trace_id: TraceId) -> (bool, u32) {
        self.traces
            .get(&trace_id)
            .map(|state| (state.is_replan, state.replan_depth))
            .unwrap_or_default()
    }

    /// Current phase for a trace.
    #[must_use]
    pub fn phase(&self, trace_id: TraceId) -> ResearchPhase {
        self.traces
            .get(&trace_id)
            .map(|state| state.phase)
            .unwrap_or_default()
    }

    /// Selects which intents to actually dispatch: duplicates collapse onto
    /// prior requests, and the in-flight and per-trace caps apply. Marks the
    /// accepted intents as in flight.
    ///
    /// Returns the accepted intents paired with their digests.
    pub fn begin_dispatch(
        &self,
        trace_id: TraceId,
        intents: Vec<ResearchIntent>,
        now: DateTime<Utc>,
    ) -> Vec<(ResearchIntent, String)> {
        let mut state = self.traces.entry(trace_id).or_default();
        let mut accepted = Vec::new();

        for intent in intents {
            if state.in_flight.len() >= MAX_IN_FLIGHT {
                debug!(trace_id = %trace_id, outcome = "capped_in_flight", "research intent deferred");
                break;
            }
            if state.dispatched_total >= MAX_REQUESTS_PER_TRACE {
                debug!(trace_id = %trace_id, outcome = "capped_total", "research intent dropped");
                break;
            }
            let digest = intent.digest();
            if state.results.contains_key(&digest)
                || state.in_flight.contains_key(&digest)
                || state.timed_out.contains(&digest)
            {
                debug!(trace_id = %trace_id, outcome = "duplicate_collapsed", "research intent deduplicated");
                continue;
            }

            state.dispatched_total += 1;
            state.dispatch_order.push(digest.clone());
            state.in_flight.insert(
                digest.clone(),
                PendingRequest {
                    dispatched_at: now,
                },
            );
            accepted.push((intent, digest));
        }

        if !state.in_flight.is_empty() {
            state.phase = ResearchPhase::AwaitingResearch;
        }
        accepted
    }

    /// Number of requests currently in flight for a trace.
    #[must_use]
    pub fn in_flight(&self, trace_id: TraceId) -> usize {
        self.traces
            .get(&trace_id)
            .map(|state| state.in_flight.len())
            .unwrap_or_default()
    }

    /// Total requests dispatched for a trace.
    #[must_use]
    pub fn dispatched_total(&self, trace_id: TraceId) -> u32 {
        self.traces
            .get(&trace_id)
            .map(|state| state.dispatched_total)
            .unwrap_or_default()
    }

    /// Feeds a research result in and reports whether the trace can
    /// finalize. Replayed result messages (same `result_id`) and unknown
    /// digests are ignored.
    pub fn record_result(
        &self,
        trace_id: TraceId,
        result_id: MessageId,
        digest: &str,
        content: Value,
        now: DateTime<Utc>,
    ) -> Advance {
        let Some(mut state) = self.traces.get_mut(&trace_id) else {
            return Advance::Pending;
        };

        if matches!(
            state.phase,
            ResearchPhase::ReadyToFinalize | ResearchPhase::Expired
        ) {
            return Advance::Pending;
        }
        if !state.seen_result_ids.insert(result_id) {
            debug!(trace_id = %trace_id, message_id = %result_id, outcome = "replay_dropped", "duplicate research result");
            return Advance::Pending;
        }

        if state.in_flight.remove(digest).is_some() || state.timed_out.remove(digest) {
            state.results.insert(digest.to_string(), content);
        }

        state.sweep_timeouts(now);

        let exhausted = state.dispatched_total >= MAX_REQUESTS_PER_TRACE;
        if state.in_flight.is_empty() && (exhausted || !state.results.is_empty()) {
            state.phase = ResearchPhase::ReadyToFinalize;
            return Advance::Finalize(state.context());
        }
        Advance::Pending
    }

    /// Checks the research deadline against the given clock reading.
    ///
    /// While requests are outstanding and the deadline (120 s after the
    /// oldest in-flight dispatch) has not passed, returns how long remains.
    /// Once it has passed, transitions the trace to `Expired` exactly once
    /// and hands back whatever was collected, flagged partial.
    pub fn check_deadline(&self, trace_id: TraceId, now: DateTime<Utc>) -> DeadlineCheck {
        let Some(mut state) = self.traces.get_mut(&trace_id) else {
            return DeadlineCheck::Settled;
        };
        if !matches!(state.phase, ResearchPhase::AwaitingResearch) {
            return DeadlineCheck::Settled;
        }
        let Some(oldest) = state
            .in_flight
            .values()
            .map(|pending| pending.dispatched_at)
            .min()
        else {
            return DeadlineCheck::Settled;
        };

        let timeout = chrono::Duration::from_std(REQUEST_TIMEOUT)
            .unwrap_or_else(|_| chrono::Duration::seconds(120));
        let deadline = oldest + timeout;
        if now < deadline {
            let remaining = (deadline - now).to_std().unwrap_or(REQUEST_TIMEOUT);
            return DeadlineCheck::Pending(remaining);
        }

        state.phase = ResearchPhase::Expired;
        let mut context = state.context();
        context.partial = true;
        debug!(trace_id = %trace_id, results = context.results.len(), outcome = "expired", "research deadline passed");
        DeadlineCheck::Expired(context)
    }

    /// Drops a trace's research state entirely.
    pub fn forget(&self, trace_id: TraceId) {
        self.traces.remove(&trace_id);
    }
}
