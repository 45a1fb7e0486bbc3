//! Work-item data model: items, budgets, gates, checks, and wave building.

pub mod item_executor;
pub mod pool;
pub mod runner;

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use thiserror::Error;

use crate::domain_types::{ApprovalToken, ScopeId, WorkItemId};

/// Execution backend for a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorType {
    /// Shell commands in a sandbox.
    Shell,
    /// Python in a sandbox.
    Python,
    /// A registered skill run by the executor agent directly.
    Skill,
}

/// Policy applied when a work item keeps failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    /// Retry up to the attempt budget, then report.
    Retry,
    /// One try, no retry.
    Report,
    /// One retry, then escalate.
    Escalate,
    /// No retry; the item parks as stuck.
    Pause,
}

/// Closed set of work statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    /// Execution in progress.
    Running,
    /// Completed and verified.
    Done,
    /// Failed terminally.
    Failed,
    /// Parked awaiting intervention.
    Stuck,
    /// Stopped by a gate or invalid approval.
    Blocked,
    /// Execution finished but checks did not pass.
    VerificationFailed,
}

impl WorkStatus {
    /// Wire name of the status.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Stuck => "stuck",
            Self::Blocked => "blocked",
            Self::VerificationFailed => "verification_failed",
        }
    }
}

impl std::fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When a gate is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateTrigger {
    /// Before the executor runs, guarding tool access.
    OnToolCall,
    /// After a failed step, before another attempt.
    AfterStep,
}

/// Outcome a gate is configured to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateAction {
    /// Proceed.
    Continue,
    /// Ask the user before proceeding.
    RequireApproval,
    /// Stop the item.
    Block,
}

/// A labeled gate on a work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gate {
    /// Operator-facing label.
    pub label: String,
    /// When the gate fires.
    pub trigger: GateTrigger,
    /// What the gate decides.
    pub action: GateAction,
}

/// One deterministic post-execution check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationCheck {
    /// Check name, reported on failure.
    pub name: String,
    /// What the verification runner should assert.
    pub expectation: String,
}

/// Resource ceilings for one work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    /// Executor attempts allowed.
    pub max_attempts: u32,
    /// Token ceiling across attempts.
    pub max_tokens: u64,
    /// Wall-clock ceiling in seconds.
    pub max_wall_seconds: u64,
    /// Planner consults/replans allowed.
    pub max_planner_calls: u32,
    /// Executor runs allowed (attempts plus guided retries).
    pub max_executor_runs: u32,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_tokens: 200_000,
            max_wall_seconds: 600,
            max_planner_calls: 5,
            max_executor_runs: 10,
        }
    }
}

/// Accumulated consumption along the same axes as [`Budget`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetUsed {
    /// Executor attempts consumed.
    pub attempts: u32,
    /// Tokens consumed.
    pub tokens: u64,
    /// Wall-clock seconds consumed.
    pub wall_seconds: u64,
    /// Planner calls consumed.
    pub planner_calls: u32,
    /// Executor runs consumed.
    pub executor_runs: u32,
}

impl BudgetUsed {
    /// True when any axis has reached its ceiling (`>=` comparison).
    #[must_use]
    pub fn exceeds(&self, budget: &Budget) -> bool {
        self.attempts >= budget.max_attempts
            || self.tokens >= budget.max_tokens
            || self.wall_seconds >= budget.max_wall_seconds
            || self.planner_calls >= budget.max_planner_calls
            || self.executor_runs >= budget.max_executor_runs
    }

    /// Sums another account into this one; used for follow-up linkage.
    pub fn merge(&mut self, other: &Self) {
        self.attempts = self.attempts.saturating_add(other.attempts);
        self.tokens = self.tokens.saturating_add(other.tokens);
        self.wall_seconds = self.wall_seconds.saturating_add(other.wall_seconds);
        self.planner_calls = self.planner_calls.saturating_add(other.planner_calls);
        self.executor_runs = self.executor_runs.saturating_add(other.executor_runs);
    }
}

/// One unit of approved work, carried in an `execution_request` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Item identifier, unique within its request.
    pub id: WorkItemId,
    /// Isolation domain the item runs in.
    pub scope_id: ScopeId,
    /// What to do.
    pub description: String,
    /// Execution backend.
    pub executor: ExecutorType,
    /// Resource ceilings.
    #[serde(default)]
    pub budget: Budget,
    /// Gates evaluated around execution.
    #[serde(default)]
    pub gates: Vec<Gate>,
    /// Post-execution checks; empty means vacuously verified.
    #[serde(default)]
    pub checks: Vec<VerificationCheck>,
    /// Approval token bound to this item's plan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_token: Option<ApprovalToken>,
    /// Items that must complete before this one starts.
    #[serde(default)]
    pub depends_on: Vec<WorkItemId>,
    /// Artifact paths this item reads or writes; drives conflict detection.
    #[serde(default)]
    pub input_artifacts_from: Vec<String>,
    /// Failure policy.
    #[serde(default = "default_on_failure")]
    pub on_failure: OnFailure,
}

fn default_on_failure() -> OnFailure {
    OnFailure::Retry
}

impl WorkItem {
    /// Gates with the given trigger, in declaration order.
    pub fn gates_for(&self, trigger: GateTrigger) -> impl Iterator<Item = &Gate> {
        self.gates.iter().filter(move |gate| gate.trigger == trigger)
    }
}

/// Structural errors in a request's dependency graph.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WaveError {
    /// An item depends on an ID not present in the request.
    #[error("work item {item} depends on unknown item {dependency}")]
    UnknownDependency {
        /// The dependent item.
        item: WorkItemId,
        /// The missing dependency.
        dependency: WorkItemId,
    },

    /// The dependency graph contains a cycle.
    #[error("dependency cycle among work items: {items:?}")]
    Cycle {
        /// Items caught in the cycle.
        items: Vec<WorkItemId>,
    },
}

/// Topologically sorts items into waves: every item's dependencies live in
/// earlier waves, so items within one wave are mutually independent.
///
/// # Errors
///
/// Returns an error on unknown dependencies or cycles.
pub fn build_waves(items: &[WorkItem]) -> Result<Vec<Vec<WorkItem>>, WaveError> {
    let by_id: HashMap<&WorkItemId, &WorkItem> =
        items.iter().map(|item| (&item.id, item)).collect();

    for item in items {
        for dependency in &item.depends_on {
            if !by_id.contains_key(dependency) {
                return Err(WaveError::UnknownDependency {
                    item: item.id.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
    }

    let mut remaining: Vec<&WorkItem> = items.iter().collect();
    let mut done: HashSet<WorkItemId> = HashSet::new();
    let mut waves = Vec::new();

    while !remaining.is_empty() {
        let (ready, blocked): (Vec<&WorkItem>, Vec<&WorkItem>) = remaining
            .into_iter()
            .partition(|item| item.depends_on.iter().all(|dep| done.contains(dep)));

        if ready.is_empty() {
            return Err(WaveError::Cycle {
                items: blocked.iter().map(|item| item.id.clone()).collect(),
            });
        }

        for item in &ready {
            done.insert(item.id.clone());
        }
        waves.push(ready.into_iter().cloned().collect());
        remaining = blocked;
    }

    Ok(waves)
}

/// Whether two artifact paths conflict: equal, or one is a filesystem prefix
/// of the other.
#[must_use]
pub fn paths_conflict(a: &str, b: &str) -> bool {
    let a = Path::new(a);
    let b = Path::new(b);
    a.starts_with(b) || b.starts_with(a)
}

/// Whether any pair of paths across the two sets conflicts.
#[must_use]
pub fn artifact_sets_conflict(a: &[String], b: &[String]) -> bool {
    a.iter()
        .any(|left| b.iter().any(|right| paths_conflict(left, right)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, deps: &[&str]) -> WorkItem {
        WorkItem {
            id: WorkItemId::try_new(id.to_string()).unwrap(),
            scope_id: ScopeId::try_new("scope".to_string()).unwrap(),
            description: format!("item {id}"),
            executor: ExecutorType::Skill,
            budget: Budget::default(),
            gates: Vec::new(),
            checks: Vec::new(),
            approval_token: None,
            depends_on: deps
                .iter()
                .map(|d| WorkItemId::try_new((*d).to_string()).unwrap())
                .collect(),
            input_artifacts_from: Vec::new(),
            on_failure: OnFailure::Retry,
        }
    }

    #[test]
    fn waves_respect_dependencies() {
        let items = vec![
            item("a", &[]),
            item("b", &["a"]),
            item("c", &["a"]),
            item("d", &["b", "c"]),
        ];
        let waves = build_waves(&items).unwrap();
        assert_eq!(waves.len(), 3);
        assert_eq!(waves[0].len(), 1);
        assert_eq!(waves[1].len(), 2);
        assert_eq!(waves[2].len(), 1);
    }

    #[test]
    fn cycle_is_detected() {
        let items = vec![item("a", &["b"]), item("b", &["a"])];
        assert!(matches!(
            build_waves(&items),
            Err(WaveError::Cycle { .. })
        ));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let items = vec![item("a", &["ghost"])];
        assert!(matches!(
            build_waves(&items),
            Err(WaveError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn prefix_paths_conflict() {
        assert!(paths_conflict("build/", "build/"));
        assert!(paths_conflict("build/", "build/out/app"));
        assert!(paths_conflict("build/out/app", "build/"));
        assert!(!paths_conflict("build/", "docs/"));
        // Prefix means path components, not string prefixes.
        assert!(!paths_conflict("build", "build-cache"));
    }

    #[test]
    fn budget_exceeds_uses_greater_or_equal() {
        let budget = Budget {
            max_attempts: 2,
            ..Budget::default()
        };
        let mut used = BudgetUsed::default();
        assert!(!used.exceeds(&budget));
        used.attempts = 2;
        assert!(used.exceeds(&budget));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn exceeds_iff_some_axis_reaches_its_ceiling(
                attempts in 0u32..10,
                tokens in 0u64..1000,
                wall_seconds in 0u64..1000,
                planner_calls in 0u32..10,
                executor_runs in 0u32..10,
            ) {
                let budget = Budget {
                    max_attempts: 5,
                    max_tokens: 500,
                    max_wall_seconds: 500,
                    max_planner_calls: 5,
                    max_executor_runs: 5,
                };
                let used = BudgetUsed {
                    attempts,
                    tokens,
                    wall_seconds,
                    planner_calls,
                    executor_runs,
                };
                let expected = attempts >= 5
                    || tokens >= 500
                    || wall_seconds >= 500
                    || planner_calls >= 5
                    || executor_runs >= 5;
                prop_assert_eq!(used.exceeds(&budget), expected);
            }
        }
    }

    #[test]
    fn budget_merge_sums_axes() {
        let mut a = BudgetUsed {
            attempts: 1,
            tokens: 100,
            wall_seconds: 5,
            planner_calls: 1,
            executor_runs: 2,
        };
        let b = a;
        a.merge(&b);
        assert_eq!(a.attempts, 2);
        assert_eq!(a.tokens, 200);
        assert_eq!(a.executor_runs, 4);
    }
}
