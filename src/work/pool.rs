//! Concurrency gate for parallel work execution.
//!
//! Admission requires two permits: one from the per-scope semaphore
//! (default 8) and one from the global semaphore (default 16). Waiters are
//! admitted in priority order — approved execution before research before
//! status work — with submission order breaking ties. A waiter whose scope is
//! saturated does not hold back lower-priority waiters in other scopes.
//!
//! Conflict detection over `input_artifacts_from` path sets is computed
//! before a wave dispatches: items whose path sets overlap are chained into
//! one group and run sequentially, earliest-submitted first; disjoint groups
//! run concurrently.

use dashmap::DashMap;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, oneshot, watch};
use tracing::debug;

use crate::domain_types::{ConcurrencyLimit, ScopeId, TaskId};
use crate::work::{WorkItem, artifact_sets_conflict};

/// Default per-scope concurrency.
pub const DEFAULT_SCOPE_CONCURRENCY: usize = 8;

/// Default global concurrency.
pub const DEFAULT_GLOBAL_CONCURRENCY: usize = 16;

/// Priority classes for the waiting queue, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PriorityClass {
    /// Approved execution work.
    ApprovedExecution = 0,
    /// Research requests.
    Research = 1,
    /// Status and housekeeping work.
    Status = 2,
}

/// The pool was shut down while a waiter was queued.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("executor pool closed while waiting for admission")]
pub struct PoolClosed;

struct Waiter {
    class: PriorityClass,
    seq: u64,
    scope: Arc<Semaphore>,
    wake: oneshot::Sender<PermitPair>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.class == other.class && self.seq == other.seq
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; invert so the lowest (class, seq) pops
        // first.
        (other.class, other.seq).cmp(&(self.class, self.seq))
    }
}

struct PermitPair {
    global: OwnedSemaphorePermit,
    scope: OwnedSemaphorePermit,
}

struct PoolInner {
    global: Arc<Semaphore>,
    scopes: DashMap<ScopeId, Arc<Semaphore>>,
    scope_limit: usize,
    waiting: Mutex<BinaryHeap<Waiter>>,
    cancels: DashMap<TaskId, watch::Sender<bool>>,
    seq: AtomicU64,
}

impl PoolInner {
    fn scope_semaphore(&self, scope: &ScopeId) -> Arc<Semaphore> {
        self.scopes
            .entry(scope.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.scope_limit)))
            .clone()
    }

    /// Admits as many waiters as permits allow, best-first. Purely
    /// synchronous: permits are taken with `try_acquire` and handed over the
    /// waiter's oneshot.
    fn pump(&self) {
        let mut queue = self.waiting.lock().expect("pool waiting lock poisoned");
        let mut parked = Vec::new();

        while let Some(waiter) = queue.pop() {
            let Ok(global) = Arc::clone(&self.global).try_acquire_owned() else {
                // Global exhausted: nobody can be admitted this round.
                parked.push(waiter);
                break;
            };
            match Arc::clone(&waiter.scope).try_acquire_owned() {
                Ok(scope) => {
                    // A dropped receiver returns the permits via PermitPair.
                    let _ = waiter.wake.send(PermitPair { global, scope });
                }
                Err(_) => {
                    // Scope saturated; let lower-priority waiters in other
                    // scopes through.
                    drop(global);
                    parked.push(waiter);
                }
            }
        }

        for waiter in parked {
            queue.push(waiter);
        }
    }
}

/// Two-level semaphore gate with priority admission and cancellation.
#[derive(Clone)]
pub struct ExecutorPool {
    inner: Arc<PoolInner>,
}

impl ExecutorPool {
    /// Creates a pool with the given caps.
    #[must_use]
    pub fn new(scope_limit: ConcurrencyLimit, global_limit: ConcurrencyLimit) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                global: Arc::new(Semaphore::new(global_limit.as_usize())),
                scopes: DashMap::new(),
                scope_limit: scope_limit.as_usize(),
                waiting: Mutex::new(BinaryHeap::new()),
                cancels: DashMap::new(),
                seq: AtomicU64::new(0),
            }),
        }
    }

    /// Creates a pool with the documented defaults (8 per scope, 16 global).
    ///
    /// # Panics
    ///
    /// Never panics; the defaults are within the validated range.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(
            ConcurrencyLimit::try_new(DEFAULT_SCOPE_CONCURRENCY).expect("default scope cap valid"),
            ConcurrencyLimit::try_new(DEFAULT_GLOBAL_CONCURRENCY).expect("default global cap valid"),
        )
    }

    /// Waits for admission: both the scope and the global permit. The permit
    /// releases on drop.
    ///
    /// # Errors
    ///
    /// Returns [`PoolClosed`] if the pool is torn down while waiting.
    pub async fn acquire(
        &self,
        scope: &ScopeId,
        class: PriorityClass,
    ) -> Result<PoolPermit, PoolClosed> {
        let seq = self.inner.seq.fetch_add(1, Ordering::SeqCst);
        let (wake, admitted) = oneshot::channel();
        {
            let mut queue = self
                .inner
                .waiting
                .lock()
                .expect("pool waiting lock poisoned");
            queue.push(Waiter {
                class,
                seq,
                scope: self.inner.scope_semaphore(scope),
                wake,
            });
        }
        self.inner.pump();

        let permits = admitted.await.map_err(|_| PoolClosed)?;
        debug!(scope = %scope, class = ?class, seq, outcome = "admitted", "pool admission");
        Ok(PoolPermit {
            permits: Some(permits),
            pool: Arc::downgrade(&self.inner),
        })
    }

    /// Registers a cancellation signal for a task and returns the receiver
    /// the task should watch.
    #[must_use]
    pub fn register_cancel(&self, task_id: TaskId) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        self.inner.cancels.insert(task_id, tx);
        rx
    }

    /// Signals cancellation to a running task. Returns whether the task was
    /// known.
    pub fn cancel(&self, task_id: &TaskId) -> bool {
        if let Some(entry) = self.inner.cancels.get(task_id) {
            let _ = entry.send(true);
            debug!(task_id = %task_id, outcome = "cancelled", "task cancellation signalled");
            true
        } else {
            false
        }
    }

    /// Removes a finished task's cancellation registration.
    pub fn clear_cancel(&self, task_id: &TaskId) {
        self.inner.cancels.remove(task_id);
    }

    /// Number of free global permits; for tests and monitoring.
    #[must_use]
    pub fn available_global(&self) -> usize {
        self.inner.global.available_permits()
    }
}

/// Held admission; dropping releases both permits and admits the next
/// waiter.
pub struct PoolPermit {
    permits: Option<PermitPair>,
    pool: std::sync::Weak<PoolInner>,
}

impl Drop for PoolPermit {
    fn drop(&mut self) {
        self.permits.take();
        if let Some(pool) = self.pool.upgrade() {
            pool.pump();
        }
    }
}

/// Partitions a wave into conflict groups by `input_artifacts_from` overlap.
///
/// Returned groups hold indexes into `items` in submission order; items in
/// one group must run sequentially, distinct groups may run concurrently.
#[must_use]
pub fn conflict_groups(items: &[WorkItem]) -> Vec<Vec<usize>> {
    let mut groups: Vec<Vec<usize>> = Vec::new();

    for (index, item) in items.iter().enumerate() {
        let conflicting: Vec<usize> = groups
            .iter()
            .enumerate()
            .filter(|(_, group)| {
                group.iter().any(|&other| {
                    artifact_sets_conflict(
                        &item.input_artifacts_from,
                        &items[other].input_artifacts_from,
                    )
                })
            })
            .map(|(group_index, _)| group_index)
            .collect();

        match conflicting.as_slice() {
            [] => groups.push(vec![index]),
            [first] => groups[*first].push(index),
            [first, rest @ ..] => {
                // The new item bridges several groups; merge them so the
                // whole overlapping chain serializes.
                let mut merged: Vec<usize> = groups[*first].clone();
                for &group_index in rest.iter().rev() {
                    merged.extend(groups.remove(group_index));
                }
                merged.push(index);
                merged.sort_unstable();
                groups[*first] = merged;
            }
        }
    }

    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::WorkItemId;
    use crate::work::{Budget, ExecutorType, OnFailure};

    fn item(id: &str, paths: &[&str]) -> WorkItem {
        WorkItem {
            id: WorkItemId::try_new(id.to_string()).unwrap(),
            scope_id: ScopeId::try_new("scope".to_string()).unwrap(),
            description: String::new(),
            executor: ExecutorType::Skill,
            budget: Budget::default(),
            gates: Vec::new(),
            checks: Vec::new(),
            approval_token: None,
            depends_on: Vec::new(),
            input_artifacts_from: paths.iter().map(ToString::to_string).collect(),
            on_failure: OnFailure::Retry,
        }
    }

    fn scope(name: &str) -> ScopeId {
        ScopeId::try_new(name.to_string()).unwrap()
    }

    #[test]
    fn overlapping_items_share_a_group() {
        let items = vec![
            item("a", &["build/"]),
            item("b", &["build/"]),
            item("c", &["docs/"]),
        ];
        let groups = conflict_groups(&items);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0], vec![0, 1]);
        assert_eq!(groups[1], vec![2]);
    }

    #[test]
    fn bridging_item_merges_groups() {
        let items = vec![
            item("a", &["build/"]),
            item("b", &["docs/"]),
            item("c", &["build/", "docs/"]),
        ];
        let groups = conflict_groups(&items);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0], vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn global_cap_bounds_admission() {
        let pool = ExecutorPool::new(
            ConcurrencyLimit::try_new(8).unwrap(),
            ConcurrencyLimit::try_new(2).unwrap(),
        );
        let s = scope("s1");
        let a = pool
            .acquire(&s, PriorityClass::ApprovedExecution)
            .await
            .unwrap();
        let _b = pool
            .acquire(&s, PriorityClass::ApprovedExecution)
            .await
            .unwrap();
        assert_eq!(pool.available_global(), 0);

        let pool2 = pool.clone();
        let s2 = scope("s2");
        let waiter =
            tokio::spawn(async move { pool2.acquire(&s2, PriorityClass::Research).await });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(a);
        let permit = waiter.await.unwrap();
        assert!(permit.is_ok());
    }

    #[tokio::test]
    async fn priority_orders_waiters() {
        let pool = ExecutorPool::new(
            ConcurrencyLimit::try_new(8).unwrap(),
            ConcurrencyLimit::try_new(1).unwrap(),
        );
        let s = scope("s1");
        let held = pool.acquire(&s, PriorityClass::ApprovedExecution).await.unwrap();

        let low_pool = pool.clone();
        let low_scope = scope("s1");
        let low = tokio::spawn(async move {
            low_pool.acquire(&low_scope, PriorityClass::Status).await
        });
        tokio::task::yield_now().await;

        let high_pool = pool.clone();
        let high_scope = scope("s1");
        let high = tokio::spawn(async move {
            high_pool
                .acquire(&high_scope, PriorityClass::ApprovedExecution)
                .await
        });
        tokio::task::yield_now().await;

        // Release the held permit; the high-priority waiter (submitted
        // second) must be admitted first.
        drop(held);
        let high_permit = high.await.unwrap().unwrap();
        tokio::task::yield_now().await;
        assert!(!low.is_finished());

        drop(high_permit);
        assert!(low.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn cancel_signals_registered_task() {
        let pool = ExecutorPool::with_defaults();
        let task = TaskId::try_new("t1".to_string()).unwrap();
        let mut rx = pool.register_cancel(task.clone());
        assert!(!*rx.borrow());
        assert!(pool.cancel(&task));
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        pool.clear_cancel(&task);
        assert!(!pool.cancel(&task));
    }
}
