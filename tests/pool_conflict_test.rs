//! Work-item pipeline behavior under the pool: conflicting artifact paths
//! serialize, disjoint ones overlap, gates and approval binding block, and
//! cancellation surfaces as a failed status.

mod common;

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use test_log::test;

use common::{
    ApproveAll, NullSandbox, PassingChecks, RejectAll, ScriptedAgent, open_store, routed,
    work_item,
};
use switchyard::bus::envelope::{ExecutionRequestBody, MessageKind, QueueName, SenderRole};
use switchyard::consult::{ApprovalRelay, ConsultManager, ReplanManager};
use switchyard::consumers::MessageHandler;
use switchyard::consumers::executor::ExecutorConsumer;
use switchyard::domain_types::{ApprovalToken, TaskId, TraceId};
use switchyard::time_provider::mock_time_provider;
use switchyard::work::item_executor::WorkItemExecutor;
use switchyard::work::pool::ExecutorPool;
use switchyard::work::runner::Runner;
use switchyard::work::{Gate, GateAction, GateTrigger, WorkItem};

const LEASE: Duration = Duration::from_secs(60);

struct Pipeline {
    store: Arc<switchyard::bus::store::QueueStore>,
    agent: Arc<ScriptedAgent>,
    pool: ExecutorPool,
    consumer: ExecutorConsumer,
    _dir: tempfile::TempDir,
}

async fn pipeline(agent: ScriptedAgent, approvals: Arc<dyn switchyard::traits::ApprovalVerifier>) -> Pipeline {
    let time = mock_time_provider();
    let (store, dir) = open_store(Arc::clone(&time) as _).await;
    let agent = Arc::new(agent);
    let consult = ConsultManager::new(Arc::clone(&store), Arc::clone(&time) as _);
    let replan = ReplanManager::new(Arc::clone(&store));
    let relay = ApprovalRelay::new(Arc::clone(&store), Arc::clone(&time) as _);
    let pool = ExecutorPool::with_defaults();

    let work = Arc::new(WorkItemExecutor::new(
        Arc::clone(&agent) as _,
        approvals,
        Arc::new(PassingChecks),
        Arc::new(NullSandbox),
        consult.clone(),
        replan.clone(),
        relay,
        Arc::clone(&time) as _,
        dir.path().join("artifacts"),
    ));

    let consumer = ExecutorConsumer::new(
        Arc::clone(&store),
        Arc::clone(&agent) as _,
        Some(work),
        pool.clone(),
        consult,
        replan,
        Runner::new(Arc::clone(&time) as _),
    );

    Pipeline {
        store,
        agent,
        pool,
        consumer,
        _dir: dir,
    }
}

fn execution_request(
    trace: TraceId,
    items: Vec<WorkItem>,
) -> switchyard::bus::envelope::Message {
    let body = ExecutionRequestBody {
        work_items: items,
        description: String::new(),
        replan_depth: 0,
    };
    routed(
        MessageKind::ExecutionRequest,
        SenderRole::Proxy,
        trace,
        serde_json::to_value(&body).unwrap(),
    )
    .with_approval_token(ApprovalToken::try_new("TKN".to_string()).unwrap())
}

async fn statuses_for(
    store: &switchyard::bus::store::QueueStore,
    trace: TraceId,
) -> Vec<serde_json::Value> {
    let mut collected = Vec::new();
    while let Some(message) = store
        .lease_filtered(QueueName::Proxy, trace, MessageKind::ExecutionStatus, LEASE)
        .await
        .unwrap()
    {
        store.ack(message.id).await.unwrap();
        collected.push(message.payload);
    }
    collected
}

#[test(tokio::test)]
async fn test_conflicting_items_serialize_and_disjoint_items_overlap() {
    let fixture = pipeline(
        ScriptedAgent::with_delay(Duration::from_millis(50)),
        Arc::new(ApproveAll),
    )
    .await;
    let trace = TraceId::generate();

    let request = execution_request(
        trace,
        vec![
            work_item("wi-a", "task A", &["build/"]),
            work_item("wi-b", "task B", &["build/"]),
            work_item("wi-c", "task C", &["docs/"]),
        ],
    );
    fixture.consumer.handle(&request).await.unwrap();

    let spans = fixture.agent.spans();
    let span = |needle: &str| {
        spans
            .iter()
            .find(|(prompt, _, _)| prompt.contains(needle))
            .unwrap_or_else(|| panic!("no span for {needle}"))
            .clone()
    };
    let (_, a_start, a_end) = span("task A");
    let (_, b_start, _) = span("task B");
    let (_, c_start, c_end) = span("task C");

    // A and B share build/: B starts no earlier than A's completion.
    assert!(b_start >= a_end, "conflicting items overlapped");
    // C is disjoint and runs concurrently with A.
    assert!(c_start < a_end && a_start < c_end, "disjoint item was serialized");

    // Every item reported done.
    let statuses = statuses_for(&fixture.store, trace).await;
    let done = statuses
        .iter()
        .filter(|status| status["status"] == "done")
        .count();
    assert_eq!(done, 3);
}

#[test(tokio::test)]
async fn test_blocking_gate_stops_the_item_before_the_agent_runs() {
    let fixture = pipeline(ScriptedAgent::new(), Arc::new(ApproveAll)).await;
    let trace = TraceId::generate();

    let mut item = work_item("wi-gated", "guarded work", &[]);
    item.gates.push(Gate {
        label: "no-side-effects".to_string(),
        trigger: GateTrigger::OnToolCall,
        action: GateAction::Block,
    });

    let request = execution_request(trace, vec![item]);
    fixture.consumer.handle(&request).await.unwrap();

    assert_eq!(fixture.agent.call_count(), 0);
    let statuses = statuses_for(&fixture.store, trace).await;
    let blocked = statuses
        .iter()
        .find(|status| status["status"] == "blocked")
        .expect("blocked status emitted");
    assert_eq!(blocked["error"]["kind"], "gate_blocked");
}

#[test(tokio::test)]
async fn test_invalid_approval_token_blocks_execution() {
    let fixture = pipeline(ScriptedAgent::new(), Arc::new(RejectAll)).await;
    let trace = TraceId::generate();

    let request = execution_request(trace, vec![work_item("wi-x", "unapproved", &[])]);
    fixture.consumer.handle(&request).await.unwrap();

    assert_eq!(fixture.agent.call_count(), 0);
    let statuses = statuses_for(&fixture.store, trace).await;
    let blocked = statuses
        .iter()
        .find(|status| status["status"] == "blocked")
        .expect("blocked status emitted");
    assert_eq!(blocked["error"]["kind"], "approval_denied");
}

#[test(tokio::test)]
async fn test_cancellation_surfaces_as_failed_with_reason() {
    let fixture = pipeline(
        ScriptedAgent::with_delay(Duration::from_millis(200)),
        Arc::new(ApproveAll),
    )
    .await;
    let trace = TraceId::generate();
    let request = execution_request(trace, vec![work_item("wi-slow", "long running", &[])]);

    let pool = fixture.pool.clone();
    let cancel_task = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.cancel(&TaskId::try_new("wi-slow".to_string()).unwrap())
    });

    fixture.consumer.handle(&request).await.unwrap();
    assert!(cancel_task.await.unwrap(), "task was not registered for cancel");

    let statuses = statuses_for(&fixture.store, trace).await;
    let failed = statuses
        .iter()
        .find(|status| status["status"] == "failed")
        .expect("failed status emitted");
    assert_eq!(failed["detail"], "cancelled");

    let done = statuses.iter().any(|status| status["status"] == "done");
    assert!(!done, "cancelled item must not report done");
}

#[test(tokio::test)]
async fn test_dependency_cycle_fails_items_without_running_them() {
    let fixture = pipeline(ScriptedAgent::new(), Arc::new(ApproveAll)).await;
    let trace = TraceId::generate();

    let mut a = work_item("wi-a", "a", &[]);
    let mut b = work_item("wi-b", "b", &[]);
    a.depends_on = vec![b.id.clone()];
    b.depends_on = vec![a.id.clone()];

    let request = execution_request(trace, vec![a, b]);
    fixture.consumer.handle(&request).await.unwrap();

    assert_eq!(fixture.agent.call_count(), 0);
    let statuses = statuses_for(&fixture.store, trace).await;
    assert_eq!(statuses.len(), 2);
    assert!(statuses.iter().all(|status| status["status"] == "failed"));
}
