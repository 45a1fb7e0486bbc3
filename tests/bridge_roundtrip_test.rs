//! End-to-end paths through the full runtime: the direct reply path and the
//! plan-approve-execute path.

mod common;

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use test_log::test;

use common::{NullSandbox, PassingChecks, ScriptedAgent, ScriptedChannel};
use switchyard::bus::envelope::QueueName;
use switchyard::database::{DatabaseConfig, DatabasePath};
use switchyard::domain_types::TraceId;
use switchyard::orchestrator::{RuntimeConfig, RuntimeSeams, build_runtime};
use switchyard::time_provider::mock_time_provider;
use switchyard::traits::StatusSurface;

struct Fixture {
    proxy: Arc<ScriptedAgent>,
    planner: Arc<ScriptedAgent>,
    executor: Arc<ScriptedAgent>,
    channel: Arc<ScriptedChannel>,
}

async fn start_runtime(
    dir: &tempfile::TempDir,
    channel: ScriptedChannel,
    approvals: Arc<dyn switchyard::traits::ApprovalVerifier>,
) -> (
    switchyard::Orchestrator,
    switchyard::Bridge,
    Fixture,
) {
    let proxy = Arc::new(ScriptedAgent::new());
    let planner = Arc::new(ScriptedAgent::new());
    let executor = Arc::new(ScriptedAgent::new());
    let channel = Arc::new(channel);

    let database = DatabaseConfig::for_testing(
        DatabasePath::new(dir.path().join("runtime.db")).unwrap(),
    )
    .with_max_connections(4);
    let config = RuntimeConfig::new(database, dir.path().join("artifacts"));

    let seams = RuntimeSeams {
        proxy_agent: Arc::clone(&proxy) as _,
        planner_agent: Arc::clone(&planner) as _,
        executor_agent: Arc::clone(&executor) as _,
        channel: Arc::clone(&channel) as _,
        approvals,
        verifier: Arc::new(PassingChecks),
        sandbox: Arc::new(NullSandbox),
    };

    let (orchestrator, bridge) = build_runtime(config, seams, mock_time_provider())
        .await
        .unwrap();
    orchestrator.start();

    (
        orchestrator,
        bridge,
        Fixture {
            proxy,
            planner,
            executor,
            channel,
        },
    )
}

#[test(tokio::test)]
async fn test_direct_path_round_trips_within_a_second() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, bridge, fixture) = start_runtime(
        &dir,
        ScriptedChannel::approving("unused"),
        Arc::new(common::ApproveAll),
    )
    .await;

    fixture
        .proxy
        .push_output(json!({"route": "direct", "response": "hello"}), 10);

    let trace = TraceId::generate();
    bridge
        .dispatch_turn("hi", trace, json!({}), None, None, Vec::new())
        .await
        .unwrap();

    let response = bridge
        .collect_response(trace, Duration::from_secs(1))
        .await
        .unwrap()
        .expect("terminal response within one second");
    assert_eq!(response.payload["text"], "hello");
    assert_eq!(response.trace_id, trace);

    // The trace leaves nothing behind on the proxy queue once the consumer
    // finishes acking the turn.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        if bridge.store().pending_count(QueueName::Proxy).await.unwrap() == 0 {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "proxy queue did not drain"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    orchestrator.stop().await;
}

#[test(tokio::test)]
async fn test_plan_path_executes_after_approval() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, bridge, fixture) = start_runtime(
        &dir,
        ScriptedChannel::approving("TKN"),
        Arc::new(common::ApproveAll),
    )
    .await;

    fixture.proxy.push_output(
        json!({"route": "planner", "description": "build it"}),
        10,
    );
    fixture.planner.push_output(
        json!({
            "plan": {"summary": "one step"},
            "work_items": [{
                "id": "wi-1",
                "scope_id": "scope-a",
                "description": "do the build",
                "executor": "skill"
            }]
        }),
        20,
    );
    fixture.executor.push_output(json!({"result": "built"}), 30);

    let trace = TraceId::generate();
    bridge
        .dispatch_turn("build it", trace, json!({}), None, None, Vec::new())
        .await
        .unwrap();

    // The terminal signal for this path is the execution status reaching the
    // channel's stream surface.
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    let done = loop {
        let statuses = fixture.channel.statuses();
        if let Some(done) = statuses
            .iter()
            .find(|(status, _)| status["status"] == "done")
        {
            break done.clone();
        }
        assert!(
            std::time::Instant::now() < deadline,
            "execution never reported done; statuses: {statuses:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert!(done.1.contains(&StatusSurface::Stream));
    assert_eq!(done.0["work_item_id"], "wi-1");

    // Running status stayed off the stream surface.
    let running = fixture
        .channel
        .statuses()
        .into_iter()
        .find(|(status, _)| status["status"] == "running")
        .expect("running status routed");
    assert_eq!(running.1, vec![StatusSurface::Activity]);

    // One invocation each: proxy turn, planner plan, executor run.
    assert_eq!(fixture.proxy.call_count(), 1);
    assert_eq!(fixture.planner.call_count(), 1);
    assert_eq!(fixture.executor.call_count(), 1);

    orchestrator.stop().await;
}

#[test(tokio::test)]
async fn test_declined_plan_produces_terminal_response() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, bridge, fixture) = start_runtime(
        &dir,
        ScriptedChannel::declining(),
        Arc::new(common::ApproveAll),
    )
    .await;

    fixture.proxy.push_output(
        json!({"route": "planner", "description": "build it"}),
        10,
    );
    fixture
        .planner
        .push_output(json!({"plan": {"summary": "one step"}}), 20);

    let trace = TraceId::generate();
    bridge
        .dispatch_turn("build it", trace, json!({}), None, None, Vec::new())
        .await
        .unwrap();

    let response = bridge
        .collect_response(trace, Duration::from_secs(5))
        .await
        .unwrap()
        .expect("declined plan still answers the user");
    let text = response.payload["text"].as_str().unwrap();
    assert!(text.contains("not approved"), "unexpected text: {text}");

    // Nothing reached the executor.
    assert_eq!(fixture.executor.call_count(), 0);

    orchestrator.stop().await;
}
