//! Shared fixtures: temp-file stores, scripted seams, and message builders.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

use switchyard::bus::envelope::{Message, MessageKind, SenderRole};
use switchyard::bus::router;
use switchyard::bus::store::QueueStore;
use switchyard::database::{DatabaseConfig, DatabaseConnection, DatabasePath};
use switchyard::domain_types::{ApprovalToken, ScopeId, TraceId, WorkItemId};
use switchyard::error::{
    AgentError, ApprovalError, ChannelError, SandboxError, VerificationError,
};
use switchyard::time_provider::SharedTimeProvider;
use switchyard::traits::{
    AgentCall, AgentInvoker, ApprovalDecision, ApprovalOutcome, ApprovalVerifier, ChannelPort,
    ExecOutput, SandboxHandle, SandboxManager, StatusSurface, VerificationReport,
    VerificationRunner,
};
use switchyard::work::{Budget, ExecutorType, OnFailure, WorkItem};

/// Opens a store over a fresh temp-file database.
pub async fn open_store(time: SharedTimeProvider) -> (Arc<QueueStore>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let path = DatabasePath::new(dir.path().join("queues.db")).unwrap();
    let config = DatabaseConfig::for_testing(path).with_max_connections(4);
    let connection = DatabaseConnection::initialize(config).await.unwrap();
    let store = Arc::new(QueueStore::open(connection, time).await.unwrap());
    (store, dir)
}

/// Agent whose replies are scripted in order. Records every call with start
/// and end instants; when the script is empty it answers with an empty
/// success.
pub struct ScriptedAgent {
    replies: Mutex<VecDeque<switchyard::traits::AgentReply>>,
    spans: Mutex<Vec<(String, Instant, Instant)>>,
    delay: Duration,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            spans: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new()
        }
    }

    pub fn push_output(&self, output: Value, tokens_used: u64) {
        self.replies
            .lock()
            .unwrap()
            .push_back(switchyard::traits::AgentReply::ok(output, tokens_used));
    }

    pub fn push_failure(&self, failure: switchyard::error::ErrorPayload, tokens_used: u64) {
        self.replies
            .lock()
            .unwrap()
            .push_back(switchyard::traits::AgentReply::failed(failure, tokens_used));
    }

    pub fn call_count(&self) -> usize {
        self.spans.lock().unwrap().len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.spans
            .lock()
            .unwrap()
            .iter()
            .map(|(prompt, _, _)| prompt.clone())
            .collect()
    }

    /// `(prompt, started, finished)` per call, in call order.
    pub fn spans(&self) -> Vec<(String, Instant, Instant)> {
        self.spans.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentInvoker for ScriptedAgent {
    async fn invoke(
        &self,
        call: AgentCall,
    ) -> Result<switchyard::traits::AgentReply, AgentError> {
        let started = Instant::now();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| switchyard::traits::AgentReply::ok(json!({}), 0));
        self.spans
            .lock()
            .unwrap()
            .push((call.prompt, started, Instant::now()));
        Ok(reply)
    }
}

/// Channel that approves (or declines) every plan and records everything it
/// is asked to render.
pub struct ScriptedChannel {
    approve: bool,
    token: Option<String>,
    statuses: Mutex<Vec<(Value, Vec<StatusSurface>)>>,
    cards: Mutex<Vec<Value>>,
}

impl ScriptedChannel {
    pub fn approving(token: &str) -> Self {
        Self {
            approve: true,
            token: Some(token.to_string()),
            statuses: Mutex::new(Vec::new()),
            cards: Mutex::new(Vec::new()),
        }
    }

    pub fn declining() -> Self {
        Self {
            approve: false,
            token: None,
            statuses: Mutex::new(Vec::new()),
            cards: Mutex::new(Vec::new()),
        }
    }

    pub fn statuses(&self) -> Vec<(Value, Vec<StatusSurface>)> {
        self.statuses.lock().unwrap().clone()
    }

    pub fn cards(&self) -> Vec<Value> {
        self.cards.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelPort for ScriptedChannel {
    async fn request_approval(
        &self,
        _trace_id: TraceId,
        _plan: &Value,
    ) -> Result<ApprovalDecision, ChannelError> {
        Ok(ApprovalDecision {
            approved: self.approve,
            token: self
                .token
                .clone()
                .map(|token| ApprovalToken::try_new(token).unwrap()),
        })
    }

    async fn render_card(&self, _trace_id: TraceId, card: &Value) -> Result<(), ChannelError> {
        self.cards.lock().unwrap().push(card.clone());
        Ok(())
    }

    async fn route_status(
        &self,
        _trace_id: TraceId,
        status: &Value,
        surfaces: &[StatusSurface],
    ) -> Result<(), ChannelError> {
        self.statuses
            .lock()
            .unwrap()
            .push((status.clone(), surfaces.to_vec()));
        Ok(())
    }
}

/// Verifier that accepts every token.
pub struct ApproveAll;

#[async_trait]
impl ApprovalVerifier for ApproveAll {
    async fn check(
        &self,
        _token: &ApprovalToken,
        _work_item: &WorkItem,
    ) -> Result<ApprovalOutcome, ApprovalError> {
        Ok(ApprovalOutcome {
            ok: true,
            reason: None,
        })
    }
}

/// Verifier that rejects every token.
pub struct RejectAll;

#[async_trait]
impl ApprovalVerifier for RejectAll {
    async fn check(
        &self,
        _token: &ApprovalToken,
        _work_item: &WorkItem,
    ) -> Result<ApprovalOutcome, ApprovalError> {
        Ok(ApprovalOutcome {
            ok: false,
            reason: Some("token rejected by fixture".to_string()),
        })
    }
}

/// Verification runner that passes everything.
pub struct PassingChecks;

#[async_trait]
impl VerificationRunner for PassingChecks {
    async fn run(
        &self,
        _work_item: &WorkItem,
        _artifacts_root: &Path,
    ) -> Result<VerificationReport, VerificationError> {
        Ok(VerificationReport {
            pass: true,
            fails: Vec::new(),
        })
    }
}

/// Sandbox that fabricates handles and succeeds at everything.
pub struct NullSandbox;

#[async_trait]
impl SandboxManager for NullSandbox {
    async fn create(&self, scope: &ScopeId) -> Result<SandboxHandle, SandboxError> {
        Ok(SandboxHandle(format!("sbx-{scope}")))
    }

    async fn exec(
        &self,
        _sandbox: &SandboxHandle,
        _command: &str,
    ) -> Result<ExecOutput, SandboxError> {
        Ok(ExecOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    async fn destroy(&self, _sandbox: &SandboxHandle) -> Result<(), SandboxError> {
        Ok(())
    }
}

/// A minimal skill-type work item.
pub fn work_item(id: &str, description: &str, paths: &[&str]) -> WorkItem {
    WorkItem {
        id: WorkItemId::try_new(id.to_string()).unwrap(),
        scope_id: ScopeId::try_new("test-scope".to_string()).unwrap(),
        description: description.to_string(),
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

/// A routed message ready to enqueue.
pub fn routed(kind: MessageKind, sender: SenderRole, trace_id: TraceId, payload: Value) -> Message {
    router::stamp(Message::new(kind, sender, trace_id, payload))
}
