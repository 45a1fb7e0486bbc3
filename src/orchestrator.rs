//! Consumer lifecycle supervision and the external bridge seam.
//!
//! Startup wires the store, router, managers, and consumers together and
//! hands back an [`Orchestrator`] (owning the consumer tasks) and a
//! [`Bridge`] (the embedding runtime's way in and out of the bus). Store
//! failures inside a consumer are logged and the consumer restarts after a
//! short backoff; they never propagate out of the orchestrator.

use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::bus::envelope::{
    Message, MessageKind, PlanRequestBody, QueueName, SenderRole, Taint, UserTurn,
};
use crate::bus::router;
use crate::bus::store::QueueStore;
use crate::consult::{ApprovalRelay, ConsultManager, ReplanManager};
use crate::consumers::executor::ExecutorConsumer;
use crate::consumers::planner::PlannerConsumer;
use crate::consumers::proxy::ProxyConsumer;
use crate::consumers::{Consumer, ConsumerConfig};
use crate::database::{DatabaseConfig, DatabaseConnection, DatabaseError};
use crate::domain_types::{ConcurrencyLimit, ConsumerName, GoalId, MessageId, ScopeId, TraceId};
use crate::error::StoreError;
use crate::research::ResearchTracker;
use crate::time_provider::SharedTimeProvider;
use crate::traits::{
    AgentInvoker, ApprovalVerifier, ChannelPort, SandboxManager, VerificationRunner,
};
use crate::work::item_executor::WorkItemExecutor;
use crate::work::pool::{DEFAULT_GLOBAL_CONCURRENCY, DEFAULT_SCOPE_CONCURRENCY, ExecutorPool};
use crate::work::runner::Runner;

/// Default deadline for [`Bridge::collect_response`].
pub const COLLECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll interval for reply collection.
pub const COLLECT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Delay before restarting a consumer whose incarnation died.
const RESTART_BACKOFF: Duration = Duration::from_secs(1);

const REPLY_LEASE: Duration = Duration::from_secs(60);

/// Errors during runtime construction.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Database could not be opened.
    #[error(transparent)]
    Database(#[from] DatabaseError),

    /// Store could not be opened or recovered.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// External collaborators injected at startup.
pub struct RuntimeSeams {
    /// Proxy agent capability.
    pub proxy_agent: Arc<dyn AgentInvoker>,
    /// Planner agent capability.
    pub planner_agent: Arc<dyn AgentInvoker>,
    /// Executor agent capability.
    pub executor_agent: Arc<dyn AgentInvoker>,
    /// User-facing channel.
    pub channel: Arc<dyn ChannelPort>,
    /// Approval token verifier.
    pub approvals: Arc<dyn ApprovalVerifier>,
    /// Post-execution verification runner.
    pub verifier: Arc<dyn VerificationRunner>,
    /// Sandbox backend.
    pub sandbox: Arc<dyn SandboxManager>,
}

/// Runtime construction parameters.
pub struct RuntimeConfig {
    /// Database settings.
    pub database: DatabaseConfig,
    /// Root directory verification checks run against.
    pub artifacts_root: PathBuf,
    /// Per-scope concurrency cap.
    pub scope_concurrency: ConcurrencyLimit,
    /// Global concurrency cap.
    pub global_concurrency: ConcurrencyLimit,
}

impl RuntimeConfig {
    /// Config with the documented pool defaults.
    ///
    /// # Panics
    ///
    /// Never panics; the defaults are within the validated range.
    #[must_use]
    pub fn new(database: DatabaseConfig, artifacts_root: PathBuf) -> Self {
        Self {
            database,
            artifacts_root,
            scope_concurrency: ConcurrencyLimit::try_new(DEFAULT_SCOPE_CONCURRENCY)
                .expect("default scope cap valid"),
            global_concurrency: ConcurrencyLimit::try_new(DEFAULT_GLOBAL_CONCURRENCY)
                .expect("default global cap valid"),
        }
    }
}

/// Owns the consumer tasks.
pub struct Orchestrator {
    consumers: Vec<Arc<Consumer>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    time: SharedTimeProvider,
}

impl Orchestrator {
    fn new(consumers: Vec<Arc<Consumer>>, time: SharedTimeProvider) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            consumers,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            time,
        }
    }

    /// Spawns one supervised task per consumer.
    ///
    /// # Panics
    ///
    /// Panics if the task registry lock is poisoned.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().expect("task registry lock poisoned");
        for consumer in &self.consumers {
            let consumer = Arc::clone(consumer);
            let shutdown = self.shutdown.subscribe();
            let time = Arc::clone(&self.time);
            tasks.push(tokio::spawn(supervise(consumer, shutdown, time)));
        }
        info!(consumers = self.consumers.len(), "orchestrator started");
    }

    /// Requests cooperative shutdown and waits for every consumer to finish
    /// its current message.
    ///
    /// # Panics
    ///
    /// Panics if the task registry lock is poisoned.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = {
            let mut registry = self.tasks.lock().expect("task registry lock poisoned");
            registry.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
        info!("orchestrator stopped");
    }
}

/// Runs one consumer, restarting it after store failures or panics until
/// shutdown is requested.
async fn supervise(
    consumer: Arc<Consumer>,
    shutdown: watch::Receiver<bool>,
    time: SharedTimeProvider,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let incarnation = {
            let consumer = Arc::clone(&consumer);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { consumer.run(shutdown).await })
        };
        match incarnation.await {
            Ok(Ok(())) => break,
            Ok(Err(store_error)) => {
                error!(
                    consumer = %consumer.name(),
                    error = %store_error,
                    "consumer died on store error; restarting"
                );
            }
            Err(join_error) => {
                error!(
                    consumer = %consumer.name(),
                    error = %join_error,
                    "consumer task aborted; restarting"
                );
            }
        }
        time.sleep(RESTART_BACKOFF).await;
    }
}

/// The embedding runtime's seam onto the bus: enqueue turns and goals, and
/// collect terminal replies.
#[derive(Clone)]
pub struct Bridge {
    store: Arc<QueueStore>,
    time: SharedTimeProvider,
}

impl Bridge {
    /// Builds a bridge over the shared store.
    #[must_use]
    pub fn new(store: Arc<QueueStore>, time: SharedTimeProvider) -> Self {
        Self { store, time }
    }

    /// Builds a `user_message` for a channel turn and enqueues it.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub async fn dispatch_turn(
        &self,
        text: &str,
        trace_id: TraceId,
        metadata: Value,
        scope_id: Option<ScopeId>,
        taint: Option<Taint>,
        tool_allowlist: Vec<String>,
    ) -> Result<MessageId, StoreError> {
        let body = UserTurn {
            text: text.to_string(),
            metadata,
        };
        let mut message = Message::new(
            MessageKind::UserMessage,
            SenderRole::User,
            trace_id,
            serde_json::to_value(&body)?,
        )
        .with_allowlist(tool_allowlist);
        if let Some(scope_id) = scope_id {
            message = message.with_scope(scope_id);
        }
        if let Some(taint) = taint {
            message = message.with_taint(taint);
        }

        let message = router::stamp(message);
        let id = message.id;
        self.store.enqueue(&message).await?;
        info!(message_id = %id, trace_id = %trace_id, outcome = "turn_dispatched", "user turn enqueued");
        Ok(id)
    }

    /// Builds an autonomous `plan_request` and enqueues it straight to the
    /// planner queue.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub async fn dispatch_goal(
        &self,
        goal_id: GoalId,
        description: &str,
        trace_id: TraceId,
    ) -> Result<MessageId, StoreError> {
        let body = PlanRequestBody {
            description: description.to_string(),
            consult: false,
            autonomous: true,
            goal_id: Some(goal_id.to_string()),
            context: Value::Null,
        };
        let message = router::stamp(Message::new(
            MessageKind::PlanRequest,
            SenderRole::Runtime,
            trace_id,
            serde_json::to_value(&body)?,
        ));
        let id = message.id;
        self.store.enqueue(&message).await?;
        info!(message_id = %id, trace_id = %trace_id, outcome = "goal_dispatched", "autonomous goal enqueued");
        Ok(id)
    }

    /// Polls the proxy queue for this trace's terminal `agent_response`.
    /// Non-matching messages are never leased, so concurrent traces do not
    /// disturb each other. On a hit the message is acked and returned; on
    /// deadline, `None`.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub async fn collect_response(
        &self,
        trace_id: TraceId,
        timeout: Duration,
    ) -> Result<Option<Message>, StoreError> {
        let deadline = self.time.now()
            + chrono::Duration::from_std(timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));
        loop {
            if let Some(message) = self
                .store
                .lease_filtered(
                    QueueName::Proxy,
                    trace_id,
                    MessageKind::AgentResponse,
                    REPLY_LEASE,
                )
                .await?
            {
                self.store.ack(message.id).await?;
                info!(
                    message_id = %message.id,
                    trace_id = %trace_id,
                    outcome = "response_collected",
                    "terminal response collected"
                );
                return Ok(Some(message));
            }
            if self.time.now() >= deadline {
                return Ok(None);
            }
            self.time.sleep(COLLECT_POLL_INTERVAL).await;
        }
    }

    /// The shared store, for embedders that need direct access (monitoring,
    /// tests).
    #[must_use]
    pub fn store(&self) -> &Arc<QueueStore> {
        &self.store
    }
}

fn consumer_name(name: &str) -> ConsumerName {
    ConsumerName::try_new(name.to_string()).expect("static consumer name valid")
}

/// Opens the store, recovers expired leases, wires every component, and
/// returns the orchestrator/bridge pair. The caller invokes
/// [`Orchestrator::start`].
///
/// # Errors
///
/// Returns an error if the database or store cannot be opened.
pub async fn build_runtime(
    config: RuntimeConfig,
    seams: RuntimeSeams,
    time: SharedTimeProvider,
) -> Result<(Orchestrator, Bridge), BuildError> {
    let connection = DatabaseConnection::initialize(config.database).await?;
    let store = Arc::new(QueueStore::open(connection, Arc::clone(&time)).await?);

    let requeued = store.requeue_expired().await?;
    if requeued > 0 {
        info!(requeued, "recovered expired leases at startup");
    }

    let pool = ExecutorPool::new(config.scope_concurrency, config.global_concurrency);
    let research = Arc::new(ResearchTracker::new());
    let consult = ConsultManager::new(Arc::clone(&store), Arc::clone(&time));
    let replan = ReplanManager::new(Arc::clone(&store));
    let relay = ApprovalRelay::new(Arc::clone(&store), Arc::clone(&time));

    let work = Arc::new(WorkItemExecutor::new(
        Arc::clone(&seams.executor_agent),
        Arc::clone(&seams.approvals),
        Arc::clone(&seams.verifier),
        Arc::clone(&seams.sandbox),
        consult.clone(),
        replan.clone(),
        relay,
        Arc::clone(&time),
        config.artifacts_root,
    ));

    let proxy = Consumer::new(
        Arc::clone(&store),
        Arc::new(ProxyConsumer::new(
            Arc::clone(&store),
            seams.proxy_agent,
            seams.channel,
        )),
        ConsumerConfig::new(consumer_name("proxy"), QueueName::Proxy),
        Arc::clone(&time),
    );

    let planner = Consumer::new(
        Arc::clone(&store),
        Arc::new(PlannerConsumer::new(
            Arc::clone(&store),
            seams.planner_agent,
            research,
            Arc::clone(&time),
        )),
        ConsumerConfig::new(consumer_name("planner"), QueueName::Planner),
        Arc::clone(&time),
    );

    let executor = Consumer::new(
        Arc::clone(&store),
        Arc::new(ExecutorConsumer::new(
            Arc::clone(&store),
            seams.executor_agent,
            Some(work),
            pool,
            consult,
            replan,
            Runner::new(Arc::clone(&time)),
        )),
        ConsumerConfig::new(consumer_name("executor"), QueueName::Executor),
        Arc::clone(&time),
    );

    let orchestrator = Orchestrator::new(
        vec![Arc::new(proxy), Arc::new(planner), Arc::new(executor)],
        Arc::clone(&time),
    );
    let bridge = Bridge::new(store, time);

    Ok((orchestrator, bridge))
}
