//! In-process SDK backed by a scripted server
//!
//! Workflows start running as soon as a worker polls their task queue.
//! Activities are invoked directly on the registered implementation and
//! every step is recorded as a history event, so fetched histories replay
//! through [`LoopbackWorker::replay`] the same way recorded fixtures do.
//!
//! Replay matches the activity calls made by the workflow code against the
//! scheduled activities in the history, in order. Any difference is a
//! nondeterminism failure.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::watch;

use crate::common::{Error, Result};
use crate::harness::version::Version;
use crate::sdk::{
    Activities, ClientOptions, EventType, ExecutionStatus, HistoryEvent, Payload, RpcCode,
    RpcError, Sdk, ServiceOptions, Worker, WorkerFactory, WorkerFactoryOptions, WorkerOptions,
    WorkflowClient, WorkflowContext, WorkflowDefinition, WorkflowExecution,
    WorkflowExecutionHistory, WorkflowExecutionInfo, WorkflowFailure, WorkflowOptions,
    WorkflowService,
};

/// Language name used in fixture file names
pub const SDK_NAME: &str = "rust";

/// Version reported unless overridden
pub const SDK_VERSION: Version = Version::new(0, 1, 0, false);

/// How long `result` waits when the workflow has no execution timeout
const DEFAULT_RESULT_TIMEOUT: Duration = Duration::from_secs(60);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How the server answers update RPCs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateSupport {
    /// Updates reach workflows; unknown workflows are "not found"
    #[default]
    Enabled,
    /// Disabled by dynamic config ("permission denied")
    Disabled,
    /// Server predates updates ("unimplemented")
    Unimplemented,
}

/// A call that reached the server, with the address it was sent to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub target: String,
    pub operation: &'static str,
}

type Completion = Option<std::result::Result<Payload, String>>;

struct ExecutionRecord {
    execution: WorkflowExecution,
    workflow_type: String,
    task_queue: String,
    input: Vec<Payload>,
    events: Vec<HistoryEvent>,
    status: ExecutionStatus,
    timeout: Duration,
    done: watch::Sender<Completion>,
}

impl ExecutionRecord {
    fn record(&mut self, event_type: EventType, attributes: Value) -> i64 {
        let event_id = self.events.len() as i64 + 1;
        self.events
            .push(HistoryEvent::new(event_id, event_type, attributes));
        event_id
    }

    fn matches(&self, execution: &WorkflowExecution) -> bool {
        execution.run_id.is_empty() || execution.run_id == self.execution.run_id
    }
}

#[derive(Debug)]
struct Connection {
    target: String,
    open: AtomicBool,
}

#[derive(Default)]
struct ServerState {
    executions: HashMap<String, ExecutionRecord>,
    /// Task queue -> the worker currently polling it
    pollers: HashMap<String, Arc<LoopbackWorker>>,
    /// Task queue -> workflow ids waiting for a poller
    pending: HashMap<String, VecDeque<String>>,
    connections: Vec<Arc<Connection>>,
    calls: Vec<RecordedCall>,
    update_support: UpdateSupport,
    refused: HashSet<String>,
    failing_shutdown: HashSet<String>,
}

/// Shared state of the in-process server
#[derive(Default)]
pub struct LoopbackServer {
    state: Mutex<ServerState>,
    ids: AtomicU64,
}

impl LoopbackServer {
    fn state(&self) -> MutexGuard<'_, ServerState> {
        lock(&self.state)
    }

    fn record_call(state: &mut ServerState, target: &str, operation: &'static str) {
        state.calls.push(RecordedCall {
            target: target.to_string(),
            operation,
        });
    }

    fn not_found(execution: &WorkflowExecution) -> Error {
        Error::Rpc(RpcError::new(
            RpcCode::NotFound,
            format!("workflow execution {} not found", execution),
        ))
    }

    /// Connections that have not been shut down
    pub fn open_connections(&self) -> usize {
        self.state()
            .connections
            .iter()
            .filter(|c| c.open.load(Ordering::SeqCst))
            .count()
    }

    /// Every connection ever opened, with whether it is still open
    pub fn connections(&self) -> Vec<(String, bool)> {
        self.state()
            .connections
            .iter()
            .map(|c| (c.target.clone(), c.open.load(Ordering::SeqCst)))
            .collect()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state().calls.clone()
    }

    /// Targets the given operation was sent to, in call order
    pub fn targets_of(&self, operation: &str) -> Vec<String> {
        self.state()
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .map(|c| c.target.clone())
            .collect()
    }

    /// Task queues that currently have a polling worker
    pub fn polling_task_queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self.state().pollers.keys().cloned().collect();
        queues.sort();
        queues
    }

    pub fn execution_count(&self) -> usize {
        self.state().executions.len()
    }

    fn with_execution<T>(
        &self,
        workflow_id: &str,
        f: impl FnOnce(&mut ExecutionRecord) -> T,
    ) -> Option<T> {
        self.state().executions.get_mut(workflow_id).map(f)
    }

    fn open(&self, target: &str) -> Result<Arc<Connection>> {
        let mut state = self.state();
        if state.refused.contains(target) {
            return Err(Error::Connection {
                target: target.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        let connection = Arc::new(Connection {
            target: target.to_string(),
            open: AtomicBool::new(true),
        });
        state.connections.push(Arc::clone(&connection));
        Ok(connection)
    }

    /// Record a release; it still takes effect when the target is set to fail
    fn release(&self, target: &str, operation: &'static str) -> Result<()> {
        let mut state = self.state();
        Self::record_call(&mut state, target, operation);
        if state.failing_shutdown.contains(target) {
            return Err(Error::Rpc(RpcError::new(
                RpcCode::Internal,
                format!("{} on {} failed", operation, target),
            )));
        }
        Ok(())
    }

    fn start_workflow(
        self: &Arc<Self>,
        target: &str,
        workflow_type: &str,
        options: WorkflowOptions,
        args: Vec<Payload>,
    ) -> Result<WorkflowExecution> {
        if options.task_queue.is_empty() {
            return Err(Error::Rpc(RpcError::new(
                RpcCode::InvalidArgument,
                "task queue is not set",
            )));
        }

        let n = self.ids.fetch_add(1, Ordering::SeqCst) + 1;
        let workflow_id = options
            .workflow_id
            .clone()
            .unwrap_or_else(|| format!("loopback-workflow-{}", n));
        let execution = WorkflowExecution {
            workflow_id: workflow_id.clone(),
            run_id: format!("loopback-run-{}", n),
        };

        let poller = {
            let mut state = self.state();
            Self::record_call(&mut state, target, "start_workflow");
            if let Some(existing) = state.executions.get(&workflow_id) {
                if existing.status == ExecutionStatus::Running {
                    return Err(Error::Rpc(RpcError::new(
                        RpcCode::InvalidArgument,
                        format!("workflow {} is already running", workflow_id),
                    )));
                }
            }

            let (done, _) = watch::channel(None);
            let mut record = ExecutionRecord {
                execution: execution.clone(),
                workflow_type: workflow_type.to_string(),
                task_queue: options.task_queue.clone(),
                input: args.clone(),
                events: Vec::new(),
                status: ExecutionStatus::Running,
                timeout: options.execution_timeout.unwrap_or(DEFAULT_RESULT_TIMEOUT),
                done,
            };
            record.record(
                EventType::WorkflowExecutionStarted,
                json!({
                    "workflowType": workflow_type,
                    "taskQueue": options.task_queue,
                    "input": args,
                }),
            );
            state.executions.insert(workflow_id.clone(), record);

            match state.pollers.get(&options.task_queue) {
                Some(worker) => Some(Arc::clone(worker)),
                None => {
                    state
                        .pending
                        .entry(options.task_queue.clone())
                        .or_default()
                        .push_back(workflow_id.clone());
                    None
                }
            }
        };

        if let Some(worker) = poller {
            self.spawn_workflow(worker, workflow_id);
        }
        Ok(execution)
    }

    async fn await_result(&self, execution: &WorkflowExecution) -> Result<Payload> {
        let (mut rx, timeout) = {
            let state = self.state();
            let record = state
                .executions
                .get(&execution.workflow_id)
                .filter(|r| r.matches(execution))
                .ok_or_else(|| Self::not_found(execution))?;
            (record.done.subscribe(), record.timeout)
        };

        let completion = match tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await {
            Ok(Ok(completion)) => completion.clone(),
            Ok(Err(_)) => {
                return Err(Error::Workflow(format!(
                    "workflow {} was replaced before it completed",
                    execution
                )))
            }
            Err(_) => {
                return Err(Error::Workflow(format!(
                    "workflow {} timed out after {:?}",
                    execution, timeout
                )))
            }
        };

        match completion {
            Some(Ok(result)) => Ok(result),
            Some(Err(failure)) => Err(Error::Workflow(failure)),
            None => Err(Error::Internal("completion signalled without a result".to_string())),
        }
    }

    /// The server has no update handlers, so every update ends in an error
    fn reject_update(&self, target: &str, workflow_id: &str, update_name: &str) -> RpcError {
        let mut state = self.state();
        Self::record_call(&mut state, target, "update");
        match state.update_support {
            UpdateSupport::Disabled => RpcError::new(
                RpcCode::PermissionDenied,
                "UpdateWorkflowExecution operation is disabled on this namespace",
            ),
            UpdateSupport::Unimplemented => RpcError::new(
                RpcCode::Unimplemented,
                "unknown method UpdateWorkflowExecution",
            ),
            UpdateSupport::Enabled => match state.executions.get(workflow_id) {
                // Rejections are not written to history
                Some(record) if record.status == ExecutionStatus::Running => RpcError::new(
                    RpcCode::InvalidArgument,
                    format!("update {} rejected: no handler registered", update_name),
                ),
                Some(_) => RpcError::new(RpcCode::NotFound, "workflow execution already completed"),
                None => RpcError::new(
                    RpcCode::NotFound,
                    format!("workflow not found for ID: {}", workflow_id),
                ),
            },
        }
    }

    fn history(&self, target: &str, execution: &WorkflowExecution) -> Result<WorkflowExecutionHistory> {
        let mut state = self.state();
        Self::record_call(&mut state, target, "fetch_history");
        state
            .executions
            .get(&execution.workflow_id)
            .filter(|r| r.matches(execution))
            .map(|r| WorkflowExecutionHistory::new(r.events.clone()))
            .ok_or_else(|| Self::not_found(execution))
    }

    fn describe(&self, target: &str, execution: &WorkflowExecution) -> Result<WorkflowExecutionInfo> {
        let mut state = self.state();
        Self::record_call(&mut state, target, "describe_execution");
        state
            .executions
            .get(&execution.workflow_id)
            .filter(|r| r.matches(execution))
            .map(|r| WorkflowExecutionInfo {
                execution: r.execution.clone(),
                workflow_type: r.workflow_type.clone(),
                task_queue: r.task_queue.clone(),
                status: r.status,
                history_length: r.events.len(),
            })
            .ok_or_else(|| Self::not_found(execution))
    }

    /// Make `worker` the poller of its task queue and hand it queued work
    fn attach(self: &Arc<Self>, target: &str, worker: &Arc<LoopbackWorker>) {
        let pending = {
            let mut state = self.state();
            Self::record_call(&mut state, target, "poll_task_queue");
            state
                .pollers
                .insert(worker.task_queue.clone(), Arc::clone(worker));
            state.pending.remove(&worker.task_queue).unwrap_or_default()
        };
        for workflow_id in pending {
            self.spawn_workflow(Arc::clone(worker), workflow_id);
        }
    }

    fn detach(&self, worker: &Arc<LoopbackWorker>) {
        let mut state = self.state();
        let polling = state
            .pollers
            .get(&worker.task_queue)
            .is_some_and(|current| Arc::ptr_eq(current, worker));
        if polling {
            state.pollers.remove(&worker.task_queue);
        }
    }

    fn spawn_workflow(self: &Arc<Self>, worker: Arc<LoopbackWorker>, workflow_id: String) {
        let server = Arc::clone(self);
        tokio::spawn(async move { server.drive(worker, workflow_id).await });
    }

    async fn drive(self: Arc<Self>, worker: Arc<LoopbackWorker>, workflow_id: String) {
        let Some((workflow_type, input)) =
            self.with_execution(&workflow_id, |r| (r.workflow_type.clone(), r.input.clone()))
        else {
            return;
        };
        tracing::debug!(workflow_id = %workflow_id, workflow_type = %workflow_type, "Running workflow");

        let outcome = match worker.definition(&workflow_type) {
            Some(definition) => {
                let ctx = LiveContext {
                    server: Arc::clone(&self),
                    worker: Arc::clone(&worker),
                    workflow_id: workflow_id.clone(),
                };
                definition.run(&ctx, input).await.map_err(|f| f.to_string())
            }
            None => Err(format!(
                "workflow type {} is not registered on task queue {}",
                workflow_type, worker.task_queue
            )),
        };

        self.with_execution(&workflow_id, |record| {
            match &outcome {
                Ok(result) => {
                    record.record(EventType::WorkflowExecutionCompleted, json!({ "result": result }));
                    record.status = ExecutionStatus::Completed;
                }
                Err(failure) => {
                    record.record(EventType::WorkflowExecutionFailed, json!({ "failure": failure }));
                    record.status = ExecutionStatus::Failed;
                }
            }
            record.done.send_replace(Some(outcome));
        });
    }
}

/// Context for workflow code running live
struct LiveContext {
    server: Arc<LoopbackServer>,
    worker: Arc<LoopbackWorker>,
    workflow_id: String,
}

#[async_trait]
impl WorkflowContext for LiveContext {
    async fn execute_activity(
        &self,
        activity_type: &str,
        args: Vec<Payload>,
    ) -> std::result::Result<Payload, WorkflowFailure> {
        let scheduled = self
            .server
            .with_execution(&self.workflow_id, |r| {
                r.record(
                    EventType::ActivityTaskScheduled,
                    json!({ "activityType": activity_type, "input": args }),
                )
            })
            .ok_or_else(|| {
                WorkflowFailure::Application(format!("workflow {} disappeared", self.workflow_id))
            })?;

        let result = match self.worker.activities() {
            Some(activities) if activities.activity_types().iter().any(|t| t == activity_type) => {
                activities.invoke(activity_type, args).await
            }
            _ => Err(WorkflowFailure::Activity {
                activity_type: activity_type.to_string(),
                message: format!(
                    "activity type {} is not registered on task queue {}",
                    activity_type, self.worker.task_queue
                ),
            }),
        };

        self.server.with_execution(&self.workflow_id, |r| match &result {
            Ok(value) => r.record(
                EventType::ActivityTaskCompleted,
                json!({ "scheduledEventId": scheduled, "result": value }),
            ),
            Err(failure) => r.record(
                EventType::ActivityTaskFailed,
                json!({ "scheduledEventId": scheduled, "failure": failure.to_string() }),
            ),
        });
        result
    }

    fn is_replaying(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
struct ReplayedActivity {
    activity_type: String,
    outcome: Option<std::result::Result<Payload, String>>,
}

/// Context for workflow code re-run against a recorded history
struct ReplayContext {
    activities: Vec<ReplayedActivity>,
    cursor: Mutex<usize>,
    mismatch: Mutex<Option<WorkflowFailure>>,
}

/// Event references are numbers, or strings in some exports
fn event_ref(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

impl ReplayContext {
    fn new(history: &WorkflowExecutionHistory) -> Self {
        let mut activities: Vec<ReplayedActivity> = Vec::new();
        let mut by_event_id = HashMap::new();

        for event in &history.events {
            match event.event_type {
                EventType::ActivityTaskScheduled => {
                    by_event_id.insert(event.event_id, activities.len());
                    activities.push(ReplayedActivity {
                        activity_type: event.attr_str("activityType").unwrap_or_default().to_string(),
                        outcome: None,
                    });
                }
                EventType::ActivityTaskCompleted | EventType::ActivityTaskFailed => {
                    let index = event
                        .attributes
                        .get("scheduledEventId")
                        .and_then(event_ref)
                        .and_then(|id| by_event_id.get(&id).copied());
                    if let Some(index) = index {
                        activities[index].outcome = Some(
                            if event.event_type == EventType::ActivityTaskCompleted {
                                Ok(event.attributes.get("result").cloned().unwrap_or(Value::Null))
                            } else {
                                Err(event.attr_str("failure").unwrap_or("activity failed").to_string())
                            },
                        );
                    }
                }
                _ => {}
            }
        }

        Self {
            activities,
            cursor: Mutex::new(0),
            mismatch: Mutex::new(None),
        }
    }

    /// Check the replayed run consumed the history exactly
    fn finish(
        &self,
        history: &WorkflowExecutionHistory,
        succeeded: bool,
    ) -> std::result::Result<(), WorkflowFailure> {
        if let Some(failure) = lock(&self.mismatch).take() {
            return Err(failure);
        }

        let consumed = *lock(&self.cursor);
        if consumed < self.activities.len() {
            return Err(WorkflowFailure::Nondeterminism(format!(
                "history has {} activity tasks the workflow did not schedule",
                self.activities.len() - consumed
            )));
        }

        let completed = history.find(EventType::WorkflowExecutionCompleted).is_some();
        let failed = history.find(EventType::WorkflowExecutionFailed).is_some();
        if completed && !succeeded {
            return Err(WorkflowFailure::Nondeterminism(
                "history completed but the workflow failed on replay".to_string(),
            ));
        }
        if failed && succeeded {
            return Err(WorkflowFailure::Nondeterminism(
                "history failed but the workflow completed on replay".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl WorkflowContext for ReplayContext {
    async fn execute_activity(
        &self,
        activity_type: &str,
        _args: Vec<Payload>,
    ) -> std::result::Result<Payload, WorkflowFailure> {
        let next = {
            let mut cursor = lock(&self.cursor);
            let index = *cursor;
            *cursor += 1;
            self.activities.get(index).cloned()
        };

        let failure = match next {
            None => WorkflowFailure::Nondeterminism(format!(
                "workflow scheduled activity {} that is not in history",
                activity_type
            )),
            Some(recorded) if recorded.activity_type != activity_type => {
                WorkflowFailure::Nondeterminism(format!(
                    "workflow scheduled activity {} but history has {}",
                    activity_type, recorded.activity_type
                ))
            }
            Some(ReplayedActivity {
                outcome: Some(Ok(result)),
                ..
            }) => return Ok(result),
            Some(ReplayedActivity {
                activity_type,
                outcome: Some(Err(message)),
            }) => {
                return Err(WorkflowFailure::Activity {
                    activity_type,
                    message,
                })
            }
            Some(recorded) => WorkflowFailure::Nondeterminism(format!(
                "activity {} has no recorded outcome",
                recorded.activity_type
            )),
        };

        lock(&self.mismatch).get_or_insert_with(|| failure.clone());
        Err(failure)
    }

    fn is_replaying(&self) -> bool {
        true
    }
}

/// The in-process SDK
pub struct LoopbackSdk {
    server: Arc<LoopbackServer>,
    version: Version,
}

impl LoopbackSdk {
    pub fn new() -> Self {
        Self {
            server: Arc::new(LoopbackServer::default()),
            version: SDK_VERSION,
        }
    }

    #[must_use]
    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    #[must_use]
    pub fn with_update_support(self, support: UpdateSupport) -> Self {
        self.server.state().update_support = support;
        self
    }

    /// Refuse connections to `target`
    #[must_use]
    pub fn refuse(self, target: impl Into<String>) -> Self {
        self.server.state().refused.insert(target.into());
        self
    }

    /// Report an error from every shutdown of a worker factory or
    /// connection on `target`
    #[must_use]
    pub fn fail_shutdown(self, target: impl Into<String>) -> Self {
        self.server.state().failing_shutdown.insert(target.into());
        self
    }

    pub fn server(&self) -> &Arc<LoopbackServer> {
        &self.server
    }
}

impl Default for LoopbackSdk {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sdk for LoopbackSdk {
    fn name(&self) -> &str {
        SDK_NAME
    }

    fn version(&self) -> Version {
        self.version
    }

    async fn connect(&self, options: ServiceOptions) -> Result<Arc<dyn WorkflowService>> {
        let connection = self.server.open(&options.target)?;
        options.metrics.counter("loopback_connections_opened", 1);
        tracing::debug!(server = %options.target, "Opened loopback connection");
        Ok(Arc::new(LoopbackService {
            server: Arc::clone(&self.server),
            connection,
        }))
    }

    fn new_client(
        &self,
        service: Arc<dyn WorkflowService>,
        options: ClientOptions,
    ) -> Result<Arc<dyn WorkflowClient>> {
        Ok(Arc::new(LoopbackClient {
            server: Arc::clone(&self.server),
            service,
            namespace: options.namespace,
        }))
    }

    fn new_worker_factory(
        &self,
        client: Arc<dyn WorkflowClient>,
        _options: WorkerFactoryOptions,
    ) -> Result<Box<dyn WorkerFactory>> {
        Ok(Box::new(LoopbackWorkerFactory {
            server: Arc::clone(&self.server),
            target: client.service().target().to_string(),
            workers: Vec::new(),
            running: AtomicBool::new(false),
        }))
    }
}

struct LoopbackService {
    server: Arc<LoopbackServer>,
    connection: Arc<Connection>,
}

impl LoopbackService {
    fn ensure_open(&self) -> Result<()> {
        if self.connection.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Rpc(RpcError::new(
                RpcCode::Unavailable,
                format!("connection to {} is closed", self.connection.target),
            )))
        }
    }
}

#[async_trait]
impl WorkflowService for LoopbackService {
    fn target(&self) -> &str {
        &self.connection.target
    }

    async fn fetch_history(
        &self,
        _namespace: &str,
        execution: &WorkflowExecution,
    ) -> Result<WorkflowExecutionHistory> {
        self.ensure_open()?;
        self.server.history(self.target(), execution)
    }

    async fn describe_execution(
        &self,
        _namespace: &str,
        execution: &WorkflowExecution,
    ) -> Result<WorkflowExecutionInfo> {
        self.ensure_open()?;
        self.server.describe(self.target(), execution)
    }

    fn shutdown_now(&self) -> Result<()> {
        self.connection.open.store(false, Ordering::SeqCst);
        self.server.release(self.target(), "shutdown_service")
    }
}

struct LoopbackClient {
    server: Arc<LoopbackServer>,
    service: Arc<dyn WorkflowService>,
    namespace: String,
}

#[async_trait]
impl WorkflowClient for LoopbackClient {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn service(&self) -> Arc<dyn WorkflowService> {
        Arc::clone(&self.service)
    }

    async fn start_workflow(
        &self,
        workflow_type: &str,
        options: WorkflowOptions,
        args: Vec<Payload>,
    ) -> Result<WorkflowExecution> {
        self.server
            .start_workflow(self.service.target(), workflow_type, options, args)
    }

    async fn result(&self, execution: &WorkflowExecution) -> Result<Payload> {
        self.server.await_result(execution).await
    }

    async fn update(
        &self,
        workflow_id: &str,
        update_name: &str,
        _args: Vec<Payload>,
    ) -> std::result::Result<Payload, RpcError> {
        Err(self
            .server
            .reject_update(self.service.target(), workflow_id, update_name))
    }

    async fn start_update(
        &self,
        workflow_id: &str,
        update_name: &str,
        _args: Vec<Payload>,
    ) -> std::result::Result<String, RpcError> {
        Err(self
            .server
            .reject_update(self.service.target(), workflow_id, update_name))
    }
}

struct LoopbackWorkerFactory {
    server: Arc<LoopbackServer>,
    target: String,
    workers: Vec<Arc<LoopbackWorker>>,
    running: AtomicBool,
}

#[async_trait]
impl WorkerFactory for LoopbackWorkerFactory {
    fn new_worker(&mut self, task_queue: &str, _options: WorkerOptions) -> Result<Arc<dyn Worker>> {
        if self.running.load(Ordering::SeqCst) {
            return Err(Error::Internal(
                "cannot add a worker to a started factory".to_string(),
            ));
        }
        let worker = Arc::new(LoopbackWorker::new(task_queue));
        self.workers.push(Arc::clone(&worker));
        Ok(worker)
    }

    async fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        for worker in &self.workers {
            self.server.attach(&self.target, worker);
        }
        Ok(())
    }

    fn shutdown_now(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        for worker in &self.workers {
            self.server.detach(worker);
        }
        self.server.release(&self.target, "shutdown_worker_factory")
    }

    /// In-flight workflow tasks keep running; only polling stops
    async fn await_termination(&self) -> Result<()> {
        Ok(())
    }
}

/// A worker of the in-process SDK
pub struct LoopbackWorker {
    task_queue: String,
    workflows: Mutex<HashMap<String, Arc<dyn WorkflowDefinition>>>,
    activities: Mutex<Option<Arc<dyn Activities>>>,
}

impl LoopbackWorker {
    pub fn new(task_queue: impl Into<String>) -> Self {
        Self {
            task_queue: task_queue.into(),
            workflows: Mutex::new(HashMap::new()),
            activities: Mutex::new(None),
        }
    }

    fn definition(&self, workflow_type: &str) -> Option<Arc<dyn WorkflowDefinition>> {
        lock(&self.workflows).get(workflow_type).cloned()
    }

    fn activities(&self) -> Option<Arc<dyn Activities>> {
        lock(&self.activities).clone()
    }
}

#[async_trait]
impl Worker for LoopbackWorker {
    fn task_queue(&self) -> &str {
        &self.task_queue
    }

    fn register_workflow(&self, definition: Arc<dyn WorkflowDefinition>) -> Result<()> {
        let name = definition.method().name;
        let mut workflows = lock(&self.workflows);
        if workflows.contains_key(&name) {
            return Err(Error::Config(format!(
                "workflow type {} is already registered on task queue {}",
                name, self.task_queue
            )));
        }
        workflows.insert(name, definition);
        Ok(())
    }

    fn register_activities(&self, activities: Arc<dyn Activities>) -> Result<()> {
        *lock(&self.activities) = Some(activities);
        Ok(())
    }

    async fn replay(&self, history: &WorkflowExecutionHistory) -> Result<()> {
        let workflow_type = history
            .workflow_type()
            .ok_or_else(|| Error::Workflow("history has no started event".to_string()))?;
        let definition = self.definition(workflow_type).ok_or_else(|| {
            Error::Workflow(format!("workflow type {} is not registered", workflow_type))
        })?;
        let input = history
            .find(EventType::WorkflowExecutionStarted)
            .and_then(|e| e.attributes.get("input"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let ctx = ReplayContext::new(history);
        let outcome = definition.run(&ctx, input).await;
        ctx.finish(history, outcome.is_ok())
            .map_err(|f| Error::Workflow(f.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdk::{ValueKind, WorkflowMethod};

    /// Calls `greet` once and returns its result
    struct GreetWorkflow;

    #[async_trait]
    impl WorkflowDefinition for GreetWorkflow {
        fn method(&self) -> WorkflowMethod {
            WorkflowMethod::new("GreetWorkflow", ValueKind::String, 1)
        }

        async fn run(
            &self,
            ctx: &dyn WorkflowContext,
            args: Vec<Payload>,
        ) -> std::result::Result<Payload, WorkflowFailure> {
            ctx.execute_activity("greet", args).await
        }
    }

    struct GreetActivities;

    #[async_trait]
    impl Activities for GreetActivities {
        fn activity_types(&self) -> Vec<String> {
            vec!["greet".to_string()]
        }

        async fn invoke(
            &self,
            _activity_type: &str,
            args: Vec<Payload>,
        ) -> std::result::Result<Payload, WorkflowFailure> {
            let name = args.first().and_then(Value::as_str).unwrap_or("nobody");
            Ok(json!(format!("hello {}", name)))
        }
    }

    async fn started_worker(sdk: &LoopbackSdk, target: &str) -> (Arc<dyn WorkflowClient>, Box<dyn WorkerFactory>, Arc<dyn Worker>) {
        let service = sdk
            .connect(ServiceOptions {
                target: target.to_string(),
                ..ServiceOptions::default()
            })
            .await
            .unwrap();
        let client = sdk
            .new_client(service, ClientOptions::default())
            .unwrap();
        let mut factory = sdk
            .new_worker_factory(Arc::clone(&client), WorkerFactoryOptions::default())
            .unwrap();
        let worker = factory.new_worker("tq", WorkerOptions::default()).unwrap();
        worker.register_workflow(Arc::new(GreetWorkflow)).unwrap();
        worker.register_activities(Arc::new(GreetActivities)).unwrap();
        factory.start().await.unwrap();
        (client, factory, worker)
    }

    fn options() -> WorkflowOptions {
        WorkflowOptions {
            task_queue: "tq".to_string(),
            execution_timeout: Some(Duration::from_secs(5)),
            ..WorkflowOptions::default()
        }
    }

    #[tokio::test]
    async fn test_workflow_runs_and_records_history() {
        let sdk = LoopbackSdk::new();
        let (client, _factory, _worker) = started_worker(&sdk, "server:1").await;

        let execution = client
            .start_workflow("GreetWorkflow", options(), vec![json!("ada")])
            .await
            .unwrap();
        assert_eq!(client.result(&execution).await.unwrap(), json!("hello ada"));

        let history = client
            .service()
            .fetch_history("default", &execution)
            .await
            .unwrap();
        let types: Vec<EventType> = history.events.iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![
                EventType::WorkflowExecutionStarted,
                EventType::ActivityTaskScheduled,
                EventType::ActivityTaskCompleted,
                EventType::WorkflowExecutionCompleted,
            ]
        );
        assert_eq!(history.workflow_type(), Some("GreetWorkflow"));
    }

    #[tokio::test]
    async fn test_pending_workflow_starts_with_worker() {
        let sdk = LoopbackSdk::new();
        let service = sdk
            .connect(ServiceOptions {
                target: "server:1".to_string(),
                ..ServiceOptions::default()
            })
            .await
            .unwrap();
        let client = sdk.new_client(service, ClientOptions::default()).unwrap();
        let execution = client
            .start_workflow("GreetWorkflow", options(), vec![json!("bob")])
            .await
            .unwrap();

        let info = client
            .service()
            .describe_execution("default", &execution)
            .await
            .unwrap();
        assert_eq!(info.status, ExecutionStatus::Running);

        let (_client, _factory, _worker) = started_worker(&sdk, "server:1").await;
        assert_eq!(client.result(&execution).await.unwrap(), json!("hello bob"));
    }

    #[tokio::test]
    async fn test_replay_detects_changed_activity() {
        let sdk = LoopbackSdk::new();
        let (_client, _factory, worker) = started_worker(&sdk, "server:1").await;

        let history = WorkflowExecutionHistory::new(vec![
            HistoryEvent::new(
                1,
                EventType::WorkflowExecutionStarted,
                json!({"workflowType": "GreetWorkflow", "input": ["x"]}),
            ),
            HistoryEvent::new(2, EventType::ActivityTaskScheduled, json!({"activityType": "wave"})),
            HistoryEvent::new(
                3,
                EventType::ActivityTaskCompleted,
                json!({"scheduledEventId": 2, "result": "hi"}),
            ),
            HistoryEvent::new(4, EventType::WorkflowExecutionCompleted, json!({"result": "hi"})),
        ]);

        let err = worker.replay(&history).await.unwrap_err();
        assert!(err.to_string().contains("nondeterminism"));
        assert!(err.to_string().contains("wave"));
    }

    #[tokio::test]
    async fn test_update_support_modes() {
        for (support, code) in [
            (UpdateSupport::Enabled, RpcCode::NotFound),
            (UpdateSupport::Disabled, RpcCode::PermissionDenied),
            (UpdateSupport::Unimplemented, RpcCode::Unimplemented),
        ] {
            let sdk = LoopbackSdk::new().with_update_support(support);
            let (client, _factory, _worker) = started_worker(&sdk, "server:1").await;
            let err = client.update("fake", "also_fake", Vec::new()).await.unwrap_err();
            assert_eq!(err.code, code);
        }
    }

    #[tokio::test]
    async fn test_refused_target_fails_to_connect() {
        let sdk = LoopbackSdk::new().refuse("down:1");
        let result = sdk
            .connect(ServiceOptions {
                target: "down:1".to_string(),
                ..ServiceOptions::default()
            })
            .await;
        assert!(matches!(result, Err(Error::Connection { .. })));
        assert_eq!(sdk.server().open_connections(), 0);
    }

    #[tokio::test]
    async fn test_closed_service_rejects_calls() {
        let sdk = LoopbackSdk::new();
        let (client, _factory, _worker) = started_worker(&sdk, "server:1").await;
        let service = client.service();
        service.shutdown_now().unwrap();

        let err = service
            .fetch_history("default", &WorkflowExecution::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Rpc(RpcError { code: RpcCode::Unavailable, .. })));
        assert_eq!(sdk.server().open_connections(), 0);
    }
}
