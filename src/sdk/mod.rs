//! Workflow SDK collaborator interface
//!
//! The harness never implements workflow semantics itself. It drives an
//! SDK through these traits: open a service connection, build clients on
//! it, create worker factories and workers, start workflows, fetch
//! histories and replay them.

mod types;

use std::sync::Arc;

use async_trait::async_trait;

use crate::common::Result;
use crate::harness::version::Version;

pub use types::*;

/// Entry point of an SDK implementation
#[async_trait]
pub trait Sdk: Send + Sync {
    /// Short language name used in fixture file names (e.g. "rust")
    fn name(&self) -> &str;

    /// Version of the SDK under test
    fn version(&self) -> Version;

    /// Open a connection to the server
    async fn connect(&self, options: ServiceOptions) -> Result<Arc<dyn WorkflowService>>;

    /// Build a client on top of an open connection
    fn new_client(
        &self,
        service: Arc<dyn WorkflowService>,
        options: ClientOptions,
    ) -> Result<Arc<dyn WorkflowClient>>;

    /// Build a worker factory polling through the given client
    fn new_worker_factory(
        &self,
        client: Arc<dyn WorkflowClient>,
        options: WorkerFactoryOptions,
    ) -> Result<Box<dyn WorkerFactory>>;
}

/// An open connection to the server
#[async_trait]
pub trait WorkflowService: Send + Sync {
    /// Address this connection dials
    fn target(&self) -> &str;

    /// Fetch the full event history of an execution
    async fn fetch_history(
        &self,
        namespace: &str,
        execution: &WorkflowExecution,
    ) -> Result<WorkflowExecutionHistory>;

    /// Describe an execution
    async fn describe_execution(
        &self,
        namespace: &str,
        execution: &WorkflowExecution,
    ) -> Result<WorkflowExecutionInfo>;

    /// Close the connection immediately
    fn shutdown_now(&self) -> Result<()>;
}

/// Namespace-scoped client
#[async_trait]
pub trait WorkflowClient: Send + Sync {
    fn namespace(&self) -> &str;

    /// The connection this client sends calls through
    fn service(&self) -> Arc<dyn WorkflowService>;

    /// Start a workflow by type name
    async fn start_workflow(
        &self,
        workflow_type: &str,
        options: WorkflowOptions,
        args: Vec<Payload>,
    ) -> Result<WorkflowExecution>;

    /// Wait for an execution to close and return its result
    async fn result(&self, execution: &WorkflowExecution) -> Result<Payload>;

    /// Send an update and wait for its outcome
    async fn update(
        &self,
        workflow_id: &str,
        update_name: &str,
        args: Vec<Payload>,
    ) -> std::result::Result<Payload, RpcError>;

    /// Send an update and return once it has been accepted
    async fn start_update(
        &self,
        workflow_id: &str,
        update_name: &str,
        args: Vec<Payload>,
    ) -> std::result::Result<String, RpcError>;
}

/// Owns workers for a client and drives their polling
#[async_trait]
pub trait WorkerFactory: Send + Sync {
    /// Create a worker for a task queue
    fn new_worker(&mut self, task_queue: &str, options: WorkerOptions) -> Result<Arc<dyn Worker>>;

    /// Start polling on every worker created so far
    async fn start(&self) -> Result<()>;

    /// Stop polling without waiting for in-flight tasks
    fn shutdown_now(&self) -> Result<()>;

    /// Wait until every worker has stopped
    async fn await_termination(&self) -> Result<()>;
}

/// A worker bound to one task queue
#[async_trait]
pub trait Worker: Send + Sync {
    fn task_queue(&self) -> &str;

    fn register_workflow(&self, definition: Arc<dyn WorkflowDefinition>) -> Result<()>;

    fn register_activities(&self, activities: Arc<dyn Activities>) -> Result<()>;

    /// Re-run the registered workflow code against a recorded history
    async fn replay(&self, history: &WorkflowExecutionHistory) -> Result<()>;
}

/// Environment handed to workflow code
#[async_trait]
pub trait WorkflowContext: Send + Sync {
    async fn execute_activity(
        &self,
        activity_type: &str,
        args: Vec<Payload>,
    ) -> std::result::Result<Payload, WorkflowFailure>;

    /// True while the worker is replaying recorded history
    fn is_replaying(&self) -> bool;
}

/// Workflow code registered on a worker
#[async_trait]
pub trait WorkflowDefinition: Send + Sync {
    fn method(&self) -> WorkflowMethod;

    async fn run(
        &self,
        ctx: &dyn WorkflowContext,
        args: Vec<Payload>,
    ) -> std::result::Result<Payload, WorkflowFailure>;
}

/// Activity implementations registered on a worker
#[async_trait]
pub trait Activities: Send + Sync {
    fn activity_types(&self) -> Vec<String>;

    async fn invoke(
        &self,
        activity_type: &str,
        args: Vec<Payload>,
    ) -> std::result::Result<Payload, WorkflowFailure>;
}
