//! The pluggable unit under test
//!
//! A feature pairs workflow/activity code with assertions. Every hook has a
//! default so a feature only overrides what it needs; the defaults run the
//! single workflow, wait for its result and replay its history.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::common::{Error, Result};
use crate::sdk::{
    Activities, ClientOptions, Payload, ServiceOptions, Worker, WorkerFactoryOptions,
    WorkerOptions, WorkflowDefinition, WorkflowExecution, WorkflowMethod, WorkflowOptions,
};

use super::runner::Runner;

/// A scripted scenario run against a live server
#[async_trait]
pub trait Feature: Send + Sync {
    /// Workflow code to register on the worker
    fn workflows(&self) -> Vec<Arc<dyn WorkflowDefinition>>;

    /// The feature itself when it implements activities
    fn activities(self: Arc<Self>) -> Option<Arc<dyn Activities>> {
        None
    }

    /// Skip without connecting when set
    fn skip_reason(&self) -> Option<String> {
        None
    }

    fn service_options(&self, _options: &mut ServiceOptions) {}

    fn client_options(&self, _options: &mut ClientOptions) {}

    fn worker_factory_options(&self, _options: &mut WorkerFactoryOptions) {}

    fn worker_options(&self, _options: &mut WorkerOptions) {}

    fn workflow_options(&self, _options: &mut WorkflowOptions) {}

    /// Whether the worker must talk through the fault-injection proxy
    fn worker_uses_proxy(&self) -> bool {
        false
    }

    /// Whether workflow-initiating calls must go through the proxy
    fn initiator_uses_proxy(&self) -> bool {
        true
    }

    /// Value the default result check expects
    fn expected_result(&self) -> Option<Payload> {
        None
    }

    /// Called on each new worker before registration, e.g. to add workflows
    fn prepare_worker(&self, _worker: &dyn Worker) -> Result<()> {
        Ok(())
    }

    /// Start the scenario; `None` means the feature checked itself
    async fn execute(&self, runner: &mut Runner) -> Result<Option<Run>> {
        runner.execute_single_parameterless_workflow().await.map(Some)
    }

    async fn check_result(&self, runner: &mut Runner, run: &Run) -> Result<()> {
        // Waiting surfaces any workflow failure
        let result = runner.wait_for_run_result(run).await?;
        if let Some(expected) = self.expected_result() {
            if result != expected {
                return Err(Error::assertion(format!(
                    "expected result {}, got {}",
                    expected, result
                )));
            }
        }
        Ok(())
    }

    async fn check_history(&self, runner: &mut Runner, run: &Run) -> Result<()> {
        runner.check_current_and_past_histories(run).await
    }
}

/// A started workflow together with the method it was started through
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Run {
    pub method: WorkflowMethod,
    pub execution: WorkflowExecution,
}

impl Run {
    pub fn new(method: WorkflowMethod, execution: WorkflowExecution) -> Self {
        Self { method, execution }
    }
}

/// Constructs a fresh feature instance
pub type FeatureConstructor = fn() -> Arc<dyn Feature>;

/// Static metadata about a registered feature
#[derive(Clone)]
pub struct PreparedFeature {
    /// Directory key, slash separated (e.g. "update/self")
    pub dir: &'static str,
    /// Signatures of the feature's workflow methods
    pub workflow_methods: Vec<WorkflowMethod>,
    constructor: FeatureConstructor,
}

impl PreparedFeature {
    /// Prepare a feature by inspecting one throwaway instance
    pub fn new(dir: &'static str, constructor: FeatureConstructor) -> Self {
        let workflow_methods = constructor()
            .workflows()
            .iter()
            .map(|w| w.method())
            .collect();
        Self {
            dir,
            workflow_methods,
            constructor,
        }
    }

    /// A new instance for one run; per-run state lives in it
    pub fn new_instance(&self) -> Arc<dyn Feature> {
        (self.constructor)()
    }
}

impl fmt::Debug for PreparedFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedFeature")
            .field("dir", &self.dir)
            .field("workflow_methods", &self.workflow_methods)
            .finish()
    }
}

/// Final result of one feature run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Passed,
    Failed(String),
    Skipped(String),
}

impl Outcome {
    /// Fold a run result into an outcome; skips never count as failures
    pub fn from_result(result: Result<()>) -> Self {
        match result {
            Ok(()) => Outcome::Passed,
            Err(e) if e.is_skip() => Outcome::Skipped(e.to_string()),
            Err(e) => Outcome::Failed(e.to_string()),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Outcome::Passed => "",
            Outcome::Failed(m) | Outcome::Skipped(m) => m,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Passed => write!(f, "PASSED"),
            Outcome::Failed(_) => write!(f, "FAILED"),
            Outcome::Skipped(_) => write!(f, "SKIPPED"),
        }
    }
}

/// One-shot gate features use to block until another task signals
///
/// Owned by a feature instance, so concurrent runs never share one.
#[derive(Debug, Clone)]
pub struct Latch {
    tx: Arc<watch::Sender<bool>>,
}

impl Latch {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn open(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the latch is opened
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as self, so this cannot fail
        let _ = rx.wait_for(|open| *open).await;
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}
