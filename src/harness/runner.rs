//! Runs one feature against a server
//!
//! The runner owns the service connections, clients and the current worker
//! for the duration of a run. Two connection/client pairs are kept: one
//! through the fault-injection proxy and one direct. The feature picks which
//! pair the worker and the initiating calls use.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::common::{Config, Error, Result};
use crate::sdk::{
    ClientOptions, EventType, Payload, Sdk, ServiceOptions, Worker, WorkerFactory,
    WorkflowClient, WorkflowExecution, WorkflowExecutionHistory, WorkflowExecutionInfo,
    WorkflowMethod, WorkflowOptions, WorkflowService,
};

use super::capability::{self, check_optional_rpc, OptionalRpc};
use super::feature::{Feature, Outcome, PreparedFeature, Run};
use super::history::{FixtureStore, HistoryVerifier, PastHistories};
use super::proxy::ProxyController;
use super::worker::WorkerManager;

/// Default execution timeout for workflows started by the harness
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Drives one feature through execute, result check and history check
pub struct Runner {
    pub config: Config,
    pub prepared: PreparedFeature,
    feature: Arc<dyn Feature>,
    sdk: Arc<dyn Sdk>,
    service: Arc<dyn WorkflowService>,
    direct_service: Arc<dyn WorkflowService>,
    client: Arc<dyn WorkflowClient>,
    direct_client: Arc<dyn WorkflowClient>,
    workers: WorkerManager,
    proxy: ProxyController,
}

impl Runner {
    /// Connect, build clients and start the worker
    ///
    /// Anything opened before a failure is shut down before the error is
    /// returned.
    pub async fn new(sdk: Arc<dyn Sdk>, config: Config, prepared: PreparedFeature) -> Result<Self> {
        config.validate()?;
        let feature = prepared.new_instance();
        if let Some(reason) = feature.skip_reason() {
            return Err(Error::Skipped(reason));
        }
        let proxy = ProxyController::new(config.proxy_control.clone())?;

        let mut service_options = ServiceOptions {
            target: config.server.clone(),
            tls: config.tls.clone(),
            metrics: Arc::clone(&config.metrics),
            ..ServiceOptions::default()
        };
        feature.service_options(&mut service_options);
        let mut direct_service_options = service_options.clone();
        direct_service_options.target = config.direct_server().to_string();

        let service = connect(sdk.as_ref(), service_options).await?;
        let direct_service = match connect(sdk.as_ref(), direct_service_options).await {
            Ok(s) => s,
            Err(e) => {
                let _ = service.shutdown_now();
                return Err(e);
            }
        };
        let release = |err: Error| {
            let _ = direct_service.shutdown_now();
            let _ = service.shutdown_now();
            err
        };

        let mut client_options = ClientOptions {
            namespace: config.namespace.clone(),
            ..ClientOptions::default()
        };
        feature.client_options(&mut client_options);
        let client = sdk
            .new_client(Arc::clone(&service), client_options.clone())
            .map_err(release)?;
        let direct_client = sdk
            .new_client(Arc::clone(&direct_service), client_options)
            .map_err(release)?;

        let mut runner = Self {
            config,
            prepared,
            feature,
            sdk: Arc::clone(&sdk),
            service: Arc::clone(&service),
            direct_service: Arc::clone(&direct_service),
            client,
            direct_client,
            workers: WorkerManager::new(),
            proxy,
        };

        if let Err(e) = runner.restart_worker().await {
            return Err(release(e));
        }
        Ok(runner)
    }

    /// Run the feature lifecycle
    pub async fn run(&mut self) -> Result<()> {
        let feature = Arc::clone(&self.feature);
        let dir = self.prepared.dir;

        tracing::info!("Executing feature {}", dir);
        let run = match feature.execute(self).await? {
            Some(run) => run,
            None => {
                tracing::info!("Feature {} returned no run", dir);
                return Ok(());
            }
        };

        tracing::info!("Checking result of feature {}", dir);
        feature.check_result(self, &run).await?;

        tracing::info!("Checking history of feature {}", dir);
        feature.check_history(self, &run).await
    }

    /// Release the worker, then the direct and proxied connections
    ///
    /// Every release is attempted; the first failure is returned.
    pub fn close(self) -> Result<()> {
        let mut first = None;
        let mut record = |what: &str, result: Result<()>| {
            if let Err(e) = result {
                tracing::warn!("Failed to shut down {}: {}", what, e);
                first.get_or_insert(e);
            }
        };

        record("worker factory", self.workers.shutdown_now());
        record("direct service", self.direct_service.shutdown_now());
        record("service", self.service.shutdown_now());

        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // === Endpoint selection ===

    /// Client the worker polls through
    pub fn worker_client(&self) -> Arc<dyn WorkflowClient> {
        if self.feature.worker_uses_proxy() {
            Arc::clone(&self.client)
        } else {
            Arc::clone(&self.direct_client)
        }
    }

    /// Client used to start, signal, update and await workflows
    pub fn initiator_client(&self) -> Arc<dyn WorkflowClient> {
        if self.feature.initiator_uses_proxy() {
            Arc::clone(&self.client)
        } else {
            Arc::clone(&self.direct_client)
        }
    }

    pub fn initiator_service(&self) -> Arc<dyn WorkflowService> {
        if self.feature.initiator_uses_proxy() {
            Arc::clone(&self.service)
        } else {
            Arc::clone(&self.direct_service)
        }
    }

    pub fn sdk(&self) -> &dyn Sdk {
        self.sdk.as_ref()
    }

    // === Worker lifecycle ===

    /// Replace the worker with a freshly built and started one
    ///
    /// Shut the previous worker down first with [`Runner::shutdown_worker`].
    pub async fn restart_worker(&mut self) -> Result<()> {
        let client = self.worker_client();
        self.workers
            .restart(
                self.sdk.as_ref(),
                client,
                &self.feature,
                &self.config.task_queue,
            )
            .await
    }

    /// Stop the worker factory and wait for it to terminate
    pub async fn shutdown_worker(&self) -> Result<()> {
        self.workers.shutdown().await
    }

    pub fn worker(&self) -> Result<&Arc<dyn Worker>> {
        self.workers.worker()
    }

    pub fn worker_factory(&self) -> Option<&dyn WorkerFactory> {
        self.workers.factory()
    }

    /// Number of workers started so far in this run
    pub fn worker_starts(&self) -> usize {
        self.workers.starts()
    }

    // === Proxy ===

    pub fn proxy(&self) -> &ProxyController {
        &self.proxy
    }

    pub async fn proxy_reject(&self) -> Result<()> {
        self.proxy.reject().await
    }

    pub async fn proxy_accept(&self) -> Result<()> {
        self.proxy.accept().await
    }

    pub async fn proxy_freeze(&self) -> Result<()> {
        self.proxy.freeze().await
    }

    pub async fn proxy_thaw(&self) -> Result<()> {
        self.proxy.thaw().await
    }

    pub async fn proxy_restart(&self, sleep: Duration, forceful: bool) -> Result<()> {
        self.proxy.restart(sleep, forceful).await
    }

    pub async fn proxy_reject_and_accept<T, F, Fut>(&self, sleep: Duration, work: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.proxy.reject_and_accept(sleep, work).await
    }

    pub async fn proxy_freeze_and_thaw<T, F, Fut>(&self, sleep: Duration, work: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.proxy.freeze_and_thaw(sleep, work).await
    }

    // === Starting workflows ===

    /// Options used when a feature does not pass its own
    pub fn default_workflow_options(&self) -> WorkflowOptions {
        let mut options = WorkflowOptions {
            task_queue: self.config.task_queue.clone(),
            execution_timeout: Some(DEFAULT_EXECUTION_TIMEOUT),
            ..WorkflowOptions::default()
        };
        self.feature.workflow_options(&mut options);
        options
    }

    /// Start the feature's only workflow, which must take no parameters
    pub async fn execute_single_parameterless_workflow(&self) -> Result<Run> {
        let method = self.single_workflow_method()?;
        if method.arity != 0 {
            return Err(Error::assertion(format!(
                "expected no parameters, got {}",
                method.arity
            )));
        }
        let execution = self.execute_workflow(&method.name, Vec::new()).await?;
        Ok(Run::new(method, execution))
    }

    /// Start the feature's only workflow with arguments
    pub async fn execute_single_workflow(
        &self,
        options: Option<WorkflowOptions>,
        args: Vec<Payload>,
    ) -> Result<Run> {
        let method = self.single_workflow_method()?;
        let options = options.unwrap_or_else(|| self.default_workflow_options());
        let execution = self
            .initiator_client()
            .start_workflow(&method.name, options, args)
            .await?;
        tracing::info!("Started workflow {} as {}", method.name, execution);
        Ok(Run::new(method, execution))
    }

    /// Start any workflow type with the default options
    pub async fn execute_workflow(
        &self,
        workflow_type: &str,
        args: Vec<Payload>,
    ) -> Result<WorkflowExecution> {
        let execution = self
            .initiator_client()
            .start_workflow(workflow_type, self.default_workflow_options(), args)
            .await?;
        tracing::info!("Started workflow {} as {}", workflow_type, execution);
        Ok(execution)
    }

    fn single_workflow_method(&self) -> Result<WorkflowMethod> {
        match self.prepared.workflow_methods.as_slice() {
            [method] => Ok(method.clone()),
            methods => Err(Error::assertion(format!(
                "expected only one workflow method, got {}",
                methods.len()
            ))),
        }
    }

    // === Results and histories ===

    /// Wait for the run to finish and check the result's declared shape
    pub async fn wait_for_run_result(&self, run: &Run) -> Result<Payload> {
        let result = self.initiator_client().result(&run.execution).await?;
        if !run.method.return_kind.matches(&result) {
            return Err(Error::assertion(format!(
                "workflow {} declared a {} result, got {}",
                run.method.name, run.method.return_kind, result
            )));
        }
        Ok(result)
    }

    /// Wait for the run to finish and decode its result
    pub async fn wait_for_run_result_as<T: DeserializeOwned>(&self, run: &Run) -> Result<T> {
        let result = self.initiator_client().result(&run.execution).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Fetch the run's history through the initiating connection
    pub async fn workflow_history(&self, run: &Run) -> Result<WorkflowExecutionHistory> {
        self.initiator_service()
            .fetch_history(&self.config.namespace, &run.execution)
            .await
    }

    /// Result payload recorded in the completion event
    pub async fn workflow_result_payload(&self, run: &Run) -> Result<Payload> {
        let history = self.workflow_history(run).await?;
        history
            .find(EventType::WorkflowExecutionCompleted)
            .map(|e| e.attributes.get("result").cloned().unwrap_or(Payload::Null))
            .ok_or_else(|| Error::assertion("workflow has no completed event"))
    }

    /// First argument recorded in the started event
    pub async fn workflow_argument_payload(&self, run: &Run) -> Result<Payload> {
        let history = self.workflow_history(run).await?;
        history
            .find(EventType::WorkflowExecutionStarted)
            .and_then(|e| e.attributes.get("input"))
            .and_then(|input| input.get(0))
            .cloned()
            .ok_or_else(|| Error::assertion("workflow was started without arguments"))
    }

    pub async fn workflow_execution_info(&self, run: &Run) -> Result<WorkflowExecutionInfo> {
        self.initiator_service()
            .describe_execution(&self.config.namespace, &run.execution)
            .await
    }

    /// Fixture namespace of this feature for the SDK under test
    pub fn fixture_store(&self) -> FixtureStore {
        FixtureStore::for_feature(
            &self.config.fixtures_dir,
            self.prepared.dir,
            self.sdk.name(),
        )
    }

    /// Fixtures recorded by this SDK version or older
    pub fn load_past_histories(&self) -> Result<PastHistories> {
        self.fixture_store().load_up_to(&self.sdk.version())
    }

    /// Replay the live history and every past fixture
    pub async fn check_current_and_past_histories(&self, run: &Run) -> Result<()> {
        let current = self.workflow_history(run).await?;
        let worker = self.workers.worker()?;
        let verifier = HistoryVerifier::new(worker.as_ref());
        verifier.verify_current(&current).await?;

        if self.config.generate_history {
            let version = self.sdk.version().to_string();
            self.fixture_store().store(&version, &[current])?;
        }

        verifier.verify_past(&self.load_past_histories()?).await
    }

    /// Rejected updates must not have been written to history
    pub async fn require_no_update_rejected_events(&self, run: &Run) -> Result<()> {
        let history = self.workflow_history(run).await?;
        require_no_update_rejected(&history)
    }

    // === Capabilities and skips ===

    async fn check_update(&self, rpc: &OptionalRpc, accepted_only: bool) -> Result<()> {
        let client = self.initiator_client();
        let capability = if accepted_only {
            check_optional_rpc(rpc, || {
                client.start_update(
                    capability::NONEXISTENT_WORKFLOW_ID,
                    capability::NONEXISTENT_UPDATE_NAME,
                    Vec::new(),
                )
            })
            .await
        } else {
            check_optional_rpc(rpc, || {
                client.update(
                    capability::NONEXISTENT_WORKFLOW_ID,
                    capability::NONEXISTENT_UPDATE_NAME,
                    Vec::new(),
                )
            })
            .await
        };
        capability.require()
    }

    pub async fn skip_if_update_not_supported(&self) -> Result<()> {
        self.check_update(&capability::UPDATE, false).await
    }

    pub async fn skip_if_async_accepted_update_not_supported(&self) -> Result<()> {
        self.check_update(&capability::ASYNC_ACCEPTED_UPDATE, true)
            .await
    }

    /// Stop the run with a skip
    pub fn skip<T>(&self, message: impl Into<String>) -> Result<T> {
        Err(Error::skip(message))
    }

    /// Poll `check` until it reports true
    pub async fn retry<F, Fut>(&self, mut check: F, retries: usize, sleep: Duration) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        for _ in 0..retries {
            if check().await? {
                return Ok(());
            }
            tokio::time::sleep(sleep).await;
        }
        Err(Error::assertion("retry limit exceeded"))
    }
}

fn require_no_update_rejected(history: &WorkflowExecutionHistory) -> Result<()> {
    match history.find(EventType::WorkflowExecutionUpdateRejected) {
        Some(event) => Err(Error::assertion(format!(
            "unexpected update rejected event {}",
            event.event_id
        ))),
        None => Ok(()),
    }
}

async fn connect(sdk: &dyn Sdk, options: ServiceOptions) -> Result<Arc<dyn WorkflowService>> {
    let target = options.target.clone();
    sdk.connect(options).await.map_err(|e| match e {
        Error::Connection { .. } => e,
        other => Error::Connection {
            target,
            reason: other.to_string(),
        },
    })
}

/// Construct, run and close a runner, folding everything into an outcome
pub async fn run_feature(sdk: Arc<dyn Sdk>, config: Config, prepared: &PreparedFeature) -> Outcome {
    let dir = prepared.dir;
    let result = match Runner::new(sdk, config, prepared.clone()).await {
        Ok(mut runner) => {
            let result = runner.run().await;
            let closed = runner.close();
            match result {
                Ok(()) => closed,
                Err(e) => Err(e),
            }
        }
        Err(e) => Err(e),
    };

    let outcome = Outcome::from_result(result);
    match &outcome {
        Outcome::Passed => tracing::info!("Feature {} passed", dir),
        Outcome::Skipped(reason) => tracing::info!("Feature {} skipped: {}", dir, reason),
        Outcome::Failed(message) => tracing::error!("Feature {} failed: {}", dir, message),
    }
    outcome
}
