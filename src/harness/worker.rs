//! Worker lifecycle
//!
//! Builds a worker factory and a worker from the feature's option hooks,
//! registers the feature's workflows (and the feature itself as activities
//! when it implements any) and starts polling.

use std::sync::Arc;

use crate::common::{Error, Result};
use crate::sdk::{Sdk, Worker, WorkerFactory, WorkerFactoryOptions, WorkerOptions, WorkflowClient};

use super::feature::Feature;

/// Holds the current worker factory and its single worker
#[derive(Default)]
pub struct WorkerManager {
    factory: Option<Box<dyn WorkerFactory>>,
    worker: Option<Arc<dyn Worker>>,
    starts: usize,
}

impl WorkerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build and start a fresh factory + worker, replacing the current pair
    ///
    /// This does not stop the previous factory. Callers must have shut it
    /// down (see [`WorkerManager::shutdown`]) so two factories never poll
    /// the same task queue.
    pub async fn restart(
        &mut self,
        sdk: &dyn Sdk,
        client: Arc<dyn WorkflowClient>,
        feature: &Arc<dyn Feature>,
        task_queue: &str,
    ) -> Result<()> {
        let mut factory_options = WorkerFactoryOptions::default();
        feature.worker_factory_options(&mut factory_options);
        let mut factory = sdk.new_worker_factory(client, factory_options)?;

        let mut worker_options = WorkerOptions::default();
        feature.worker_options(&mut worker_options);
        let worker = factory.new_worker(task_queue, worker_options)?;
        feature.prepare_worker(worker.as_ref())?;

        for definition in feature.workflows() {
            worker.register_workflow(definition)?;
        }

        if let Some(activities) = Arc::clone(feature).activities() {
            tracing::debug!("Registering activities {:?}", activities.activity_types());
            worker.register_activities(activities)?;
        }

        factory.start().await?;
        self.starts += 1;
        tracing::info!(task_queue, starts = self.starts, "Worker started");

        self.factory = Some(factory);
        self.worker = Some(worker);
        Ok(())
    }

    /// Stop the current factory and wait until it has terminated
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(factory) = &self.factory {
            factory.shutdown_now()?;
            factory.await_termination().await?;
            tracing::info!("Worker factory terminated");
        }
        Ok(())
    }

    /// Stop the current factory without waiting
    pub fn shutdown_now(&self) -> Result<()> {
        match &self.factory {
            Some(factory) => factory.shutdown_now(),
            None => Ok(()),
        }
    }

    pub fn worker(&self) -> Result<&Arc<dyn Worker>> {
        self.worker
            .as_ref()
            .ok_or_else(|| Error::Internal("worker has not been started".to_string()))
    }

    pub fn factory(&self) -> Option<&dyn WorkerFactory> {
        self.factory.as_deref()
    }

    /// How many times a worker has been started
    pub fn starts(&self) -> usize {
        self.starts
    }
}
