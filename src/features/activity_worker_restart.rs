//! An activity in flight survives a worker restart
//!
//! The activity blocks until the feature has shut the worker down and
//! started a new one. The workflow must then complete with the activity's
//! result.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::common::{Error, Result};
use crate::harness::{Feature, Latch, Run, Runner};
use crate::sdk::{
    Activities, Payload, ValueKind, WorkflowContext, WorkflowDefinition, WorkflowFailure,
    WorkflowMethod,
};

pub const DIR: &str = "activity/worker_restart";

const WORKFLOW_TYPE: &str = "ActivityWorkerRestart";
const BLOCK: &str = "block";

/// Pause between stopping the old worker and starting the new one
const RESTART_PAUSE: Duration = Duration::from_millis(200);
const STARTED_TIMEOUT: Duration = Duration::from_secs(10);

pub struct WorkerRestart {
    activity_started: Latch,
    worker_restarted: Latch,
}

pub fn new() -> Arc<dyn Feature> {
    Arc::new(WorkerRestart {
        activity_started: Latch::new(),
        worker_restarted: Latch::new(),
    })
}

struct BlockingWorkflow;

#[async_trait]
impl WorkflowDefinition for BlockingWorkflow {
    fn method(&self) -> WorkflowMethod {
        WorkflowMethod::new(WORKFLOW_TYPE, ValueKind::Number, 0)
    }

    async fn run(
        &self,
        ctx: &dyn WorkflowContext,
        _args: Vec<Payload>,
    ) -> std::result::Result<Payload, WorkflowFailure> {
        ctx.execute_activity(BLOCK, Vec::new()).await
    }
}

#[async_trait]
impl Activities for WorkerRestart {
    fn activity_types(&self) -> Vec<String> {
        vec![BLOCK.to_string()]
    }

    async fn invoke(
        &self,
        _activity_type: &str,
        _args: Vec<Payload>,
    ) -> std::result::Result<Payload, WorkflowFailure> {
        self.activity_started.open();
        self.worker_restarted.wait().await;
        Ok(json!(1))
    }
}

#[async_trait]
impl Feature for WorkerRestart {
    fn workflows(&self) -> Vec<Arc<dyn WorkflowDefinition>> {
        vec![Arc::new(BlockingWorkflow)]
    }

    fn activities(self: Arc<Self>) -> Option<Arc<dyn Activities>> {
        Some(self)
    }

    fn expected_result(&self) -> Option<Payload> {
        Some(json!(1))
    }

    async fn execute(&self, runner: &mut Runner) -> Result<Option<Run>> {
        let run = runner.execute_single_parameterless_workflow().await?;

        tokio::time::timeout(STARTED_TIMEOUT, self.activity_started.wait())
            .await
            .map_err(|_| Error::assertion("activity did not start"))?;

        runner.shutdown_worker().await?;
        tokio::time::sleep(RESTART_PAUSE).await;
        runner.restart_worker().await?;
        self.worker_restarted.open();

        Ok(Some(run))
    }
}
