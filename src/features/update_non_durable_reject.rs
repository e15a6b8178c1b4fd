//! Rejected updates leave no trace in history
//!
//! Updates sent to a workflow that does not accept them must fail, and the
//! rejections must not be written as events.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::common::{Error, Result};
use crate::harness::{Feature, Latch, Run, Runner};
use crate::sdk::{
    Activities, Payload, RpcCode, RpcError, ValueKind, WorkflowContext, WorkflowDefinition, WorkflowFailure,
    WorkflowMethod,
};

pub const DIR: &str = "update/non_durable_reject";

const WORKFLOW_TYPE: &str = "NonDurableReject";
const WAIT_FOR_FINISH: &str = "wait_for_finish";
const UPDATE_NAME: &str = "update";

const COUNT: usize = 5;
const STARTED_TIMEOUT: Duration = Duration::from_secs(10);

pub struct NonDurableReject {
    started: Latch,
    finish: Latch,
    rejected: AtomicUsize,
}

pub fn new() -> Arc<dyn Feature> {
    Arc::new(NonDurableReject {
        started: Latch::new(),
        finish: Latch::new(),
        rejected: AtomicUsize::new(0),
    })
}

struct WaitingWorkflow;

#[async_trait]
impl WorkflowDefinition for WaitingWorkflow {
    fn method(&self) -> WorkflowMethod {
        WorkflowMethod::new(WORKFLOW_TYPE, ValueKind::Number, 0)
    }

    async fn run(
        &self,
        ctx: &dyn WorkflowContext,
        _args: Vec<Payload>,
    ) -> std::result::Result<Payload, WorkflowFailure> {
        ctx.execute_activity(WAIT_FOR_FINISH, Vec::new()).await
    }
}

#[async_trait]
impl Activities for NonDurableReject {
    fn activity_types(&self) -> Vec<String> {
        vec![WAIT_FOR_FINISH.to_string()]
    }

    /// Returns the number of updates the server rejected
    async fn invoke(
        &self,
        _activity_type: &str,
        _args: Vec<Payload>,
    ) -> std::result::Result<Payload, WorkflowFailure> {
        self.started.open();
        self.finish.wait().await;
        Ok(json!(self.rejected.load(Ordering::SeqCst)))
    }
}

#[async_trait]
impl Feature for NonDurableReject {
    fn workflows(&self) -> Vec<Arc<dyn WorkflowDefinition>> {
        vec![Arc::new(WaitingWorkflow)]
    }

    fn activities(self: Arc<Self>) -> Option<Arc<dyn Activities>> {
        Some(self)
    }

    fn expected_result(&self) -> Option<Payload> {
        Some(json!(COUNT))
    }

    async fn execute(&self, runner: &mut Runner) -> Result<Option<Run>> {
        runner.skip_if_update_not_supported().await?;

        let run = runner.execute_single_parameterless_workflow().await?;
        tokio::time::timeout(STARTED_TIMEOUT, self.started.wait())
            .await
            .map_err(|_| Error::assertion("workflow did not start its activity"))?;

        let client = runner.initiator_client();
        for i in 0..COUNT {
            let outcome = client
                .update(&run.execution.workflow_id, UPDATE_NAME, vec![json!(-1)])
                .await;
            require_rejected(i, outcome)?;
            self.rejected.fetch_add(1, Ordering::SeqCst);
        }

        self.finish.open();
        Ok(Some(run))
    }

    async fn check_history(&self, runner: &mut Runner, run: &Run) -> Result<()> {
        runner.require_no_update_rejected_events(run).await?;
        runner.check_current_and_past_histories(run).await
    }
}

/// Only a rejection by the workflow counts; transport errors do not
fn require_rejected(i: usize, outcome: std::result::Result<Payload, RpcError>) -> Result<()> {
    match outcome {
        Ok(result) => Err(Error::assertion(format!(
            "update {} was accepted with result {}",
            i, result
        ))),
        Err(e) if e.code == RpcCode::InvalidArgument => {
            tracing::debug!("Update {} rejected: {}", i, e);
            Ok(())
        }
        Err(e) => Err(Error::assertion(format!(
            "update {} failed instead of being rejected: {}",
            i, e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_invalid_argument_is_a_rejection() {
        let rejected = Err(RpcError::new(RpcCode::InvalidArgument, "no handler"));
        assert!(require_rejected(0, rejected).is_ok());

        for code in [RpcCode::Unavailable, RpcCode::NotFound, RpcCode::Internal] {
            let err = require_rejected(1, Err(RpcError::new(code, "gone"))).unwrap_err();
            assert!(err.to_string().contains("failed instead of being rejected"));
        }

        let err = require_rejected(2, Ok(json!(1))).unwrap_err();
        assert!(err.to_string().contains("was accepted"));
    }
}
