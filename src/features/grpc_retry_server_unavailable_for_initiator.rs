//! Starting a workflow retries while the proxy refuses connections

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::common::Result;
use crate::harness::{Feature, Run, Runner};
use crate::sdk::{
    Payload, ValueKind, WorkflowContext, WorkflowDefinition, WorkflowFailure, WorkflowMethod,
};

pub const DIR: &str = "grpc_retry/server_unavailable_for_initiator";

const WORKFLOW_TYPE: &str = "ServerUnavailableForInitiator";

/// How long the proxy refuses connections
const REJECT_FOR: Duration = Duration::from_secs(2);

pub struct ServerUnavailableForInitiator;

pub fn new() -> Arc<dyn Feature> {
    Arc::new(ServerUnavailableForInitiator)
}

struct EmptyWorkflow;

#[async_trait]
impl WorkflowDefinition for EmptyWorkflow {
    fn method(&self) -> WorkflowMethod {
        WorkflowMethod::new(WORKFLOW_TYPE, ValueKind::Null, 0)
    }

    async fn run(
        &self,
        _ctx: &dyn WorkflowContext,
        _args: Vec<Payload>,
    ) -> std::result::Result<Payload, WorkflowFailure> {
        Ok(Payload::Null)
    }
}

#[async_trait]
impl Feature for ServerUnavailableForInitiator {
    fn workflows(&self) -> Vec<Arc<dyn WorkflowDefinition>> {
        vec![Arc::new(EmptyWorkflow)]
    }

    async fn execute(&self, runner: &mut Runner) -> Result<Option<Run>> {
        let runner = &*runner;
        runner
            .proxy_reject_and_accept(REJECT_FOR, || {
                runner.execute_single_parameterless_workflow()
            })
            .await
            .map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initiator_goes_through_proxy() {
        let feature = new();
        assert!(feature.initiator_uses_proxy());
        assert!(!feature.worker_uses_proxy());
    }
}
