//! A workflow without an execution timeout runs one activity

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::harness::Feature;
use crate::sdk::{
    Activities, Payload, ValueKind, WorkflowContext, WorkflowDefinition, WorkflowFailure,
    WorkflowMethod, WorkflowOptions,
};

pub const DIR: &str = "activity/basic_no_workflow_timeout";

const WORKFLOW_TYPE: &str = "ActivityBasicNoWorkflowTimeout";
const ECHO: &str = "echo";

pub struct BasicNoWorkflowTimeout;

pub fn new() -> Arc<dyn Feature> {
    Arc::new(BasicNoWorkflowTimeout)
}

struct EchoWorkflow;

#[async_trait]
impl WorkflowDefinition for EchoWorkflow {
    fn method(&self) -> WorkflowMethod {
        WorkflowMethod::new(WORKFLOW_TYPE, ValueKind::Null, 0)
    }

    async fn run(
        &self,
        ctx: &dyn WorkflowContext,
        _args: Vec<Payload>,
    ) -> Result<Payload, WorkflowFailure> {
        ctx.execute_activity(ECHO, Vec::new()).await?;
        Ok(Payload::Null)
    }
}

#[async_trait]
impl Activities for BasicNoWorkflowTimeout {
    fn activity_types(&self) -> Vec<String> {
        vec![ECHO.to_string()]
    }

    async fn invoke(
        &self,
        activity_type: &str,
        _args: Vec<Payload>,
    ) -> Result<Payload, WorkflowFailure> {
        match activity_type {
            ECHO => Ok(json!("hi")),
            other => Err(WorkflowFailure::Application(format!(
                "unknown activity {}",
                other
            ))),
        }
    }
}

#[async_trait]
impl Feature for BasicNoWorkflowTimeout {
    fn workflows(&self) -> Vec<Arc<dyn WorkflowDefinition>> {
        vec![Arc::new(EchoWorkflow)]
    }

    fn activities(self: Arc<Self>) -> Option<Arc<dyn Activities>> {
        Some(self)
    }

    fn workflow_options(&self, options: &mut WorkflowOptions) {
        options.execution_timeout = None;
    }

    fn expected_result(&self) -> Option<Payload> {
        Some(Payload::Null)
    }
}
