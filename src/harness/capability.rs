//! Detection of optional server RPCs
//!
//! The check calls the RPC against a workflow that does not exist and reads
//! the answer from the error: "not found" means the call got past the
//! server's feature gate.

use std::future::Future;

use crate::common::{Error, Result};
use crate::sdk::{RpcCode, RpcError};

/// An optional RPC and the dynamic-config flag that enables it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionalRpc {
    /// Human name used in skip messages
    pub name: &'static str,
    /// Dynamic config key that enables the RPC on the server
    pub dynamic_config_flag: &'static str,
    /// Name used in the "server version too old" message
    pub min_version_name: &'static str,
}

/// Workflow update
pub const UPDATE: OptionalRpc = OptionalRpc {
    name: "update",
    dynamic_config_flag: "frontend.enableUpdateWorkflowExecution",
    min_version_name: "update",
};

/// Workflow update that returns once accepted
pub const ASYNC_ACCEPTED_UPDATE: OptionalRpc = OptionalRpc {
    name: "async accepted update",
    dynamic_config_flag: "frontend.enableUpdateWorkflowExecutionAsyncAccepted",
    min_version_name: "update",
};

/// Target identities guaranteed not to exist
pub const NONEXISTENT_WORKFLOW_ID: &str = "fake";
pub const NONEXISTENT_UPDATE_NAME: &str = "also_fake";

/// Result of probing an optional RPC
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    Supported,
    NotSupported(String),
}

impl Capability {
    /// Classify the outcome of a check call
    pub fn classify<T>(rpc: &OptionalRpc, outcome: std::result::Result<T, RpcError>) -> Self {
        let err = match outcome {
            Ok(_) => return Capability::NotSupported("unknown".to_string()),
            Err(err) => err,
        };

        match err.code {
            RpcCode::NotFound => Capability::Supported,
            RpcCode::PermissionDenied => Capability::NotSupported(format!(
                "server support for {} is disabled; set {}=true in dynamic config to enable",
                rpc.name, rpc.dynamic_config_flag
            )),
            RpcCode::Unimplemented => Capability::NotSupported(format!(
                "server version too old to support {}",
                rpc.min_version_name
            )),
            _ => {
                tracing::debug!(rpc = rpc.name, error = %err, "Unrecognized capability status");
                Capability::NotSupported("unknown".to_string())
            }
        }
    }

    pub fn is_supported(&self) -> bool {
        matches!(self, Capability::Supported)
    }

    /// Turn an unsupported capability into a skip
    pub fn require(self) -> Result<()> {
        match self {
            Capability::Supported => Ok(()),
            Capability::NotSupported(reason) => Err(Error::Skipped(reason)),
        }
    }
}

/// Check an optional RPC by invoking it against a nonexistent target
pub async fn check_optional_rpc<T, F, Fut>(rpc: &OptionalRpc, invoke: F) -> Capability
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = std::result::Result<T, RpcError>>,
{
    let capability = Capability::classify(rpc, invoke().await);
    tracing::info!(rpc = rpc.name, ?capability, "Checked optional RPC");
    capability
}
