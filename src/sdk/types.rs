//! Data types exchanged with the workflow SDK
//!
//! These mirror the subset of the orchestration API the harness touches:
//! execution identities, option bags, recorded histories and RPC status
//! codes.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// A serialized workflow or activity argument / result
pub type Payload = Value;

/// Identity of a started workflow execution
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecution {
    pub workflow_id: String,
    pub run_id: String,
}

impl fmt::Display for WorkflowExecution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.workflow_id, self.run_id)
    }
}

/// Shape of a value a workflow method declares it returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// No value (unit)
    Null,
    Bool,
    Number,
    String,
    Array,
    Object,
    /// Anything is accepted
    Any,
}

impl ValueKind {
    /// Whether the payload has this shape
    pub fn matches(&self, payload: &Payload) -> bool {
        match self {
            ValueKind::Null => payload.is_null(),
            ValueKind::Bool => payload.is_boolean(),
            ValueKind::Number => payload.is_number(),
            ValueKind::String => payload.is_string(),
            ValueKind::Array => payload.is_array(),
            ValueKind::Object => payload.is_object(),
            ValueKind::Any => true,
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Null => "null",
            ValueKind::Bool => "bool",
            ValueKind::Number => "number",
            ValueKind::String => "string",
            ValueKind::Array => "array",
            ValueKind::Object => "object",
            ValueKind::Any => "any",
        };
        f.write_str(name)
    }
}

/// Signature of a workflow method: its registered name, declared return
/// kind and parameter count
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowMethod {
    pub name: String,
    pub return_kind: ValueKind,
    pub arity: usize,
}

impl WorkflowMethod {
    pub fn new(name: impl Into<String>, return_kind: ValueKind, arity: usize) -> Self {
        Self {
            name: name.into(),
            return_kind,
            arity,
        }
    }
}

// === Events and histories ===

/// Kind of a recorded history event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    WorkflowExecutionStarted,
    ActivityTaskScheduled,
    ActivityTaskCompleted,
    ActivityTaskFailed,
    WorkflowExecutionUpdateAccepted,
    WorkflowExecutionUpdateRejected,
    WorkflowExecutionUpdateCompleted,
    WorkflowExecutionCompleted,
    WorkflowExecutionFailed,
    #[serde(other)]
    Unspecified,
}

/// A single recorded event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEvent {
    #[serde(deserialize_with = "int_or_string")]
    pub event_id: i64,
    pub event_type: EventType,
    #[serde(default)]
    pub attributes: Value,
}

impl HistoryEvent {
    pub fn new(event_id: i64, event_type: EventType, attributes: Value) -> Self {
        Self {
            event_id,
            event_type,
            attributes,
        }
    }

    /// Look up a string attribute
    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }
}

/// Event ids are written as strings by some exporters
fn int_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Str(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Int(i) => Ok(i),
        Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// The ordered event log of one workflow execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecutionHistory {
    pub events: Vec<HistoryEvent>,
}

impl WorkflowExecutionHistory {
    pub fn new(events: Vec<HistoryEvent>) -> Self {
        Self { events }
    }

    /// First event of the given type
    pub fn find(&self, event_type: EventType) -> Option<&HistoryEvent> {
        self.events.iter().find(|e| e.event_type == event_type)
    }

    /// Workflow type recorded in the started event
    pub fn workflow_type(&self) -> Option<&str> {
        self.find(EventType::WorkflowExecutionStarted)
            .and_then(|e| e.attr_str("workflowType"))
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Summary returned by a describe call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecutionInfo {
    pub execution: WorkflowExecution,
    pub workflow_type: String,
    pub task_queue: String,
    pub status: ExecutionStatus,
    pub history_length: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

// === RPC status ===

/// gRPC-style status code attached to a failed call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcCode {
    NotFound,
    PermissionDenied,
    Unimplemented,
    Unavailable,
    InvalidArgument,
    DeadlineExceeded,
    Internal,
    Unknown,
}

impl fmt::Display for RpcCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RpcCode::NotFound => "NOT_FOUND",
            RpcCode::PermissionDenied => "PERMISSION_DENIED",
            RpcCode::Unimplemented => "UNIMPLEMENTED",
            RpcCode::Unavailable => "UNAVAILABLE",
            RpcCode::InvalidArgument => "INVALID_ARGUMENT",
            RpcCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            RpcCode::Internal => "INTERNAL",
            RpcCode::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// A failed call to the server
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RpcError {
    pub code: RpcCode,
    pub message: String,
}

impl RpcError {
    pub fn new(code: RpcCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Failure raised by workflow or activity code
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkflowFailure {
    #[error("activity {activity_type} failed: {message}")]
    Activity {
        activity_type: String,
        message: String,
    },

    #[error("application error: {0}")]
    Application(String),

    #[error("nondeterminism: {0}")]
    Nondeterminism(String),
}

// === Options ===

/// Receiver for client metrics
pub trait MetricsSink: Send + Sync + fmt::Debug {
    fn counter(&self, name: &str, value: u64);
}

/// Metrics sink that drops everything
#[derive(Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn counter(&self, _name: &str, _value: u64) {}
}

/// Client TLS material in PEM form
#[derive(Clone, PartialEq, Eq)]
pub struct TlsConfig {
    pub client_cert: Vec<u8>,
    pub client_key: Vec<u8>,
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("client_cert", &format_args!("{} bytes", self.client_cert.len()))
            .field("client_key", &"<redacted>")
            .finish()
    }
}

/// Options for opening a service connection
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub target: String,
    pub tls: Option<TlsConfig>,
    pub metrics: Arc<dyn MetricsSink>,
    pub rpc_timeout: Duration,
    pub headers: HashMap<String, String>,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            target: String::new(),
            tls: None,
            metrics: Arc::new(NoopMetrics),
            rpc_timeout: Duration::from_secs(10),
            headers: HashMap::new(),
        }
    }
}

/// Options for building a client on top of a service
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    pub namespace: String,
    pub identity: Option<String>,
}

/// Options for a worker factory
#[derive(Debug, Clone)]
pub struct WorkerFactoryOptions {
    pub max_workflow_thread_count: usize,
    pub workflow_cache_size: usize,
}

impl Default for WorkerFactoryOptions {
    fn default() -> Self {
        Self {
            max_workflow_thread_count: 600,
            workflow_cache_size: 600,
        }
    }
}

/// Options for one worker
#[derive(Debug, Clone, Default)]
pub struct WorkerOptions {
    pub max_concurrent_activity_executions: Option<usize>,
    pub max_concurrent_workflow_task_executions: Option<usize>,
    pub disable_eager_activities: bool,
}

/// Options for starting a workflow
#[derive(Debug, Clone, Default)]
pub struct WorkflowOptions {
    pub workflow_id: Option<String>,
    pub task_queue: String,
    pub execution_timeout: Option<Duration>,
    pub run_timeout: Option<Duration>,
    pub task_timeout: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_history_event_accepts_string_ids() {
        let raw = json!({
            "events": [
                {"eventId": "1", "eventType": "WorkflowExecutionStarted",
                 "attributes": {"workflowType": "Basic"}},
                {"eventId": 2, "eventType": "WorkflowExecutionCompleted"}
            ]
        });
        let history: WorkflowExecutionHistory = serde_json::from_value(raw).unwrap();
        assert_eq!(history.events[0].event_id, 1);
        assert_eq!(history.events[1].event_id, 2);
        assert_eq!(history.workflow_type(), Some("Basic"));
    }

    #[test]
    fn test_unknown_event_type_is_tolerated() {
        let raw = json!({"eventId": 7, "eventType": "TimerFired"});
        let event: HistoryEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(event.event_type, EventType::Unspecified);
    }

    #[test]
    fn test_value_kind_matches() {
        assert!(ValueKind::String.matches(&json!("hi")));
        assert!(!ValueKind::String.matches(&json!(1)));
        assert!(ValueKind::Null.matches(&Value::Null));
        assert!(ValueKind::Any.matches(&json!({"a": 1})));
    }

    #[test]
    fn test_tls_debug_redacts_key() {
        let tls = TlsConfig {
            client_cert: b"cert".to_vec(),
            client_key: b"secret".to_vec(),
        };
        let shown = format!("{:?}", tls);
        assert!(!shown.contains("secret"));
        assert!(shown.contains("4 bytes"));
    }
}
