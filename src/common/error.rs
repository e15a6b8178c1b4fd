//! Error types for the feature harness
//!
//! Errors fall into three groups: skips (the environment cannot run the
//! feature), failures (the feature ran and something was wrong) and setup
//! errors (nothing could run at all). Skips travel through `?` like every
//! other error and are only told apart when a run is turned into an
//! [`Outcome`](crate::harness::Outcome).

use std::io;
use thiserror::Error;

use crate::harness::version::Version;
use crate::sdk::RpcError;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the harness
#[derive(Error, Debug)]
pub enum Error {
    // === Skips ===
    #[error("{0}")]
    Skipped(String),

    #[error("temporal-features-test-proxy is required for this test")]
    ProxyUnavailable,

    // === Setup Errors ===
    #[error("Failed to connect to {target}: {reason}")]
    Connection { target: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("feature {0} not found, make sure it is added to the feature registry")]
    FeatureNotFound(String),

    #[error("{0} feature(s) failed")]
    FeaturesFailed(usize),

    // === Feature Failures ===
    #[error("Assertion failed: {0}")]
    Assertion(String),

    #[error("Workflow failed: {0}")]
    Workflow(String),

    #[error("RPC failed: {0}")]
    Rpc(#[from] RpcError),

    #[error("{}", replay_message(.version, .reason))]
    Replay {
        version: Option<Version>,
        reason: String,
    },

    // === Proxy Errors ===
    #[error("proxy command {command} failed with HTTP code {status}")]
    ProxyCommandFailed { command: String, status: u16 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // === Fixture Errors ===
    #[error("Invalid version '{0}'")]
    InvalidVersion(String),

    #[error("file {path} {reason}")]
    InvalidFixture { path: String, reason: String },

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Internal Errors ===
    #[error("Internal error: {0}")]
    Internal(String),
}

fn replay_message(version: &Option<Version>, reason: &str) -> String {
    match version {
        Some(version) => format!("history for version {} failed: {}", version, reason),
        None => format!("current history failed to replay: {}", reason),
    }
}

impl Error {
    /// Create a skip with the given reason
    pub fn skip(reason: impl Into<String>) -> Self {
        Self::Skipped(reason.into())
    }

    /// Create an assertion failure
    pub fn assertion(message: impl Into<String>) -> Self {
        Self::Assertion(message.into())
    }

    /// Create a replay failure, optionally tied to a fixture version
    pub fn replay(version: Option<Version>, reason: impl std::fmt::Display) -> Self {
        Self::Replay {
            version,
            reason: reason.to_string(),
        }
    }

    /// Create an invalid fixture error for a file
    pub fn invalid_fixture(path: &std::path::Path, reason: impl std::fmt::Display) -> Self {
        Self::InvalidFixture {
            path: path.display().to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error means the feature cannot run here rather than
    /// that it is broken
    pub fn is_skip(&self) -> bool {
        matches!(self, Error::Skipped(_) | Error::ProxyUnavailable)
    }
}
