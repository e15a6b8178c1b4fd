//! Per-run configuration
//!
//! Built once by the driver for each feature and read-only afterwards.

use std::path::PathBuf;
use std::sync::Arc;

use reqwest::Url;

use crate::sdk::{MetricsSink, NoopMetrics, TlsConfig};

use super::{Error, Result};

/// Default root of the per-feature fixture namespaces
pub const DEFAULT_FIXTURES_DIR: &str = "features";

/// Everything a runner needs to reach the server and the proxy
#[derive(Debug, Clone)]
pub struct Config {
    /// host:port of the server, through the proxy when one is used
    pub server: String,

    /// host:port that bypasses the proxy (defaults to `server`)
    pub direct_server: Option<String>,

    pub namespace: String,

    pub task_queue: String,

    /// Client TLS material
    pub tls: Option<TlsConfig>,

    /// Where client metrics go
    pub metrics: Arc<dyn MetricsSink>,

    /// Proxy control endpoint; fault-injection features skip without it
    pub proxy_control: Option<Url>,

    /// Root of the per-feature fixture namespaces
    pub fixtures_dir: PathBuf,

    /// Store each live history as the fixture for the current SDK version
    pub generate_history: bool,
}

impl Config {
    pub fn new(
        server: impl Into<String>,
        namespace: impl Into<String>,
        task_queue: impl Into<String>,
    ) -> Self {
        Self {
            server: server.into(),
            direct_server: None,
            namespace: namespace.into(),
            task_queue: task_queue.into(),
            tls: None,
            metrics: Arc::new(NoopMetrics),
            proxy_control: None,
            fixtures_dir: PathBuf::from(DEFAULT_FIXTURES_DIR),
            generate_history: false,
        }
    }

    #[must_use]
    pub fn with_direct_server(mut self, direct_server: impl Into<String>) -> Self {
        self.direct_server = Some(direct_server.into());
        self
    }

    #[must_use]
    pub fn with_tls(mut self, tls: Option<TlsConfig>) -> Self {
        self.tls = tls;
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    #[must_use]
    pub fn with_proxy_control(mut self, proxy_control: Option<Url>) -> Self {
        self.proxy_control = proxy_control;
        self
    }

    #[must_use]
    pub fn with_fixtures_dir(mut self, fixtures_dir: impl Into<PathBuf>) -> Self {
        self.fixtures_dir = fixtures_dir.into();
        self
    }

    #[must_use]
    pub fn with_generate_history(mut self, generate_history: bool) -> Self {
        self.generate_history = generate_history;
        self
    }

    /// Same settings for another task queue
    #[must_use]
    pub fn for_task_queue(&self, task_queue: impl Into<String>) -> Self {
        let mut config = self.clone();
        config.task_queue = task_queue.into();
        config
    }

    /// Address that bypasses the proxy
    pub fn direct_server(&self) -> &str {
        self.direct_server.as_deref().unwrap_or(&self.server)
    }

    /// Reject configurations no run could use
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("server", self.server.as_str()),
            ("direct server", self.direct_server()),
            ("namespace", self.namespace.as_str()),
            ("task queue", self.task_queue.as_str()),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(Error::Config(format!("{} must not be empty", name)));
            }
        }
        Ok(())
    }
}
