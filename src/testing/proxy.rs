//! Fake proxy control endpoint
//!
//! An axum router that records each request path with its arrival time and
//! answers every POST with the same, configurable status.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::routing::post;
use axum::Router;
use reqwest::Url;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::common::{Error, Result};

/// A control request as seen by the proxy
#[derive(Debug, Clone)]
pub struct ReceivedCommand {
    /// Request path without the query, e.g. `/reject`
    pub path: String,
    /// Raw query string, empty when absent
    pub query: String,
    pub at: Instant,
}

#[derive(Debug)]
struct ProxyState {
    status: AtomicU16,
    received: Mutex<Vec<ReceivedCommand>>,
}

/// Running fake control endpoint; stops when dropped
#[derive(Debug)]
pub struct LoopbackProxy {
    addr: SocketAddr,
    control: Url,
    state: Arc<ProxyState>,
    task: JoinHandle<()>,
}

impl LoopbackProxy {
    /// Bind an ephemeral local port and start serving
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let control = Url::parse(&format!("http://{}/", addr))
            .map_err(|e| Error::Internal(format!("invalid loopback proxy address {}: {}", addr, e)))?;
        let state = Arc::new(ProxyState {
            status: AtomicU16::new(StatusCode::OK.as_u16()),
            received: Mutex::new(Vec::new()),
        });

        let router = create_router(Arc::clone(&state));
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                tracing::warn!("Loopback proxy stopped: {}", e);
            }
        });

        tracing::debug!("Loopback proxy listening on {}", addr);
        Ok(Self {
            addr,
            control,
            state,
            task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Base URL to configure as the proxy control endpoint
    pub fn control_url(&self) -> Url {
        self.control.clone()
    }

    /// Status returned for every following request
    pub fn set_status(&self, status: u16) {
        self.state.status.store(status, Ordering::SeqCst);
    }

    pub fn received(&self) -> Vec<ReceivedCommand> {
        self.state
            .received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Paths of received commands in arrival order
    pub fn commands(&self) -> Vec<String> {
        self.received().into_iter().map(|c| c.path).collect()
    }
}

impl Drop for LoopbackProxy {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Every path is a command, so a single fallback handles all of them
fn create_router(state: Arc<ProxyState>) -> Router {
    Router::new().fallback(post(record_command)).with_state(state)
}

async fn record_command(State(state): State<Arc<ProxyState>>, uri: Uri) -> StatusCode {
    let command = ReceivedCommand {
        path: uri.path().to_string(),
        query: uri.query().unwrap_or_default().to_string(),
        at: Instant::now(),
    };
    state
        .received
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(command);

    StatusCode::from_u16(state.status.load(Ordering::SeqCst))
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}
