//! Fault injection through the test proxy's control channel
//!
//! The proxy sits between the harness and the server. Each command is an
//! HTTP POST to `<control>/<command>?k=v&...`; any status >= 400 is an error.

use std::future::Future;
use std::time::Duration;

use reqwest::{redirect, StatusCode, Url};

use crate::common::{Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A control command understood by the proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyCommand {
    /// Refuse new and existing connections
    Reject,
    /// Undo `Reject`
    Accept,
    /// Stop forwarding bytes while keeping connections open
    Freeze,
    /// Undo `Freeze`
    Thaw,
    /// Drop all connections and come back after `sleep`
    Restart { sleep: Duration, forceful: bool },
}

impl ProxyCommand {
    /// Path segment for this command
    pub fn method(&self) -> &'static str {
        match self {
            ProxyCommand::Reject => "reject",
            ProxyCommand::Accept => "accept",
            ProxyCommand::Freeze => "freeze",
            ProxyCommand::Thaw => "thaw",
            ProxyCommand::Restart { .. } => "restart",
        }
    }

    /// Query parameters for this command
    pub fn params(&self) -> Vec<(&'static str, String)> {
        match self {
            ProxyCommand::Restart { sleep, forceful } => vec![
                ("sleep", format!("{}ms", sleep.as_millis())),
                ("forceful", forceful.to_string()),
            ],
            _ => Vec::new(),
        }
    }
}

/// Sends commands to the proxy control endpoint
#[derive(Debug, Clone)]
pub struct ProxyController {
    control: Option<Url>,
    http: reqwest::Client,
}

impl ProxyController {
    /// Create a controller; `None` means no proxy is available
    pub fn new(control: Option<Url>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .redirect(redirect::Policy::none())
            .no_proxy()
            .build()?;
        Ok(Self { control, http })
    }

    pub fn is_available(&self) -> bool {
        self.control.is_some()
    }

    /// Build the URL for a command with URL-encoded arguments
    pub fn command_url(&self, method: &str, args: &[(&str, &str)]) -> Result<Url> {
        let base = self.control.as_ref().ok_or(Error::ProxyUnavailable)?;
        let mut url = base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Config(format!("proxy control URI cannot be a base: {}", base)))?
            .pop_if_empty()
            .push(method);
        if !args.is_empty() {
            let mut query = url.query_pairs_mut();
            for (key, value) in args {
                query.append_pair(key, value);
            }
        }
        Ok(url)
    }

    /// POST a raw command with key/value arguments
    pub async fn send_command(&self, method: &str, args: &[(&str, &str)]) -> Result<()> {
        let url = self.command_url(method, args)?;
        tracing::info!("proxySendCommand: {}", url);

        let response = self.http.post(url).send().await?;
        let status = response.status();
        if status.as_u16() >= StatusCode::BAD_REQUEST.as_u16() {
            return Err(Error::ProxyCommandFailed {
                command: method.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(())
    }

    /// Send a typed command
    pub async fn send(&self, command: &ProxyCommand) -> Result<()> {
        let params = command.params();
        let args: Vec<(&str, &str)> = params.iter().map(|(k, v)| (*k, v.as_str())).collect();
        self.send_command(command.method(), &args).await
    }

    pub async fn reject(&self) -> Result<()> {
        self.send(&ProxyCommand::Reject).await
    }

    pub async fn accept(&self) -> Result<()> {
        self.send(&ProxyCommand::Accept).await
    }

    pub async fn freeze(&self) -> Result<()> {
        self.send(&ProxyCommand::Freeze).await
    }

    pub async fn thaw(&self) -> Result<()> {
        self.send(&ProxyCommand::Thaw).await
    }

    pub async fn restart(&self, sleep: Duration, forceful: bool) -> Result<()> {
        self.send(&ProxyCommand::Restart { sleep, forceful }).await
    }

    /// Run `work` between two proxy commands
    ///
    /// `first` is applied before `work` starts. `second` is sent from a
    /// background task `sleep` after `first` completed, while `work` runs;
    /// its errors are only logged. The background task is always joined
    /// before returning the outcome of `work`.
    pub async fn bracket<T, F, Fut>(
        &self,
        sleep: Duration,
        first: ProxyCommand,
        second: ProxyCommand,
        work: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.send(&first).await?;

        let controller = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(sleep).await;
            if let Err(e) = controller.send(&second).await {
                tracing::warn!("Ignoring failed proxy {} command: {}", second.method(), e);
            }
        });

        let result = work().await;

        if let Err(e) = handle.await {
            tracing::warn!("Proxy command task did not complete: {}", e);
        }
        result
    }

    /// Simulate the server being briefly unreachable around `work`
    pub async fn reject_and_accept<T, F, Fut>(&self, sleep: Duration, work: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.bracket(sleep, ProxyCommand::Reject, ProxyCommand::Accept, work)
            .await
    }

    /// Simulate a stalled connection around `work`
    pub async fn freeze_and_thaw<T, F, Fut>(&self, sleep: Duration, work: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.bracket(sleep, ProxyCommand::Freeze, ProxyCommand::Thaw, work)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::LoopbackProxy;
    use std::time::Instant;

    fn controller(url: &str) -> ProxyController {
        ProxyController::new(Some(Url::parse(url).unwrap())).unwrap()
    }

    #[test]
    fn test_command_url_encodes_args() {
        let proxy = controller("http://127.0.0.1:9999/");
        let url = proxy
            .command_url("restart", &[("sleep", "200ms"), ("note", "a b&c")])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:9999/restart?sleep=200ms&note=a+b%26c"
        );
    }

    #[test]
    fn test_command_url_keeps_base_path() {
        let proxy = controller("http://proxy.local:8080/control");
        let url = proxy.command_url("freeze", &[]).unwrap();
        assert_eq!(url.as_str(), "http://proxy.local:8080/control/freeze");
    }

    #[test]
    fn test_restart_params() {
        let cmd = ProxyCommand::Restart {
            sleep: Duration::from_millis(1500),
            forceful: true,
        };
        assert_eq!(cmd.method(), "restart");
        assert_eq!(
            cmd.params(),
            vec![("sleep", "1500ms".to_string()), ("forceful", "true".to_string())]
        );
    }

    #[tokio::test]
    async fn test_missing_endpoint_is_unavailable() {
        let proxy = ProxyController::new(None).unwrap();
        let err = proxy.reject().await.unwrap_err();
        assert!(matches!(err, Error::ProxyUnavailable));
        assert!(err.is_skip());
    }

    #[tokio::test]
    async fn test_error_status_fails_command() {
        let server = LoopbackProxy::start().await.unwrap();
        server.set_status(503);
        let proxy = ProxyController::new(Some(server.control_url())).unwrap();

        let err = proxy.freeze().await.unwrap_err();
        assert!(matches!(
            err,
            Error::ProxyCommandFailed { status: 503, .. }
        ));
        assert_eq!(server.commands(), vec!["/freeze".to_string()]);
    }

    #[tokio::test]
    async fn test_bracket_ordering() {
        let server = LoopbackProxy::start().await.unwrap();
        let proxy = ProxyController::new(Some(server.control_url())).unwrap();
        let sleep = Duration::from_millis(200);

        let started = Instant::now();
        let work_started = proxy
            .reject_and_accept(sleep, || async {
                // reject must already be recorded when work begins
                assert_eq!(server.commands(), vec!["/reject".to_string()]);
                Ok(Instant::now())
            })
            .await
            .unwrap();

        // bracket joined the accept before returning
        let received = server.received();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].path, "/reject");
        assert_eq!(received[1].path, "/accept");
        assert!(received[0].at <= work_started);
        assert!(received[1].at.duration_since(received[0].at) >= sleep);
        assert!(started.elapsed() >= sleep);
    }

    #[tokio::test]
    async fn test_bracket_returns_work_error_and_swallows_second() {
        let server = LoopbackProxy::start().await.unwrap();
        let proxy = ProxyController::new(Some(server.control_url())).unwrap();

        let result: Result<()> = proxy
            .freeze_and_thaw(Duration::from_millis(20), || async {
                // the thaw will now be refused, which must not mask our error
                server.set_status(500);
                Err(Error::assertion("work failed"))
            })
            .await;

        assert!(matches!(result, Err(Error::Assertion(_))));
        assert_eq!(
            server.commands(),
            vec!["/freeze".to_string(), "/thaw".to_string()]
        );
    }
}
