//! Operator control of relay-side pulling.
//!
//! The relay can fetch frames itself from a camera URL instead of waiting
//! for a publisher. [`PullController`] issues the start/stop commands and
//! tracks whether it believes a pull session is running, which is all a UI
//! needs to enable or disable its buttons.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::{START_PATH, STATUS_PATH, STOP_PATH, control_url};
use crate::error::{RelayError, Result};
use crate::protocol::{PullKind, PullStatus, StartBody};

/// Transport for pull commands.
#[async_trait]
pub trait ControlClient: Send + Sync {
    async fn send_start(&self, body: &StartBody) -> Result<()>;
    async fn send_stop(&self) -> Result<()>;
}

/// [`ControlClient`] speaking JSON over HTTP to the relay.
#[derive(Debug, Clone)]
pub struct HttpControlClient {
    http: reqwest::Client,
    start_url: String,
    stop_url: String,
    status_url: String,
}

impl HttpControlClient {
    pub fn new(origin: &str) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::new(),
            start_url: control_url(origin, START_PATH)?,
            stop_url: control_url(origin, STOP_PATH)?,
            status_url: control_url(origin, STATUS_PATH)?,
        })
    }

    /// Ask the relay what it is pulling, if anything.
    pub async fn status(&self) -> Result<PullStatus> {
        let resp = self.http.get(&self.status_url).send().await?;
        Ok(resp.error_for_status()?.json().await?)
    }
}

#[async_trait]
impl ControlClient for HttpControlClient {
    async fn send_start(&self, body: &StartBody) -> Result<()> {
        self.http
            .post(&self.start_url)
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn send_stop(&self) -> Result<()> {
        self.http
            .post(&self.stop_url)
            .json(&serde_json::json!({}))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Whether a pull session is believed to be running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullState {
    Stopped,
    /// A start command is in flight.
    Starting,
    Running,
}

impl PullState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: PullState,
    source: Option<(String, PullKind)>,
}

pub struct PullController {
    client: Arc<dyn ControlClient>,
    inner: Mutex<Inner>,
}

impl PullController {
    pub fn new(client: Arc<dyn ControlClient>) -> Self {
        Self {
            client,
            inner: Mutex::new(Inner {
                state: PullState::Stopped,
                source: None,
            }),
        }
    }

    /// Controller talking HTTP to the relay at `origin`.
    pub fn http(origin: &str) -> Result<Self> {
        Ok(Self::new(Arc::new(HttpControlClient::new(origin)?)))
    }

    /// Tell the relay to start pulling `url`.
    ///
    /// An empty URL fails with [`RelayError::InvalidSource`] without contacting
    /// the relay. Starting while already running replaces the source. On
    /// failure the previous state is kept.
    pub async fn start_pull(&self, url: &str, kind: PullKind) -> Result<()> {
        let url = url.trim();
        if url.is_empty() {
            return Err(RelayError::InvalidSource("source URL is empty".to_string()));
        }

        let previous = {
            let mut inner = self.inner.lock();
            let previous = inner.state;
            inner.state = PullState::Starting;
            previous
        };

        let body = StartBody {
            url: url.to_string(),
            kind,
        };
        match self.client.send_start(&body).await {
            Ok(()) => {
                let replaced = previous == PullState::Running;
                let mut inner = self.inner.lock();
                inner.state = PullState::Running;
                inner.source = Some((body.url, kind));
                tracing::info!(url, %kind, replaced, "pull started");
                Ok(())
            }
            Err(e) => {
                self.inner.lock().state = previous;
                tracing::warn!(url, error = %e, "pull start failed");
                Err(e)
            }
        }
    }

    /// Tell the relay to stop pulling. Safe to repeat.
    pub async fn stop_pull(&self) -> Result<()> {
        self.client.send_stop().await?;
        let mut inner = self.inner.lock();
        if inner.state != PullState::Stopped {
            tracing::info!("pull stopped");
        }
        inner.state = PullState::Stopped;
        inner.source = None;
        Ok(())
    }

    pub fn state(&self) -> PullState {
        self.inner.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == PullState::Running
    }

    /// URL and analysis kind of the running pull, if any.
    pub fn source(&self) -> Option<(String, PullKind)> {
        self.inner.lock().source.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Start(StartBody),
        Stop,
    }

    #[derive(Default)]
    struct RecordingClient {
        calls: Mutex<Vec<Call>>,
        fail_start: bool,
    }

    #[async_trait]
    impl ControlClient for RecordingClient {
        async fn send_start(&self, body: &StartBody) -> Result<()> {
            self.calls.lock().push(Call::Start(body.clone()));
            if self.fail_start {
                return Err(RelayError::ChannelFault("relay unreachable".into()));
            }
            Ok(())
        }

        async fn send_stop(&self) -> Result<()> {
            self.calls.lock().push(Call::Stop);
            Ok(())
        }
    }

    #[tokio::test]
    async fn empty_url_is_rejected_without_a_call() {
        let client = Arc::new(RecordingClient::default());
        let pull = PullController::new(client.clone());

        assert!(matches!(
            pull.start_pull("", PullKind::Both).await,
            Err(RelayError::InvalidSource(_))
        ));
        assert!(matches!(
            pull.start_pull("   ", PullKind::Both).await,
            Err(RelayError::InvalidSource(_))
        ));
        assert!(client.calls.lock().is_empty());
        assert_eq!(pull.state(), PullState::Stopped);
    }

    #[tokio::test]
    async fn start_then_stop_issues_one_of_each() {
        let client = Arc::new(RecordingClient::default());
        let pull = PullController::new(client.clone());

        pull.start_pull("http://x", PullKind::Fire).await.unwrap();
        assert!(pull.is_running());
        assert_eq!(pull.source(), Some(("http://x".to_string(), PullKind::Fire)));

        pull.stop_pull().await.unwrap();
        assert_eq!(pull.state(), PullState::Stopped);
        assert_eq!(
            *client.calls.lock(),
            vec![
                Call::Start(StartBody {
                    url: "http://x".into(),
                    kind: PullKind::Fire,
                }),
                Call::Stop,
            ]
        );
    }

    #[tokio::test]
    async fn second_start_replaces_source() {
        let client = Arc::new(RecordingClient::default());
        let pull = PullController::new(client.clone());

        pull.start_pull("http://a", PullKind::Both).await.unwrap();
        pull.start_pull("http://b", PullKind::Ppe).await.unwrap();
        assert_eq!(pull.source(), Some(("http://b".to_string(), PullKind::Ppe)));
        assert_eq!(client.calls.lock().len(), 2);
    }

    #[tokio::test]
    async fn failed_start_keeps_previous_state() {
        let client = Arc::new(RecordingClient {
            fail_start: true,
            ..Default::default()
        });
        let pull = PullController::new(client);

        assert!(pull.start_pull("http://x", PullKind::Both).await.is_err());
        assert_eq!(pull.state(), PullState::Stopped);
        assert_eq!(pull.source(), None);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let pull = PullController::new(Arc::new(RecordingClient::default()));
        pull.stop_pull().await.unwrap();
        pull.stop_pull().await.unwrap();
        assert_eq!(pull.state(), PullState::Stopped);
    }

    #[test]
    fn http_client_builds_endpoints() {
        let client = HttpControlClient::new("https://site.example/dashboard").unwrap();
        assert_eq!(client.start_url, "https://site.example/stream/start");
        assert_eq!(client.stop_url, "https://site.example/stream/stop");
        assert_eq!(client.status_url, "https://site.example/stream/status");
    }
}
