//! Viewer side of the relay.
//!
//! A [`Subscriber`] holds one supervised channel to the relay's watch
//! endpoint, turns incoming envelopes into a [`ViewState`] and keeps the
//! connection alive with periodic pings.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::channel::ws::WsConnector;
use crate::channel::{
    Backoff, ChannelHandle, ChannelMessage, ChannelState, Connector, ReconnectSupervisor,
};
use crate::config::ClientConfig;
use crate::error::{RelayError, Result};
use crate::protocol::{AlertPayload, Envelope, FramePayload, PING, RiskSignal};

const NOTIFICATION_CAPACITY: usize = 64;

/// What a viewer currently shows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewState {
    /// Last frame received. Later frames replace earlier ones.
    pub frame: Option<FramePayload>,
    pub risk: Option<RiskSignal>,
    /// Most recent first.
    pub alerts: VecDeque<AlertPayload>,
    pub last_error: Option<String>,
    /// Envelopes applied.
    pub received: u64,
    /// Messages discarded as malformed or of an unknown type.
    pub dropped: u64,
}

impl ViewState {
    pub fn latest_alert(&self) -> Option<&AlertPayload> {
        self.alerts.front()
    }

    /// Fold one envelope into the view.
    pub fn apply(&mut self, envelope: &Envelope, alert_history: usize) {
        match envelope {
            Envelope::Frame(frame) => {
                if let Some(risk) = &frame.risk {
                    self.risk = Some(risk.clone());
                }
                self.frame = Some(frame.clone());
            }
            Envelope::Risk(risk) => self.risk = Some(risk.clone()),
            Envelope::Alert(alert) => {
                self.alerts.push_front(alert.clone());
                self.alerts.truncate(alert_history);
            }
            Envelope::Error { message } => self.last_error = Some(message.clone()),
        }
        self.received += 1;
    }
}

struct Session {
    supervisor: Arc<ReconnectSupervisor>,
    task: JoinHandle<()>,
}

/// Receives relay envelopes and maintains a [`ViewState`].
pub struct Subscriber {
    ping_interval: Duration,
    alert_history: usize,
    backoff: Backoff,
    view: Arc<watch::Sender<ViewState>>,
    notifications: broadcast::Sender<Envelope>,
    running: AtomicBool,
    session: Mutex<Option<Session>>,
}

impl Subscriber {
    pub fn new(config: &ClientConfig) -> Self {
        let (view, _) = watch::channel(ViewState::default());
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            ping_interval: config.ping_interval,
            alert_history: config.alert_history,
            backoff: Backoff::new(config.backoff.clone()),
            view: Arc::new(view),
            notifications,
            running: AtomicBool::new(false),
            session: Mutex::new(None),
        }
    }

    pub fn start(&self, connector: Arc<dyn Connector>) -> Result<()> {
        let mut session = self.session.lock();
        if session.is_some() {
            return Err(RelayError::AlreadyRunning);
        }

        let (supervisor, inbound) = ReconnectSupervisor::spawn(connector, self.backoff.clone());
        let supervisor = Arc::new(supervisor);
        self.running.store(true, Ordering::SeqCst);

        let receiver = Receiver {
            inbound,
            channel: supervisor.handle(),
            view: self.view.clone(),
            notifications: self.notifications.clone(),
            ping_interval: self.ping_interval,
            alert_history: self.alert_history,
        };
        let task = tokio::spawn(receiver.run());

        tracing::info!(endpoint = %supervisor.target(), "subscriber started");
        *session = Some(Session { supervisor, task });
        Ok(())
    }

    /// Connect to the relay's watch endpoint for `config.origin`.
    pub fn start_with_config(&self, config: &ClientConfig) -> Result<()> {
        let connector = Arc::new(WsConnector::new(&config.watch_url()?));
        self.start(connector)
    }

    /// Stop pinging, close the channel without reconnecting and drop the
    /// displayed frame. Idempotent.
    pub fn stop(&self) {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        if let Some(session) = self.session.lock().take() {
            session.task.abort();
            session.supervisor.stop();
        }
        self.view.send_if_modified(|v| v.frame.take().is_some());
        if was_running {
            tracing::info!("subscriber stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Snapshot of the current view.
    pub fn view(&self) -> ViewState {
        self.view.borrow().clone()
    }

    pub fn watch_view(&self) -> watch::Receiver<ViewState> {
        self.view.subscribe()
    }

    /// Stream of every envelope as it is applied, for transient surfaces
    /// such as toasts.
    pub fn notifications(&self) -> broadcast::Receiver<Envelope> {
        self.notifications.subscribe()
    }

    pub fn channel(&self) -> Option<ChannelHandle> {
        self.session.lock().as_ref().map(|s| s.supervisor.handle())
    }

    /// "Connected" or "Disconnected".
    pub fn connectivity(&self) -> &'static str {
        self.channel()
            .map_or(ChannelState::Idle, |c| c.state())
            .connectivity()
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Receiver {
    inbound: mpsc::Receiver<ChannelMessage>,
    channel: ChannelHandle,
    view: Arc<watch::Sender<ViewState>>,
    notifications: broadcast::Sender<Envelope>,
    ping_interval: Duration,
    alert_history: usize,
}

impl Receiver {
    async fn run(mut self) {
        let mut ping = tokio::time::interval_at(Instant::now() + self.ping_interval, self.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = self.inbound.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    None => break,
                },
                _ = ping.tick() => {
                    if self.channel.is_open() && self.channel.try_send(ChannelMessage::Text(PING.to_string())) {
                        tracing::trace!("ping sent");
                    }
                }
            }
        }
        tracing::debug!("subscriber receive loop exited");
    }

    fn handle(&self, msg: ChannelMessage) {
        let text = match msg {
            ChannelMessage::Text(text) => text,
            ChannelMessage::Binary(data) => {
                tracing::warn!(bytes = data.len(), "unexpected binary message dropped");
                self.view.send_modify(|v| v.dropped += 1);
                return;
            }
        };

        let envelope = match Envelope::parse(&text) {
            Ok(Some(envelope)) => envelope,
            Ok(None) => {
                tracing::debug!("message with unknown type skipped");
                self.view.send_modify(|v| v.dropped += 1);
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "malformed message dropped");
                self.view.send_modify(|v| v.dropped += 1);
                return;
            }
        };

        tracing::debug!(kind = envelope.tag(), "envelope received");
        self.view.send_modify(|v| v.apply(&envelope, self.alert_history));
        // No receivers is fine.
        let _ = self.notifications.send(envelope);
    }
}

impl Default for Subscriber {
    fn default() -> Self {
        Self::new(&ClientConfig::default())
    }
}
