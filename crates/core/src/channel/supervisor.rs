use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::{Backoff, ChannelHandle, ChannelMessage, ChannelState, Connector, LinkSink, LinkStream};

/// Inbound queue depth. Once a consumer falls this far behind, newly arriving
/// messages are dropped; the queued ones are kept and the link never stalls.
const INBOUND_QUEUE: usize = 32;

/// Keeps one duplex channel connected until told to stop.
///
/// Owns the physical link in a background task. After an unexpected close or
/// a failed connect it waits [`Backoff::delay`] and tries again; consecutive
/// failures grow the delay up to its cap, a successful open resets it.
///
/// [`stop`](Self::stop) is the only way out: it is synchronous, idempotent,
/// and guarantees no further connect attempt or send is started. Dropping
/// the supervisor stops it.
pub struct ReconnectSupervisor {
    target: String,
    state: Arc<watch::Sender<ChannelState>>,
    shutdown: watch::Sender<bool>,
    stopping: Arc<AtomicBool>,
    handle: ChannelHandle,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReconnectSupervisor {
    /// Start supervising a channel to `connector`'s target.
    ///
    /// Returns the supervisor and the receiver for inbound messages.
    /// Must be called within a tokio runtime.
    pub fn spawn(
        connector: Arc<dyn Connector>,
        backoff: Backoff,
    ) -> (Self, mpsc::Receiver<ChannelMessage>) {
        let (state_tx, state_rx) = watch::channel(ChannelState::Idle);
        let state = Arc::new(state_tx);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (outbound_tx, outbound_rx) = mpsc::channel(1);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let stopping = Arc::new(AtomicBool::new(false));
        let target = connector.target().to_string();

        let worker = Worker {
            connector,
            backoff,
            state: state.clone(),
            shutdown: shutdown_rx,
            stopping: stopping.clone(),
            outbound: outbound_rx,
            inbound: inbound_tx,
        };
        let task = tokio::spawn(worker.run());

        let supervisor = Self {
            target,
            state,
            shutdown: shutdown_tx,
            stopping,
            handle: ChannelHandle::new(state_rx, outbound_tx),
            task: Mutex::new(Some(task)),
        };
        (supervisor, inbound_rx)
    }

    pub fn handle(&self) -> ChannelHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Observe every state transition.
    pub fn subscribe(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn is_stopped(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Close the channel and disable reconnection for good.
    pub fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(endpoint = %self.target, "channel stop requested");
        self.state.send_if_modified(|s| {
            if *s == ChannelState::Idle {
                false
            } else {
                *s = ChannelState::Closing;
                true
            }
        });
        let _ = self.shutdown.send(true);
    }

    /// Wait for the background task to finish closing the link.
    pub async fn join(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for ReconnectSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

enum SessionEnd {
    Stopped,
    Faulted(String),
}

struct Worker {
    connector: Arc<dyn Connector>,
    backoff: Backoff,
    state: Arc<watch::Sender<ChannelState>>,
    shutdown: watch::Receiver<bool>,
    stopping: Arc<AtomicBool>,
    outbound: mpsc::Receiver<ChannelMessage>,
    inbound: mpsc::Sender<ChannelMessage>,
}

impl Worker {
    async fn run(mut self) {
        let endpoint = self.connector.target().to_string();
        let mut failures: u32 = 0;

        loop {
            if self.is_stopping() {
                break;
            }
            set_state(&self.state, ChannelState::Connecting);

            let connected = tokio::select! {
                biased;
                _ = wait_shutdown(&mut self.shutdown) => break,
                res = self.connector.connect() => res,
            };

            match connected {
                Ok((mut sink, stream)) => {
                    if self.is_stopping() {
                        sink.close().await;
                        break;
                    }
                    failures = 0;
                    // New delivery epoch: nothing queued for the old link survives.
                    while self.outbound.try_recv().is_ok() {}
                    set_state(&self.state, ChannelState::Open);
                    tracing::info!(%endpoint, "channel open");

                    match self.pump(sink, stream).await {
                        SessionEnd::Stopped => break,
                        SessionEnd::Faulted(reason) => {
                            tracing::warn!(%endpoint, %reason, "channel fault");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(%endpoint, error = %e, "connect failed");
                }
            }

            if self.is_stopping() {
                break;
            }
            failures = failures.saturating_add(1);
            let delay = self.backoff.delay(failures);
            set_state(&self.state, ChannelState::Faulted);
            tracing::info!(
                %endpoint,
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                "reconnect scheduled"
            );

            tokio::select! {
                biased;
                _ = wait_shutdown(&mut self.shutdown) => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        set_state(&self.state, ChannelState::Idle);
        tracing::debug!(%endpoint, "supervisor exited");
    }

    /// Move messages between the link and the owner's queues until the link
    /// drops or stop is requested.
    async fn pump(
        &mut self,
        mut sink: Box<dyn LinkSink>,
        mut stream: Box<dyn LinkStream>,
    ) -> SessionEnd {
        let shutdown = &mut self.shutdown;
        let outbound = &mut self.outbound;
        let inbound = &self.inbound;
        let state = &self.state;

        loop {
            tokio::select! {
                biased;
                _ = wait_shutdown(shutdown) => {
                    set_state(state, ChannelState::Closing);
                    sink.close().await;
                    return SessionEnd::Stopped;
                }
                msg = outbound.recv() => match msg {
                    Some(msg) => {
                        if let Err(e) = sink.send(msg).await {
                            return SessionEnd::Faulted(e.to_string());
                        }
                    }
                    None => {
                        set_state(state, ChannelState::Closing);
                        sink.close().await;
                        return SessionEnd::Stopped;
                    }
                },
                incoming = stream.recv() => match incoming {
                    Some(Ok(msg)) => {
                        if let Err(mpsc::error::TrySendError::Full(_)) = inbound.try_send(msg) {
                            tracing::debug!("inbound queue full, message dropped");
                        }
                    }
                    Some(Err(e)) => return SessionEnd::Faulted(e.to_string()),
                    None => return SessionEnd::Faulted("closed by peer".to_string()),
                },
            }
        }
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }
}

fn set_state(state: &watch::Sender<ChannelState>, next: ChannelState) {
    state.send_if_modified(|current| {
        if *current == next {
            return false;
        }
        tracing::debug!(old_state = %current, new_state = %next, "channel state transition");
        *current = next;
        true
    });
}

/// Resolves once stop has been requested or the supervisor was dropped.
async fn wait_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::channel::loopback::LoopbackRelay;
    use crate::config::BackoffConfig;

    async fn wait_for_state(rx: &mut watch::Receiver<ChannelState>, want: ChannelState) {
        tokio::time::timeout(Duration::from_secs(60), rx.wait_for(|s| *s == want))
            .await
            .expect("state timeout")
            .expect("supervisor dropped");
    }

    #[tokio::test(start_paused = true)]
    async fn opens_and_delivers_in_order() {
        let relay = LoopbackRelay::new();
        let (sup, mut inbound) =
            ReconnectSupervisor::spawn(Arc::new(relay.connector()), Backoff::default());
        let mut state = sup.subscribe();
        wait_for_state(&mut state, ChannelState::Open).await;

        let handle = sup.handle();
        assert!(handle.try_send(ChannelMessage::Binary(vec![1])));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(handle.try_send(ChannelMessage::Binary(vec![2])));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            relay.received(),
            vec![ChannelMessage::Binary(vec![1]), ChannelMessage::Binary(vec![2])]
        );

        relay.broadcast(ChannelMessage::Text("hello".into()));
        assert_eq!(inbound.recv().await, Some(ChannelMessage::Text("hello".into())));
        sup.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn lagging_consumer_keeps_queued_and_drops_newest() {
        let relay = LoopbackRelay::new();
        let (sup, mut inbound) =
            ReconnectSupervisor::spawn(Arc::new(relay.connector()), Backoff::default());
        let mut state = sup.subscribe();
        wait_for_state(&mut state, ChannelState::Open).await;

        for i in 0..INBOUND_QUEUE + 8 {
            relay.broadcast(ChannelMessage::Text(i.to_string()));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sup.state(), ChannelState::Open);

        let mut got = Vec::new();
        while let Ok(msg) = inbound.try_recv() {
            got.push(msg);
        }
        let want: Vec<ChannelMessage> = (0..INBOUND_QUEUE)
            .map(|i| ChannelMessage::Text(i.to_string()))
            .collect();
        assert_eq!(got, want);
        sup.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_gaps_non_decreasing_until_cap() {
        let relay = LoopbackRelay::new();
        relay.set_online(false);
        let backoff = Backoff::new(BackoffConfig {
            base: Duration::from_millis(100),
            factor: 2,
            cap: Duration::from_millis(800),
        });
        let (sup, _inbound) = ReconnectSupervisor::spawn(Arc::new(relay.connector()), backoff);

        tokio::time::sleep(Duration::from_secs(6)).await;
        let attempts = relay.connect_attempts();
        assert!(attempts.len() >= 6, "only {} attempts", attempts.len());

        let gaps: Vec<Duration> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(gaps.windows(2).all(|g| g[0] <= g[1]), "gaps {gaps:?}");
        assert!(gaps.iter().all(|g| *g <= Duration::from_millis(800)));
        sup.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_peer_close() {
        let relay = LoopbackRelay::new();
        let (sup, _inbound) =
            ReconnectSupervisor::spawn(Arc::new(relay.connector()), Backoff::default());
        let mut state = sup.subscribe();
        wait_for_state(&mut state, ChannelState::Open).await;

        relay.drop_connections();
        wait_for_state(&mut state, ChannelState::Faulted).await;
        wait_for_state(&mut state, ChannelState::Open).await;
        assert_eq!(relay.connect_attempts().len(), 2);

        assert!(sup.handle().try_send(ChannelMessage::Text("after".into())));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(relay.received_from(0).is_empty());
        assert_eq!(relay.received_from(1), vec![ChannelMessage::Text("after".into())]);
        sup.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_backoff_prevents_reconnect() {
        let relay = LoopbackRelay::new();
        relay.set_online(false);
        let (sup, _inbound) =
            ReconnectSupervisor::spawn(Arc::new(relay.connector()), Backoff::default());
        let mut state = sup.subscribe();
        wait_for_state(&mut state, ChannelState::Faulted).await;
        assert!(!sup.is_stopped());

        sup.stop();
        sup.stop();
        assert!(sup.is_stopped());
        relay.set_online(true);
        sup.join().await;

        let attempts = relay.connect_attempts().len();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(relay.connect_attempts().len(), attempts);
        assert_eq!(sup.state(), ChannelState::Idle);
        assert!(!sup.handle().try_send(ChannelMessage::Text("late".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_while_open_closes_link() {
        let relay = LoopbackRelay::new();
        let (sup, _inbound) =
            ReconnectSupervisor::spawn(Arc::new(relay.connector()), Backoff::default());
        let mut state = sup.subscribe();
        wait_for_state(&mut state, ChannelState::Open).await;

        sup.stop();
        assert_eq!(sup.state(), ChannelState::Closing);
        sup.join().await;
        assert_eq!(sup.state(), ChannelState::Idle);
        assert_eq!(relay.connections(), 0);
        assert_eq!(relay.connect_attempts().len(), 1);
    }
}
