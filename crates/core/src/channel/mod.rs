//! Duplex channel plumbing shared by publishers and subscribers.
//!
//! A duplex channel is a persistent, ordered, message-based connection to
//! the relay. This module splits it into three layers:
//!
//! - **Link** ([`Connector`], [`LinkSink`], [`LinkStream`]): one physical
//!   connection. [`ws::WsConnector`] speaks WebSocket; [`loopback`] is an
//!   in-memory stand-in used by tests and demos.
//!
//! - **Supervision** ([`ReconnectSupervisor`]): owns the link, reconnects
//!   with [`Backoff`] after faults and publishes every [`ChannelState`]
//!   transition on a `watch` channel.
//!
//! - **Handle** ([`ChannelHandle`]): what publisher and subscriber loops hold.
//!   It answers "is it open" and drops sends that arrive while it is not.
//!
//! ## State machine
//!
//! ```text
//! Idle ──start──> Connecting ──ok──> Open ──fault──> Faulted ──backoff──> Connecting
//!                     │                │
//!                     └──fail──> Faulted
//! any ──stop()──> Closing ──> Idle   (terminal, no reconnect)
//! ```
//!
//! Messages sent before a fault and after the following reconnect belong to
//! separate delivery epochs: anything still queued when a link drops is
//! discarded.

pub mod backoff;
pub mod loopback;
pub mod supervisor;
pub mod ws;

use std::fmt;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::error::Result;

pub use backoff::Backoff;
pub use supervisor::ReconnectSupervisor;

/// One message on a duplex channel. Message boundaries are preserved by the
/// transport; there is no extra framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Text(String),
    Binary(Vec<u8>),
}

/// Supervised channel state.
///
/// `Idle` and `Faulted` are both "closed"; they differ in whether a
/// reconnect is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Not started, or stopped by the owner.
    Idle,
    /// A connection attempt is in flight.
    Connecting,
    /// Messages may be sent.
    Open,
    /// The owner requested stop; the link is being closed.
    Closing,
    /// The link dropped unexpectedly; a reconnect is scheduled.
    Faulted,
}

impl ChannelState {
    pub fn is_open(self) -> bool {
        self == Self::Open
    }

    /// User-facing connectivity label.
    pub fn connectivity(self) -> &'static str {
        if self.is_open() {
            "Connected"
        } else {
            "Disconnected"
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Outbound half of one physical connection.
#[async_trait]
pub trait LinkSink: Send {
    async fn send(&mut self, msg: ChannelMessage) -> Result<()>;

    /// Close the connection gracefully. Errors are ignored; the link is gone
    /// either way.
    async fn close(&mut self);
}

/// Inbound half of one physical connection.
#[async_trait]
pub trait LinkStream: Send {
    /// Next message. `None` means the peer closed the connection.
    ///
    /// Must be cancel-safe: the supervisor polls it inside `select!`.
    async fn recv(&mut self) -> Option<Result<ChannelMessage>>;
}

/// Opens physical connections to one target.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<(Box<dyn LinkSink>, Box<dyn LinkStream>)>;

    /// Human-readable target, used in logs.
    fn target(&self) -> &str;
}

/// Sending side of a supervised channel.
///
/// Cheap to clone. Sends are non-blocking and lossy: a message is dropped
/// unless the channel is [`Open`](ChannelState::Open) and the single-slot
/// outbound queue is free.
#[derive(Clone)]
pub struct ChannelHandle {
    state: watch::Receiver<ChannelState>,
    outbound: mpsc::Sender<ChannelMessage>,
}

impl ChannelHandle {
    pub(crate) fn new(
        state: watch::Receiver<ChannelState>,
        outbound: mpsc::Sender<ChannelMessage>,
    ) -> Self {
        Self { state, outbound }
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    /// Hand `msg` to the channel. Returns `false` if it was dropped.
    pub fn try_send(&self, msg: ChannelMessage) -> bool {
        if !self.is_open() {
            return false;
        }
        match self.outbound.try_send(msg) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::trace!("outbound slot busy, message dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ChannelState> {
        self.state.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connectivity_labels() {
        assert_eq!(ChannelState::Open.connectivity(), "Connected");
        for state in [
            ChannelState::Idle,
            ChannelState::Connecting,
            ChannelState::Closing,
            ChannelState::Faulted,
        ] {
            assert_eq!(state.connectivity(), "Disconnected");
        }
    }

    #[test]
    fn handle_drops_when_not_open() {
        let (_state_tx, state_rx) = watch::channel(ChannelState::Connecting);
        let (tx, mut rx) = mpsc::channel(1);
        let handle = ChannelHandle::new(state_rx, tx);

        assert!(!handle.try_send(ChannelMessage::Text("ping".into())));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn handle_drops_when_slot_busy() {
        let (_state_tx, state_rx) = watch::channel(ChannelState::Open);
        let (tx, mut rx) = mpsc::channel(1);
        let handle = ChannelHandle::new(state_rx, tx);

        assert!(handle.try_send(ChannelMessage::Binary(vec![1])));
        assert!(!handle.try_send(ChannelMessage::Binary(vec![2])));
        assert_eq!(rx.try_recv().unwrap(), ChannelMessage::Binary(vec![1]));
    }
}
