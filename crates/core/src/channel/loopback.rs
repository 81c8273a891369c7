//! In-memory relay double.
//!
//! [`LoopbackRelay`] stands in for the remote relay: clients connect through
//! [`LoopbackConnector`], everything they send is recorded, and
//! [`broadcast`](LoopbackRelay::broadcast) fans a message out to every live
//! connection while recording per-connection delivery order. The relay can be
//! taken offline or have its connections cut to exercise reconnection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{ChannelMessage, Connector, LinkSink, LinkStream};
use crate::error::{RelayError, Result};

const PEER_QUEUE: usize = 64;

struct Peer {
    to_client: Option<mpsc::Sender<ChannelMessage>>,
    closed: Arc<AtomicBool>,
    delivered: Vec<ChannelMessage>,
}

struct RelayInner {
    online: bool,
    attempts: Vec<Instant>,
    peers: Vec<Peer>,
    received: Vec<(usize, ChannelMessage)>,
}

#[derive(Clone)]
pub struct LoopbackRelay {
    inner: Arc<Mutex<RelayInner>>,
}

impl LoopbackRelay {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RelayInner {
                online: true,
                attempts: Vec::new(),
                peers: Vec::new(),
                received: Vec::new(),
            })),
        }
    }

    pub fn connector(&self) -> LoopbackConnector {
        LoopbackConnector {
            relay: self.clone(),
            target: "loopback://relay".to_string(),
        }
    }

    /// While offline, every connect attempt fails.
    pub fn set_online(&self, online: bool) {
        self.inner.lock().online = online;
    }

    /// Instants of every connect attempt, successful or not.
    pub fn connect_attempts(&self) -> Vec<Instant> {
        self.inner.lock().attempts.clone()
    }

    /// Number of connections that are still open.
    pub fn connections(&self) -> usize {
        self.inner
            .lock()
            .peers
            .iter()
            .filter(|p| !p.closed.load(Ordering::SeqCst))
            .count()
    }

    /// Every message clients sent, in arrival order.
    pub fn received(&self) -> Vec<ChannelMessage> {
        self.inner.lock().received.iter().map(|(_, m)| m.clone()).collect()
    }

    /// Messages sent over connection number `peer` (0-based, in connect order).
    pub fn received_from(&self, peer: usize) -> Vec<ChannelMessage> {
        self.inner
            .lock()
            .received
            .iter()
            .filter(|(p, _)| *p == peer)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Deliver `msg` to every open connection. Returns how many got it.
    pub fn broadcast(&self, msg: ChannelMessage) -> usize {
        let mut inner = self.inner.lock();
        let mut sent = 0;
        for peer in inner.peers.iter_mut() {
            if peer.closed.load(Ordering::SeqCst) {
                continue;
            }
            let Some(tx) = peer.to_client.as_ref() else {
                continue;
            };
            if tx.try_send(msg.clone()).is_ok() {
                peer.delivered.push(msg.clone());
                sent += 1;
            }
        }
        sent
    }

    /// What connection number `peer` has been handed so far.
    pub fn delivered(&self, peer: usize) -> Vec<ChannelMessage> {
        self.inner
            .lock()
            .peers
            .get(peer)
            .map(|p| p.delivered.clone())
            .unwrap_or_default()
    }

    /// Cut every open connection as if the network dropped.
    pub fn drop_connections(&self) {
        let mut inner = self.inner.lock();
        for peer in inner.peers.iter_mut() {
            peer.closed.store(true, Ordering::SeqCst);
            peer.to_client = None;
        }
    }

    fn accept(&self) -> Result<(Box<dyn LinkSink>, Box<dyn LinkStream>)> {
        let mut inner = self.inner.lock();
        inner.attempts.push(Instant::now());
        if !inner.online {
            return Err(RelayError::ChannelFault("relay offline".to_string()));
        }

        let (tx, rx) = mpsc::channel(PEER_QUEUE);
        let closed = Arc::new(AtomicBool::new(false));
        let index = inner.peers.len();
        inner.peers.push(Peer {
            to_client: Some(tx),
            closed: closed.clone(),
            delivered: Vec::new(),
        });

        let sink = LoopbackSink {
            relay: self.inner.clone(),
            index,
            closed,
        };
        let stream = LoopbackStream { rx };
        Ok((Box::new(sink), Box::new(stream)))
    }
}

impl Default for LoopbackRelay {
    fn default() -> Self {
        Self::new()
    }
}

/// [`Connector`] into a [`LoopbackRelay`].
pub struct LoopbackConnector {
    relay: LoopbackRelay,
    target: String,
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self) -> Result<(Box<dyn LinkSink>, Box<dyn LinkStream>)> {
        self.relay.accept()
    }

    fn target(&self) -> &str {
        &self.target
    }
}

struct LoopbackSink {
    relay: Arc<Mutex<RelayInner>>,
    index: usize,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl LinkSink for LoopbackSink {
    async fn send(&mut self, msg: ChannelMessage) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RelayError::ChannelFault("connection closed".to_string()));
        }
        self.relay.lock().received.push((self.index, msg));
        Ok(())
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(peer) = self.relay.lock().peers.get_mut(self.index) {
            peer.to_client = None;
        }
    }
}

struct LoopbackStream {
    rx: mpsc::Receiver<ChannelMessage>,
}

#[async_trait]
impl LinkStream for LoopbackStream {
    async fn recv(&mut self) -> Option<Result<ChannelMessage>> {
        self.rx.recv().await.map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn offline_relay_refuses() {
        let relay = LoopbackRelay::new();
        relay.set_online(false);
        assert!(relay.connector().connect().await.is_err());
        assert_eq!(relay.connect_attempts().len(), 1);
        assert_eq!(relay.connections(), 0);
    }

    #[tokio::test]
    async fn broadcast_records_per_peer_order() {
        let relay = LoopbackRelay::new();
        let (_s1, mut r1) = relay.connector().connect().await.unwrap();
        let (_s2, mut r2) = relay.connector().connect().await.unwrap();

        relay.broadcast(ChannelMessage::Text("a".into()));
        relay.broadcast(ChannelMessage::Text("b".into()));

        assert_eq!(relay.delivered(0), relay.delivered(1));
        assert_eq!(r1.recv().await.unwrap().unwrap(), ChannelMessage::Text("a".into()));
        assert_eq!(r2.recv().await.unwrap().unwrap(), ChannelMessage::Text("a".into()));
    }

    #[tokio::test]
    async fn dropped_connection_ends_stream_and_rejects_sends() {
        let relay = LoopbackRelay::new();
        let (mut sink, mut stream) = relay.connector().connect().await.unwrap();
        relay.drop_connections();

        assert!(stream.recv().await.is_none());
        assert!(sink.send(ChannelMessage::Binary(vec![0])).await.is_err());
        assert_eq!(relay.connections(), 0);
    }
}
