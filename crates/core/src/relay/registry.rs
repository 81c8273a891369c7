use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::mpsc;

static WATCHER_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Message queued for a watcher. Shared so a broadcast serializes once.
pub type Outgoing = Arc<str>;

/// One connected viewer.
#[derive(Debug)]
pub struct Watcher {
    /// Unique watcher identifier (16-char hex string).
    pub id: String,
    /// Remote address the viewer connected from.
    pub peer: String,
    queue: mpsc::Sender<Outgoing>,
    dropped: AtomicU64,
}

impl Watcher {
    /// Messages this watcher missed because its queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Information about a connected viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Viewer {
    pub watcher_id: String,
    pub peer: String,
    pub dropped: u64,
}

/// Thread-safe registry of connected watchers.
///
/// Each watcher gets its own bounded queue drained by its connection task,
/// so one slow viewer cannot stall the others. Broadcast visits watchers in
/// registration order; a watcher whose connection task has gone away is
/// removed on the next broadcast.
#[derive(Clone)]
pub struct WatcherRegistry {
    watchers: Arc<RwLock<Vec<Arc<Watcher>>>>,
    queue_depth: usize,
}

impl WatcherRegistry {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            watchers: Arc::new(RwLock::new(Vec::new())),
            queue_depth: queue_depth.max(1),
        }
    }

    /// Register a watcher and return the receiving end of its queue.
    pub fn register(&self, peer: &str) -> (Arc<Watcher>, mpsc::Receiver<Outgoing>) {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let n = WATCHER_COUNTER.fetch_add(1, Ordering::SeqCst);
        let watcher = Arc::new(Watcher {
            id: format!("{n:016X}"),
            peer: peer.to_string(),
            queue: tx,
            dropped: AtomicU64::new(0),
        });

        let mut watchers = self.watchers.write();
        watchers.push(watcher.clone());
        tracing::info!(watcher_id = %watcher.id, peer, total_watchers = watchers.len(), "watcher registered");
        (watcher, rx)
    }

    /// Remove a watcher by ID. Returns whether it was registered.
    pub fn remove(&self, id: &str) -> bool {
        let mut watchers = self.watchers.write();
        let Some(pos) = watchers.iter().position(|w| w.id == id) else {
            return false;
        };
        watchers.remove(pos);
        tracing::info!(watcher_id = %id, total_watchers = watchers.len(), "watcher removed");
        true
    }

    /// Queue `message` for every watcher. Returns how many accepted it.
    ///
    /// Broadcasts are serialized, so all watchers see concurrent broadcasts
    /// in the same order.
    pub fn broadcast(&self, message: &str) -> usize {
        let message: Outgoing = Arc::from(message);
        let mut watchers = self.watchers.write();
        let before = watchers.len();
        let mut delivered = 0;

        watchers.retain(|watcher| match watcher.queue.try_send(message.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                watcher.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(watcher_id = %watcher.id, "watcher queue full, message dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });

        if watchers.len() < before {
            tracing::debug!(
                removed = before - watchers.len(),
                remaining = watchers.len(),
                "closed watchers cleaned up"
            );
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.watchers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.watchers.read().is_empty()
    }

    pub fn viewers(&self) -> Vec<Viewer> {
        self.watchers
            .read()
            .iter()
            .map(|w| Viewer {
                watcher_id: w.id.clone(),
                peer: w.peer.clone(),
                dropped: w.dropped(),
            })
            .collect()
    }
}

impl Default for WatcherRegistry {
    fn default() -> Self {
        Self::new(crate::config::RelayConfig::default().watcher_queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::Receiver<Outgoing>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg.to_string());
        }
        out
    }

    #[test]
    fn every_watcher_sees_same_order() {
        let registry = WatcherRegistry::new(8);
        let (_a, mut rx_a) = registry.register("10.0.0.1:5000");
        let (_b, mut rx_b) = registry.register("10.0.0.2:5000");

        for msg in ["one", "two", "three"] {
            assert_eq!(registry.broadcast(msg), 2);
        }

        let a = drain(&mut rx_a);
        assert_eq!(a, vec!["one", "two", "three"]);
        assert_eq!(a, drain(&mut rx_b));
    }

    #[test]
    fn full_queue_drops_for_that_watcher_only() {
        let registry = WatcherRegistry::new(1);
        let (slow, _rx_slow) = registry.register("slow");
        let (_fast, mut rx_fast) = registry.register("fast");

        registry.broadcast("a");
        drain(&mut rx_fast);
        assert_eq!(registry.broadcast("b"), 1);

        assert_eq!(slow.dropped(), 1);
        assert_eq!(drain(&mut rx_fast), vec!["b"]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn closed_watchers_are_removed_on_broadcast() {
        let registry = WatcherRegistry::new(4);
        let (_gone, rx) = registry.register("gone");
        let (_kept, _rx_kept) = registry.register("kept");
        drop(rx);

        assert_eq!(registry.broadcast("x"), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.viewers()[0].peer, "kept");
    }

    #[test]
    fn remove_by_id() {
        let registry = WatcherRegistry::new(4);
        let (w, _rx) = registry.register("peer");
        assert!(registry.remove(&w.id));
        assert!(!registry.remove(&w.id));
        assert!(registry.is_empty());
    }

    #[test]
    fn ids_are_unique() {
        let registry = WatcherRegistry::default();
        let (a, _ra) = registry.register("a");
        let (b, _rb) = registry.register("b");
        assert_ne!(a.id, b.id);
        assert_eq!(a.id.len(), 16);
    }
}
