use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::types::{ConnectionId, PublishMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Queued,
    /// Queue at capacity, message dropped.
    Full,
    /// Delivery loop already gone.
    Closed,
    /// Id not registered (never was, or already released).
    Unknown,
}

/// Delivery queues of the live connections on this node, keyed by id.
pub struct ConnectionRegistry {
    conns: DashMap<ConnectionId, mpsc::Sender<PublishMessage>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            conns: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocates a fresh id. Ids are never reused within a process.
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn register(&self, id: ConnectionId, queue: mpsc::Sender<PublishMessage>) {
        self.conns.insert(id, queue);
    }

    pub fn release(&self, id: ConnectionId) -> bool {
        self.conns.remove(&id).is_some()
    }

    /// Never waits: a full queue drops the newest message.
    pub fn try_enqueue(&self, id: ConnectionId, msg: PublishMessage) -> Enqueue {
        let Some(queue) = self.conns.get(&id) else {
            return Enqueue::Unknown;
        };
        match queue.try_send(msg) {
            Ok(()) => Enqueue::Queued,
            Err(TrySendError::Full(_)) => Enqueue::Full,
            Err(TrySendError::Closed(_)) => Enqueue::Closed,
        }
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::types::PeerId;

    #[test]
    fn test_ids_are_monotonic() {
        let registry = ConnectionRegistry::new();
        let a = registry.next_id();
        let b = registry.next_id();
        assert!(b > a);
        assert_eq!(a, ConnectionId(1));
    }

    #[test]
    fn test_full_queue_drops_newest() {
        let registry = ConnectionRegistry::new();
        let id = registry.next_id();
        let (tx, mut rx) = mpsc::channel(1);
        registry.register(id, tx);

        let first = PublishMessage::new("t", "1", PeerId(1));
        let second = PublishMessage::new("t", "2", PeerId(1));
        assert_eq!(registry.try_enqueue(id, first.clone()), Enqueue::Queued);
        assert_eq!(registry.try_enqueue(id, second), Enqueue::Full);
        assert_eq!(rx.try_recv().unwrap(), first);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_release_and_closed() {
        let registry = ConnectionRegistry::new();
        let id = registry.next_id();
        let (tx, rx) = mpsc::channel(4);
        registry.register(id, tx);
        drop(rx);
        let msg = PublishMessage::new("t", "x", PeerId(1));
        assert_eq!(registry.try_enqueue(id, msg.clone()), Enqueue::Closed);
        assert!(registry.release(id));
        assert!(!registry.release(id));
        assert_eq!(registry.try_enqueue(id, msg), Enqueue::Unknown);
        assert!(registry.is_empty());
    }
}
