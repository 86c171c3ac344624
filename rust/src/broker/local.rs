use ahash::{AHashMap, AHashSet};
use parking_lot::RwLock;

use super::topic::TopicKey;
use super::types::{ConnectionHandle, ConnectionId};

// ---------------------------------------------------------------------------
// Local subscription table
// ---------------------------------------------------------------------------

/// Authoritative subscriptions of connections attached to this node.
///
/// Both indexes live under one lock so a bulk removal is observed atomically
/// by concurrent lookups.
pub struct LocalSubscriptionTable {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    by_topic: AHashMap<TopicKey, AHashSet<ConnectionHandle>>,
    by_conn: AHashMap<ConnectionId, AHashSet<TopicKey>>,
}

impl LocalSubscriptionTable {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Returns false if the subscription already existed.
    pub fn subscribe(&self, key: TopicKey, handle: &ConnectionHandle) -> bool {
        let mut inner = self.inner.write();
        let added = inner
            .by_topic
            .entry(key)
            .or_default()
            .insert(handle.clone());
        if added {
            inner.by_conn.entry(handle.id).or_default().insert(key);
        }
        added
    }

    /// Returns false if there was nothing to remove.
    pub fn unsubscribe(&self, key: TopicKey, handle: &ConnectionHandle) -> bool {
        let mut inner = self.inner.write();
        let Some(subscribers) = inner.by_topic.get_mut(&key) else {
            return false;
        };
        if !subscribers.remove(handle) {
            return false;
        }
        if subscribers.is_empty() {
            inner.by_topic.remove(&key);
        }
        if let Some(topics) = inner.by_conn.get_mut(&handle.id) {
            topics.remove(&key);
            if topics.is_empty() {
                inner.by_conn.remove(&handle.id);
            }
        }
        true
    }

    pub fn lookup(&self, key: TopicKey) -> Vec<ConnectionHandle> {
        let inner = self.inner.read();
        inner
            .by_topic
            .get(&key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drops every subscription held by `handle` and returns the keys it held.
    pub fn remove_connection(&self, handle: &ConnectionHandle) -> Vec<TopicKey> {
        let mut inner = self.inner.write();
        let Some(topics) = inner.by_conn.remove(&handle.id) else {
            return Vec::new();
        };
        for key in &topics {
            if let Some(subscribers) = inner.by_topic.get_mut(key) {
                subscribers.remove(handle);
                if subscribers.is_empty() {
                    inner.by_topic.remove(key);
                }
            }
        }
        topics.into_iter().collect()
    }

    pub fn topics_of(&self, id: ConnectionId) -> Vec<TopicKey> {
        self.inner
            .read()
            .by_conn
            .get(&id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn topic_count(&self) -> usize {
        self.inner.read().by_topic.len()
    }

    pub fn subscriber_count(&self, key: TopicKey) -> usize {
        self.inner
            .read()
            .by_topic
            .get(&key)
            .map_or(0, |set| set.len())
    }
}

impl Default for LocalSubscriptionTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::types::PeerId;

    fn handle(id: u64) -> ConnectionHandle {
        ConnectionHandle::new(ConnectionId(id), PeerId(1), "user")
    }

    #[test]
    fn test_subscribe_then_lookup() {
        let table = LocalSubscriptionTable::new();
        let key = TopicKey::of(b"sensors/temp");
        assert!(table.subscribe(key, &handle(1)));
        assert_eq!(table.lookup(key), vec![handle(1)]);
    }

    #[test]
    fn test_subscribe_is_idempotent() {
        let table = LocalSubscriptionTable::new();
        let key = TopicKey::of(b"a");
        assert!(table.subscribe(key, &handle(1)));
        assert!(!table.subscribe(key, &handle(1)));
        assert_eq!(table.subscriber_count(key), 1);
    }

    #[test]
    fn test_unsubscribe_twice_is_noop() {
        let table = LocalSubscriptionTable::new();
        let key = TopicKey::of(b"a");
        table.subscribe(key, &handle(1));
        assert!(table.unsubscribe(key, &handle(1)));
        assert!(table.lookup(key).is_empty());
        assert!(!table.unsubscribe(key, &handle(1)));
        assert_eq!(table.topic_count(), 0);
    }

    #[test]
    fn test_unsubscribe_leaves_other_subscribers() {
        let table = LocalSubscriptionTable::new();
        let key = TopicKey::of(b"a");
        table.subscribe(key, &handle(1));
        table.subscribe(key, &handle(2));
        table.unsubscribe(key, &handle(1));
        assert_eq!(table.lookup(key), vec![handle(2)]);
    }

    #[test]
    fn test_remove_connection_drops_all_topics() {
        let table = LocalSubscriptionTable::new();
        let a = TopicKey::of(b"a");
        let b = TopicKey::of(b"b");
        table.subscribe(a, &handle(1));
        table.subscribe(b, &handle(1));
        table.subscribe(b, &handle(2));

        let mut removed = table.remove_connection(&handle(1));
        removed.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(removed, expected);

        assert!(table.lookup(a).is_empty());
        assert_eq!(table.lookup(b), vec![handle(2)]);
        assert!(table.topics_of(ConnectionId(1)).is_empty());
        assert!(table.remove_connection(&handle(1)).is_empty());
    }
}
