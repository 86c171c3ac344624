use std::fmt;

use bytes::Bytes;

use super::topic::TopicKey;

/// Stable identifier of a cluster node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Per-node connection id. Allocated from a monotonic counter, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A subscriber as seen by the whole cluster. Handles owned by other peers
/// are opaque here: only the owning peer can deliver to them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub peer: PeerId,
    pub username: Bytes,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, peer: PeerId, username: impl Into<Bytes>) -> Self {
        Self {
            id,
            peer,
            username: username.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishMessage {
    pub topic: Bytes,
    pub key: TopicKey,
    pub payload: Bytes,
    pub origin: PeerId,
}

impl PublishMessage {
    /// Hashes the topic on ingress.
    pub fn new(topic: impl Into<Bytes>, payload: impl Into<Bytes>, origin: PeerId) -> Self {
        let topic = topic.into();
        Self {
            key: TopicKey::of(&topic),
            topic,
            payload: payload.into(),
            origin,
        }
    }
}
