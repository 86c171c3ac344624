use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free broker counters. Hot paths use `Relaxed` increments only.
#[derive(Default)]
pub struct BrokerMetrics {
    pub connections_accepted: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub connections_active: AtomicU64,
    pub messages_routed: AtomicU64,
    pub messages_delivered: AtomicU64,
    pub messages_dropped: AtomicU64,
    pub messages_forwarded: AtomicU64,
    pub forward_failures: AtomicU64,
    pub gossip_decode_errors: AtomicU64,
    pub snapshot_requests: AtomicU64,
    pub mesh_bytes_sent: AtomicU64,
    pub mesh_bytes_received: AtomicU64,
    pub mesh_reconnects: AtomicU64,
    pub mesh_unknown_frames: AtomicU64,
    pub connected_peers: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_accepted: u64,
    pub connections_rejected: u64,
    pub connections_active: u64,
    pub messages_routed: u64,
    pub messages_delivered: u64,
    pub messages_dropped: u64,
    pub messages_forwarded: u64,
    pub forward_failures: u64,
    pub gossip_decode_errors: u64,
    pub connected_peers: u64,
}

impl BrokerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_delivered(&self, count: u64) {
        if count > 0 {
            self.messages_delivered.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub(crate) fn add_dropped(&self, count: u64) {
        if count > 0 {
            self.messages_dropped.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            messages_routed: self.messages_routed.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            messages_forwarded: self.messages_forwarded.load(Ordering::Relaxed),
            forward_failures: self.forward_failures.load(Ordering::Relaxed),
            gossip_decode_errors: self.gossip_decode_errors.load(Ordering::Relaxed),
            connected_peers: self.connected_peers.load(Ordering::Relaxed),
        }
    }
}
