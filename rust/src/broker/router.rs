use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{debug, warn};

use super::directory::ClusterDirectory;
use super::gossip::GossipMessage;
use super::local::LocalSubscriptionTable;
use super::metrics::BrokerMetrics;
use super::registry::{ConnectionRegistry, Enqueue};
use super::transport::PeerTransport;
use super::types::{PeerId, PublishMessage};

/// Outcome of routing one message. Never reported to the publisher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteReport {
    pub delivered: usize,
    pub dropped: usize,
    pub forwarded: usize,
}

/// Fans a publish out to local subscribers and to each remote peer that owns
/// at least one subscriber.
pub struct Router {
    local_peer: PeerId,
    local: Arc<LocalSubscriptionTable>,
    directory: Arc<ClusterDirectory>,
    registry: Arc<ConnectionRegistry>,
    transport: Arc<dyn PeerTransport>,
    metrics: Arc<BrokerMetrics>,
}

impl Router {
    pub fn new(
        local: Arc<LocalSubscriptionTable>,
        directory: Arc<ClusterDirectory>,
        registry: Arc<ConnectionRegistry>,
        transport: Arc<dyn PeerTransport>,
        metrics: Arc<BrokerMetrics>,
    ) -> Self {
        Self {
            local_peer: transport.local_peer(),
            local,
            directory,
            registry,
            transport,
            metrics,
        }
    }

    pub fn route(&self, msg: &PublishMessage) -> RouteReport {
        self.metrics.messages_routed.fetch_add(1, Ordering::Relaxed);
        let mut report = self.deliver_local(msg);
        // Messages forwarded to us are never forwarded again.
        if msg.origin == self.local_peer {
            report.forwarded = self.forward(msg);
        }
        report
    }

    /// Enqueues on every local subscriber's outbound queue without waiting.
    pub fn deliver_local(&self, msg: &PublishMessage) -> RouteReport {
        let mut report = RouteReport::default();
        for handle in self.local.lookup(msg.key) {
            match self.registry.try_enqueue(handle.id, msg.clone()) {
                Enqueue::Queued => report.delivered += 1,
                Enqueue::Full => {
                    report.dropped += 1;
                    warn!(
                        conn_id = %handle.id,
                        topic_key = %msg.key,
                        "outbound queue full, dropping message"
                    );
                }
                Enqueue::Closed | Enqueue::Unknown => {
                    // Connection is tearing down.
                    report.dropped += 1;
                    debug!(conn_id = %handle.id, "subscriber gone, dropping message");
                }
            }
        }
        self.metrics.add_delivered(report.delivered as u64);
        self.metrics.add_dropped(report.dropped as u64);
        report
    }

    /// One unicast per distinct peer, however many of its handles match.
    fn forward(&self, msg: &PublishMessage) -> usize {
        let remotes = self.directory.lookup_remote(msg.key);
        if remotes.is_empty() {
            return 0;
        }
        let payload = GossipMessage::Route {
            origin: msg.origin,
            topic: msg.topic.clone(),
            payload: msg.payload.clone(),
        }
        .encode();

        let mut forwarded = 0;
        for peer in remotes.keys() {
            match self.transport.unicast(*peer, payload.clone()) {
                Ok(()) => forwarded += 1,
                Err(e) => {
                    self.metrics.forward_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(%peer, topic_key = %msg.key, "forward failed: {e}");
                }
            }
        }
        self.metrics
            .messages_forwarded
            .fetch_add(forwarded as u64, Ordering::Relaxed);
        forwarded
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::sync::mpsc;

    use super::*;
    use crate::broker::directory::{DirectoryState, PartitionState, TopicEntry, Version};
    use crate::broker::topic::TopicKey;
    use crate::broker::transport::testing::RecordingTransport;
    use crate::broker::types::{ConnectionHandle, ConnectionId};

    const P1: PeerId = PeerId(1);
    const P2: PeerId = PeerId(2);
    const P3: PeerId = PeerId(3);

    struct Fixture {
        local: Arc<LocalSubscriptionTable>,
        directory: Arc<ClusterDirectory>,
        registry: Arc<ConnectionRegistry>,
        transport: Arc<RecordingTransport>,
        router: Router,
    }

    fn fixture() -> Fixture {
        let local = Arc::new(LocalSubscriptionTable::new());
        let directory = Arc::new(ClusterDirectory::new(P1, 1));
        let registry = Arc::new(ConnectionRegistry::new());
        let transport = Arc::new(RecordingTransport::new(P1));
        let router = Router::new(
            local.clone(),
            directory.clone(),
            registry.clone(),
            transport.clone(),
            Arc::new(BrokerMetrics::new()),
        );
        Fixture {
            local,
            directory,
            registry,
            transport,
            router,
        }
    }

    fn connect(f: &Fixture, capacity: usize) -> (ConnectionHandle, mpsc::Receiver<PublishMessage>) {
        let id = f.registry.next_id();
        let handle = ConnectionHandle::new(id, P1, "u");
        let (tx, rx) = mpsc::channel(capacity);
        f.registry.register(id, tx);
        (handle, rx)
    }

    fn remote_partition(peer: PeerId, topic: &[u8], ids: &[u64]) -> PartitionState {
        PartitionState {
            peer,
            version: Version::new(1, 1),
            topics: vec![TopicEntry {
                key: TopicKey::of(topic),
                subscribers: ids
                    .iter()
                    .map(|id| ConnectionHandle::new(ConnectionId(*id), peer, "r"))
                    .collect(),
            }],
        }
    }

    #[test]
    fn test_delivers_to_local_subscribers_only() {
        let f = fixture();
        let (c1, mut rx1) = connect(&f, 8);
        let (_c2, mut rx2) = connect(&f, 8);
        f.local.subscribe(TopicKey::of(b"sensors/temp"), &c1);

        let msg = PublishMessage::new("sensors/temp", "21", P1);
        let report = f.router.route(&msg);
        assert_eq!(report.delivered, 1);
        assert_eq!(rx1.try_recv().unwrap(), msg);
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn test_one_unicast_per_remote_peer() {
        let f = fixture();
        f.directory.merge(DirectoryState {
            partitions: vec![
                remote_partition(P2, b"alerts", &[10, 11]),
                remote_partition(P3, b"alerts", &[20]),
            ],
        });

        let report = f.router.route(&PublishMessage::new("alerts", "fire", P1));
        assert_eq!(report.forwarded, 2);

        let mut sent = f.transport.take_unicasts();
        sent.sort_by_key(|(peer, _)| *peer);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, P2);
        assert_eq!(sent[1].0, P3);
        assert_eq!(
            GossipMessage::decode(sent[0].1.clone()).unwrap(),
            GossipMessage::Route {
                origin: P1,
                topic: Bytes::from_static(b"alerts"),
                payload: Bytes::from_static(b"fire"),
            }
        );
    }

    #[test]
    fn test_no_forward_without_remote_subscribers() {
        let f = fixture();
        f.directory.merge(DirectoryState {
            partitions: vec![remote_partition(P2, b"other", &[1])],
        });
        let report = f.router.route(&PublishMessage::new("alerts", "x", P1));
        assert_eq!(report.forwarded, 0);
        assert!(f.transport.take_unicasts().is_empty());
    }

    #[test]
    fn test_forwarded_message_is_not_forwarded_again() {
        let f = fixture();
        let (c1, mut rx1) = connect(&f, 8);
        f.local.subscribe(TopicKey::of(b"alerts"), &c1);
        f.directory.merge(DirectoryState {
            partitions: vec![remote_partition(P3, b"alerts", &[5])],
        });

        let report = f.router.route(&PublishMessage::new("alerts", "x", P2));
        assert_eq!(report.delivered, 1);
        assert_eq!(report.forwarded, 0);
        assert!(rx1.try_recv().is_ok());
        assert!(f.transport.take_unicasts().is_empty());
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let f = fixture();
        let (c1, mut rx1) = connect(&f, 1);
        f.local.subscribe(TopicKey::of(b"t"), &c1);

        let first = PublishMessage::new("t", "1", P1);
        assert_eq!(f.router.route(&first).delivered, 1);
        let report = f.router.route(&PublishMessage::new("t", "2", P1));
        assert_eq!(report.dropped, 1);
        assert_eq!(rx1.try_recv().unwrap(), first);
        assert!(rx1.try_recv().is_err());
    }

    #[test]
    fn test_released_subscriber_counts_as_drop() {
        let f = fixture();
        let (c1, _rx1) = connect(&f, 4);
        f.local.subscribe(TopicKey::of(b"t"), &c1);
        f.registry.release(c1.id);
        let report = f.router.route(&PublishMessage::new("t", "x", P1));
        assert_eq!(report.delivered, 0);
        assert_eq!(report.dropped, 1);
    }
}
