use std::sync::Arc;
use std::sync::atomic::Ordering;

use ahash::AHashSet;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::directory::{ClusterDirectory, Delta, DeltaOutcome};
use super::gossip::GossipMessage;
use super::metrics::BrokerMetrics;
use super::router::Router;
use super::topic::TopicKey;
use super::transport::{PeerTransport, TransportEvent};
use super::types::{ConnectionHandle, PeerId, PublishMessage};

/// Keeps the replicated directory in step with the rest of the cluster.
///
/// Partitions are only cached for peers the transport reports as joined.
/// A partition relayed for any other peer is refused, since no departure
/// would ever evict it.
pub struct ClusterNode {
    directory: Arc<ClusterDirectory>,
    transport: Arc<dyn PeerTransport>,
    metrics: Arc<BrokerMetrics>,
    joined: Mutex<AHashSet<PeerId>>,
}

impl ClusterNode {
    pub fn new(
        directory: Arc<ClusterDirectory>,
        transport: Arc<dyn PeerTransport>,
        metrics: Arc<BrokerMetrics>,
    ) -> Self {
        Self {
            directory,
            transport,
            metrics,
            joined: Mutex::new(AHashSet::new()),
        }
    }

    pub fn directory(&self) -> &Arc<ClusterDirectory> {
        &self.directory
    }

    pub fn subscribe(&self, key: TopicKey, handle: &ConnectionHandle) {
        if let Some(delta) = self.directory.local_subscribe(key, handle) {
            self.announce(delta);
        }
    }

    pub fn unsubscribe(&self, key: TopicKey, handle: &ConnectionHandle) {
        if let Some(delta) = self.directory.local_unsubscribe(key, handle) {
            self.announce(delta);
        }
    }

    pub fn remove_connection(&self, handle: &ConnectionHandle, keys: &[TopicKey]) {
        if let Some(delta) = self.directory.local_remove_connection(handle, keys) {
            self.announce(delta);
        }
    }

    fn announce(&self, delta: Delta) {
        debug!(version = ?delta.version, topics = delta.topics.len(), "announcing delta");
        self.transport.broadcast(GossipMessage::Delta(delta).encode());
    }

    fn send_snapshot(&self, peer: PeerId) {
        let snapshot = GossipMessage::Snapshot(self.directory.snapshot()).encode();
        if let Err(e) = self.transport.unicast(peer, snapshot) {
            warn!(%peer, "cannot send snapshot: {e}");
        }
    }

    pub fn handle_event(&self, event: TransportEvent, router: &Router) {
        match event {
            TransportEvent::PeerJoined(peer) => {
                self.joined.lock().insert(peer);
                let version = self.directory.restamp_local();
                info!(%peer, ?version, "peer joined, sending snapshot");
                self.send_snapshot(peer);
                // Peers holding a departure mark for us need the new version.
                self.transport
                    .broadcast(GossipMessage::Snapshot(self.directory.local_snapshot()).encode());
            }
            TransportEvent::PeerDeparted(peer) => {
                self.joined.lock().remove(&peer);
                let removed = self.directory.remove_peer_partition(peer);
                info!(%peer, removed, "peer departed, partition dropped");
            }
            TransportEvent::Broadcast { from, payload }
            | TransportEvent::Unicast { from, payload } => {
                self.handle_gossip(from, payload, router);
            }
        }
    }

    fn handle_gossip(&self, from: PeerId, payload: Bytes, router: &Router) {
        let msg = match GossipMessage::decode(payload) {
            Ok(msg) => msg,
            Err(e) => {
                self.metrics
                    .gossip_decode_errors
                    .fetch_add(1, Ordering::Relaxed);
                warn!(%from, "dropping malformed gossip: {e}");
                return;
            }
        };

        match msg {
            GossipMessage::Snapshot(mut state) => {
                let offered = state.partitions.len();
                {
                    let joined = self.joined.lock();
                    state.partitions.retain(|p| joined.contains(&p.peer));
                }
                let refused = offered - state.partitions.len();
                let applied = self.directory.merge(state);
                debug!(%from, applied = applied.partitions.len(), refused, "merged snapshot");
            }
            GossipMessage::Delta(delta) if !self.joined.lock().contains(&delta.peer) => {
                debug!(%from, peer = %delta.peer, "ignored delta for a peer that is not joined");
            }
            GossipMessage::Delta(delta) => match self.directory.apply_delta(&delta) {
                DeltaOutcome::Applied => {
                    debug!(%from, version = ?delta.version, "applied delta");
                }
                DeltaOutcome::Stale => {
                    debug!(%from, version = ?delta.version, "ignored stale delta");
                }
                DeltaOutcome::Gap => {
                    debug!(%from, base = ?delta.base, "delta gap, requesting snapshot");
                    self.metrics.snapshot_requests.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = self
                        .transport
                        .unicast(from, GossipMessage::SnapshotRequest.encode())
                    {
                        warn!(%from, "cannot request snapshot: {e}");
                    }
                }
            },
            GossipMessage::SnapshotRequest => self.send_snapshot(from),
            GossipMessage::Route {
                origin,
                topic,
                payload,
            } => {
                router.deliver_local(&PublishMessage::new(topic, payload, origin));
            }
        }
    }

    /// Drains transport events until shutdown or until the transport closes.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        router: Arc<Router>,
        shutdown: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                ev = events.recv() => ev,
                () = shutdown.cancelled() => break,
            };
            let Some(event) = event else { break };
            self.handle_event(event, &router);
        }
        debug!("cluster event loop stopped");
    }
}
