use bytes::Bytes;

use super::error::TransportError;
use super::types::PeerId;

/// Narrow port onto the peer substrate (discovery, links, failure detection).
///
/// Sends never block: implementations queue the payload on the link.
/// Callbacks arrive as [`TransportEvent`]s on a channel handed out when the
/// transport starts; they race freely with local operations.
pub trait PeerTransport: Send + Sync + 'static {
    fn local_peer(&self) -> PeerId;

    /// Sends `payload` once to every connected peer.
    fn broadcast(&self, payload: Bytes);

    fn unicast(&self, peer: PeerId, payload: Bytes) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// First link to `peer` came up. The joiner wants our snapshot.
    PeerJoined(PeerId),
    Broadcast { from: PeerId, payload: Bytes },
    Unicast { from: PeerId, payload: Bytes },
    /// Last link to `peer` went down.
    PeerDeparted(PeerId),
}
