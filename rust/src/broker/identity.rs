use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::BrokerError;

use super::types::PeerId;

/// Who this node is, for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub peer: PeerId,
    /// Human-readable name used in logs.
    pub name: String,
    /// Process start in epoch milliseconds. Orders partitions across restarts.
    pub incarnation: u64,
}

impl NodeIdentity {
    /// Derives the peer id from the host name and cluster port, unless an
    /// explicit id is configured. An unresolvable host name is fatal.
    pub fn resolve(node_id: Option<u64>, cluster_port: u16) -> Result<Self, BrokerError> {
        let hostname = whoami::fallible::hostname()
            .map_err(|e| BrokerError::Identity(format!("hostname lookup failed: {e}")))?;
        if hostname.is_empty() {
            return Err(BrokerError::Identity("empty hostname".into()));
        }
        let name = format!("{hostname}:{cluster_port}");
        let peer = match node_id {
            Some(id) => PeerId(id),
            None => derive_peer_id(&name),
        };
        Ok(Self {
            peer,
            name,
            incarnation: epoch_ms(),
        })
    }
}

pub(crate) fn derive_peer_id(name: &str) -> PeerId {
    let digest = blake3::hash(name.as_bytes());
    let mut id = [0u8; 8];
    id.copy_from_slice(&digest.as_bytes()[..8]);
    PeerId(u64::from_le_bytes(id))
}

pub(crate) fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
