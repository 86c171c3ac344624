use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::directory::{Delta, DirectoryState, PartitionState, TopicEntry, Version};
use super::error::WireError;
use super::topic::TopicKey;
use super::types::{ConnectionHandle, ConnectionId, PeerId};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub(crate) const FORMAT_VERSION: u8 = 1;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tag {
    Snapshot = 0x01,
    Delta = 0x02,
    SnapshotRequest = 0x03,
    Route = 0x04,
}

impl Tag {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(Self::Snapshot),
            0x02 => Some(Self::Delta),
            0x03 => Some(Self::SnapshotRequest),
            0x04 => Some(Self::Route),
            _ => None,
        }
    }
}

/// Logical messages exchanged between brokers over the peer transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GossipMessage {
    /// Full partitions. Sent to a joining peer and in answer to a request.
    Snapshot(DirectoryState),
    /// A peer's change to its own partition.
    Delta(Delta),
    /// Ask the receiver for its full snapshot.
    SnapshotRequest,
    /// A publish forwarded to the peer that owns matching subscribers.
    Route {
        origin: PeerId,
        topic: Bytes,
        payload: Bytes,
    },
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

impl GossipMessage {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(FORMAT_VERSION);
        match self {
            GossipMessage::Snapshot(state) => {
                buf.put_u8(Tag::Snapshot as u8);
                buf.put_u32_le(state.partitions.len() as u32);
                for partition in &state.partitions {
                    put_partition(&mut buf, partition);
                }
            }
            GossipMessage::Delta(delta) => {
                buf.put_u8(Tag::Delta as u8);
                buf.put_u64_le(delta.peer.0);
                put_version(&mut buf, delta.base);
                put_version(&mut buf, delta.version);
                put_entries(&mut buf, &delta.topics);
            }
            GossipMessage::SnapshotRequest => {
                buf.put_u8(Tag::SnapshotRequest as u8);
            }
            GossipMessage::Route {
                origin,
                topic,
                payload,
            } => {
                buf.reserve(2 + 8 + 2 + topic.len() + 4 + payload.len());
                buf.put_u8(Tag::Route as u8);
                buf.put_u64_le(origin.0);
                buf.put_u16_le(topic.len() as u16);
                buf.put_slice(topic);
                buf.put_u32_le(payload.len() as u32);
                buf.put_slice(payload);
            }
        }
        buf.freeze()
    }

    pub fn decode(mut data: Bytes) -> Result<Self, WireError> {
        need(&data, 2)?;
        let version = data.get_u8();
        if version != FORMAT_VERSION {
            return Err(WireError::UnsupportedVersion(version));
        }
        let raw_tag = data.get_u8();
        let msg = match Tag::from_u8(raw_tag).ok_or(WireError::UnknownTag(raw_tag))? {
            Tag::Snapshot => {
                need(&data, 4)?;
                let count = data.get_u32_le() as usize;
                let mut partitions = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    partitions.push(get_partition(&mut data)?);
                }
                GossipMessage::Snapshot(DirectoryState { partitions })
            }
            Tag::Delta => {
                need(&data, 8 + 16 + 16)?;
                let peer = PeerId(data.get_u64_le());
                let base = get_version(&mut data);
                let version = get_version(&mut data);
                let topics = get_entries(&mut data, peer)?;
                GossipMessage::Delta(Delta {
                    peer,
                    base,
                    version,
                    topics,
                })
            }
            Tag::SnapshotRequest => GossipMessage::SnapshotRequest,
            Tag::Route => {
                need(&data, 8 + 2)?;
                let origin = PeerId(data.get_u64_le());
                let topic_len = data.get_u16_le() as usize;
                need(&data, topic_len + 4)?;
                let topic = data.split_to(topic_len);
                let payload_len = data.get_u32_le() as usize;
                need(&data, payload_len)?;
                let payload = data.split_to(payload_len);
                GossipMessage::Route {
                    origin,
                    topic,
                    payload,
                }
            }
        };
        if data.has_remaining() {
            return Err(WireError::TrailingBytes(data.remaining()));
        }
        Ok(msg)
    }
}

fn put_version(buf: &mut BytesMut, version: Version) {
    buf.put_u64_le(version.incarnation);
    buf.put_u64_le(version.seq);
}

/// Handles inside an entry always belong to the enclosing partition's peer,
/// so only the id and username go on the wire.
fn put_entries(buf: &mut BytesMut, entries: &[TopicEntry]) {
    buf.put_u32_le(entries.len() as u32);
    for entry in entries {
        buf.put_u32_le(entry.key.0);
        buf.put_u32_le(entry.subscribers.len() as u32);
        for handle in &entry.subscribers {
            buf.put_u64_le(handle.id.0);
            buf.put_u16_le(handle.username.len() as u16);
            buf.put_slice(&handle.username);
        }
    }
}

fn put_partition(buf: &mut BytesMut, partition: &PartitionState) {
    buf.put_u64_le(partition.peer.0);
    put_version(buf, partition.version);
    put_entries(buf, &partition.topics);
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

fn need(data: &Bytes, needed: usize) -> Result<(), WireError> {
    if data.remaining() < needed {
        return Err(WireError::InsufficientData {
            needed,
            have: data.remaining(),
        });
    }
    Ok(())
}

fn get_version(data: &mut Bytes) -> Version {
    let incarnation = data.get_u64_le();
    let seq = data.get_u64_le();
    Version::new(incarnation, seq)
}

fn get_entries(data: &mut Bytes, peer: PeerId) -> Result<Vec<TopicEntry>, WireError> {
    need(data, 4)?;
    let count = data.get_u32_le() as usize;
    let mut entries = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        need(data, 8)?;
        let key = TopicKey(data.get_u32_le());
        let n = data.get_u32_le() as usize;
        let mut subscribers = Vec::with_capacity(n.min(1024));
        for _ in 0..n {
            need(data, 10)?;
            let id = ConnectionId(data.get_u64_le());
            let name_len = data.get_u16_le() as usize;
            need(data, name_len)?;
            let username = data.split_to(name_len);
            subscribers.push(ConnectionHandle { id, peer, username });
        }
        entries.push(TopicEntry { key, subscribers });
    }
    Ok(entries)
}

fn get_partition(data: &mut Bytes) -> Result<PartitionState, WireError> {
    need(data, 8 + 16)?;
    let peer = PeerId(data.get_u64_le());
    let version = get_version(data);
    let topics = get_entries(data, peer)?;
    Ok(PartitionState {
        peer,
        version,
        topics,
    })
}
