//! Replicated, per-peer partitioned subscription directory.
//!
//! Each peer is the only writer of its own partition. Remote copies are
//! replaced wholesale by newer announcements (last writer per partition), so
//! removals need no per-subscription tombstones. A departed peer leaves a
//! version watermark behind: announcements at or below it are rejected, which
//! lets a departure win over gossip still in flight.

use ahash::{AHashMap, AHashSet};
use parking_lot::RwLock;

use super::topic::TopicKey;
use super::types::{ConnectionHandle, PeerId};

/// Partition version. `incarnation` changes whenever the owning node
/// restarts, `seq` on every change to the partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version {
    pub incarnation: u64,
    pub seq: u64,
}

impl Version {
    pub fn new(incarnation: u64, seq: u64) -> Self {
        Self { incarnation, seq }
    }

    fn next(self) -> Self {
        Self {
            incarnation: self.incarnation,
            seq: self.seq + 1,
        }
    }
}

/// Full subscriber set of one topic within one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicEntry {
    pub key: TopicKey,
    pub subscribers: Vec<ConnectionHandle>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionState {
    pub peer: PeerId,
    pub version: Version,
    pub topics: Vec<TopicEntry>,
}

/// Wire-level view of (part of) the directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryState {
    pub partitions: Vec<PartitionState>,
}

impl DirectoryState {
    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}

/// Incremental change to one partition. Each listed topic's subscriber set
/// replaces the cached one; an empty set removes the topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delta {
    pub peer: PeerId,
    pub base: Version,
    pub version: Version,
    pub topics: Vec<TopicEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOutcome {
    Applied,
    /// Already covered by what we hold, or from a departed incarnation.
    Stale,
    /// Base does not match our copy. A full snapshot is needed.
    Gap,
}

// ---------------------------------------------------------------------------
// Partition
// ---------------------------------------------------------------------------

struct Partition {
    version: Version,
    topics: AHashMap<TopicKey, AHashSet<ConnectionHandle>>,
}

impl Partition {
    fn empty(version: Version) -> Self {
        Self {
            version,
            topics: AHashMap::new(),
        }
    }

    fn from_state(state: &PartitionState) -> Self {
        let mut topics = AHashMap::with_capacity(state.topics.len());
        for entry in &state.topics {
            if !entry.subscribers.is_empty() {
                topics.insert(entry.key, entry.subscribers.iter().cloned().collect());
            }
        }
        Self {
            version: state.version,
            topics,
        }
    }

    fn entry(&self, key: TopicKey) -> TopicEntry {
        TopicEntry {
            key,
            subscribers: self
                .topics
                .get(&key)
                .map(|set| sorted(set.iter().cloned().collect()))
                .unwrap_or_default(),
        }
    }

    fn to_state(&self, peer: PeerId) -> PartitionState {
        let mut keys: Vec<TopicKey> = self.topics.keys().copied().collect();
        keys.sort();
        PartitionState {
            peer,
            version: self.version,
            topics: keys.into_iter().map(|k| self.entry(k)).collect(),
        }
    }

    fn subscription_count(&self) -> usize {
        self.topics.values().map(|set| set.len()).sum()
    }
}

fn sorted(mut handles: Vec<ConnectionHandle>) -> Vec<ConnectionHandle> {
    handles.sort_by_key(|h| (h.peer, h.id));
    handles
}

// ---------------------------------------------------------------------------
// Directory
// ---------------------------------------------------------------------------

pub struct ClusterDirectory {
    local: PeerId,
    incarnation: u64,
    inner: RwLock<Inner>,
}

struct Inner {
    partitions: AHashMap<PeerId, Partition>,
    /// Last version seen from each departed peer.
    departed: AHashMap<PeerId, Version>,
}

impl ClusterDirectory {
    pub fn new(local: PeerId, incarnation: u64) -> Self {
        let mut partitions = AHashMap::new();
        partitions.insert(local, Partition::empty(Version::new(incarnation, 0)));
        Self {
            local,
            incarnation,
            inner: RwLock::new(Inner {
                partitions,
                departed: AHashMap::new(),
            }),
        }
    }

    fn local_partition<'a>(&self, inner: &'a mut Inner) -> &'a mut Partition {
        inner
            .partitions
            .entry(self.local)
            .or_insert_with(|| Partition::empty(Version::new(self.incarnation, 0)))
    }

    /// Adds `handle` to our own partition. Returns the delta to gossip, or
    /// `None` if the subscription was already present.
    pub fn local_subscribe(&self, key: TopicKey, handle: &ConnectionHandle) -> Option<Delta> {
        let mut inner = self.inner.write();
        let part = self.local_partition(&mut inner);
        if !part.topics.entry(key).or_default().insert(handle.clone()) {
            return None;
        }
        let base = part.version;
        part.version = base.next();
        Some(Delta {
            peer: self.local,
            base,
            version: part.version,
            topics: vec![part.entry(key)],
        })
    }

    pub fn local_unsubscribe(&self, key: TopicKey, handle: &ConnectionHandle) -> Option<Delta> {
        self.local_remove_connection(handle, &[key])
    }

    /// Removes `handle` from each of `keys` in one version step.
    pub fn local_remove_connection(
        &self,
        handle: &ConnectionHandle,
        keys: &[TopicKey],
    ) -> Option<Delta> {
        let mut inner = self.inner.write();
        let part = self.local_partition(&mut inner);
        let mut changed = Vec::new();
        for key in keys {
            let Some(set) = part.topics.get_mut(key) else {
                continue;
            };
            if set.remove(handle) {
                if set.is_empty() {
                    part.topics.remove(key);
                }
                changed.push(*key);
            }
        }
        if changed.is_empty() {
            return None;
        }
        let base = part.version;
        part.version = base.next();
        Some(Delta {
            peer: self.local,
            base,
            version: part.version,
            topics: changed.into_iter().map(|k| part.entry(k)).collect(),
        })
    }

    /// Bumps our own version without changing content, so peers that hold a
    /// departure watermark for us accept the next announcement.
    pub fn restamp_local(&self) -> Version {
        let mut inner = self.inner.write();
        let part = self.local_partition(&mut inner);
        part.version = part.version.next();
        part.version
    }

    pub fn local_version(&self) -> Version {
        let inner = self.inner.read();
        inner
            .partitions
            .get(&self.local)
            .map_or(Version::new(self.incarnation, 0), |p| p.version)
    }

    /// Every partition we hold, our own included, in a stable order.
    pub fn snapshot(&self) -> DirectoryState {
        let inner = self.inner.read();
        let mut peers: Vec<PeerId> = inner.partitions.keys().copied().collect();
        peers.sort();
        DirectoryState {
            partitions: peers
                .into_iter()
                .filter_map(|peer| inner.partitions.get(&peer).map(|p| p.to_state(peer)))
                .collect(),
        }
    }

    pub fn local_snapshot(&self) -> DirectoryState {
        let inner = self.inner.read();
        DirectoryState {
            partitions: inner
                .partitions
                .get(&self.local)
                .map(|p| vec![p.to_state(self.local)])
                .unwrap_or_default(),
        }
    }

    /// Replaces each cached remote partition that `remote` carries a newer
    /// version of. Returns the partitions that were actually applied.
    pub fn merge(&self, remote: DirectoryState) -> DirectoryState {
        let mut inner = self.inner.write();
        let mut applied = Vec::new();
        for state in remote.partitions {
            if state.peer == self.local {
                continue;
            }
            if inner
                .departed
                .get(&state.peer)
                .is_some_and(|mark| state.version <= *mark)
            {
                continue;
            }
            if inner
                .partitions
                .get(&state.peer)
                .is_some_and(|cur| state.version <= cur.version)
            {
                continue;
            }
            inner.departed.remove(&state.peer);
            inner
                .partitions
                .insert(state.peer, Partition::from_state(&state));
            applied.push(state);
        }
        DirectoryState {
            partitions: applied,
        }
    }

    pub fn apply_delta(&self, delta: &Delta) -> DeltaOutcome {
        if delta.peer == self.local {
            return DeltaOutcome::Stale;
        }
        let mut inner = self.inner.write();
        if inner
            .departed
            .get(&delta.peer)
            .is_some_and(|mark| delta.version <= *mark)
        {
            return DeltaOutcome::Stale;
        }
        let Some(part) = inner.partitions.get_mut(&delta.peer) else {
            return DeltaOutcome::Gap;
        };
        if delta.version <= part.version {
            return DeltaOutcome::Stale;
        }
        if delta.base != part.version {
            return DeltaOutcome::Gap;
        }
        for entry in &delta.topics {
            if entry.subscribers.is_empty() {
                part.topics.remove(&entry.key);
            } else {
                part.topics
                    .insert(entry.key, entry.subscribers.iter().cloned().collect());
            }
        }
        part.version = delta.version;
        DeltaOutcome::Applied
    }

    /// Drops everything `peer` contributed. Returns the number of
    /// subscriptions removed.
    pub fn remove_peer_partition(&self, peer: PeerId) -> usize {
        if peer == self.local {
            return 0;
        }
        let mut inner = self.inner.write();
        let Some(part) = inner.partitions.remove(&peer) else {
            return 0;
        };
        let mark = inner.departed.entry(peer).or_default();
        if part.version > *mark {
            *mark = part.version;
        }
        part.subscription_count()
    }

    /// Remote subscribers of `key`, grouped by owning peer. Our own
    /// partition is excluded.
    pub fn lookup_remote(&self, key: TopicKey) -> AHashMap<PeerId, Vec<ConnectionHandle>> {
        let inner = self.inner.read();
        let mut out = AHashMap::new();
        for (peer, part) in &inner.partitions {
            if *peer == self.local {
                continue;
            }
            if let Some(set) = part.topics.get(&key)
                && !set.is_empty()
            {
                out.insert(*peer, set.iter().cloned().collect());
            }
        }
        out
    }

    /// Number of remote partitions held.
    pub fn peer_count(&self) -> usize {
        let inner = self.inner.read();
        inner
            .partitions
            .keys()
            .filter(|peer| **peer != self.local)
            .count()
    }

    pub fn partition_len(&self, peer: PeerId) -> usize {
        self.inner
            .read()
            .partitions
            .get(&peer)
            .map_or(0, Partition::subscription_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::types::ConnectionId;

    const LOCAL: PeerId = PeerId(1);
    const A: PeerId = PeerId(2);
    const B: PeerId = PeerId(3);

    fn handle(peer: PeerId, id: u64) -> ConnectionHandle {
        ConnectionHandle::new(ConnectionId(id), peer, "u")
    }

    fn partition(peer: PeerId, seq: u64, topics: &[(&str, &[u64])]) -> PartitionState {
        PartitionState {
            peer,
            version: Version::new(100, seq),
            topics: topics
                .iter()
                .map(|(topic, ids)| TopicEntry {
                    key: TopicKey::of(topic.as_bytes()),
                    subscribers: ids.iter().map(|id| handle(peer, *id)).collect(),
                })
                .collect(),
        }
    }

    fn state(partitions: Vec<PartitionState>) -> DirectoryState {
        DirectoryState { partitions }
    }

    #[test]
    fn test_local_subscribe_produces_delta() {
        let dir = ClusterDirectory::new(LOCAL, 7);
        let key = TopicKey::of(b"alerts");
        let delta = dir.local_subscribe(key, &handle(LOCAL, 1)).unwrap();
        assert_eq!(delta.peer, LOCAL);
        assert_eq!(delta.base, Version::new(7, 0));
        assert_eq!(delta.version, Version::new(7, 1));
        assert_eq!(delta.topics[0].subscribers, vec![handle(LOCAL, 1)]);

        // Repeat subscribe changes nothing.
        assert!(dir.local_subscribe(key, &handle(LOCAL, 1)).is_none());
        assert_eq!(dir.local_version(), Version::new(7, 1));
    }

    #[test]
    fn test_local_unsubscribe_idempotent() {
        let dir = ClusterDirectory::new(LOCAL, 7);
        let key = TopicKey::of(b"alerts");
        assert!(dir.local_unsubscribe(key, &handle(LOCAL, 1)).is_none());
        dir.local_subscribe(key, &handle(LOCAL, 1));
        let delta = dir.local_unsubscribe(key, &handle(LOCAL, 1)).unwrap();
        assert!(delta.topics[0].subscribers.is_empty());
        assert!(dir.local_unsubscribe(key, &handle(LOCAL, 1)).is_none());
    }

    #[test]
    fn test_local_remove_connection_single_delta() {
        let dir = ClusterDirectory::new(LOCAL, 7);
        let a = TopicKey::of(b"a");
        let b = TopicKey::of(b"b");
        dir.local_subscribe(a, &handle(LOCAL, 1));
        dir.local_subscribe(b, &handle(LOCAL, 1));
        dir.local_subscribe(b, &handle(LOCAL, 2));

        let delta = dir
            .local_remove_connection(&handle(LOCAL, 1), &[a, b])
            .unwrap();
        assert_eq!(delta.base, Version::new(7, 3));
        assert_eq!(delta.version, Version::new(7, 4));
        assert_eq!(delta.topics.len(), 2);
        assert_eq!(dir.partition_len(LOCAL), 1);
    }

    #[test]
    fn test_lookup_remote_excludes_local() {
        let dir = ClusterDirectory::new(LOCAL, 7);
        let key = TopicKey::of(b"alerts");
        dir.local_subscribe(key, &handle(LOCAL, 1));
        dir.merge(state(vec![partition(A, 1, &[("alerts", &[5, 6])])]));

        let remote = dir.lookup_remote(key);
        assert_eq!(remote.len(), 1);
        assert_eq!(remote[&A].len(), 2);
    }

    #[test]
    fn test_merge_ignores_own_partition() {
        let dir = ClusterDirectory::new(LOCAL, 7);
        let applied = dir.merge(state(vec![partition(LOCAL, 99, &[("x", &[1])])]));
        assert!(applied.is_empty());
        assert_eq!(dir.partition_len(LOCAL), 0);
    }

    #[test]
    fn test_merge_replaces_partition() {
        let dir = ClusterDirectory::new(LOCAL, 7);
        dir.merge(state(vec![partition(A, 1, &[("x", &[1]), ("y", &[2])])]));
        dir.merge(state(vec![partition(A, 2, &[("y", &[3])])]));

        assert!(dir.lookup_remote(TopicKey::of(b"x")).is_empty());
        assert_eq!(dir.lookup_remote(TopicKey::of(b"y"))[&A], vec![handle(A, 3)]);
    }

    #[test]
    fn test_merge_rejects_older_version() {
        let dir = ClusterDirectory::new(LOCAL, 7);
        dir.merge(state(vec![partition(A, 5, &[("x", &[1])])]));
        let applied = dir.merge(state(vec![partition(A, 4, &[("y", &[1])])]));
        assert!(applied.is_empty());
        assert_eq!(dir.lookup_remote(TopicKey::of(b"x")).len(), 1);
    }

    #[test]
    fn test_merge_idempotent() {
        let dir = ClusterDirectory::new(LOCAL, 7);
        let incoming = state(vec![
            partition(A, 1, &[("x", &[1])]),
            partition(B, 3, &[("y", &[2, 3])]),
        ]);
        let first = dir.merge(incoming.clone());
        assert_eq!(first.partitions.len(), 2);
        let after_first = dir.snapshot();

        let second = dir.merge(incoming);
        assert!(second.is_empty());
        assert_eq!(dir.snapshot(), after_first);
    }

    #[test]
    fn test_merge_commutative() {
        let pa = partition(A, 2, &[("x", &[1])]);
        let pb = partition(B, 4, &[("x", &[2]), ("z", &[9])]);

        let d1 = ClusterDirectory::new(LOCAL, 7);
        d1.merge(state(vec![pa.clone()]));
        d1.merge(state(vec![pb.clone()]));

        let d2 = ClusterDirectory::new(LOCAL, 7);
        d2.merge(state(vec![pb]));
        d2.merge(state(vec![pa]));

        assert_eq!(d1.snapshot(), d2.snapshot());
    }

    #[test]
    fn test_merge_commutative_same_peer() {
        let old = partition(A, 1, &[("x", &[1])]);
        let new = partition(A, 2, &[("y", &[1])]);

        let d1 = ClusterDirectory::new(LOCAL, 7);
        d1.merge(state(vec![old.clone()]));
        d1.merge(state(vec![new.clone()]));

        let d2 = ClusterDirectory::new(LOCAL, 7);
        d2.merge(state(vec![new]));
        d2.merge(state(vec![old]));

        assert_eq!(d1.snapshot(), d2.snapshot());
    }

    #[test]
    fn test_remove_peer_partition_exact() {
        let dir = ClusterDirectory::new(LOCAL, 7);
        let key = TopicKey::of(b"x");
        dir.local_subscribe(key, &handle(LOCAL, 1));
        dir.merge(state(vec![
            partition(A, 1, &[("x", &[1, 2]), ("y", &[3])]),
            partition(B, 1, &[("x", &[4])]),
        ]));

        assert_eq!(dir.remove_peer_partition(A), 3);
        let remote = dir.lookup_remote(key);
        assert_eq!(remote.len(), 1);
        assert_eq!(remote[&B], vec![handle(B, 4)]);
        assert_eq!(dir.partition_len(LOCAL), 1);
        assert_eq!(dir.peer_count(), 1);
    }

    #[test]
    fn test_departure_wins_over_late_gossip() {
        let dir = ClusterDirectory::new(LOCAL, 7);
        dir.merge(state(vec![partition(A, 3, &[("x", &[1])])]));
        dir.remove_peer_partition(A);

        // Snapshot relayed by a third peer after the departure.
        let applied = dir.merge(state(vec![partition(A, 3, &[("x", &[1])])]));
        assert!(applied.is_empty());

        // Delta that was in flight when the peer left.
        let late = Delta {
            peer: A,
            base: Version::new(100, 2),
            version: Version::new(100, 3),
            topics: vec![],
        };
        assert_eq!(dir.apply_delta(&late), DeltaOutcome::Stale);
        assert!(dir.lookup_remote(TopicKey::of(b"x")).is_empty());

        // The peer returns and re-stamps.
        let applied = dir.merge(state(vec![partition(A, 4, &[("x", &[1])])]));
        assert_eq!(applied.partitions.len(), 1);
        assert_eq!(dir.lookup_remote(TopicKey::of(b"x")).len(), 1);
    }

    #[test]
    fn test_apply_delta_in_order() {
        let dir = ClusterDirectory::new(LOCAL, 7);
        dir.merge(state(vec![partition(A, 1, &[("x", &[1])])]));

        let delta = Delta {
            peer: A,
            base: Version::new(100, 1),
            version: Version::new(100, 2),
            topics: vec![
                TopicEntry {
                    key: TopicKey::of(b"x"),
                    subscribers: vec![],
                },
                TopicEntry {
                    key: TopicKey::of(b"y"),
                    subscribers: vec![handle(A, 2)],
                },
            ],
        };
        assert_eq!(dir.apply_delta(&delta), DeltaOutcome::Applied);
        assert!(dir.lookup_remote(TopicKey::of(b"x")).is_empty());
        assert_eq!(dir.lookup_remote(TopicKey::of(b"y"))[&A], vec![handle(A, 2)]);

        // Re-delivery is ignored.
        assert_eq!(dir.apply_delta(&delta), DeltaOutcome::Stale);
    }

    #[test]
    fn test_apply_delta_gap() {
        let dir = ClusterDirectory::new(LOCAL, 7);
        let delta = Delta {
            peer: A,
            base: Version::new(100, 4),
            version: Version::new(100, 5),
            topics: vec![],
        };
        // Unknown partition.
        assert_eq!(dir.apply_delta(&delta), DeltaOutcome::Gap);

        dir.merge(state(vec![partition(A, 2, &[])]));
        assert_eq!(dir.apply_delta(&delta), DeltaOutcome::Gap);
    }

    #[test]
    fn test_restamp_bumps_version() {
        let dir = ClusterDirectory::new(LOCAL, 7);
        assert_eq!(dir.restamp_local(), Version::new(7, 1));
        assert_eq!(dir.local_snapshot().partitions[0].version, Version::new(7, 1));
    }

    #[test]
    fn test_newer_incarnation_wins() {
        let dir = ClusterDirectory::new(LOCAL, 7);
        dir.merge(state(vec![partition(A, 50, &[("x", &[1])])]));
        let restarted = PartitionState {
            peer: A,
            version: Version::new(200, 0),
            topics: vec![],
        };
        assert_eq!(dir.merge(state(vec![restarted])).partitions.len(), 1);
        assert!(dir.lookup_remote(TopicKey::of(b"x")).is_empty());
    }
}
