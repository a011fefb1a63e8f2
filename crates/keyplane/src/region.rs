//! Region model: a half-open key range replicated across stores.
//!
//! Like stores, `RegionInfo` is an immutable snapshot mutated through cloning
//! setters. The epoch `(version, conf_ver)` orders conflicting reports:
//! `version` moves on split/merge, `conf_ver` on membership change, and the
//! derived lexicographic order is what the heartbeat path arbitrates with.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Region epoch. The derived `Ord` is lexicographic on
/// `(version, conf_ver)`, which is exactly the staleness order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct RegionEpoch {
    pub version: u64,
    pub conf_ver: u64,
}

impl RegionEpoch {
    pub fn new(version: u64, conf_ver: u64) -> Self {
        RegionEpoch { version, conf_ver }
    }
}

impl fmt::Display for RegionEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}/c{}", self.version, self.conf_ver)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRole {
    #[default]
    Voter,
    Learner,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: u64,
    pub store_id: u64,
    #[serde(default)]
    pub role: PeerRole,
}

impl Peer {
    pub fn new(id: u64, store_id: u64) -> Self {
        Peer {
            id,
            store_id,
            role: PeerRole::Voter,
        }
    }

    pub fn learner(id: u64, store_id: u64) -> Self {
        Peer {
            id,
            store_id,
            role: PeerRole::Learner,
        }
    }

    pub fn is_learner(&self) -> bool {
        self.role == PeerRole::Learner
    }
}

/// A peer a store reported as unreachable, with how long it has been down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerStats {
    pub peer: Peer,
    pub down_seconds: u64,
}

/// Persisted region descriptor. Key ranges are end-exclusive; an empty
/// start key means -inf and an empty end key means +inf.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegionMeta {
    pub id: u64,
    #[serde(default, with = "hex_key")]
    pub start_key: Vec<u8>,
    #[serde(default, with = "hex_key")]
    pub end_key: Vec<u8>,
    pub epoch: RegionEpoch,
    pub peers: Vec<Peer>,
}

/// Keys are arbitrary bytes; persist them hex-encoded so the JSON stays
/// readable in debugging sessions.
mod hex_key {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        let mut out = String::with_capacity(key.len() * 2);
        for b in key {
            out.push_str(&format!("{b:02x}"));
        }
        ser.serialize_str(&out)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        if s.len() % 2 != 0 {
            return Err(serde::de::Error::custom("odd-length hex key"));
        }
        (0..s.len())
            .step_by(2)
            .map(|i| {
                u8::from_str_radix(&s[i..i + 2], 16)
                    .map_err(|_| serde::de::Error::custom("invalid hex key"))
            })
            .collect()
    }
}

impl RegionMeta {
    pub fn new(id: u64, start_key: Vec<u8>, end_key: Vec<u8>) -> Self {
        RegionMeta {
            id,
            start_key,
            end_key,
            epoch: RegionEpoch::default(),
            peers: Vec::new(),
        }
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        key >= self.start_key.as_slice() && (self.end_key.is_empty() || key < self.end_key.as_slice())
    }

    /// True when the two half-open ranges intersect.
    pub fn overlaps(&self, other: &RegionMeta) -> bool {
        let starts_before_other_ends =
            other.end_key.is_empty() || self.start_key < other.end_key;
        let other_starts_before_end =
            self.end_key.is_empty() || other.start_key < self.end_key;
        starts_before_other_ends && other_starts_before_end
    }
}

/// In-memory region snapshot: meta plus the transient heartbeat-reported
/// state that never reaches the metadata store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegionInfo {
    meta: RegionMeta,
    leader: Option<Peer>,
    down_peers: Vec<PeerStats>,
    pending_peers: Vec<Peer>,
    /// Flow deltas over the heartbeat interval.
    bytes_written: u64,
    bytes_read: u64,
    keys_written: u64,
    keys_read: u64,
    /// MiB.
    approximate_size: i64,
    approximate_keys: i64,
}

impl RegionInfo {
    pub fn new(meta: RegionMeta) -> Self {
        RegionInfo {
            meta,
            ..Default::default()
        }
    }

    pub fn id(&self) -> u64 {
        self.meta.id
    }

    pub fn meta(&self) -> &RegionMeta {
        &self.meta
    }

    pub fn start_key(&self) -> &[u8] {
        &self.meta.start_key
    }

    pub fn end_key(&self) -> &[u8] {
        &self.meta.end_key
    }

    pub fn epoch(&self) -> RegionEpoch {
        self.meta.epoch
    }

    pub fn peers(&self) -> &[Peer] {
        &self.meta.peers
    }

    pub fn voters(&self) -> impl Iterator<Item = &Peer> {
        self.meta.peers.iter().filter(|p| !p.is_learner())
    }

    pub fn learners(&self) -> impl Iterator<Item = &Peer> {
        self.meta.peers.iter().filter(|p| p.is_learner())
    }

    pub fn leader(&self) -> Option<&Peer> {
        self.leader.as_ref()
    }

    pub fn leader_id(&self) -> u64 {
        self.leader.map(|p| p.id).unwrap_or(0)
    }

    pub fn leader_store_id(&self) -> u64 {
        self.leader.map(|p| p.store_id).unwrap_or(0)
    }

    pub fn store_peer(&self, store_id: u64) -> Option<&Peer> {
        self.meta.peers.iter().find(|p| p.store_id == store_id)
    }

    pub fn peer_by_id(&self, peer_id: u64) -> Option<&Peer> {
        self.meta.peers.iter().find(|p| p.id == peer_id)
    }

    /// Voter peers other than the leader.
    pub fn follower_peers(&self) -> Vec<Peer> {
        let leader_id = self.leader_id();
        self.voters()
            .filter(|p| p.id != leader_id)
            .copied()
            .collect()
    }

    pub fn store_ids(&self) -> Vec<u64> {
        self.meta.peers.iter().map(|p| p.store_id).collect()
    }

    pub fn down_peers(&self) -> &[PeerStats] {
        &self.down_peers
    }

    pub fn pending_peers(&self) -> &[Peer] {
        &self.pending_peers
    }

    pub fn is_pending(&self, peer_id: u64) -> bool {
        self.pending_peers.iter().any(|p| p.id == peer_id)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn keys_written(&self) -> u64 {
        self.keys_written
    }

    pub fn keys_read(&self) -> u64 {
        self.keys_read
    }

    pub fn approximate_size(&self) -> i64 {
        self.approximate_size
    }

    pub fn approximate_keys(&self) -> i64 {
        self.approximate_keys
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.meta.contains_key(key)
    }

    /// Fit for scheduling: no down, pending, or learner peers.
    pub fn is_healthy(&self) -> bool {
        self.down_peers.is_empty()
            && self.pending_peers.is_empty()
            && self.learners().next().is_none()
    }

    /// Fit for scheduling when the pending peer is the reason we are moving it.
    pub fn is_healthy_allow_pending(&self) -> bool {
        self.down_peers.is_empty() && self.learners().next().is_none()
    }

    // ---- copy-on-write setters ----

    pub fn with_leader(&self, leader: Option<Peer>) -> Self {
        let mut r = self.clone();
        r.leader = leader;
        r
    }

    pub fn with_peers(&self, peers: Vec<Peer>) -> Self {
        let mut r = self.clone();
        r.meta.peers = peers;
        r
    }

    pub fn with_epoch(&self, epoch: RegionEpoch) -> Self {
        let mut r = self.clone();
        r.meta.epoch = epoch;
        r
    }

    pub fn with_down_peers(&self, down: Vec<PeerStats>) -> Self {
        let mut r = self.clone();
        r.down_peers = down;
        r
    }

    pub fn with_pending_peers(&self, pending: Vec<Peer>) -> Self {
        let mut r = self.clone();
        r.pending_peers = pending;
        r
    }

    pub fn with_flow(
        &self,
        bytes_written: u64,
        bytes_read: u64,
        keys_written: u64,
        keys_read: u64,
    ) -> Self {
        let mut r = self.clone();
        r.bytes_written = bytes_written;
        r.bytes_read = bytes_read;
        r.keys_written = keys_written;
        r.keys_read = keys_read;
        r
    }

    pub fn with_approximates(&self, size_mib: i64, keys: i64) -> Self {
        let mut r = self.clone();
        r.approximate_size = size_mib;
        r.approximate_keys = keys;
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(id: u64, start: &[u8], end: &[u8]) -> RegionMeta {
        RegionMeta::new(id, start.to_vec(), end.to_vec())
    }

    #[test]
    fn epoch_order_is_version_then_conf_ver() {
        assert!(RegionEpoch::new(2, 0) > RegionEpoch::new(1, 9));
        assert!(RegionEpoch::new(1, 3) > RegionEpoch::new(1, 2));
        assert_eq!(RegionEpoch::new(1, 1), RegionEpoch::new(1, 1));
    }

    #[test]
    fn contains_key_half_open() {
        let r = region(1, b"b", b"d");
        assert!(!r.contains_key(b"a"));
        assert!(r.contains_key(b"b"));
        assert!(r.contains_key(b"c"));
        assert!(!r.contains_key(b"d"));

        let unbounded = region(2, b"", b"");
        assert!(unbounded.contains_key(b""));
        assert!(unbounded.contains_key(b"zzz"));
    }

    #[test]
    fn overlap_checks_infinite_bounds() {
        let whole = region(1, b"", b"");
        let mid = region(2, b"m", b"p");
        assert!(whole.overlaps(&mid));
        assert!(mid.overlaps(&whole));

        assert!(!region(3, b"a", b"m").overlaps(&region(4, b"m", b"z")));
        assert!(region(5, b"a", b"n").overlaps(&region(6, b"m", b"z")));
        assert!(region(7, b"m", b"").overlaps(&region(8, b"z", b"")));
    }

    #[test]
    fn health_ignores_or_honors_pending() {
        let meta = RegionMeta {
            peers: vec![Peer::new(1, 1), Peer::new(2, 2)],
            ..region(1, b"", b"")
        };
        let healthy = RegionInfo::new(meta.clone()).with_leader(Some(Peer::new(1, 1)));
        assert!(healthy.is_healthy());

        let pending = healthy.with_pending_peers(vec![Peer::new(2, 2)]);
        assert!(!pending.is_healthy());
        assert!(pending.is_healthy_allow_pending());

        let with_learner = healthy.with_peers(vec![Peer::new(1, 1), Peer::learner(3, 3)]);
        assert!(!with_learner.is_healthy_allow_pending());
    }

    #[test]
    fn meta_json_round_trip() {
        let meta = RegionMeta {
            id: 7,
            start_key: vec![0x00, 0xff, 0x10],
            end_key: vec![],
            epoch: RegionEpoch::new(4, 2),
            peers: vec![Peer::new(70, 1), Peer::learner(71, 2)],
        };
        let bytes = serde_json::to_vec(&meta).unwrap();
        let back: RegionMeta = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(meta, back);
    }
}
