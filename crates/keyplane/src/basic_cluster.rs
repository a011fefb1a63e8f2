//! In-memory authoritative cluster state: stores, regions, and the indexes
//! the schedulers query.
//!
//! One reader-writer lock guards the whole index; writes are short and never
//! touch I/O while holding it. Reads hand out `Arc` snapshots, so callers can
//! keep looking at a store or region while the index moves on.
//!
//! The region tree is a `BTreeMap` keyed by start key (unsigned lexicographic
//! order; the empty key sorts first, standing in for -inf). Point lookup is a
//! "largest start key <= k" probe followed by an end-key check.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use rand::Rng;

use crate::error::{Error, Result};
use crate::region::{RegionInfo, RegionMeta};
use crate::store::StoreInfo;

/// Attempts made when sampling for a random region matching a predicate.
const RANDOM_REGION_RETRIES: usize = 10;

/// Health requirement applied when sampling regions for scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthPolicy {
    /// No down peers, no pending peers, no learners.
    Healthy,
    /// No down peers, no learners; pending peers are acceptable.
    HealthyAllowPending,
}

impl HealthPolicy {
    fn allows(self, region: &RegionInfo) -> bool {
        match self {
            HealthPolicy::Healthy => region.is_healthy(),
            HealthPolicy::HealthyAllowPending => region.is_healthy_allow_pending(),
        }
    }
}

#[derive(Default)]
struct SubStores {
    leaders: HashMap<u64, BTreeSet<u64>>,
    followers: HashMap<u64, BTreeSet<u64>>,
    learners: HashMap<u64, BTreeSet<u64>>,
    pending: HashMap<u64, BTreeSet<u64>>,
}

impl SubStores {
    fn insert(&mut self, region: &RegionInfo) {
        let leader_id = region.leader_id();
        for peer in region.peers() {
            let bucket = if peer.is_learner() {
                &mut self.learners
            } else if peer.id == leader_id && leader_id != 0 {
                &mut self.leaders
            } else {
                &mut self.followers
            };
            bucket.entry(peer.store_id).or_default().insert(region.id());
        }
        for peer in region.pending_peers() {
            self.pending.entry(peer.store_id).or_default().insert(region.id());
        }
    }

    fn remove(&mut self, region: &RegionInfo) {
        for bucket in [
            &mut self.leaders,
            &mut self.followers,
            &mut self.learners,
            &mut self.pending,
        ] {
            for peer in region.peers() {
                if let Some(set) = bucket.get_mut(&peer.store_id) {
                    set.remove(&region.id());
                }
            }
            for peer in region.pending_peers() {
                if let Some(set) = bucket.get_mut(&peer.store_id) {
                    set.remove(&region.id());
                }
            }
        }
    }
}

#[derive(Default)]
struct Inner {
    stores: HashMap<u64, Arc<StoreInfo>>,
    regions: HashMap<u64, Arc<RegionInfo>>,
    /// start_key -> region id.
    tree: BTreeMap<Vec<u8>, u64>,
    sub: SubStores,
}

impl Inner {
    fn detach_region(&mut self, region: &Arc<RegionInfo>) {
        self.tree.remove(region.start_key());
        self.sub.remove(region);
    }

    /// Region ids whose range intersects `meta`, in tree order.
    fn overlap_ids(&self, meta: &RegionMeta) -> Vec<u64> {
        let from = match self
            .tree
            .range(..=meta.start_key.clone())
            .next_back()
        {
            Some((start, _)) => start.clone(),
            None => meta.start_key.clone(),
        };
        let mut out = Vec::new();
        for (start, &rid) in self.tree.range(from..) {
            if !meta.end_key.is_empty() && start.as_slice() >= meta.end_key.as_slice() {
                break;
            }
            if let Some(region) = self.regions.get(&rid) {
                if region.meta().overlaps(meta) {
                    out.push(rid);
                }
            }
        }
        out
    }

    fn search_id(&self, key: &[u8]) -> Option<u64> {
        let (_, &rid) = self.tree.range(..=key.to_vec()).next_back()?;
        let region = self.regions.get(&rid)?;
        region.contains_key(key).then_some(rid)
    }

    fn region_counts(&self, store_id: u64) -> (usize, usize, usize, i64, i64) {
        let set_len = |m: &HashMap<u64, BTreeSet<u64>>| {
            m.get(&store_id).map(|s| s.len()).unwrap_or(0)
        };
        let sum_size = |m: &HashMap<u64, BTreeSet<u64>>| {
            m.get(&store_id)
                .map(|s| {
                    s.iter()
                        .filter_map(|id| self.regions.get(id))
                        .map(|r| r.approximate_size())
                        .sum::<i64>()
                })
                .unwrap_or(0)
        };
        let leader_count = set_len(&self.sub.leaders);
        let region_count =
            leader_count + set_len(&self.sub.followers) + set_len(&self.sub.learners);
        let pending_count = set_len(&self.sub.pending);
        let leader_size = sum_size(&self.sub.leaders);
        let region_size =
            leader_size + sum_size(&self.sub.followers) + sum_size(&self.sub.learners);
        (leader_count, region_count, pending_count, leader_size, region_size)
    }
}

/// Concurrent in-memory store of stores and regions.
#[derive(Default)]
pub struct BasicCluster {
    inner: RwLock<Inner>,
}

impl BasicCluster {
    pub fn new() -> Self {
        BasicCluster::default()
    }

    // ---- stores ----

    pub fn put_store(&self, store: StoreInfo) {
        let mut inner = self.inner.write().unwrap();
        inner.stores.insert(store.id(), Arc::new(store));
    }

    pub fn delete_store(&self, store_id: u64) {
        let mut inner = self.inner.write().unwrap();
        inner.stores.remove(&store_id);
    }

    pub fn get_store(&self, store_id: u64) -> Option<Arc<StoreInfo>> {
        self.inner.read().unwrap().stores.get(&store_id).cloned()
    }

    pub fn get_stores(&self) -> Vec<Arc<StoreInfo>> {
        self.inner.read().unwrap().stores.values().cloned().collect()
    }

    pub fn store_count(&self) -> usize {
        self.inner.read().unwrap().stores.len()
    }

    pub fn block_store(&self, store_id: u64) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let store = inner
            .stores
            .get(&store_id)
            .ok_or(Error::StoreNotFound(store_id))?;
        if store.is_blocked() {
            return Err(Error::validation(format!("store {store_id} is already blocked")));
        }
        let blocked = store.with_blocked(true);
        inner.stores.insert(store_id, Arc::new(blocked));
        Ok(())
    }

    pub fn unblock_store(&self, store_id: u64) {
        let mut inner = self.inner.write().unwrap();
        if let Some(store) = inner.stores.get(&store_id) {
            let unblocked = store.with_blocked(false);
            inner.stores.insert(store_id, Arc::new(unblocked));
        }
    }

    pub fn attach_available_fn(
        &self,
        store_id: u64,
        f: Arc<dyn Fn() -> bool + Send + Sync>,
    ) {
        let mut inner = self.inner.write().unwrap();
        if let Some(store) = inner.stores.get(&store_id) {
            let updated = store.with_available_fn(Some(f));
            inner.stores.insert(store_id, Arc::new(updated));
        }
    }

    /// Recompute the counters of one store from the region index.
    pub fn update_store_status(&self, store_id: u64) {
        let mut inner = self.inner.write().unwrap();
        let Some(store) = inner.stores.get(&store_id).cloned() else {
            return;
        };
        let (leaders, regions, pending, leader_size, region_size) =
            inner.region_counts(store_id);
        let updated = store.with_counts(leaders, regions, pending, leader_size, region_size);
        inner.stores.insert(store_id, Arc::new(updated));
    }

    // ---- regions ----

    /// Insert or update a region, evicting every cached region whose range it
    /// overlaps. Callers must have run the epoch staleness check first; given
    /// that, every evicted region is strictly older (or tied and weaker) than
    /// the incoming one.
    pub fn put_region(&self, region: RegionInfo) -> Vec<Arc<RegionInfo>> {
        let region = Arc::new(region);
        let mut inner = self.inner.write().unwrap();

        if let Some(old) = inner.regions.remove(&region.id()) {
            inner.detach_region(&old);
        }

        let mut evicted = Vec::new();
        for rid in inner.overlap_ids(region.meta()) {
            if rid == region.id() {
                continue;
            }
            if let Some(old) = inner.regions.remove(&rid) {
                inner.detach_region(&old);
                evicted.push(old);
            }
        }

        inner.tree.insert(region.start_key().to_vec(), region.id());
        inner.sub.insert(&region);
        inner.regions.insert(region.id(), region);
        evicted
    }

    pub fn remove_region(&self, region_id: u64) -> Option<Arc<RegionInfo>> {
        let mut inner = self.inner.write().unwrap();
        let old = inner.regions.remove(&region_id)?;
        inner.detach_region(&old);
        Some(old)
    }

    pub fn get_region(&self, region_id: u64) -> Option<Arc<RegionInfo>> {
        self.inner.read().unwrap().regions.get(&region_id).cloned()
    }

    pub fn get_regions(&self) -> Vec<Arc<RegionInfo>> {
        self.inner.read().unwrap().regions.values().cloned().collect()
    }

    pub fn region_count(&self) -> usize {
        self.inner.read().unwrap().regions.len()
    }

    /// Cached regions overlapping `meta`, without mutating anything.
    pub fn get_overlaps(&self, meta: &RegionMeta) -> Vec<Arc<RegionInfo>> {
        let inner = self.inner.read().unwrap();
        inner
            .overlap_ids(meta)
            .iter()
            .filter_map(|id| inner.regions.get(id).cloned())
            .collect()
    }

    /// The region containing `key`, if any.
    pub fn search_region(&self, key: &[u8]) -> Option<Arc<RegionInfo>> {
        let inner = self.inner.read().unwrap();
        let rid = inner.search_id(key)?;
        inner.regions.get(&rid).cloned()
    }

    /// The region immediately before the one containing `key`, when the two
    /// are contiguous.
    pub fn search_prev_region(&self, key: &[u8]) -> Option<Arc<RegionInfo>> {
        let inner = self.inner.read().unwrap();
        let cur_id = inner.search_id(key)?;
        let cur = inner.regions.get(&cur_id)?;
        if cur.start_key().is_empty() {
            return None;
        }
        let (_, &prev_id) = inner.tree.range(..cur.start_key().to_vec()).next_back()?;
        let prev = inner.regions.get(&prev_id)?;
        (prev.end_key() == cur.start_key()).then(|| prev.clone())
    }

    /// Scan regions in key order starting from the region covering (or first
    /// after) `start`, stopping at `end` (empty = +inf) or after `limit`
    /// regions (0 = unlimited).
    pub fn scan_range(&self, start: &[u8], end: &[u8], limit: usize) -> Vec<Arc<RegionInfo>> {
        let inner = self.inner.read().unwrap();
        let from = inner
            .search_id(start)
            .and_then(|id| inner.regions.get(&id))
            .map(|r| r.start_key().to_vec())
            .unwrap_or_else(|| start.to_vec());

        let mut out = Vec::new();
        for (region_start, rid) in inner.tree.range(from..) {
            if !end.is_empty() && region_start.as_slice() >= end {
                break;
            }
            if let Some(region) = inner.regions.get(rid) {
                out.push(region.clone());
                if limit > 0 && out.len() >= limit {
                    break;
                }
            }
        }
        out
    }

    /// Tree neighbours of `region`: the entries just before and just after
    /// its start key.
    pub fn adjacent_regions(
        &self,
        region: &RegionInfo,
    ) -> (Option<Arc<RegionInfo>>, Option<Arc<RegionInfo>>) {
        let inner = self.inner.read().unwrap();
        let start = region.start_key().to_vec();
        let prev = inner
            .tree
            .range(..start.clone())
            .next_back()
            .and_then(|(_, id)| inner.regions.get(id).cloned());
        let next = inner
            .tree
            .range((
                std::ops::Bound::Excluded(start),
                std::ops::Bound::Unbounded,
            ))
            .next()
            .and_then(|(_, id)| inner.regions.get(id).cloned());
        (prev, next)
    }

    // ---- per-store region queries ----

    pub fn get_store_regions(&self, store_id: u64) -> Vec<Arc<RegionInfo>> {
        let inner = self.inner.read().unwrap();
        let mut ids = BTreeSet::new();
        for m in [&inner.sub.leaders, &inner.sub.followers, &inner.sub.learners] {
            if let Some(set) = m.get(&store_id) {
                ids.extend(set.iter().copied());
            }
        }
        ids.iter()
            .filter_map(|id| inner.regions.get(id).cloned())
            .collect()
    }

    pub fn rand_leader_region(
        &self,
        store_id: u64,
        policy: HealthPolicy,
    ) -> Option<Arc<RegionInfo>> {
        self.rand_from(store_id, policy, |inner| &inner.sub.leaders)
    }

    pub fn rand_follower_region(
        &self,
        store_id: u64,
        policy: HealthPolicy,
    ) -> Option<Arc<RegionInfo>> {
        self.rand_from(store_id, policy, |inner| &inner.sub.followers)
    }

    pub fn rand_pending_region(
        &self,
        store_id: u64,
        policy: HealthPolicy,
    ) -> Option<Arc<RegionInfo>> {
        self.rand_from(store_id, policy, |inner| &inner.sub.pending)
    }

    fn rand_from(
        &self,
        store_id: u64,
        policy: HealthPolicy,
        pick: impl Fn(&Inner) -> &HashMap<u64, BTreeSet<u64>>,
    ) -> Option<Arc<RegionInfo>> {
        let inner = self.inner.read().unwrap();
        let set = pick(&inner).get(&store_id)?;
        if set.is_empty() {
            return None;
        }
        let mut rng = rand::thread_rng();
        for _ in 0..RANDOM_REGION_RETRIES {
            let idx = rng.gen_range(0..set.len());
            let rid = set.iter().nth(idx)?;
            if let Some(region) = inner.regions.get(rid) {
                if policy.allows(region) {
                    return Some(region.clone());
                }
            }
        }
        None
    }

    pub fn store_leader_count(&self, store_id: u64) -> usize {
        let inner = self.inner.read().unwrap();
        inner.sub.leaders.get(&store_id).map(|s| s.len()).unwrap_or(0)
    }

    pub fn store_region_count(&self, store_id: u64) -> usize {
        let inner = self.inner.read().unwrap();
        let (_, count, _, _, _) = inner.region_counts(store_id);
        count
    }

    pub fn store_pending_peer_count(&self, store_id: u64) -> usize {
        let inner = self.inner.read().unwrap();
        inner.sub.pending.get(&store_id).map(|s| s.len()).unwrap_or(0)
    }

    pub fn average_region_size(&self) -> i64 {
        let inner = self.inner.read().unwrap();
        if inner.regions.is_empty() {
            return 0;
        }
        let total: i64 = inner.regions.values().map(|r| r.approximate_size()).sum();
        total / inner.regions.len() as i64
    }

    // ---- cross-lookups ----

    pub fn get_region_stores(&self, region: &RegionInfo) -> Vec<Arc<StoreInfo>> {
        let inner = self.inner.read().unwrap();
        region
            .peers()
            .iter()
            .filter_map(|p| inner.stores.get(&p.store_id).cloned())
            .collect()
    }

    pub fn get_follower_stores(&self, region: &RegionInfo) -> Vec<Arc<StoreInfo>> {
        let inner = self.inner.read().unwrap();
        region
            .follower_peers()
            .iter()
            .filter_map(|p| inner.stores.get(&p.store_id).cloned())
            .collect()
    }

    pub fn get_leader_store(&self, region: &RegionInfo) -> Option<Arc<StoreInfo>> {
        let store_id = region.leader_store_id();
        if store_id == 0 {
            return None;
        }
        self.get_store(store_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::{Peer, RegionEpoch};
    use crate::store::StoreMeta;

    fn region(id: u64, start: &[u8], end: &[u8], version: u64) -> RegionInfo {
        let mut meta = RegionMeta::new(id, start.to_vec(), end.to_vec());
        meta.epoch = RegionEpoch::new(version, 1);
        meta.peers = vec![Peer::new(id * 10, 1)];
        RegionInfo::new(meta).with_leader(Some(Peer::new(id * 10, 1)))
    }

    #[test]
    fn search_probes_largest_start_leq_key() {
        let cluster = BasicCluster::new();
        cluster.put_region(region(1, b"", b"b", 1));
        cluster.put_region(region(2, b"b", b"d", 1));
        cluster.put_region(region(3, b"d", b"", 1));

        assert_eq!(cluster.search_region(b"a").unwrap().id(), 1);
        assert_eq!(cluster.search_region(b"b").unwrap().id(), 2);
        assert_eq!(cluster.search_region(b"c").unwrap().id(), 2);
        assert_eq!(cluster.search_region(b"zzz").unwrap().id(), 3);

        let prev = cluster.search_prev_region(b"c").unwrap();
        assert_eq!(prev.id(), 1);
        assert!(cluster.search_prev_region(b"a").is_none());
    }

    #[test]
    fn search_respects_gaps() {
        let cluster = BasicCluster::new();
        cluster.put_region(region(1, b"a", b"b", 1));
        cluster.put_region(region(2, b"m", b"n", 1));
        assert!(cluster.search_region(b"c").is_none());
        assert!(cluster.search_region(b"").is_none());
    }

    #[test]
    fn put_region_evicts_covered_ranges() {
        let cluster = BasicCluster::new();
        cluster.put_region(region(1, b"a", b"m", 1));
        cluster.put_region(region(2, b"m", b"z", 1));

        let evicted = cluster.put_region(region(3, b"a", b"z", 2));
        let mut ids: Vec<u64> = evicted.iter().map(|r| r.id()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(cluster.region_count(), 1);
        assert_eq!(cluster.search_region(b"q").unwrap().id(), 3);
        assert!(cluster.get_region(1).is_none());
    }

    #[test]
    fn put_region_same_id_updates_in_place() {
        let cluster = BasicCluster::new();
        cluster.put_region(region(1, b"a", b"m", 1));
        let evicted = cluster.put_region(region(1, b"a", b"g", 2));
        assert!(evicted.is_empty());
        assert_eq!(cluster.region_count(), 1);
        assert!(cluster.search_region(b"h").is_none());
    }

    #[test]
    fn scan_range_honors_bounds_and_limit() {
        let cluster = BasicCluster::new();
        cluster.put_region(region(1, b"", b"b", 1));
        cluster.put_region(region(2, b"b", b"d", 1));
        cluster.put_region(region(3, b"d", b"f", 1));
        cluster.put_region(region(4, b"f", b"", 1));

        let all = cluster.scan_range(b"", b"", 0);
        assert_eq!(all.len(), 4);

        let bounded = cluster.scan_range(b"a", b"e", 0);
        let ids: Vec<u64> = bounded.iter().map(|r| r.id()).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        let limited = cluster.scan_range(b"", b"", 2);
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn substore_indexes_track_roles() {
        let cluster = BasicCluster::new();
        let mut meta = RegionMeta::new(1, b"".to_vec(), b"m".to_vec());
        meta.epoch = RegionEpoch::new(1, 1);
        meta.peers = vec![Peer::new(10, 1), Peer::new(11, 2), Peer::learner(12, 3)];
        let r = RegionInfo::new(meta)
            .with_leader(Some(Peer::new(10, 1)))
            .with_pending_peers(vec![Peer::new(11, 2)]);
        cluster.put_region(r);

        assert_eq!(cluster.store_leader_count(1), 1);
        assert_eq!(cluster.store_region_count(2), 1);
        assert_eq!(cluster.store_region_count(3), 1);
        assert_eq!(cluster.store_pending_peer_count(2), 1);
        assert!(cluster
            .rand_pending_region(2, HealthPolicy::HealthyAllowPending)
            .is_none()); // learner present
    }

    #[test]
    fn rand_sampling_respects_health() {
        let cluster = BasicCluster::new();
        cluster.put_region(region(1, b"", b"m", 1));
        let picked = cluster.rand_leader_region(1, HealthPolicy::Healthy).unwrap();
        assert_eq!(picked.id(), 1);
        assert!(cluster.rand_follower_region(1, HealthPolicy::Healthy).is_none());
    }

    #[test]
    fn update_store_status_recounts() {
        let cluster = BasicCluster::new();
        cluster.put_store(crate::store::StoreInfo::new(StoreMeta::new(1, "s1")));
        cluster.put_region(region(1, b"", b"m", 1).with_approximates(64, 1000));
        cluster.put_region(region(2, b"m", b"", 1).with_approximates(32, 500));

        cluster.update_store_status(1);
        let store = cluster.get_store(1).unwrap();
        assert_eq!(store.leader_count(), 2);
        assert_eq!(store.region_count(), 2);
        assert_eq!(store.leader_size(), 96);
        assert_eq!(store.region_size(), 96);
    }
}
