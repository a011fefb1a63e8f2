//! Sliding-window hot region detection.
//!
//! Two flow kinds are tracked independently: every peer of a region absorbs
//! its writes, only the leader serves its reads. A region becomes "hot" on a
//! store once its flow beats the store-relative threshold often enough for
//! the hit counter to reach the configured threshold; falling below the
//! threshold decays the counter, and decaying to zero evicts the entry.
//!
//! `check_write`/`check_read` only compute pending updates so the caller can
//! run them in the heartbeat read phase; `update` applies them later under
//! the cache's own lock.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Instant;

use rand::Rng;

use crate::region::RegionInfo;
use crate::stats::StoresStats;

/// Regions report flow deltas on this cadence; rates are deltas divided by it.
pub const REGION_HEARTBEAT_INTERVAL_SECS: u64 = 60;

/// Entries tracked per store and flow; the threshold divisor, so a store's
/// hot bar rises with its total traffic.
const STORE_HOT_PEERS_CAP: usize = 1000;

/// Floors under which a region is never considered hot, bytes/sec.
const HOT_WRITE_MIN_FLOW_RATE: f64 = 16.0 * 1024.0;
const HOT_READ_MIN_FLOW_RATE: f64 = 128.0 * 1024.0;

/// Smoothing factor of the per-peer flow estimate.
const FLOW_ALPHA: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowKind {
    Write,
    Read,
}

impl FlowKind {
    fn min_flow_rate(self) -> f64 {
        match self {
            FlowKind::Write => HOT_WRITE_MIN_FLOW_RATE,
            FlowKind::Read => HOT_READ_MIN_FLOW_RATE,
        }
    }
}

/// Sliding-window record of one (region, store) flow.
#[derive(Debug, Clone)]
pub struct HotPeerStat {
    pub region_id: u64,
    pub store_id: u64,
    pub kind: FlowKind,
    /// Exponentially smoothed bytes/sec.
    pub flow_bytes: f64,
    /// Exponentially smoothed keys/sec.
    pub flow_keys: f64,
    pub hit_count: u64,
    pub last_update: Instant,
    pub is_leader: bool,
    /// Decayed to nothing, or the peer left the store: drop on apply.
    remove: bool,
}

impl HotPeerStat {
    pub fn is_hot(&self, hits_threshold: u64) -> bool {
        self.hit_count >= hits_threshold
    }
}

#[derive(Default)]
struct FlowMap {
    /// store id -> region id -> stat.
    peers: HashMap<u64, HashMap<u64, HotPeerStat>>,
}

impl FlowMap {
    fn apply(&mut self, item: HotPeerStat) {
        let store = self.peers.entry(item.store_id).or_default();
        if item.remove {
            store.remove(&item.region_id);
        } else {
            store.insert(item.region_id, item);
        }
    }
}

/// Hot-spot cache over both flow kinds, with its own lock.
#[derive(Default)]
pub struct HotCache {
    write_flow: RwLock<FlowMap>,
    read_flow: RwLock<FlowMap>,
}

impl HotCache {
    pub fn new() -> Self {
        HotCache::default()
    }

    /// Compute pending write-flow updates for a heartbeat. Every peer of the
    /// region is a write target.
    pub fn check_write(&self, region: &RegionInfo, stats: &StoresStats) -> Vec<HotPeerStat> {
        let targets: Vec<u64> = region.peers().iter().map(|p| p.store_id).collect();
        self.check_flow(FlowKind::Write, region, region.bytes_written(), region.keys_written(), &targets, stats)
    }

    /// Compute pending read-flow updates. Only the leader serves reads.
    pub fn check_read(&self, region: &RegionInfo, stats: &StoresStats) -> Vec<HotPeerStat> {
        let leader_store = region.leader_store_id();
        let targets = if leader_store != 0 { vec![leader_store] } else { Vec::new() };
        self.check_flow(FlowKind::Read, region, region.bytes_read(), region.keys_read(), &targets, stats)
    }

    fn check_flow(
        &self,
        kind: FlowKind,
        region: &RegionInfo,
        delta_bytes: u64,
        delta_keys: u64,
        target_stores: &[u64],
        stats: &StoresStats,
    ) -> Vec<HotPeerStat> {
        let byte_rate = delta_bytes as f64 / REGION_HEARTBEAT_INTERVAL_SECS as f64;
        let key_rate = delta_keys as f64 / REGION_HEARTBEAT_INTERVAL_SECS as f64;
        let leader_store = region.leader_store_id();

        let flow = self.flow(kind).read().unwrap();
        let mut items = Vec::new();

        for &store_id in target_stores {
            let threshold = hot_threshold(kind, store_id, stats);
            let old = flow.peers.get(&store_id).and_then(|m| m.get(&region.id()));
            match old {
                Some(old) => {
                    let hit = byte_rate >= threshold;
                    let hit_count = if hit { old.hit_count + 1 } else { old.hit_count.saturating_sub(1) };
                    items.push(HotPeerStat {
                        region_id: region.id(),
                        store_id,
                        kind,
                        flow_bytes: old.flow_bytes * (1.0 - FLOW_ALPHA) + byte_rate * FLOW_ALPHA,
                        flow_keys: old.flow_keys * (1.0 - FLOW_ALPHA) + key_rate * FLOW_ALPHA,
                        hit_count,
                        last_update: Instant::now(),
                        is_leader: store_id == leader_store,
                        remove: hit_count == 0,
                    });
                }
                None if byte_rate >= threshold => {
                    items.push(HotPeerStat {
                        region_id: region.id(),
                        store_id,
                        kind,
                        flow_bytes: byte_rate,
                        flow_keys: key_rate,
                        hit_count: 1,
                        last_update: Instant::now(),
                        is_leader: store_id == leader_store,
                        remove: false,
                    });
                }
                None => {}
            }
        }

        // Peers that migrated away still have stale entries on their old
        // stores; queue removals for them.
        for (&store_id, regions) in &flow.peers {
            if regions.contains_key(&region.id()) && !target_stores.contains(&store_id) {
                let mut stale = regions[&region.id()].clone();
                stale.remove = true;
                stale.last_update = Instant::now();
                items.push(stale);
            }
        }

        items
    }

    /// Apply a pending item computed by `check_write`/`check_read`.
    pub fn update(&self, item: HotPeerStat) {
        self.flow(item.kind).write().unwrap().apply(item);
    }

    /// True when any peer of the region is hot on either flow.
    pub fn is_region_hot(&self, region: &RegionInfo, hits_threshold: u64) -> bool {
        for kind in [FlowKind::Write, FlowKind::Read] {
            let flow = self.flow(kind).read().unwrap();
            for peer in region.peers() {
                if let Some(stat) = flow.peers.get(&peer.store_id).and_then(|m| m.get(&region.id())) {
                    if stat.is_hot(hits_threshold) {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Random hot region id on the store for the given flow kind.
    pub fn rand_hot_region_from_store(
        &self,
        store_id: u64,
        kind: FlowKind,
        hits_threshold: u64,
    ) -> Option<u64> {
        let flow = self.flow(kind).read().unwrap();
        let hot: Vec<u64> = flow
            .peers
            .get(&store_id)?
            .values()
            .filter(|s| s.is_hot(hits_threshold))
            .map(|s| s.region_id)
            .collect();
        if hot.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..hot.len());
        Some(hot[idx])
    }

    /// Snapshot of all tracked peers for one flow kind, keyed by store.
    pub fn region_stats(&self, kind: FlowKind) -> HashMap<u64, Vec<HotPeerStat>> {
        let flow = self.flow(kind).read().unwrap();
        flow.peers
            .iter()
            .map(|(&store_id, m)| (store_id, m.values().cloned().collect()))
            .collect()
    }

    fn flow(&self, kind: FlowKind) -> &RwLock<FlowMap> {
        match kind {
            FlowKind::Write => &self.write_flow,
            FlowKind::Read => &self.read_flow,
        }
    }
}

/// Store-relative hot bar: a share of the store's observed rate, floored by
/// the per-kind minimum.
fn hot_threshold(kind: FlowKind, store_id: u64, stats: &StoresStats) -> f64 {
    let store_rate = match kind {
        FlowKind::Write => stats.store_bytes_write_rate(store_id),
        FlowKind::Read => stats.store_bytes_read_rate(store_id),
    };
    (store_rate / STORE_HOT_PEERS_CAP as f64).max(kind.min_flow_rate())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::{Peer, RegionMeta};

    fn hot_region(id: u64, bytes_written: u64) -> RegionInfo {
        let mut meta = RegionMeta::new(id, vec![], vec![]);
        meta.peers = vec![Peer::new(id * 10, 1), Peer::new(id * 10 + 1, 2)];
        RegionInfo::new(meta)
            .with_leader(Some(Peer::new(id * 10, 1)))
            .with_flow(bytes_written, 0, 1000, 0)
    }

    fn feed(cache: &HotCache, stats: &StoresStats, region: &RegionInfo, times: usize) {
        for _ in 0..times {
            for item in cache.check_write(region, stats) {
                cache.update(item);
            }
        }
    }

    #[test]
    fn hot_classification_needs_sustained_hits() {
        let cache = HotCache::new();
        let stats = StoresStats::new();
        // 10 GiB written per interval, far above the floor.
        let region = hot_region(1, 10 << 30);

        feed(&cache, &stats, &region, 2);
        assert!(!cache.is_region_hot(&region, 3));
        feed(&cache, &stats, &region, 1);
        assert!(cache.is_region_hot(&region, 3));
        assert_eq!(cache.rand_hot_region_from_store(1, FlowKind::Write, 3), Some(1));
        assert_eq!(cache.rand_hot_region_from_store(1, FlowKind::Read, 3), None);
    }

    #[test]
    fn cold_flow_never_enters_cache() {
        let cache = HotCache::new();
        let stats = StoresStats::new();
        let region = hot_region(1, 1024);
        feed(&cache, &stats, &region, 5);
        assert!(!cache.is_region_hot(&region, 1));
        assert!(cache.region_stats(FlowKind::Write).is_empty() ||
            cache.region_stats(FlowKind::Write).values().all(|v| v.is_empty()));
    }

    #[test]
    fn decay_to_zero_evicts() {
        let cache = HotCache::new();
        let stats = StoresStats::new();
        let hot = hot_region(1, 10 << 30);
        feed(&cache, &stats, &hot, 3);
        assert!(cache.is_region_hot(&hot, 3));

        let cooled = hot.with_flow(0, 0, 0, 0);
        feed(&cache, &stats, &cooled, 3);
        assert!(!cache.is_region_hot(&hot, 1));
        assert!(cache
            .region_stats(FlowKind::Write)
            .values()
            .all(|v| v.is_empty()));
    }

    #[test]
    fn migrated_peer_entry_is_removed() {
        let cache = HotCache::new();
        let stats = StoresStats::new();
        let region = hot_region(1, 10 << 30);
        feed(&cache, &stats, &region, 3);

        // Peer moved off store 2 onto store 3.
        let moved = region.with_peers(vec![Peer::new(10, 1), Peer::new(12, 3)]);
        feed(&cache, &stats, &moved, 1);
        let stats_map = cache.region_stats(FlowKind::Write);
        assert!(stats_map.get(&2).map(|v| v.is_empty()).unwrap_or(true));
        assert!(stats_map.get(&3).is_some());
    }
}
