//! Cluster statistics fed by heartbeats.
//!
//! `StoresStats` keeps rolling per-store flow averages consumed by the hot
//! cache thresholds and by metrics collection. `RegionStatistics` and
//! `LabelStatistics` classify regions as heartbeats arrive so the checkers
//! and operators can ask "which regions are under-replicated" without a scan.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};

use crate::region::RegionInfo;
use crate::store::{StoreInfo, StoreStats};

/// Samples kept per rolling average.
const ROLLING_WINDOW: usize = 10;

/// Fallback when a heartbeat reports no interval.
const DEFAULT_STORE_HEARTBEAT_INTERVAL_SECS: u64 = 10;

#[derive(Debug, Clone, Default)]
struct RollingAvg {
    window: VecDeque<f64>,
}

impl RollingAvg {
    fn add(&mut self, v: f64) {
        if self.window.len() == ROLLING_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(v);
    }

    fn get(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }
}

/// Rolling flow rates of one store, bytes and keys per second.
#[derive(Debug, Clone, Default)]
pub struct RollingStoreStats {
    bytes_write_rate: RollingAvg,
    bytes_read_rate: RollingAvg,
    keys_write_rate: RollingAvg,
    keys_read_rate: RollingAvg,
}

impl RollingStoreStats {
    fn observe(&mut self, stats: &StoreStats) {
        let interval = if stats.interval_secs > 0 {
            stats.interval_secs
        } else {
            DEFAULT_STORE_HEARTBEAT_INTERVAL_SECS
        } as f64;
        self.bytes_write_rate.add(stats.bytes_written as f64 / interval);
        self.bytes_read_rate.add(stats.bytes_read as f64 / interval);
        self.keys_write_rate.add(stats.keys_written as f64 / interval);
        self.keys_read_rate.add(stats.keys_read as f64 / interval);
    }
}

/// Per-store rolling statistics for the whole cluster.
#[derive(Default)]
pub struct StoresStats {
    inner: RwLock<HashMap<u64, RollingStoreStats>>,
}

impl StoresStats {
    pub fn new() -> Self {
        StoresStats::default()
    }

    pub fn create_rolling_store_stats(&self, store_id: u64) {
        self.inner.write().unwrap().entry(store_id).or_default();
    }

    pub fn remove_rolling_store_stats(&self, store_id: u64) {
        self.inner.write().unwrap().remove(&store_id);
    }

    pub fn observe(&self, store_id: u64, stats: &StoreStats) {
        let mut inner = self.inner.write().unwrap();
        inner.entry(store_id).or_default().observe(stats);
    }

    pub fn store_bytes_write_rate(&self, store_id: u64) -> f64 {
        self.rate(store_id, |s| s.bytes_write_rate.get())
    }

    pub fn store_bytes_read_rate(&self, store_id: u64) -> f64 {
        self.rate(store_id, |s| s.bytes_read_rate.get())
    }

    pub fn store_keys_write_rate(&self, store_id: u64) -> f64 {
        self.rate(store_id, |s| s.keys_write_rate.get())
    }

    pub fn store_keys_read_rate(&self, store_id: u64) -> f64 {
        self.rate(store_id, |s| s.keys_read_rate.get())
    }

    fn rate(&self, store_id: u64, f: impl Fn(&RollingStoreStats) -> f64) -> f64 {
        self.inner
            .read()
            .unwrap()
            .get(&store_id)
            .map(f)
            .unwrap_or(0.0)
    }

    pub fn total_bytes_write_rate(&self) -> f64 {
        self.total(|s| s.bytes_write_rate.get())
    }

    pub fn total_bytes_read_rate(&self) -> f64 {
        self.total(|s| s.bytes_read_rate.get())
    }

    fn total(&self, f: impl Fn(&RollingStoreStats) -> f64) -> f64 {
        self.inner.read().unwrap().values().map(f).sum()
    }

    pub fn stores_bytes_write_stat(&self) -> HashMap<u64, u64> {
        self.snapshot(|s| s.bytes_write_rate.get() as u64)
    }

    pub fn stores_bytes_read_stat(&self) -> HashMap<u64, u64> {
        self.snapshot(|s| s.bytes_read_rate.get() as u64)
    }

    pub fn stores_keys_write_stat(&self) -> HashMap<u64, u64> {
        self.snapshot(|s| s.keys_write_rate.get() as u64)
    }

    pub fn stores_keys_read_stat(&self) -> HashMap<u64, u64> {
        self.snapshot(|s| s.keys_read_rate.get() as u64)
    }

    fn snapshot(&self, f: impl Fn(&RollingStoreStats) -> u64) -> HashMap<u64, u64> {
        self.inner
            .read()
            .unwrap()
            .iter()
            .map(|(&id, s)| (id, f(s)))
            .collect()
    }
}

/// Region placement anomalies tracked incrementally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionStatKind {
    MissPeer,
    ExtraPeer,
    DownPeer,
    PendingPeer,
    OfflinePeer,
}

const ALL_REGION_STAT_KINDS: [RegionStatKind; 5] = [
    RegionStatKind::MissPeer,
    RegionStatKind::ExtraPeer,
    RegionStatKind::DownPeer,
    RegionStatKind::PendingPeer,
    RegionStatKind::OfflinePeer,
];

/// Classifies each observed region into anomaly sets.
#[derive(Default)]
pub struct RegionStatistics {
    inner: RwLock<HashMap<RegionStatKind, HashMap<u64, Arc<RegionInfo>>>>,
}

impl RegionStatistics {
    pub fn new() -> Self {
        RegionStatistics::default()
    }

    pub fn observe(
        &self,
        region: &Arc<RegionInfo>,
        stores: &[Arc<StoreInfo>],
        max_replicas: usize,
    ) {
        let mut kinds = HashSet::new();
        let peer_count = region.peers().len();
        if peer_count < max_replicas {
            kinds.insert(RegionStatKind::MissPeer);
        } else if peer_count > max_replicas {
            kinds.insert(RegionStatKind::ExtraPeer);
        }
        if !region.down_peers().is_empty() {
            kinds.insert(RegionStatKind::DownPeer);
        }
        if !region.pending_peers().is_empty() {
            kinds.insert(RegionStatKind::PendingPeer);
        }
        if stores.iter().any(|s| s.is_offline()) {
            kinds.insert(RegionStatKind::OfflinePeer);
        }

        let mut inner = self.inner.write().unwrap();
        for kind in ALL_REGION_STAT_KINDS {
            let set = inner.entry(kind).or_default();
            if kinds.contains(&kind) {
                set.insert(region.id(), region.clone());
            } else {
                set.remove(&region.id());
            }
        }
    }

    pub fn clear_defunct_region(&self, region_id: u64) {
        let mut inner = self.inner.write().unwrap();
        for set in inner.values_mut() {
            set.remove(&region_id);
        }
    }

    pub fn regions(&self, kind: RegionStatKind) -> Vec<Arc<RegionInfo>> {
        self.inner
            .read()
            .unwrap()
            .get(&kind)
            .map(|set| set.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn count(&self, kind: RegionStatKind) -> usize {
        self.inner
            .read()
            .unwrap()
            .get(&kind)
            .map(|set| set.len())
            .unwrap_or(0)
    }
}

/// Per-region fault-domain isolation level under the configured location
/// labels. "none" means at least two peers share every label value.
#[derive(Default)]
pub struct LabelStatistics {
    inner: RwLock<LabelInner>,
}

#[derive(Default)]
struct LabelInner {
    region_level: HashMap<u64, String>,
    counts: HashMap<String, usize>,
}

impl LabelStatistics {
    pub fn new() -> Self {
        LabelStatistics::default()
    }

    pub fn observe(&self, region: &RegionInfo, stores: &[Arc<StoreInfo>], labels: &[String]) {
        let level = label_isolation_level(stores, labels);
        let mut inner = self.inner.write().unwrap();
        if let Some(old) = inner.region_level.insert(region.id(), level.clone()) {
            if let Some(c) = inner.counts.get_mut(&old) {
                *c = c.saturating_sub(1);
            }
        }
        *inner.counts.entry(level).or_insert(0) += 1;
    }

    pub fn clear_defunct_region(&self, region_id: u64) {
        let mut inner = self.inner.write().unwrap();
        if let Some(old) = inner.region_level.remove(&region_id) {
            if let Some(c) = inner.counts.get_mut(&old) {
                *c = c.saturating_sub(1);
            }
        }
    }

    pub fn counts(&self) -> HashMap<String, usize> {
        self.inner.read().unwrap().counts.clone()
    }
}

/// Deepest label level at which every pair of peer stores is distinguished;
/// "none" when no level isolates them all.
fn label_isolation_level(stores: &[Arc<StoreInfo>], labels: &[String]) -> String {
    if labels.is_empty() || stores.len() < 2 {
        return "none".to_string();
    }
    for (i, label) in labels.iter().enumerate() {
        let mut seen = HashSet::new();
        let mut isolated = true;
        for store in stores {
            let key: Vec<&str> = labels[..=i]
                .iter()
                .map(|l| store.label_value(l).unwrap_or(""))
                .collect();
            if !seen.insert(key) {
                isolated = false;
                break;
            }
        }
        if isolated {
            return label.clone();
        }
    }
    "none".to_string()
}
