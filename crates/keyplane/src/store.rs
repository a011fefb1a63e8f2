//! Store model: persisted meta, runtime status, and placement scores.
//!
//! `StoreMeta` is what survives in the metadata store; `StoreInfo` wraps it
//! with the runtime status derived from heartbeats and the region index.
//! `StoreInfo` values are immutable snapshots: every mutation goes through a
//! `with_*` setter that clones, so readers holding an `Arc<StoreInfo>` never
//! observe a torn store.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Heartbeats older than this mark the store as disconnected (but not yet
/// down) for leader-transfer decisions.
pub const STORE_DISCONNECT_DURATION: Duration = Duration::from_secs(20);

/// Score assigned to an almost-full store so that the balancer always prefers
/// draining it; free-space scores stay comfortably below this.
const MAX_SCORE: f64 = 1024.0 * 1024.0 * 1024.0;

/// Positional base of the fault-domain diversity score.
const REPLICA_BASE_SCORE: f64 = 100.0;

const MIN_WEIGHT: f64 = 1e-6;

/// Store lifecycle state. Tombstone is terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreState {
    #[default]
    Up,
    Offline,
    Tombstone,
}

impl fmt::Display for StoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreState::Up => write!(f, "up"),
            StoreState::Offline => write!(f, "offline"),
            StoreState::Tombstone => write!(f, "tombstone"),
        }
    }
}

/// Hot/cold tier tag. Anything that is not explicitly a performance store is
/// treated as storage-tier by the balancer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreType {
    #[default]
    Performance,
    Storage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreLabel {
    pub key: String,
    pub value: String,
}

impl StoreLabel {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        StoreLabel {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Persisted store descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreMeta {
    pub id: u64,
    pub address: String,
    #[serde(default)]
    pub state: StoreState,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub labels: Vec<StoreLabel>,
    #[serde(default)]
    pub store_type: StoreType,
    #[serde(default = "default_weight")]
    pub leader_weight: f64,
    #[serde(default = "default_weight")]
    pub region_weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

impl StoreMeta {
    pub fn new(id: u64, address: impl Into<String>) -> Self {
        StoreMeta {
            id,
            address: address.into(),
            state: StoreState::Up,
            version: String::new(),
            labels: Vec::new(),
            store_type: StoreType::Performance,
            leader_weight: 1.0,
            region_weight: 1.0,
        }
    }
}

/// One sampled heartbeat report from a store. Flow fields are deltas over the
/// reporting interval.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub store_id: u64,
    pub capacity: u64,
    pub available: u64,
    pub used_size: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub keys_written: u64,
    pub keys_read: u64,
    pub sending_snap_count: u64,
    pub receiving_snap_count: u64,
    pub applying_snap_count: u64,
    pub is_busy: bool,
    /// Reporting interval of the flow deltas, seconds.
    pub interval_secs: u64,
}

pub type AvailableFn = Arc<dyn Fn() -> bool + Send + Sync>;

/// In-memory store snapshot: meta + heartbeat stats + counters derived from
/// the region index.
#[derive(Clone, Default)]
pub struct StoreInfo {
    meta: StoreMeta,
    stats: StoreStats,
    leader_count: usize,
    region_count: usize,
    pending_peer_count: usize,
    leader_size: i64,
    region_size: i64,
    last_heartbeat: Option<Instant>,
    blocked: bool,
    available: Option<AvailableFn>,
}

impl Default for StoreMeta {
    fn default() -> Self {
        StoreMeta::new(0, "")
    }
}

impl fmt::Debug for StoreInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreInfo")
            .field("meta", &self.meta)
            .field("leader_count", &self.leader_count)
            .field("region_count", &self.region_count)
            .field("pending_peer_count", &self.pending_peer_count)
            .field("leader_size", &self.leader_size)
            .field("region_size", &self.region_size)
            .field("blocked", &self.blocked)
            .finish_non_exhaustive()
    }
}

impl StoreInfo {
    pub fn new(meta: StoreMeta) -> Self {
        StoreInfo {
            meta,
            ..Default::default()
        }
    }

    pub fn id(&self) -> u64 {
        self.meta.id
    }

    pub fn address(&self) -> &str {
        &self.meta.address
    }

    pub fn meta(&self) -> &StoreMeta {
        &self.meta
    }

    pub fn version(&self) -> &str {
        &self.meta.version
    }

    pub fn store_type(&self) -> StoreType {
        self.meta.store_type
    }

    pub fn state(&self) -> StoreState {
        self.meta.state
    }

    pub fn is_up(&self) -> bool {
        self.meta.state == StoreState::Up
    }

    pub fn is_offline(&self) -> bool {
        self.meta.state == StoreState::Offline
    }

    pub fn is_tombstone(&self) -> bool {
        self.meta.state == StoreState::Tombstone
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    pub fn is_busy(&self) -> bool {
        self.stats.is_busy
    }

    /// The store-limit hook: `OperatorController` attaches a closure that
    /// reports whether the store still has operator-rate budget.
    pub fn is_available(&self) -> bool {
        self.available.as_ref().map(|f| f()).unwrap_or(true)
    }

    pub fn is_overloaded(&self) -> bool {
        !self.is_available()
    }

    pub fn labels(&self) -> &[StoreLabel] {
        &self.meta.labels
    }

    pub fn label_value(&self, key: &str) -> Option<&str> {
        self.meta
            .labels
            .iter()
            .find(|l| l.key.eq_ignore_ascii_case(key))
            .map(|l| l.value.as_str())
    }

    /// Merge incoming labels into the existing set, key-wise; an incoming
    /// empty value deletes the key.
    pub fn merge_labels(&self, incoming: &[StoreLabel]) -> Vec<StoreLabel> {
        let mut merged = self.meta.labels.clone();
        for label in incoming {
            match merged
                .iter_mut()
                .find(|l| l.key.eq_ignore_ascii_case(&label.key))
            {
                Some(existing) => existing.value = label.value.clone(),
                None => merged.push(label.clone()),
            }
        }
        merged.retain(|l| !l.value.is_empty());
        merged
    }

    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    pub fn capacity(&self) -> u64 {
        self.stats.capacity
    }

    pub fn available_space(&self) -> u64 {
        self.stats.available
    }

    pub fn used_size(&self) -> u64 {
        self.stats.used_size
    }

    pub fn sending_snap_count(&self) -> u64 {
        self.stats.sending_snap_count
    }

    pub fn receiving_snap_count(&self) -> u64 {
        self.stats.receiving_snap_count
    }

    pub fn applying_snap_count(&self) -> u64 {
        self.stats.applying_snap_count
    }

    pub fn leader_count(&self) -> usize {
        self.leader_count
    }

    pub fn region_count(&self) -> usize {
        self.region_count
    }

    pub fn pending_peer_count(&self) -> usize {
        self.pending_peer_count
    }

    pub fn leader_size(&self) -> i64 {
        self.leader_size
    }

    pub fn region_size(&self) -> i64 {
        self.region_size
    }

    pub fn leader_weight(&self) -> f64 {
        self.meta.leader_weight
    }

    pub fn region_weight(&self) -> f64 {
        self.meta.region_weight
    }

    pub fn last_heartbeat(&self) -> Option<Instant> {
        self.last_heartbeat
    }

    pub fn down_time(&self) -> Duration {
        match self.last_heartbeat {
            Some(ts) => ts.elapsed(),
            None => Duration::MAX,
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.down_time() > STORE_DISCONNECT_DURATION
    }

    pub fn is_low_space(&self, low_space_ratio: f64) -> bool {
        if self.stats.capacity == 0 {
            return false;
        }
        self.storage_used_ratio() > low_space_ratio
    }

    pub fn storage_used_ratio(&self) -> f64 {
        if self.stats.capacity == 0 {
            return 0.0;
        }
        1.0 - self.stats.available as f64 / self.stats.capacity as f64
    }

    // ---- copy-on-write setters ----

    pub fn with_state(&self, state: StoreState) -> Self {
        let mut s = self.clone();
        s.meta.state = state;
        s
    }

    pub fn with_meta(&self, meta: StoreMeta) -> Self {
        let mut s = self.clone();
        s.meta = meta;
        s
    }

    pub fn with_labels(&self, labels: Vec<StoreLabel>) -> Self {
        let mut s = self.clone();
        s.meta.labels = labels;
        s
    }

    pub fn with_address(&self, address: String) -> Self {
        let mut s = self.clone();
        s.meta.address = address;
        s
    }

    pub fn with_version(&self, version: String) -> Self {
        let mut s = self.clone();
        s.meta.version = version;
        s
    }

    pub fn with_stats(&self, stats: StoreStats) -> Self {
        let mut s = self.clone();
        s.stats = stats;
        s
    }

    pub fn with_heartbeat_now(&self) -> Self {
        let mut s = self.clone();
        s.last_heartbeat = Some(Instant::now());
        s
    }

    pub fn with_counts(
        &self,
        leader_count: usize,
        region_count: usize,
        pending_peer_count: usize,
        leader_size: i64,
        region_size: i64,
    ) -> Self {
        let mut s = self.clone();
        s.leader_count = leader_count;
        s.region_count = region_count;
        s.pending_peer_count = pending_peer_count;
        s.leader_size = leader_size;
        s.region_size = region_size;
        s
    }

    pub fn with_leader_weight(&self, weight: f64) -> Self {
        let mut s = self.clone();
        s.meta.leader_weight = weight;
        s
    }

    pub fn with_region_weight(&self, weight: f64) -> Self {
        let mut s = self.clone();
        s.meta.region_weight = weight;
        s
    }

    pub fn with_blocked(&self, blocked: bool) -> Self {
        let mut s = self.clone();
        s.blocked = blocked;
        s
    }

    pub fn with_available_fn(&self, f: Option<AvailableFn>) -> Self {
        let mut s = self.clone();
        s.available = f;
        s
    }

    // ---- scores ----

    /// Region score used by the balancer to rank stores.
    ///
    /// Two regimes, joined by a linear transition so the function stays
    /// continuous: while free space is plentiful the score is simply the
    /// hosted region size (plus the projected `delta` from pending
    /// operators), and once free space falls under the low-space bound the
    /// score balloons toward `MAX_SCORE` as free space approaches zero.
    /// `delta` is in MiB and may be negative.
    pub fn region_score(&self, high_space_ratio: f64, low_space_ratio: f64, delta: i64) -> f64 {
        const MIB: f64 = (1 << 20) as f64;
        let capacity = self.stats.capacity as f64 / MIB;
        let available = self.stats.available as f64 / MIB;
        let used = self.stats.used_size as f64 / MIB;

        // Region size is logical; on-disk bytes differ by compression.
        let amplification = if self.region_size > 0 {
            (used / self.region_size as f64).max(MIN_WEIGHT)
        } else {
            1.0
        };

        let high_space_bound = (1.0 - high_space_ratio) * capacity;
        let low_space_bound = (1.0 - low_space_ratio) * capacity;
        let projected_free = available - delta as f64 / amplification;

        let score = if projected_free >= high_space_bound {
            (self.region_size + delta) as f64
        } else if projected_free <= low_space_bound {
            MAX_SCORE - projected_free
        } else {
            let x1 = high_space_bound;
            let y1 = (capacity - high_space_bound) / amplification;
            let x2 = low_space_bound;
            let y2 = MAX_SCORE - low_space_bound;
            let k = (y2 - y1) / (x2 - x1);
            k * (projected_free - x1) + y1
        };

        score / self.meta.region_weight.max(MIN_WEIGHT)
    }

    /// Leader score: count of leaders or their total size depending on the
    /// configured strategy, weighted.
    pub fn leader_score(&self, by_size: bool, delta: i64) -> f64 {
        let base = if by_size {
            self.leader_size as f64 + delta as f64
        } else {
            self.leader_count as f64 + delta as f64
        };
        base / self.meta.leader_weight.max(MIN_WEIGHT)
    }

    /// Label level at which this store first diverges from `other`; None when
    /// they share (or do not declare) every configured label.
    pub fn compare_location(&self, other: &StoreInfo, labels: &[String]) -> Option<usize> {
        for (i, key) in labels.iter().enumerate() {
            let v1 = self.label_value(key);
            let v2 = other.label_value(key);
            // An unset label counts as sharing the location.
            if let (Some(v1), Some(v2)) = (v1, v2) {
                if v1 != v2 {
                    return Some(i);
                }
            }
        }
        None
    }
}

/// Fault-domain diversity of `candidate` against the stores already hosting a
/// region's peers. Diverging at an earlier (higher-priority) label level
/// contributes a strictly larger positional weight, so placing a replica in a
/// previously-unoccupied fault domain always raises the score.
pub fn distinct_score(labels: &[String], stores: &[Arc<StoreInfo>], candidate: &StoreInfo) -> f64 {
    let mut score = 0.0;
    for store in stores {
        if store.id() == candidate.id() {
            continue;
        }
        if let Some(level) = store.compare_location(candidate, labels) {
            score += REPLICA_BASE_SCORE.powi((labels.len() - level - 1) as i32);
        }
    }
    score
}

/// Minimal `major.minor.patch` version, enough to enforce cluster-wide
/// compatibility without a semver dependency. Tolerates a leading `v` and
/// ignores any pre-release suffix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    pub fn parse(s: &str) -> Option<Version> {
        let s = s.trim().trim_start_matches('v');
        if s.is_empty() {
            return Some(Version::default());
        }
        let core = s.split(['-', '+']).next()?;
        let mut parts = core.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().unwrap_or("0").parse().ok()?;
        let patch = parts.next().unwrap_or("0").parse().ok()?;
        Some(Version {
            major,
            minor,
            patch,
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_labels(id: u64, labels: &[(&str, &str)]) -> Arc<StoreInfo> {
        let mut meta = StoreMeta::new(id, format!("127.0.0.1:{}", 20160 + id));
        meta.labels = labels
            .iter()
            .map(|(k, v)| StoreLabel::new(*k, *v))
            .collect();
        Arc::new(StoreInfo::new(meta))
    }

    #[test]
    fn distinct_score_rewards_new_fault_domains() {
        let labels = vec!["zone".to_string(), "rack".to_string()];
        let existing = vec![
            store_with_labels(1, &[("zone", "z1"), ("rack", "r1")]),
            store_with_labels(2, &[("zone", "z1"), ("rack", "r2")]),
        ];

        let same_rack = store_with_labels(3, &[("zone", "z1"), ("rack", "r1")]);
        let new_rack = store_with_labels(4, &[("zone", "z1"), ("rack", "r3")]);
        let new_zone = store_with_labels(5, &[("zone", "z2"), ("rack", "r1")]);

        let s_same = distinct_score(&labels, &existing, &same_rack);
        let s_rack = distinct_score(&labels, &existing, &new_rack);
        let s_zone = distinct_score(&labels, &existing, &new_zone);
        assert!(s_rack > s_same);
        assert!(s_zone > s_rack);
    }

    #[test]
    fn unset_label_counts_as_shared_location() {
        let labels = vec!["zone".to_string()];
        let existing = vec![store_with_labels(1, &[("zone", "z1")])];
        let unlabeled = store_with_labels(2, &[]);
        assert_eq!(distinct_score(&labels, &existing, &unlabeled), 0.0);
    }

    #[test]
    fn region_score_regimes() {
        const GIB: u64 = 1 << 30;
        let mut stats = StoreStats {
            capacity: 100 * GIB,
            available: 80 * GIB,
            used_size: 20 * GIB,
            ..Default::default()
        };
        let roomy = StoreInfo::new(StoreMeta::new(1, "a"))
            .with_stats(stats.clone())
            .with_counts(0, 10, 0, 0, 20 * 1024);
        // High-space regime: score tracks hosted size.
        assert_eq!(roomy.region_score(0.6, 0.8, 0), (20 * 1024) as f64);

        stats.available = 5 * GIB;
        stats.used_size = 95 * GIB;
        let full = StoreInfo::new(StoreMeta::new(2, "b"))
            .with_stats(stats)
            .with_counts(0, 10, 0, 0, 95 * 1024);
        // Low-space regime: score dwarfs any size-based score.
        assert!(full.region_score(0.6, 0.8, 0) > roomy.region_score(0.6, 0.8, 0) * 100.0);
    }

    #[test]
    fn merge_labels_replaces_and_deletes() {
        let store = StoreInfo::new(StoreMeta::new(1, "a")).with_labels(vec![
            StoreLabel::new("zone", "z1"),
            StoreLabel::new("rack", "r1"),
        ]);
        let merged = store.merge_labels(&[
            StoreLabel::new("rack", "r2"),
            StoreLabel::new("host", "h1"),
            StoreLabel::new("zone", ""),
        ]);
        assert_eq!(
            merged,
            vec![StoreLabel::new("rack", "r2"), StoreLabel::new("host", "h1")]
        );
    }

    #[test]
    fn version_parse_and_order() {
        assert_eq!(
            Version::parse("v3.0.4"),
            Some(Version {
                major: 3,
                minor: 0,
                patch: 4
            })
        );
        assert!(Version::parse("3.1.0-beta") > Version::parse("3.0.9"));
        assert_eq!(Version::parse(""), Some(Version::default()));
        assert_eq!(Version::parse("not-a-version"), None);
    }
}
