//! Composable store admissibility predicates.
//!
//! A filter returns true to *reject* a store; a store is admitted as a
//! source (or target) only when every filter in the stack passes it. The
//! `scope`/`kind` labels exist for telemetry so rejections can be attributed
//! to the scheduler and filter that produced them.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::namespace::Classifier;
use crate::options::{ScheduleOptions, REJECT_LEADER};
use crate::store::{distinct_score, StoreInfo};

pub trait Filter: Send + Sync {
    /// The scheduler or checker this filter acts for.
    fn scope(&self) -> &str;
    fn kind(&self) -> &'static str;
    /// True when the store must not be used as a source.
    fn source(&self, opts: &ScheduleOptions, store: &StoreInfo) -> bool;
    /// True when the store must not be used as a target.
    fn target(&self, opts: &ScheduleOptions, store: &StoreInfo) -> bool;
}

/// True when some filter rejects the store as a source.
pub fn filter_source(opts: &ScheduleOptions, store: &StoreInfo, filters: &[Box<dyn Filter>]) -> bool {
    filters.iter().any(|f| {
        let rejected = f.source(opts, store);
        if rejected {
            debug!(
                store_id = store.id(),
                scope = f.scope(),
                filter = f.kind(),
                "store rejected as source"
            );
        }
        rejected
    })
}

/// True when some filter rejects the store as a target.
pub fn filter_target(opts: &ScheduleOptions, store: &StoreInfo, filters: &[Box<dyn Filter>]) -> bool {
    filters.iter().any(|f| {
        let rejected = f.target(opts, store);
        if rejected {
            debug!(
                store_id = store.id(),
                scope = f.scope(),
                filter = f.kind(),
                "store rejected as target"
            );
        }
        rejected
    })
}

/// Explicit store-id exclusion, separately for each side.
pub struct ExcludedFilter {
    scope: String,
    sources: HashSet<u64>,
    targets: HashSet<u64>,
}

impl ExcludedFilter {
    pub fn new(scope: &str, sources: HashSet<u64>, targets: HashSet<u64>) -> Self {
        ExcludedFilter {
            scope: scope.to_string(),
            sources,
            targets,
        }
    }
}

impl Filter for ExcludedFilter {
    fn scope(&self) -> &str {
        &self.scope
    }

    fn kind(&self) -> &'static str {
        "exclude-filter"
    }

    fn source(&self, _opts: &ScheduleOptions, store: &StoreInfo) -> bool {
        self.sources.contains(&store.id())
    }

    fn target(&self, _opts: &ScheduleOptions, store: &StoreInfo) -> bool {
        self.targets.contains(&store.id())
    }
}

/// Rejects stores whose operator-rate budget is exhausted.
pub struct OverloadFilter {
    scope: String,
}

impl OverloadFilter {
    pub fn new(scope: &str) -> Self {
        OverloadFilter { scope: scope.to_string() }
    }
}

impl Filter for OverloadFilter {
    fn scope(&self) -> &str {
        &self.scope
    }

    fn kind(&self) -> &'static str {
        "overload-filter"
    }

    fn source(&self, _opts: &ScheduleOptions, store: &StoreInfo) -> bool {
        store.is_overloaded()
    }

    fn target(&self, _opts: &ScheduleOptions, store: &StoreInfo) -> bool {
        store.is_overloaded()
    }
}

/// Basic lifecycle filter: tombstones never participate, targets must be up.
pub struct StateFilter {
    scope: String,
}

impl StateFilter {
    pub fn new(scope: &str) -> Self {
        StateFilter { scope: scope.to_string() }
    }
}

impl Filter for StateFilter {
    fn scope(&self) -> &str {
        &self.scope
    }

    fn kind(&self) -> &'static str {
        "state-filter"
    }

    fn source(&self, _opts: &ScheduleOptions, store: &StoreInfo) -> bool {
        store.is_tombstone()
    }

    fn target(&self, _opts: &ScheduleOptions, store: &StoreInfo) -> bool {
        !store.is_up()
    }
}

/// Rejects busy stores and stores that have been silent too long.
pub struct HealthFilter {
    scope: String,
}

impl HealthFilter {
    pub fn new(scope: &str) -> Self {
        HealthFilter { scope: scope.to_string() }
    }

    fn filter(&self, opts: &ScheduleOptions, store: &StoreInfo) -> bool {
        store.is_busy() || store.down_time() > opts.max_store_down_time()
    }
}

impl Filter for HealthFilter {
    fn scope(&self) -> &str {
        &self.scope
    }

    fn kind(&self) -> &'static str {
        "health-filter"
    }

    fn source(&self, opts: &ScheduleOptions, store: &StoreInfo) -> bool {
        self.filter(opts, store)
    }

    fn target(&self, opts: &ScheduleOptions, store: &StoreInfo) -> bool {
        self.filter(opts, store)
    }
}

/// Rejects stores working through too many pending peers. A zero limit
/// disables the check.
pub struct PendingPeerCountFilter {
    scope: String,
}

impl PendingPeerCountFilter {
    pub fn new(scope: &str) -> Self {
        PendingPeerCountFilter { scope: scope.to_string() }
    }

    fn filter(&self, opts: &ScheduleOptions, store: &StoreInfo) -> bool {
        let max = opts.max_pending_peer_count();
        max > 0 && store.pending_peer_count() as u64 > max
    }
}

impl Filter for PendingPeerCountFilter {
    fn scope(&self) -> &str {
        &self.scope
    }

    fn kind(&self) -> &'static str {
        "pending-peer-filter"
    }

    fn source(&self, opts: &ScheduleOptions, store: &StoreInfo) -> bool {
        self.filter(opts, store)
    }

    fn target(&self, opts: &ScheduleOptions, store: &StoreInfo) -> bool {
        self.filter(opts, store)
    }
}

/// Rejects stores with too many snapshots in flight in any direction.
pub struct SnapshotCountFilter {
    scope: String,
}

impl SnapshotCountFilter {
    pub fn new(scope: &str) -> Self {
        SnapshotCountFilter { scope: scope.to_string() }
    }

    fn filter(&self, opts: &ScheduleOptions, store: &StoreInfo) -> bool {
        let max = opts.max_snapshot_count();
        store.sending_snap_count() > max
            || store.receiving_snap_count() > max
            || store.applying_snap_count() > max
    }
}

impl Filter for SnapshotCountFilter {
    fn scope(&self) -> &str {
        &self.scope
    }

    fn kind(&self) -> &'static str {
        "snapshot-filter"
    }

    fn source(&self, opts: &ScheduleOptions, store: &StoreInfo) -> bool {
        self.filter(opts, store)
    }

    fn target(&self, opts: &ScheduleOptions, store: &StoreInfo) -> bool {
        self.filter(opts, store)
    }
}

/// TTL'd set of store ids, shared between a scheduler's passes.
#[derive(Default)]
pub struct TtlCache {
    ttl: Duration,
    entries: Mutex<HashMap<u64, Instant>>,
}

impl TtlCache {
    pub fn new(ttl: Duration) -> Self {
        TtlCache {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn put(&self, id: u64) {
        self.entries.lock().unwrap().insert(id, Instant::now());
    }

    pub fn remove(&self, id: u64) {
        self.entries.lock().unwrap().remove(&id);
    }

    pub fn contains(&self, id: u64) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(&id) {
            Some(at) if at.elapsed() <= self.ttl => true,
            Some(_) => {
                entries.remove(&id);
                false
            }
            None => false,
        }
    }
}

/// Rejects sources recently written into a taint cache; targets pass.
pub struct CacheFilter {
    scope: String,
    cache: Arc<TtlCache>,
}

impl CacheFilter {
    pub fn new(scope: &str, cache: Arc<TtlCache>) -> Self {
        CacheFilter {
            scope: scope.to_string(),
            cache,
        }
    }
}

impl Filter for CacheFilter {
    fn scope(&self) -> &str {
        &self.scope
    }

    fn kind(&self) -> &'static str {
        "cache-filter"
    }

    fn source(&self, _opts: &ScheduleOptions, store: &StoreInfo) -> bool {
        self.cache.contains(store.id())
    }

    fn target(&self, _opts: &ScheduleOptions, _store: &StoreInfo) -> bool {
        false
    }
}

/// Rejects almost-full targets; draining a full store is always allowed.
pub struct StorageThresholdFilter {
    scope: String,
}

impl StorageThresholdFilter {
    pub fn new(scope: &str) -> Self {
        StorageThresholdFilter { scope: scope.to_string() }
    }
}

impl Filter for StorageThresholdFilter {
    fn scope(&self) -> &str {
        &self.scope
    }

    fn kind(&self) -> &'static str {
        "storage-threshold-filter"
    }

    fn source(&self, _opts: &ScheduleOptions, _store: &StoreInfo) -> bool {
        false
    }

    fn target(&self, opts: &ScheduleOptions, store: &StoreInfo) -> bool {
        store.is_low_space(opts.low_space_ratio())
    }
}

/// Guards fault-domain diversity: a target whose distinct score against the
/// region's other peers falls below the source's is rejected, so replacing
/// the source peer never worsens isolation.
pub struct DistinctScoreFilter {
    scope: String,
    labels: Vec<String>,
    stores: Vec<Arc<StoreInfo>>,
    safe_score: f64,
}

impl DistinctScoreFilter {
    pub fn new(
        scope: &str,
        labels: Vec<String>,
        region_stores: &[Arc<StoreInfo>],
        source: &StoreInfo,
    ) -> Self {
        let others: Vec<Arc<StoreInfo>> = region_stores
            .iter()
            .filter(|s| s.id() != source.id())
            .cloned()
            .collect();
        let safe_score = distinct_score(&labels, &others, source);
        DistinctScoreFilter {
            scope: scope.to_string(),
            labels,
            stores: others,
            safe_score,
        }
    }
}

impl Filter for DistinctScoreFilter {
    fn scope(&self) -> &str {
        &self.scope
    }

    fn kind(&self) -> &'static str {
        "distinct-filter"
    }

    fn source(&self, _opts: &ScheduleOptions, _store: &StoreInfo) -> bool {
        false
    }

    fn target(&self, _opts: &ScheduleOptions, store: &StoreInfo) -> bool {
        distinct_score(&self.labels, &self.stores, store) < self.safe_score
    }
}

/// Keeps scheduling inside one namespace.
pub struct NamespaceFilter {
    scope: String,
    classifier: Arc<dyn Classifier>,
    namespace: String,
}

impl NamespaceFilter {
    pub fn new(scope: &str, classifier: Arc<dyn Classifier>, namespace: String) -> Self {
        NamespaceFilter {
            scope: scope.to_string(),
            classifier,
            namespace,
        }
    }

    fn filter(&self, store: &StoreInfo) -> bool {
        self.classifier.store_namespace(store) != self.namespace
    }
}

impl Filter for NamespaceFilter {
    fn scope(&self) -> &str {
        &self.scope
    }

    fn kind(&self) -> &'static str {
        "namespace-filter"
    }

    fn source(&self, _opts: &ScheduleOptions, store: &StoreInfo) -> bool {
        self.filter(store)
    }

    fn target(&self, _opts: &ScheduleOptions, store: &StoreInfo) -> bool {
        self.filter(store)
    }
}

/// The composite state filter used by the balancers; which checks apply
/// depends on what the schedule intends to do with the store.
pub struct StoreStateFilter {
    pub scope: String,
    /// The schedule moves a leader.
    pub transfer_leader: bool,
    /// The schedule moves a peer.
    pub move_region: bool,
}

impl StoreStateFilter {
    fn move_region_unfit(&self, opts: &ScheduleOptions, store: &StoreInfo) -> bool {
        if store.is_busy() || store.is_overloaded() {
            return true;
        }
        let max = opts.max_snapshot_count();
        store.sending_snap_count() > max
            || store.receiving_snap_count() > max
            || store.applying_snap_count() > max
    }
}

impl Filter for StoreStateFilter {
    fn scope(&self) -> &str {
        &self.scope
    }

    fn kind(&self) -> &'static str {
        "store-state-filter"
    }

    fn source(&self, opts: &ScheduleOptions, store: &StoreInfo) -> bool {
        if store.is_tombstone() || store.down_time() > opts.max_store_down_time() {
            return true;
        }
        if self.transfer_leader && (store.is_disconnected() || store.is_blocked()) {
            return true;
        }
        self.move_region && self.move_region_unfit(opts, store)
    }

    fn target(&self, opts: &ScheduleOptions, store: &StoreInfo) -> bool {
        if store.is_tombstone()
            || store.is_offline()
            || store.down_time() > opts.max_store_down_time()
        {
            return true;
        }
        if self.transfer_leader
            && (store.is_disconnected()
                || store.is_blocked()
                || store.is_busy()
                || opts.check_label_property(REJECT_LEADER, store.labels()))
        {
            return true;
        }
        if self.move_region {
            // Pending peers pile up on slow disks; only targets care.
            let max_pending = opts.max_pending_peer_count();
            if max_pending > 0 && store.pending_peer_count() as u64 > max_pending {
                return true;
            }
            if self.move_region_unfit(opts, store) {
                return true;
            }
        }
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlacklistSide {
    Source,
    Target,
    Both,
}

/// Rejects blacklisted stores on the configured side(s).
pub struct BlacklistFilter {
    scope: String,
    side: BlacklistSide,
    blacklist: Mutex<HashSet<u64>>,
}

impl BlacklistFilter {
    pub fn new(scope: &str, side: BlacklistSide) -> Self {
        BlacklistFilter {
            scope: scope.to_string(),
            side,
            blacklist: Mutex::new(HashSet::new()),
        }
    }

    pub fn add(&self, store_id: u64) {
        self.blacklist.lock().unwrap().insert(store_id);
    }

    fn listed(&self, store: &StoreInfo) -> bool {
        self.blacklist.lock().unwrap().contains(&store.id())
    }
}

impl Filter for BlacklistFilter {
    fn scope(&self) -> &str {
        &self.scope
    }

    fn kind(&self) -> &'static str {
        "blacklist-store-filter"
    }

    fn source(&self, _opts: &ScheduleOptions, store: &StoreInfo) -> bool {
        matches!(self.side, BlacklistSide::Source | BlacklistSide::Both) && self.listed(store)
    }

    fn target(&self, _opts: &ScheduleOptions, store: &StoreInfo) -> bool {
        matches!(self.side, BlacklistSide::Target | BlacklistSide::Both) && self.listed(store)
    }
}
