//! The coordinator's authoritative cluster: heartbeat ingestion, store
//! lifecycle, bootstrap, and the background workers.
//!
//! The region heartbeat path computes its decision flags against a read
//! snapshot, persists outside any lock, and only then mutates the cache.
//! Persistence failures on this path are logged and swallowed: the in-memory
//! state stays authoritative and the worst case is a longer warm-up after
//! restart. Admin paths (store create/remove, bootstrap) propagate
//! persistence errors and leave memory untouched.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::basic_cluster::{BasicCluster, HealthPolicy};
use crate::error::{Error, Result};
use crate::hot_cache::{FlowKind, HotCache, HotPeerStat};
use crate::id::IdAllocator;
use crate::namespace::{Classifier, DefaultClassifier};
use crate::operator::{OpInfluence, OpStep};
use crate::operator_controller::OperatorController;
use crate::options::{ScheduleConfig, ScheduleOptions};
use crate::region::{Peer, RegionInfo, RegionMeta};
use crate::scheduler::PlacementView;
use crate::stats::{LabelStatistics, RegionStatistics, StoresStats};
use crate::storage::{ClusterMeta, MetaStorage, PersistedOptions};
use crate::store::{StoreInfo, StoreMeta, StoreStats, Version};

/// Bound of the best-effort changed-regions channel.
const CHANGED_REGIONS_LIMIT: usize = 10_000;

/// Cadence of store health checks, metrics collection, and history pruning.
const BACKGROUND_JOB_INTERVAL: Duration = Duration::from_secs(60);

/// Scheduling starts once this share of known regions has heartbeated, per
/// store and in total, or after the collect timeout.
const COLLECT_FACTOR: f64 = 0.8;
const COLLECT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// A bootstrap request: exactly one store holding exactly one region that
/// spans the whole key space.
#[derive(Debug, Clone)]
pub struct BootstrapRequest {
    pub store: StoreMeta,
    pub region: RegionMeta,
}

pub struct RaftCluster {
    cluster_id: u64,
    core: BasicCluster,
    opts: Arc<ScheduleOptions>,
    storage: Arc<MetaStorage>,
    classifier: Arc<dyn Classifier>,
    id_alloc: IdAllocator,
    stores_stats: StoresStats,
    hot_cache: HotCache,
    region_stats: RegionStatistics,
    label_stats: LabelStatistics,
    op_controller: Arc<OperatorController>,
    prepare: Mutex<PrepareChecker>,
    changed_regions_tx: mpsc::Sender<Arc<RegionInfo>>,
    changed_regions_rx: Mutex<Option<mpsc::Receiver<Arc<RegionInfo>>>>,
    quit_tx: Mutex<Option<watch::Sender<bool>>>,
}

impl RaftCluster {
    pub fn new(
        cluster_id: u64,
        opts: Arc<ScheduleOptions>,
        storage: Arc<MetaStorage>,
    ) -> Result<Arc<Self>> {
        Self::with_classifier(cluster_id, opts, storage, Arc::new(DefaultClassifier))
    }

    pub fn with_classifier(
        cluster_id: u64,
        opts: Arc<ScheduleOptions>,
        storage: Arc<MetaStorage>,
        classifier: Arc<dyn Classifier>,
    ) -> Result<Arc<Self>> {
        let id_alloc = IdAllocator::new(storage.clone())?;
        let (tx, rx) = mpsc::channel(CHANGED_REGIONS_LIMIT);
        let cluster = Arc::new(RaftCluster {
            cluster_id,
            core: BasicCluster::new(),
            op_controller: OperatorController::new(opts.clone()),
            opts,
            storage,
            classifier,
            id_alloc,
            stores_stats: StoresStats::new(),
            hot_cache: HotCache::new(),
            region_stats: RegionStatistics::new(),
            label_stats: LabelStatistics::new(),
            prepare: Mutex::new(PrepareChecker::new()),
            changed_regions_tx: tx,
            changed_regions_rx: Mutex::new(Some(rx)),
            quit_tx: Mutex::new(None),
        });
        cluster.load_cluster_info()?;
        Ok(cluster)
    }

    pub fn cluster_id(&self) -> u64 {
        self.cluster_id
    }

    pub fn core(&self) -> &BasicCluster {
        &self.core
    }

    pub fn operator_controller(&self) -> Arc<OperatorController> {
        self.op_controller.clone()
    }

    pub fn schedule_options(&self) -> Arc<ScheduleOptions> {
        self.opts.clone()
    }

    pub fn storage(&self) -> Arc<MetaStorage> {
        self.storage.clone()
    }

    pub fn hot_cache(&self) -> &HotCache {
        &self.hot_cache
    }

    pub fn region_statistics(&self) -> &RegionStatistics {
        &self.region_stats
    }

    pub fn is_bootstrapped(&self) -> Result<bool> {
        Ok(self.storage.load_cluster_meta()?.is_some())
    }

    /// Warm the cache from the metadata store.
    fn load_cluster_info(&self) -> Result<()> {
        let start = Instant::now();
        let stores = self.storage.load_stores()?;
        let store_count = stores.len();
        for meta in stores {
            self.stores_stats.create_rolling_store_stats(meta.id);
            self.core.put_store(StoreInfo::new(meta));
        }
        info!(count = store_count, cost = ?start.elapsed(), "loaded stores");

        let start = Instant::now();
        let regions = self.storage.load_regions()?;
        let region_count = regions.len();
        for meta in regions {
            self.core.put_region(RegionInfo::new(meta));
        }
        info!(count = region_count, cost = ?start.elapsed(), "loaded regions");
        Ok(())
    }

    // ---- bootstrap ----

    pub fn check_bootstrap_request(req: &BootstrapRequest) -> Result<()> {
        if req.store.id == 0 {
            return Err(Error::validation("invalid zero store id"));
        }
        if req.region.id == 0 {
            return Err(Error::validation("invalid zero region id"));
        }
        if !req.region.start_key.is_empty() || !req.region.end_key.is_empty() {
            return Err(Error::validation(
                "invalid first region key range, must all be empty",
            ));
        }
        if req.region.peers.len() != 1 {
            return Err(Error::validation(format!(
                "invalid first region peer count {}, must be 1",
                req.region.peers.len()
            )));
        }
        let peer = &req.region.peers[0];
        if peer.store_id != req.store.id {
            return Err(Error::validation(format!(
                "invalid peer store id {} != {}",
                peer.store_id, req.store.id
            )));
        }
        if peer.id == 0 {
            return Err(Error::validation("invalid zero peer id"));
        }
        Ok(())
    }

    pub fn bootstrap(&self, req: BootstrapRequest) -> Result<()> {
        Self::check_bootstrap_request(&req)?;
        if self.is_bootstrapped()? {
            return Err(Error::validation(format!(
                "cluster {} is already bootstrapped",
                self.cluster_id
            )));
        }

        let meta = ClusterMeta {
            id: self.cluster_id,
            max_peer_count: self.opts.max_replicas() as u64,
        };
        self.storage.save_cluster_meta(&meta)?;
        self.storage.save_store(&req.store)?;
        self.storage.save_region(&req.region)?;
        let now_ms = unix_time_ms();
        self.storage.save_bootstrap_time(now_ms)?;

        self.stores_stats.create_rolling_store_stats(req.store.id);
        self.core.put_store(StoreInfo::new(req.store).with_heartbeat_now());
        self.core.put_region(RegionInfo::new(req.region));
        info!(cluster_id = self.cluster_id, "cluster bootstrapped");
        Ok(())
    }

    // ---- heartbeats ----

    pub fn handle_store_heartbeat(&self, stats: &StoreStats) -> Result<()> {
        let store = self
            .core
            .get_store(stats.store_id)
            .ok_or(Error::StoreNotFound(stats.store_id))?;
        let updated = store.with_stats(stats.clone()).with_heartbeat_now();
        self.core.put_store(updated);
        self.stores_stats.observe(stats.store_id, stats);
        Ok(())
    }

    /// Apply a region heartbeat and hand back the next operator step the
    /// region should execute, if one is live.
    pub fn region_heartbeat(&self, region: RegionInfo) -> Result<Option<OpStep>> {
        self.process_region_heartbeat(region.clone())?;
        Ok(self.op_controller.dispatch(&region))
    }

    /// The heartbeat state machine. Decision flags are computed against a
    /// read snapshot, persistence happens outside the cache lock, then the
    /// cache is mutated.
    pub fn process_region_heartbeat(&self, region: RegionInfo) -> Result<()> {
        let origin = self.core.get_region(region.id());
        if origin.is_none() {
            for item in self.core.get_overlaps(region.meta()) {
                if region.epoch().version < item.epoch().version {
                    return Err(Error::RegionStale {
                        incoming_id: region.id(),
                        incoming: region.epoch(),
                        existing_id: item.id(),
                        existing: item.epoch(),
                    });
                }
            }
        }
        let write_items = self.hot_cache.check_write(&region, &self.stores_stats);
        let read_items = self.hot_cache.check_read(&region, &self.stores_stats);

        // Save to storage when the meta changed; save to cache when meta,
        // leader, flow, or transient peer state changed; is_new marks the
        // first report with a usable leader.
        let mut save_kv = false;
        let mut save_cache = false;
        let mut is_new = false;
        match &origin {
            None => {
                debug!(region_id = region.id(), "insert new region");
                save_kv = true;
                save_cache = true;
                is_new = true;
            }
            Some(origin) => {
                let r = region.epoch();
                let o = origin.epoch();
                if r.version < o.version || r.conf_ver < o.conf_ver {
                    return Err(Error::RegionStale {
                        incoming_id: region.id(),
                        incoming: r,
                        existing_id: origin.id(),
                        existing: o,
                    });
                }
                if r.version > o.version {
                    info!(
                        region_id = region.id(),
                        old_version = o.version,
                        new_version = r.version,
                        "region version changed"
                    );
                    save_kv = true;
                    save_cache = true;
                }
                if r.conf_ver > o.conf_ver {
                    info!(
                        region_id = region.id(),
                        old_conf_ver = o.conf_ver,
                        new_conf_ver = r.conf_ver,
                        "region conf version changed"
                    );
                    save_kv = true;
                    save_cache = true;
                }
                if region.leader_id() != origin.leader_id() {
                    if origin.leader_id() == 0 {
                        is_new = true;
                    } else {
                        info!(
                            region_id = region.id(),
                            from = origin.leader_store_id(),
                            to = region.leader_store_id(),
                            "leader changed"
                        );
                    }
                    save_cache = true;
                }
                if !region.down_peers().is_empty() || !region.pending_peers().is_empty() {
                    save_cache = true;
                }
                if !origin.down_peers().is_empty() || !origin.pending_peers().is_empty() {
                    save_cache = true;
                }
                if region.peers().len() != origin.peers().len() {
                    save_kv = true;
                    save_cache = true;
                }
                if region.approximate_size() != origin.approximate_size()
                    || region.approximate_keys() != origin.approximate_keys()
                {
                    save_cache = true;
                }
                if region.bytes_written() != origin.bytes_written()
                    || region.bytes_read() != origin.bytes_read()
                    || region.keys_written() != origin.keys_written()
                    || region.keys_read() != origin.keys_read()
                {
                    save_cache = true;
                }
            }
        }

        if save_kv {
            if let Err(err) = self.storage.save_region(region.meta()) {
                // Missing a save only slows warm-up after a restart; the
                // in-memory state stays authoritative.
                error!(region_id = region.id(), error = %err, "failed to save region to storage");
            }
            let _ = self.changed_regions_tx.try_send(Arc::new(region.clone()));
        }
        if write_items.is_empty() && read_items.is_empty() && !save_cache && !is_new {
            return Ok(());
        }

        if is_new {
            self.prepare.lock().unwrap().collect(&region);
        }

        if save_cache {
            let overlaps = self.core.put_region(region.clone());
            for item in &overlaps {
                if let Err(err) = self.storage.delete_region(item.id()) {
                    error!(region_id = item.id(), error = %err, "failed to delete region from storage");
                }
                self.region_stats.clear_defunct_region(item.id());
                self.label_stats.clear_defunct_region(item.id());
            }

            let mut touched: BTreeSet<u64> = region.store_ids().into_iter().collect();
            if let Some(origin) = &origin {
                touched.extend(origin.store_ids());
            }
            for store_id in touched {
                self.core.update_store_status(store_id);
            }
        }

        if let Some(cached) = self.core.get_region(region.id()) {
            let stores = self.core.get_region_stores(&cached);
            self.region_stats
                .observe(&cached, &stores, self.opts.max_replicas());
            self.label_stats
                .observe(&cached, &stores, &self.opts.location_labels());
        }

        for item in write_items {
            self.hot_cache.update(item);
        }
        for item in read_items {
            self.hot_cache.update(item);
        }
        Ok(())
    }

    // ---- store admin ----

    pub fn put_store(&self, meta: StoreMeta) -> Result<()> {
        if meta.id == 0 {
            return Err(Error::validation(format!("invalid put store {meta:?}")));
        }
        let version = Version::parse(&meta.version)
            .ok_or_else(|| Error::validation(format!("invalid store version {:?}", meta.version)))?;
        let cluster_version = self.opts.cluster_version();
        if version < cluster_version {
            return Err(Error::validation(format!(
                "store version {version} is older than cluster version {cluster_version}"
            )));
        }

        // A new store may reuse the address of a removed one, never of a
        // live one.
        for existing in self.core.get_stores() {
            if existing.is_tombstone() {
                continue;
            }
            if existing.id() != meta.id && existing.address() == meta.address {
                return Err(Error::validation(format!(
                    "duplicated store address {}, already registered by store {}",
                    meta.address,
                    existing.id()
                )));
            }
        }

        let store = match self.core.get_store(meta.id) {
            None => StoreInfo::new(meta).with_heartbeat_now(),
            Some(existing) => {
                if existing.is_tombstone() {
                    return Err(Error::StoreTombstoned(meta.id));
                }
                let labels = existing.merge_labels(&meta.labels);
                existing
                    .with_address(meta.address)
                    .with_version(meta.version)
                    .with_labels(labels)
            }
        };

        self.check_store_labels(&store)?;
        self.put_store_inner(store)
    }

    fn check_store_labels(&self, store: &StoreInfo) -> Result<()> {
        let location_labels = self.opts.location_labels();
        let strict = self.opts.strictly_match_label();
        for key in &location_labels {
            if store.label_value(key).is_none() {
                warn!(store_id = store.id(), label_key = %key, "store is missing a location label");
                if strict {
                    return Err(Error::validation(format!(
                        "label configuration is incorrect, need to specify the key {key:?}"
                    )));
                }
            }
        }
        for label in store.labels() {
            if !location_labels.iter().any(|k| k.eq_ignore_ascii_case(&label.key)) {
                warn!(store_id = store.id(), label_key = %label.key, "store label key is not configured");
                if strict {
                    return Err(Error::validation(format!(
                        "unknown store label key {:?}",
                        label.key
                    )));
                }
            }
        }
        Ok(())
    }

    fn put_store_inner(&self, store: StoreInfo) -> Result<()> {
        self.storage.save_store(store.meta())?;
        self.stores_stats.create_rolling_store_stats(store.id());
        self.core.put_store(store);
        Ok(())
    }

    /// Up -> Offline. Removing an already offline store is a no-op.
    pub fn remove_store(&self, store_id: u64) -> Result<()> {
        let store = self
            .core
            .get_store(store_id)
            .ok_or(Error::StoreNotFound(store_id))?;
        if store.is_offline() {
            return Ok(());
        }
        if store.is_tombstone() {
            return Err(Error::StoreTombstoned(store_id));
        }
        let updated = store.with_state(crate::store::StoreState::Offline);
        warn!(store_id, address = updated.address(), "store has been offlined");
        self.put_store_inner(updated)
    }

    /// Offline -> Tombstone, or Up -> Tombstone when forced.
    pub fn bury_store(&self, store_id: u64, force: bool) -> Result<()> {
        let store = self
            .core
            .get_store(store_id)
            .ok_or(Error::StoreNotFound(store_id))?;
        if store.is_tombstone() {
            return Ok(());
        }
        if store.is_up() {
            if !force {
                return Err(Error::validation(
                    "store is still up, please remove it gracefully first",
                ));
            }
            warn!(store_id, "forcibly burying an up store");
        }
        let updated = store.with_state(crate::store::StoreState::Tombstone);
        warn!(store_id, address = updated.address(), "store has been tombstoned");
        self.put_store_inner(updated)
    }

    pub fn set_store_weight(&self, store_id: u64, leader_weight: f64, region_weight: f64) -> Result<()> {
        let store = self
            .core
            .get_store(store_id)
            .ok_or(Error::StoreNotFound(store_id))?;
        let updated = store
            .with_leader_weight(leader_weight)
            .with_region_weight(region_weight);
        self.put_store_inner(updated)
    }

    pub fn block_store(&self, store_id: u64) -> Result<()> {
        self.core.block_store(store_id)
    }

    pub fn unblock_store(&self, store_id: u64) {
        self.core.unblock_store(store_id)
    }

    pub fn update_store_labels(&self, store_id: u64, labels: Vec<crate::store::StoreLabel>) -> Result<()> {
        let store = self
            .core
            .get_store(store_id)
            .ok_or(Error::StoreNotFound(store_id))?;
        let mut meta = store.meta().clone();
        meta.labels = labels;
        // put_store performs the label merge and strict checks.
        self.put_store(meta)
    }

    /// Validate, persist, then swap in a new schedule config. A persistence
    /// failure propagates and leaves the running options untouched.
    pub fn update_schedule_config(
        &self,
        config: ScheduleConfig,
        scheduler_registered: impl Fn(&str) -> bool,
    ) -> Result<()> {
        config.validate(&scheduler_registered)?;
        self.storage.save_options(&PersistedOptions {
            schedule: config.clone(),
            replication: self.opts.replication().as_ref().clone(),
        })?;
        self.opts.update_schedule(config, scheduler_registered)
    }

    /// Drop every tombstoned store from cache and storage and release its
    /// operator-rate budget.
    pub fn remove_tombstone_records(&self) -> Result<()> {
        for store in self.core.get_stores() {
            if !store.is_tombstone() {
                continue;
            }
            self.storage.delete_store(store.id())?;
            self.core.delete_store(store.id());
            self.stores_stats.remove_rolling_store_stats(store.id());
            self.op_controller.remove_store_limit(store.id());
            info!(store_id = store.id(), address = store.address(), "tombstone store removed");
        }
        Ok(())
    }

    /// Background store sweep: bury drained offline stores, warn when the
    /// cluster cannot absorb the replicas of the rest.
    pub fn check_stores(&self) {
        let mut offline_pending = Vec::new();
        let mut up_count = 0;
        for store in self.core.get_stores() {
            if store.is_tombstone() {
                continue;
            }
            if store.is_up() {
                if !store.is_low_space(self.opts.low_space_ratio()) {
                    up_count += 1;
                }
                continue;
            }
            // Offline: bury once it holds nothing.
            if self.core.store_region_count(store.id()) == 0 {
                if let Err(err) = self.bury_store(store.id(), false) {
                    error!(store_id = store.id(), error = %err, "bury store failed");
                }
            } else {
                offline_pending.push(store.id());
            }
        }

        if !offline_pending.is_empty() && up_count < self.opts.max_replicas() {
            for store_id in offline_pending {
                warn!(
                    store_id,
                    "store cannot turn tombstone, not enough healthy stores to take its replicas"
                );
            }
        }
    }

    /// Ratchet the cluster version up to the minimum version across live
    /// stores.
    pub fn on_store_version_change(&self) {
        let mut min_version: Option<Version> = None;
        for store in self.core.get_stores() {
            if store.is_tombstone() {
                continue;
            }
            let Some(v) = Version::parse(store.version()) else {
                continue;
            };
            min_version = Some(match min_version {
                Some(m) if m <= v => m,
                _ => v,
            });
        }
        if let Some(min_version) = min_version {
            if self.opts.ratchet_cluster_version(min_version) {
                info!(version = %min_version, "cluster version changed");
            }
        }
    }

    pub fn is_prepared(&self) -> bool {
        self.prepare.lock().unwrap().check(&self.core)
    }

    // ---- workers ----

    /// Spawn the background jobs and the region syncer. The coordinator is
    /// spawned separately so tests can drive scheduling by hand.
    pub fn start(self: &Arc<Self>) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        *self.quit_tx.lock().unwrap() = Some(tx);

        let cluster = self.clone();
        let mut quit = rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(BACKGROUND_JOB_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        cluster.check_stores();
                        cluster.on_store_version_change();
                        cluster.op_controller.prune_history();
                        cluster.log_cluster_stats();
                    }
                    _ = quit.changed() => {
                        info!("background jobs stopped");
                        return;
                    }
                }
            }
        });

        if let Some(mut changed) = self.changed_regions_rx.lock().unwrap().take() {
            let mut quit = rx.clone();
            tokio::spawn(async move {
                let mut synced: u64 = 0;
                loop {
                    tokio::select! {
                        region = changed.recv() => {
                            match region {
                                Some(region) => {
                                    synced += 1;
                                    debug!(region_id = region.id(), synced, "region change drained");
                                }
                                None => return,
                            }
                        }
                        _ = quit.changed() => {
                            info!(synced, "region syncer stopped");
                            return;
                        }
                    }
                }
            });
        }

        rx
    }

    pub fn stop(&self) {
        if let Some(tx) = self.quit_tx.lock().unwrap().take() {
            let _ = tx.send(true);
        }
    }

    fn log_cluster_stats(&self) {
        debug!(
            stores = self.core.store_count(),
            regions = self.core.region_count(),
            live_operators = self.op_controller.operator_count(crate::operator::OpKind::ALL),
            write_rate = self.stores_stats.total_bytes_write_rate(),
            read_rate = self.stores_stats.total_bytes_read_rate(),
            "cluster stats"
        );
    }

    // ---- lookups used by the RPC surface ----

    pub fn get_region_by_key(&self, key: &[u8]) -> Option<Arc<RegionInfo>> {
        self.core.search_region(key)
    }

    pub fn get_prev_region_by_key(&self, key: &[u8]) -> Option<Arc<RegionInfo>> {
        self.core.search_prev_region(key)
    }

    pub fn scan_regions(&self, start: &[u8], end: &[u8], limit: usize) -> Vec<Arc<RegionInfo>> {
        self.core.scan_range(start, end, limit)
    }
}

impl PlacementView for RaftCluster {
    fn options(&self) -> &ScheduleOptions {
        &self.opts
    }

    fn get_stores(&self) -> Vec<Arc<StoreInfo>> {
        self.core.get_stores()
    }

    fn get_store(&self, store_id: u64) -> Option<Arc<StoreInfo>> {
        self.core.get_store(store_id)
    }

    fn get_region(&self, region_id: u64) -> Option<Arc<RegionInfo>> {
        self.core.get_region(region_id)
    }

    fn get_region_stores(&self, region: &RegionInfo) -> Vec<Arc<StoreInfo>> {
        self.core.get_region_stores(region)
    }

    fn get_follower_stores(&self, region: &RegionInfo) -> Vec<Arc<StoreInfo>> {
        self.core.get_follower_stores(region)
    }

    fn get_leader_store(&self, region: &RegionInfo) -> Option<Arc<StoreInfo>> {
        self.core.get_leader_store(region)
    }

    fn rand_leader_region(&self, store_id: u64, policy: HealthPolicy) -> Option<Arc<RegionInfo>> {
        self.core.rand_leader_region(store_id, policy)
    }

    fn rand_follower_region(&self, store_id: u64, policy: HealthPolicy) -> Option<Arc<RegionInfo>> {
        self.core.rand_follower_region(store_id, policy)
    }

    fn rand_pending_region(&self, store_id: u64, policy: HealthPolicy) -> Option<Arc<RegionInfo>> {
        self.core.rand_pending_region(store_id, policy)
    }

    fn rand_hot_region_from_store(
        &self,
        store_id: u64,
        kind: FlowKind,
    ) -> Option<Arc<RegionInfo>> {
        let threshold = self.opts.hot_region_cache_hits_threshold();
        let region_id = self
            .hot_cache
            .rand_hot_region_from_store(store_id, kind, threshold)?;
        self.core.get_region(region_id)
    }

    fn is_region_hot(&self, region: &RegionInfo) -> bool {
        self.hot_cache
            .is_region_hot(region, self.opts.hot_region_cache_hits_threshold())
    }

    fn region_flow_stats(
        &self,
        kind: FlowKind,
    ) -> std::collections::HashMap<u64, Vec<HotPeerStat>> {
        self.hot_cache.region_stats(kind)
    }

    fn adjacent_regions(
        &self,
        region: &RegionInfo,
    ) -> (Option<Arc<RegionInfo>>, Option<Arc<RegionInfo>>) {
        self.core.adjacent_regions(region)
    }

    fn average_region_size(&self) -> i64 {
        self.core.average_region_size()
    }

    fn classifier(&self) -> Arc<dyn Classifier> {
        self.classifier.clone()
    }

    fn alloc_peer(&self, store_id: u64) -> Result<Peer> {
        let peer_id = self.id_alloc.alloc()?;
        Ok(Peer::new(peer_id, store_id))
    }

    fn op_influence(&self) -> OpInfluence {
        self.op_controller
            .op_influence(|region_id| self.core.get_region(region_id))
    }
}

/// Gate that holds scheduling back until enough regions have reported in.
struct PrepareChecker {
    reactive_regions: std::collections::HashMap<u64, usize>,
    sum: usize,
    start: Instant,
    prepared: bool,
}

impl PrepareChecker {
    fn new() -> Self {
        PrepareChecker {
            reactive_regions: std::collections::HashMap::new(),
            sum: 0,
            start: Instant::now(),
            prepared: false,
        }
    }

    fn collect(&mut self, region: &RegionInfo) {
        for peer in region.peers() {
            *self.reactive_regions.entry(peer.store_id).or_insert(0) += 1;
        }
        self.sum += 1;
    }

    fn check(&mut self, core: &BasicCluster) -> bool {
        if self.prepared || self.start.elapsed() > COLLECT_TIMEOUT {
            return true;
        }
        if (core.region_count() as f64) * COLLECT_FACTOR > self.sum as f64 {
            return false;
        }
        for store in core.get_stores() {
            if !store.is_up() {
                continue;
            }
            let reactive = self.reactive_regions.get(&store.id()).copied().unwrap_or(0);
            if (core.store_region_count(store.id()) as f64) * COLLECT_FACTOR > reactive as f64 {
                return false;
            }
        }
        self.prepared = true;
        true
    }
}

pub fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::RegionEpoch;

    fn cluster() -> Arc<RaftCluster> {
        let opts = Arc::new(ScheduleOptions::default());
        RaftCluster::new(1, opts, MetaStorage::in_memory(1)).unwrap()
    }

    fn put_up_store(cluster: &RaftCluster, id: u64) {
        let mut meta = StoreMeta::new(id, format!("127.0.0.1:{}", 20160 + id));
        meta.version = "3.0.0".to_string();
        cluster.put_store(meta).unwrap();
    }

    fn heartbeat_region(
        id: u64,
        start: &[u8],
        end: &[u8],
        epoch: RegionEpoch,
        stores: &[u64],
    ) -> RegionInfo {
        let mut meta = RegionMeta::new(id, start.to_vec(), end.to_vec());
        meta.epoch = epoch;
        meta.peers = stores
            .iter()
            .enumerate()
            .map(|(i, &s)| Peer::new(id * 100 + i as u64, s))
            .collect();
        let leader = meta.peers[0];
        RegionInfo::new(meta).with_leader(Some(leader))
    }

    #[test]
    fn store_heartbeat_unknown_store() {
        let cluster = cluster();
        let stats = StoreStats {
            store_id: 99,
            ..Default::default()
        };
        assert!(matches!(
            cluster.handle_store_heartbeat(&stats),
            Err(Error::StoreNotFound(99))
        ));
    }

    #[test]
    fn duplicate_address_rejected_until_tombstone() {
        let cluster = cluster();
        put_up_store(&cluster, 1);

        let mut dup = StoreMeta::new(2, "127.0.0.1:20161");
        dup.version = "3.0.0".to_string();
        assert!(matches!(cluster.put_store(dup.clone()), Err(Error::Validation(_))));

        // Tombstoned stores release their address.
        cluster.remove_store(1).unwrap();
        cluster.bury_store(1, false).unwrap();
        assert!(cluster.put_store(dup).is_ok());
    }

    #[test]
    fn older_store_version_rejected() {
        let cluster = cluster();
        put_up_store(&cluster, 1);
        cluster.on_store_version_change();

        let mut old = StoreMeta::new(2, "127.0.0.1:20162");
        old.version = "2.1.0".to_string();
        assert!(matches!(cluster.put_store(old), Err(Error::Validation(_))));
    }

    #[test]
    fn bury_requires_force_for_up_store() {
        let cluster = cluster();
        put_up_store(&cluster, 1);
        assert!(matches!(cluster.bury_store(1, false), Err(Error::Validation(_))));
        cluster.bury_store(1, true).unwrap();
        // Terminal: burying again is a no-op, reviving is an error.
        cluster.bury_store(1, false).unwrap();
        assert!(matches!(
            cluster.put_store(StoreMeta {
                version: "3.0.0".into(),
                ..StoreMeta::new(1, "127.0.0.1:20161")
            }),
            Err(Error::StoreTombstoned(1))
        ));
    }

    #[test]
    fn heartbeat_inserts_and_updates_counters() {
        let cluster = cluster();
        for id in 1..=3 {
            put_up_store(&cluster, id);
        }
        let region = heartbeat_region(10, b"", b"", RegionEpoch::new(1, 1), &[1, 2, 3])
            .with_approximates(64, 1000);
        cluster.process_region_heartbeat(region).unwrap();

        assert_eq!(cluster.core().region_count(), 1);
        let store = cluster.get_store(1).unwrap();
        assert_eq!(store.leader_count(), 1);
        assert_eq!(store.region_size(), 64);
        let store3 = cluster.get_store(3).unwrap();
        assert_eq!(store3.leader_count(), 0);
        assert_eq!(store3.region_count(), 1);
    }

    #[test]
    fn stale_epoch_is_rejected_without_mutation() {
        let cluster = cluster();
        for id in 1..=3 {
            put_up_store(&cluster, id);
        }
        let fresh = heartbeat_region(10, b"", b"", RegionEpoch::new(5, 2), &[1, 2, 3]);
        cluster.process_region_heartbeat(fresh.clone()).unwrap();

        let stale = heartbeat_region(10, b"", b"", RegionEpoch::new(4, 3), &[1, 2]);
        let err = cluster.process_region_heartbeat(stale).unwrap_err();
        assert!(matches!(err, Error::RegionStale { .. }));
        let cached = cluster.get_region(10).unwrap();
        assert_eq!(cached.epoch(), RegionEpoch::new(5, 2));
        assert_eq!(cached.peers().len(), 3);
    }

    #[test]
    fn overlap_eviction_purges_storage_and_stats() {
        let cluster = cluster();
        for id in 1..=3 {
            put_up_store(&cluster, id);
        }
        let a = heartbeat_region(1, b"a", b"m", RegionEpoch::new(1, 1), &[1, 2, 3]);
        let b = heartbeat_region(2, b"m", b"z", RegionEpoch::new(1, 1), &[1, 2, 3]);
        cluster.process_region_heartbeat(a).unwrap();
        cluster.process_region_heartbeat(b).unwrap();
        assert!(cluster.storage().load_region(1).unwrap().is_some());

        let c = heartbeat_region(3, b"a", b"z", RegionEpoch::new(2, 1), &[1, 2, 3]);
        cluster.process_region_heartbeat(c).unwrap();

        assert_eq!(cluster.core().region_count(), 1);
        assert!(cluster.get_region(1).is_none());
        assert!(cluster.get_region(2).is_none());
        assert!(cluster.storage().load_region(1).unwrap().is_none());
        assert!(cluster.storage().load_region(2).unwrap().is_none());
        assert!(cluster.storage().load_region(3).unwrap().is_some());
    }

    #[test]
    fn bootstrap_contract() {
        let cluster = cluster();
        let store = StoreMeta::new(1, "127.0.0.1:20161");
        let mut region = RegionMeta::new(1, vec![], vec![]);
        region.peers = vec![Peer::new(2, 1)];

        // Violations first.
        let mut bad = region.clone();
        bad.peers = vec![Peer::new(2, 9)];
        assert!(cluster
            .bootstrap(BootstrapRequest { store: store.clone(), region: bad })
            .is_err());
        let mut bad = region.clone();
        bad.start_key = b"x".to_vec();
        assert!(cluster
            .bootstrap(BootstrapRequest { store: store.clone(), region: bad })
            .is_err());

        cluster
            .bootstrap(BootstrapRequest { store: store.clone(), region: region.clone() })
            .unwrap();
        assert!(cluster.is_bootstrapped().unwrap());
        assert!(cluster
            .bootstrap(BootstrapRequest { store, region })
            .is_err());
    }

    #[test]
    fn region_round_trips_through_cluster() {
        let cluster = cluster();
        for id in 1..=3 {
            put_up_store(&cluster, id);
        }
        let region = heartbeat_region(42, b"k1", b"k9", RegionEpoch::new(7, 3), &[1, 2, 3])
            .with_approximates(10, 100);
        cluster.process_region_heartbeat(region.clone()).unwrap();

        let cached = cluster.get_region(42).unwrap();
        assert_eq!(cached.meta(), region.meta());
        let persisted = cluster.storage().load_region(42).unwrap().unwrap();
        assert_eq!(&persisted, region.meta());
    }
}
