//! Region-count balancing across stores, tier-aware.
//!
//! Storage-tier stores are balanced among themselves first; only when that
//! yields nothing does the scheduler balance the performance tier. A source
//! store that keeps getting picked without ever producing an operator is
//! cooled down through the hits builder so the scheduler stops burning its
//! retries on a hopeless store.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::basic_cluster::HealthPolicy;
use crate::checker::ReplicaChecker;
use crate::error::Result;
use crate::filter::{BlacklistFilter, BlacklistSide, DistinctScoreFilter, ExcludedFilter, Filter, StoreStateFilter};
use crate::operator::{create_move_peer_operator, OpKind, Operator};
use crate::operator_controller::OperatorController;
use crate::options::ResourceKind;
use crate::region::{Peer, RegionInfo};
use crate::scheduler::{PlacementView, Scheduler};
use crate::schedulers::should_balance;
use crate::selector::BalanceSelector;
use crate::store::{StoreInfo, StoreType};

pub const BALANCE_REGION_NAME: &str = "balance-region-scheduler";

/// Retries against one selected source before giving up the pass.
const RETRY_LIMIT: usize = 10;

const HITS_STORE_TTL: Duration = Duration::from_secs(5 * 60);

/// Picking the same hopeless source/target this many times within the TTL
/// without building an operator triggers the cooldown.
const HITS_STORE_COUNT_THRESHOLD: u32 = 30 * RETRY_LIMIT as u32;

pub fn factory(
    controller: Arc<OperatorController>,
    _args: &[String],
) -> Result<Box<dyn Scheduler>> {
    Ok(Box::new(BalanceRegionScheduler::new(controller)))
}

pub struct BalanceRegionScheduler {
    controller: Arc<OperatorController>,
    selector: BalanceSelector,
    hits: HitsStoreBuilder,
}

impl BalanceRegionScheduler {
    pub fn new(controller: Arc<OperatorController>) -> Self {
        let filters: Vec<Box<dyn Filter>> = vec![Box::new(StoreStateFilter {
            scope: BALANCE_REGION_NAME.to_string(),
            transfer_leader: false,
            move_region: true,
        })];
        BalanceRegionScheduler {
            controller,
            selector: BalanceSelector::new(ResourceKind::Region, filters),
            hits: HitsStoreBuilder::new(HITS_STORE_TTL, HITS_STORE_COUNT_THRESHOLD),
        }
    }

    fn schedule_impl(
        &mut self,
        cluster: &dyn PlacementView,
        include: &[Arc<StoreInfo>],
        excluded: &[Arc<StoreInfo>],
    ) -> Option<Operator> {
        let opts = cluster.options();
        let source_filter: Vec<Box<dyn Filter>> =
            vec![Box::new(self.hits.build_source_filter(cluster))];
        let Some(source) = self.selector.select_source(opts, include, &source_filter) else {
            debug!(scheduler = BALANCE_REGION_NAME, "no source store");
            return None;
        };
        debug!(
            scheduler = BALANCE_REGION_NAME,
            store_id = source.id(),
            "store has the max region score"
        );

        for _ in 0..RETRY_LIMIT {
            // A pending peer usually means an overloaded disk, so shedding
            // pending regions comes first, then followers, then leaders.
            let region = cluster
                .rand_pending_region(source.id(), HealthPolicy::HealthyAllowPending)
                .or_else(|| cluster.rand_follower_region(source.id(), HealthPolicy::Healthy))
                .or_else(|| cluster.rand_leader_region(source.id(), HealthPolicy::Healthy));
            let Some(region) = region else {
                debug!(scheduler = BALANCE_REGION_NAME, store_id = source.id(), "no region");
                self.hits.put(source.id(), None);
                continue;
            };

            if region.peers().len() != opts.max_replicas() {
                debug!(
                    scheduler = BALANCE_REGION_NAME,
                    region_id = region.id(),
                    "region has abnormal replica count"
                );
                self.hits.put(source.id(), None);
                continue;
            }
            if cluster.is_region_hot(&region) {
                debug!(scheduler = BALANCE_REGION_NAME, region_id = region.id(), "region is hot");
                self.hits.put(source.id(), None);
                continue;
            }

            let Some(old_peer) = region.store_peer(source.id()).copied() else {
                continue;
            };
            if let Some(op) = self.transfer_peer(cluster, &region, &old_peer, excluded) {
                return Some(op);
            }
        }
        None
    }

    /// Choose the best store to host the replacement peer and gate the move
    /// on the projected score gap.
    fn transfer_peer(
        &mut self,
        cluster: &dyn PlacementView,
        region: &RegionInfo,
        old_peer: &Peer,
        excluded: &[Arc<StoreInfo>],
    ) -> Option<Operator> {
        let opts = cluster.options();
        let source = cluster.get_store(old_peer.store_id)?;
        let region_stores = cluster.get_region_stores(region);

        // The replacement may never lower the region's fault-domain spread.
        let score_guard = DistinctScoreFilter::new(
            BALANCE_REGION_NAME,
            opts.location_labels(),
            &region_stores,
            &source,
        );
        let hits_filter = self.hits.build_target_filter(cluster, source.id());
        let excluded_ids: HashSet<u64> = excluded.iter().map(|s| s.id()).collect();
        let tier_filter =
            ExcludedFilter::new(BALANCE_REGION_NAME, excluded_ids.clone(), excluded_ids);

        let extra: Vec<Box<dyn Filter>> = vec![
            Box::new(score_guard),
            Box::new(hits_filter),
            Box::new(tier_filter),
        ];
        let checker = ReplicaChecker::new(BALANCE_REGION_NAME);
        let Some(target_id) =
            checker.select_best_replacement_store(cluster, region, old_peer, &extra)
        else {
            debug!(scheduler = BALANCE_REGION_NAME, region_id = region.id(), "no replacement store");
            self.hits.put(source.id(), None);
            return None;
        };
        let target = cluster.get_store(target_id)?;

        let influence = cluster.op_influence();
        if !should_balance(opts, &source, &target, region, ResourceKind::Region, &influence) {
            debug!(
                scheduler = BALANCE_REGION_NAME,
                region_id = region.id(),
                source = source.id(),
                target = target.id(),
                "skip balance, score gap under tolerance"
            );
            self.hits.put(source.id(), Some(target.id()));
            return None;
        }

        let new_peer = cluster.alloc_peer(target.id()).ok()?;
        let op = create_move_peer_operator(
            "balance-region",
            region,
            OpKind::BALANCE,
            old_peer.store_id,
            new_peer.store_id,
            new_peer.id,
        );
        self.hits.remove(source.id(), Some(target.id()));
        self.hits.remove(source.id(), None);
        Some(op)
    }
}

impl Scheduler for BalanceRegionScheduler {
    fn name(&self) -> &str {
        BALANCE_REGION_NAME
    }

    fn scheduler_type(&self) -> &'static str {
        "balance-region"
    }

    fn kind(&self) -> OpKind {
        OpKind::REGION | OpKind::BALANCE
    }

    fn is_schedule_allowed(&self, cluster: &dyn PlacementView) -> bool {
        self.controller.operator_count(OpKind::REGION)
            < cluster.options().schedule_limit(OpKind::REGION)
    }

    fn schedule(&mut self, cluster: &dyn PlacementView) -> Vec<Operator> {
        let mut storage_stores = Vec::new();
        let mut performance_stores = Vec::new();
        for store in cluster.get_stores() {
            match store.store_type() {
                StoreType::Storage => storage_stores.push(store),
                StoreType::Performance => performance_stores.push(store),
            }
        }

        // Balance within the storage tier first, then fall back to the
        // performance tier; the excluded list keeps regions inside their tier.
        if let Some(op) = self.schedule_impl(cluster, &storage_stores, &performance_stores) {
            return vec![op];
        }
        self.schedule_impl(cluster, &performance_stores, &storage_stores)
            .map(|op| vec![op])
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy)]
struct HitRecord {
    last: Instant,
    count: u32,
}

/// Cooldown bookkeeping for (source, optional target) pairs that keep
/// failing to produce an operator.
struct HitsStoreBuilder {
    hits: HashMap<(u64, Option<u64>), HitRecord>,
    ttl: Duration,
    threshold: u32,
}

impl HitsStoreBuilder {
    fn new(ttl: Duration, threshold: u32) -> Self {
        HitsStoreBuilder {
            hits: HashMap::new(),
            ttl,
            threshold,
        }
    }

    fn is_cooling(&mut self, source: u64, target: Option<u64>) -> bool {
        let key = (source, target);
        if let Some(record) = self.hits.get(&key) {
            if record.last.elapsed() > self.ttl {
                self.hits.remove(&key);
                return false;
            }
            if record.count >= self.threshold {
                debug!(scheduler = BALANCE_REGION_NAME, source, ?target, "store is cooling down");
                return true;
            }
        }
        false
    }

    fn put(&mut self, source: u64, target: Option<u64>) {
        let now = Instant::now();
        let ttl = self.ttl;
        self.hits
            .entry((source, target))
            .and_modify(|record| {
                if record.last.elapsed() >= ttl {
                    record.count = 0;
                } else {
                    record.count += 1;
                }
                record.last = now;
            })
            .or_insert(HitRecord { last: now, count: 0 });
    }

    fn remove(&mut self, source: u64, target: Option<u64>) {
        self.hits.remove(&(source, target));
    }

    fn build_source_filter(&mut self, cluster: &dyn PlacementView) -> BlacklistFilter {
        let filter = BlacklistFilter::new(BALANCE_REGION_NAME, BlacklistSide::Source);
        for store in cluster.get_stores() {
            if self.is_cooling(store.id(), None) {
                filter.add(store.id());
            }
        }
        filter
    }

    fn build_target_filter(&mut self, cluster: &dyn PlacementView, source: u64) -> BlacklistFilter {
        let filter = BlacklistFilter::new(BALANCE_REGION_NAME, BlacklistSide::Target);
        for store in cluster.get_stores() {
            if self.is_cooling(source, Some(store.id())) {
                filter.add(store.id());
            }
        }
        filter
    }
}
