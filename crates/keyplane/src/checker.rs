//! Checker-driven repair: replica count and placement fixes found by the
//! patrol, plus small-region merging.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::filter::{
    filter_target, DistinctScoreFilter, ExcludedFilter, Filter, NamespaceFilter,
    PendingPeerCountFilter, SnapshotCountFilter, StorageThresholdFilter, StoreStateFilter,
};
use crate::operator::{
    create_add_peer_operator, create_merge_region_operators, create_move_peer_operator,
    create_remove_peer_operator, OpKind, Operator,
};
use crate::region::{Peer, RegionInfo};
use crate::scheduler::PlacementView;
use crate::selector::resource_score;
use crate::store::{distinct_score, StoreInfo};

/// Keeps every region at the configured replica count in the most diverse
/// fault domains available. Each action is individually switchable.
pub struct ReplicaChecker {
    name: &'static str,
}

impl ReplicaChecker {
    pub fn new(name: &'static str) -> Self {
        ReplicaChecker { name }
    }

    pub fn check(&self, cluster: &dyn PlacementView, region: &RegionInfo) -> Option<Operator> {
        if let Some(op) = self.check_down_peers(cluster, region) {
            return Some(op);
        }
        if let Some(op) = self.check_offline_peers(cluster, region) {
            return Some(op);
        }
        let opts = cluster.options();
        let max_replicas = opts.max_replicas();
        if opts.is_make_up_replica_enabled() && region.peers().len() < max_replicas {
            return self.make_up_replica(cluster, region);
        }
        if opts.is_remove_extra_replica_enabled() && region.peers().len() > max_replicas {
            return self.remove_extra_replica(cluster, region);
        }
        if opts.is_location_replacement_enabled() {
            return self.replace_for_location(cluster, region);
        }
        None
    }

    fn check_down_peers(
        &self,
        cluster: &dyn PlacementView,
        region: &RegionInfo,
    ) -> Option<Operator> {
        let opts = cluster.options();
        if !opts.is_remove_down_replica_enabled() {
            return None;
        }
        let max_down_secs = opts.max_store_down_time().as_secs();
        for stat in region.down_peers() {
            if stat.down_seconds < max_down_secs {
                continue;
            }
            // The peer was gone long enough; give its slot back.
            let transferee = region
                .follower_peers()
                .into_iter()
                .find(|p| p.store_id != stat.peer.store_id);
            return Some(create_remove_peer_operator(
                "remove-down-replica",
                region,
                OpKind::default(),
                stat.peer.store_id,
                transferee,
            ));
        }
        None
    }

    fn check_offline_peers(
        &self,
        cluster: &dyn PlacementView,
        region: &RegionInfo,
    ) -> Option<Operator> {
        let opts = cluster.options();
        if !opts.is_replace_offline_replica_enabled() {
            return None;
        }
        for peer in region.peers() {
            let Some(store) = cluster.get_store(peer.store_id) else {
                continue;
            };
            if !store.is_offline() {
                continue;
            }
            let Some(target) = self.select_best_replacement_store(cluster, region, peer, &[])
            else {
                debug!(
                    checker = self.name,
                    region_id = region.id(),
                    store_id = peer.store_id,
                    "no replacement store for offline peer"
                );
                return None;
            };
            let new_peer = cluster.alloc_peer(target).ok()?;
            return Some(create_move_peer_operator(
                "replace-offline-replica",
                region,
                OpKind::default(),
                peer.store_id,
                new_peer.store_id,
                new_peer.id,
            ));
        }
        None
    }

    fn make_up_replica(
        &self,
        cluster: &dyn PlacementView,
        region: &RegionInfo,
    ) -> Option<Operator> {
        let target = self.select_store_to_add(cluster, region, &[])?;
        let new_peer = cluster.alloc_peer(target).ok()?;
        Some(create_add_peer_operator(
            "make-up-replica",
            region,
            OpKind::default(),
            new_peer.store_id,
            new_peer.id,
        ))
    }

    fn remove_extra_replica(
        &self,
        cluster: &dyn PlacementView,
        region: &RegionInfo,
    ) -> Option<Operator> {
        let worst = self.select_worst_peer(cluster, region)?;
        let transferee = region
            .follower_peers()
            .into_iter()
            .find(|p| p.store_id != worst.store_id);
        Some(create_remove_peer_operator(
            "remove-extra-replica",
            region,
            OpKind::default(),
            worst.store_id,
            transferee,
        ))
    }

    /// Move a peer when a strictly more isolated placement exists for it.
    fn replace_for_location(
        &self,
        cluster: &dyn PlacementView,
        region: &RegionInfo,
    ) -> Option<Operator> {
        let opts = cluster.options();
        let labels = opts.location_labels();
        if labels.is_empty() {
            return None;
        }
        let region_stores = cluster.get_region_stores(region);
        let worst = self.select_worst_peer(cluster, region)?;
        let worst_store = cluster.get_store(worst.store_id)?;
        let others: Vec<Arc<StoreInfo>> = region_stores
            .iter()
            .filter(|s| s.id() != worst.store_id)
            .cloned()
            .collect();
        let old_score = distinct_score(&labels, &others, &worst_store);

        let target = self.select_best_replacement_store(cluster, region, &worst, &[])?;
        let target_store = cluster.get_store(target)?;
        let new_score = distinct_score(&labels, &others, &target_store);
        if new_score <= old_score {
            return None;
        }
        let new_peer = cluster.alloc_peer(target).ok()?;
        Some(create_move_peer_operator(
            "move-to-better-location",
            region,
            OpKind::default(),
            worst.store_id,
            new_peer.store_id,
            new_peer.id,
        ))
    }

    /// Best store to host a replacement for `old_peer`: most diverse first,
    /// least loaded second, under the standard placement filters.
    pub fn select_best_replacement_store(
        &self,
        cluster: &dyn PlacementView,
        region: &RegionInfo,
        old_peer: &Peer,
        extra_filters: &[Box<dyn Filter>],
    ) -> Option<u64> {
        let opts = cluster.options();
        let region_stores = cluster.get_region_stores(region);
        let source = cluster.get_store(old_peer.store_id);
        let classifier = cluster.classifier();

        let mut filters: Vec<Box<dyn Filter>> = vec![
            Box::new(StoreStateFilter {
                scope: self.name.to_string(),
                transfer_leader: false,
                move_region: true,
            }),
            Box::new(StorageThresholdFilter::new(self.name)),
            Box::new(SnapshotCountFilter::new(self.name)),
            Box::new(PendingPeerCountFilter::new(self.name)),
            Box::new(ExcludedFilter::new(
                self.name,
                HashSet::new(),
                region.store_ids().into_iter().collect(),
            )),
            Box::new(NamespaceFilter::new(
                self.name,
                classifier.clone(),
                classifier.region_namespace(region),
            )),
        ];
        if let Some(source) = &source {
            filters.push(Box::new(DistinctScoreFilter::new(
                self.name,
                opts.location_labels(),
                &region_stores,
                source,
            )));
        }

        self.pick_placement(cluster, region, old_peer.store_id, &filters, extra_filters)
    }

    /// Best store for a brand-new replica (no peer is being replaced).
    fn select_store_to_add(
        &self,
        cluster: &dyn PlacementView,
        region: &RegionInfo,
        extra_filters: &[Box<dyn Filter>],
    ) -> Option<u64> {
        let classifier = cluster.classifier();
        let filters: Vec<Box<dyn Filter>> = vec![
            Box::new(StoreStateFilter {
                scope: self.name.to_string(),
                transfer_leader: false,
                move_region: true,
            }),
            Box::new(StorageThresholdFilter::new(self.name)),
            Box::new(SnapshotCountFilter::new(self.name)),
            Box::new(PendingPeerCountFilter::new(self.name)),
            Box::new(ExcludedFilter::new(
                self.name,
                HashSet::new(),
                region.store_ids().into_iter().collect(),
            )),
            Box::new(NamespaceFilter::new(
                self.name,
                classifier.clone(),
                classifier.region_namespace(region),
            )),
        ];
        self.pick_placement(cluster, region, 0, &filters, extra_filters)
    }

    fn pick_placement(
        &self,
        cluster: &dyn PlacementView,
        region: &RegionInfo,
        exclude_store: u64,
        filters: &[Box<dyn Filter>],
        extra_filters: &[Box<dyn Filter>],
    ) -> Option<u64> {
        let opts = cluster.options();
        let labels = opts.location_labels();
        let others: Vec<Arc<StoreInfo>> = cluster
            .get_region_stores(region)
            .into_iter()
            .filter(|s| s.id() != exclude_store)
            .collect();

        cluster
            .get_stores()
            .into_iter()
            .filter(|s| !filter_target(opts, s, filters))
            .filter(|s| !filter_target(opts, s, extra_filters))
            .max_by(|a, b| {
                let da = distinct_score(&labels, &others, a);
                let db = distinct_score(&labels, &others, b);
                da.total_cmp(&db).then_with(|| {
                    // Lower region score is the better tie-break.
                    let ra = resource_score(a, crate::options::ResourceKind::Region, opts, 0);
                    let rb = resource_score(b, crate::options::ResourceKind::Region, opts, 0);
                    rb.total_cmp(&ra)
                })
            })
            .map(|s| s.id())
    }

    fn select_worst_peer(&self, cluster: &dyn PlacementView, region: &RegionInfo) -> Option<Peer> {
        let opts = cluster.options();
        let labels = opts.location_labels();
        let region_stores = cluster.get_region_stores(region);
        region
            .peers()
            .iter()
            .filter_map(|peer| {
                let store = cluster.get_store(peer.store_id)?;
                let others: Vec<Arc<StoreInfo>> = region_stores
                    .iter()
                    .filter(|s| s.id() != peer.store_id)
                    .cloned()
                    .collect();
                Some((*peer, distinct_score(&labels, &others, &store), store))
            })
            .min_by(|(_, score_a, store_a), (_, score_b, store_b)| {
                score_a.total_cmp(score_b).then_with(|| {
                    // The more loaded store loses its replica on ties.
                    let ra = resource_score(store_a, crate::options::ResourceKind::Region, opts, 0);
                    let rb = resource_score(store_b, crate::options::ResourceKind::Region, opts, 0);
                    rb.total_cmp(&ra)
                })
            })
            .map(|(peer, _, _)| peer)
    }
}

/// Moves peers that landed outside their region's namespace back onto
/// stores of that namespace. Inert while every store and region classify
/// into the same namespace.
pub struct NamespaceChecker {
    name: &'static str,
}

impl NamespaceChecker {
    pub fn new(name: &'static str) -> Self {
        NamespaceChecker { name }
    }

    pub fn check(&self, cluster: &dyn PlacementView, region: &RegionInfo) -> Option<Operator> {
        if !cluster.options().is_namespace_relocation_enabled() {
            return None;
        }
        let classifier = cluster.classifier();
        let namespace = classifier.region_namespace(region);
        for peer in region.peers() {
            let Some(store) = cluster.get_store(peer.store_id) else {
                continue;
            };
            if classifier.store_namespace(&store) == namespace {
                continue;
            }
            // The replacement placement stack already pins targets to the
            // region's namespace.
            let replica = ReplicaChecker::new(self.name);
            let Some(target) = replica.select_best_replacement_store(cluster, region, peer, &[])
            else {
                debug!(
                    checker = self.name,
                    region_id = region.id(),
                    store_id = peer.store_id,
                    namespace = %namespace,
                    "no in-namespace store to relocate the peer to"
                );
                return None;
            };
            let new_peer = cluster.alloc_peer(target).ok()?;
            return Some(create_move_peer_operator(
                "namespace-relocation",
                region,
                OpKind::default(),
                peer.store_id,
                new_peer.store_id,
                new_peer.id,
            ));
        }
        None
    }
}

/// Merges undersized, settled regions into their smaller adjacent neighbour.
pub struct MergeChecker {
    name: &'static str,
    /// Merging starts one split-merge interval after process start, so fresh
    /// splits are never immediately undone.
    started: Instant,
}

impl MergeChecker {
    pub fn new(name: &'static str) -> Self {
        MergeChecker {
            name,
            started: Instant::now(),
        }
    }

    pub fn check(
        &self,
        cluster: &dyn PlacementView,
        region: &RegionInfo,
    ) -> Option<(Operator, Operator)> {
        let opts = cluster.options();
        if self.started.elapsed() < opts.split_merge_interval() {
            return None;
        }
        if !self.mergeable(cluster, region) {
            return None;
        }
        if region.approximate_size() >= opts.max_merge_region_size() as i64
            || region.approximate_keys() >= opts.max_merge_region_keys() as i64
        {
            return None;
        }

        let (prev, next) = cluster.adjacent_regions(region);
        let prev = prev.filter(|p| {
            p.end_key() == region.start_key() && self.mergeable(cluster, p.as_ref())
        });
        let next = next.filter(|n| {
            region.end_key() == n.start_key() && self.mergeable(cluster, n.as_ref())
        });

        let target = match (prev, next) {
            (Some(p), Some(n)) => {
                if p.approximate_size() <= n.approximate_size() {
                    p
                } else {
                    n
                }
            }
            (Some(p), None) => p,
            (None, Some(n)) => n,
            (None, None) => return None,
        };

        debug!(
            checker = self.name,
            region_id = region.id(),
            target_id = target.id(),
            "proposing region merge"
        );
        Some(create_merge_region_operators(
            "merge-region",
            region,
            &target,
            OpKind::default(),
        ))
    }

    fn mergeable(&self, cluster: &dyn PlacementView, region: &RegionInfo) -> bool {
        region.peers().len() == cluster.options().max_replicas()
            && region.is_healthy()
            && !cluster.is_region_hot(region)
    }
}
