//! Hot-region balancing.
//!
//! Alternates between the two flows each pass: write flow is balanced by
//! moving a hot peer off the most write-loaded store, read flow by
//! transferring a hot region's leadership off the most read-loaded store.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use crate::checker::ReplicaChecker;
use crate::error::Result;
use crate::filter::{filter_target, Filter, NamespaceFilter, StoreStateFilter};
use crate::hot_cache::FlowKind;
use crate::operator::{
    create_move_peer_operator, create_transfer_leader_operator, OpKind, Operator,
};
use crate::operator_controller::OperatorController;
use crate::scheduler::{PlacementView, Scheduler};

pub const HOT_REGION_NAME: &str = "balance-hot-region-scheduler";

pub fn factory(
    controller: Arc<OperatorController>,
    _args: &[String],
) -> Result<Box<dyn Scheduler>> {
    Ok(Box::new(HotRegionScheduler::new(controller)))
}

pub struct HotRegionScheduler {
    controller: Arc<OperatorController>,
    ticks: u64,
}

impl HotRegionScheduler {
    pub fn new(controller: Arc<OperatorController>) -> Self {
        HotRegionScheduler { controller, ticks: 0 }
    }

    /// The store carrying the most hot flow of `kind`.
    fn busiest_store(&self, cluster: &dyn PlacementView, kind: FlowKind) -> Option<u64> {
        let threshold = cluster.options().hot_region_cache_hits_threshold();
        cluster
            .region_flow_stats(kind)
            .into_iter()
            .map(|(store_id, stats)| {
                let flow: f64 = stats
                    .iter()
                    .filter(|s| s.is_hot(threshold))
                    .map(|s| s.flow_bytes)
                    .sum();
                (store_id, flow)
            })
            .filter(|(_, flow)| *flow > 0.0)
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(store_id, _)| store_id)
    }

    fn balance_write(&self, cluster: &dyn PlacementView) -> Option<Operator> {
        let source_id = self.busiest_store(cluster, FlowKind::Write)?;
        let region = cluster.rand_hot_region_from_store(source_id, FlowKind::Write)?;
        let old_peer = region.store_peer(source_id).copied()?;

        let checker = ReplicaChecker::new(HOT_REGION_NAME);
        let target = checker.select_best_replacement_store(cluster, &region, &old_peer, &[])?;
        let new_peer = cluster.alloc_peer(target).ok()?;
        debug!(
            scheduler = HOT_REGION_NAME,
            region_id = region.id(),
            source = source_id,
            target,
            "moving hot write peer"
        );
        Some(create_move_peer_operator(
            "move-hot-write-region",
            &region,
            OpKind::HOT,
            old_peer.store_id,
            new_peer.store_id,
            new_peer.id,
        ))
    }

    fn balance_read(&self, cluster: &dyn PlacementView) -> Option<Operator> {
        let source_id = self.busiest_store(cluster, FlowKind::Read)?;
        let region = cluster.rand_hot_region_from_store(source_id, FlowKind::Read)?;
        if region.leader_store_id() != source_id {
            return None;
        }

        let opts = cluster.options();
        let classifier = cluster.classifier();
        let target_filters: Vec<Box<dyn Filter>> = vec![
            Box::new(StoreStateFilter {
                scope: HOT_REGION_NAME.to_string(),
                transfer_leader: true,
                move_region: false,
            }),
            Box::new(NamespaceFilter::new(
                HOT_REGION_NAME,
                classifier.clone(),
                classifier.region_namespace(&region),
            )),
        ];
        let read_stats = cluster.region_flow_stats(FlowKind::Read);
        let flow_of = |store_id: u64| -> f64 {
            read_stats
                .get(&store_id)
                .map(|stats| stats.iter().map(|s| s.flow_bytes).sum())
                .unwrap_or(0.0)
        };
        let seen: HashSet<u64> = [source_id].into_iter().collect();
        let target = cluster
            .get_follower_stores(&region)
            .into_iter()
            .filter(|s| !seen.contains(&s.id()))
            .filter(|s| !filter_target(opts, s, &target_filters))
            .min_by(|a, b| flow_of(a.id()).total_cmp(&flow_of(b.id())))?;

        debug!(
            scheduler = HOT_REGION_NAME,
            region_id = region.id(),
            source = source_id,
            target = target.id(),
            "shedding hot read leader"
        );
        Some(create_transfer_leader_operator(
            "move-hot-read-region",
            &region,
            OpKind::HOT,
            target.id(),
        ))
    }
}

impl Scheduler for HotRegionScheduler {
    fn name(&self) -> &str {
        HOT_REGION_NAME
    }

    fn scheduler_type(&self) -> &'static str {
        "hot-region"
    }

    fn kind(&self) -> OpKind {
        OpKind::HOT
    }

    fn is_schedule_allowed(&self, cluster: &dyn PlacementView) -> bool {
        self.controller.operator_count(OpKind::HOT)
            < cluster.options().schedule_limit(OpKind::HOT)
    }

    fn schedule(&mut self, cluster: &dyn PlacementView) -> Vec<Operator> {
        self.ticks += 1;
        let op = if self.ticks % 2 == 0 {
            self.balance_write(cluster)
        } else {
            self.balance_read(cluster)
        };
        op.map(|op| vec![op]).unwrap_or_default()
    }
}
