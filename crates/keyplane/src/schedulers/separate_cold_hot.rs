//! Tier hygiene: hot regions do not belong on storage-tier stores.
//!
//! For every storage-tier store carrying a write-hot region, the scheduler
//! relocates that region's peer onto a performance-tier store, reusing the
//! standard replacement placement stack with the storage tier excluded.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use crate::checker::ReplicaChecker;
use crate::error::Result;
use crate::filter::{ExcludedFilter, Filter};
use crate::hot_cache::FlowKind;
use crate::operator::{create_move_peer_operator, OpKind, Operator};
use crate::operator_controller::OperatorController;
use crate::scheduler::{PlacementView, Scheduler};
use crate::store::StoreType;

pub const SEPARATE_COLD_HOT_NAME: &str = "separate-cold-hot-scheduler";

pub fn factory(
    controller: Arc<OperatorController>,
    _args: &[String],
) -> Result<Box<dyn Scheduler>> {
    Ok(Box::new(SeparateColdHotScheduler::new(controller)))
}

pub struct SeparateColdHotScheduler {
    controller: Arc<OperatorController>,
}

impl SeparateColdHotScheduler {
    pub fn new(controller: Arc<OperatorController>) -> Self {
        SeparateColdHotScheduler { controller }
    }
}

impl Scheduler for SeparateColdHotScheduler {
    fn name(&self) -> &str {
        SEPARATE_COLD_HOT_NAME
    }

    fn scheduler_type(&self) -> &'static str {
        "separate-cold-hot"
    }

    fn kind(&self) -> OpKind {
        OpKind::HOT
    }

    fn is_schedule_allowed(&self, cluster: &dyn PlacementView) -> bool {
        self.controller.operator_count(OpKind::HOT)
            < cluster.options().schedule_limit(OpKind::HOT)
    }

    fn schedule(&mut self, cluster: &dyn PlacementView) -> Vec<Operator> {
        let stores = cluster.get_stores();
        let storage_ids: HashSet<u64> = stores
            .iter()
            .filter(|s| s.store_type() == StoreType::Storage)
            .map(|s| s.id())
            .collect();
        if storage_ids.is_empty() || storage_ids.len() == stores.len() {
            return Vec::new();
        }

        let checker = ReplicaChecker::new(SEPARATE_COLD_HOT_NAME);
        for store in stores.iter().filter(|s| storage_ids.contains(&s.id())) {
            let Some(region) = cluster.rand_hot_region_from_store(store.id(), FlowKind::Write)
            else {
                continue;
            };
            let Some(old_peer) = region.store_peer(store.id()).copied() else {
                continue;
            };
            let tier_filter: Vec<Box<dyn Filter>> = vec![Box::new(ExcludedFilter::new(
                SEPARATE_COLD_HOT_NAME,
                HashSet::new(),
                storage_ids.clone(),
            ))];
            let Some(target) =
                checker.select_best_replacement_store(cluster, &region, &old_peer, &tier_filter)
            else {
                continue;
            };
            let Ok(new_peer) = cluster.alloc_peer(target) else {
                continue;
            };
            debug!(
                scheduler = SEPARATE_COLD_HOT_NAME,
                region_id = region.id(),
                source = store.id(),
                target,
                "pulling hot region out of the storage tier"
            );
            return vec![create_move_peer_operator(
                "separate-cold-hot",
                &region,
                OpKind::HOT,
                old_peer.store_id,
                new_peer.store_id,
                new_peer.id,
            )];
        }
        Vec::new()
    }
}
