//! Leader balancing: shed leaders from the most leader-loaded store, or pull
//! them onto the least loaded one, whichever works first this pass.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::basic_cluster::HealthPolicy;
use crate::error::Result;
use crate::filter::{CacheFilter, Filter, NamespaceFilter, StoreStateFilter, TtlCache};
use crate::operator::{create_transfer_leader_operator, OpKind, Operator};
use crate::operator_controller::OperatorController;
use crate::options::ResourceKind;
use crate::region::RegionInfo;
use crate::scheduler::{PlacementView, Scheduler};
use crate::schedulers::should_balance;
use crate::selector::{resource_score, BalanceSelector};
use crate::store::StoreInfo;

pub const BALANCE_LEADER_NAME: &str = "balance-leader-scheduler";

/// Stores that failed to yield a transfer are left alone for a while; leader
/// counts move fast, so this is much shorter than the region cooldown.
const TAINT_TTL: Duration = Duration::from_secs(5 * 60);

pub fn factory(
    controller: Arc<OperatorController>,
    _args: &[String],
) -> Result<Box<dyn Scheduler>> {
    Ok(Box::new(BalanceLeaderScheduler::new(controller)))
}

pub struct BalanceLeaderScheduler {
    controller: Arc<OperatorController>,
    selector: BalanceSelector,
    taint: Arc<TtlCache>,
}

impl BalanceLeaderScheduler {
    pub fn new(controller: Arc<OperatorController>) -> Self {
        let filters: Vec<Box<dyn Filter>> = vec![Box::new(StoreStateFilter {
            scope: BALANCE_LEADER_NAME.to_string(),
            transfer_leader: true,
            move_region: false,
        })];
        BalanceLeaderScheduler {
            controller,
            selector: BalanceSelector::new(ResourceKind::Leader, filters),
            taint: Arc::new(TtlCache::new(TAINT_TTL)),
        }
    }

    /// Move a leader off `source` to its least leader-loaded follower store.
    fn transfer_leader_out(
        &self,
        cluster: &dyn PlacementView,
        source: &Arc<StoreInfo>,
    ) -> Option<Operator> {
        let region = cluster.rand_leader_region(source.id(), HealthPolicy::Healthy)?;
        let opts = cluster.options();
        let classifier = cluster.classifier();
        let target_filters: Vec<Box<dyn Filter>> = vec![
            Box::new(StoreStateFilter {
                scope: BALANCE_LEADER_NAME.to_string(),
                transfer_leader: true,
                move_region: false,
            }),
            Box::new(NamespaceFilter::new(
                BALANCE_LEADER_NAME,
                classifier.clone(),
                classifier.region_namespace(&region),
            )),
        ];
        let target = cluster
            .get_follower_stores(&region)
            .into_iter()
            .filter(|s| !crate::filter::filter_target(opts, s, &target_filters))
            .min_by(|a, b| {
                resource_score(a, ResourceKind::Leader, opts, 0)
                    .total_cmp(&resource_score(b, ResourceKind::Leader, opts, 0))
            })?;
        self.build_transfer(cluster, &region, source, &target)
    }

    /// Pull a leader onto `target` from the leader store of one of its
    /// follower regions.
    fn transfer_leader_in(
        &self,
        cluster: &dyn PlacementView,
        target: &Arc<StoreInfo>,
    ) -> Option<Operator> {
        let region = cluster.rand_follower_region(target.id(), HealthPolicy::Healthy)?;
        let source = cluster.get_leader_store(&region)?;
        self.build_transfer(cluster, &region, &source, target)
    }

    fn build_transfer(
        &self,
        cluster: &dyn PlacementView,
        region: &RegionInfo,
        source: &Arc<StoreInfo>,
        target: &Arc<StoreInfo>,
    ) -> Option<Operator> {
        let opts = cluster.options();
        let influence = cluster.op_influence();
        if !should_balance(opts, source, target, region, ResourceKind::Leader, &influence) {
            debug!(
                scheduler = BALANCE_LEADER_NAME,
                region_id = region.id(),
                source = source.id(),
                target = target.id(),
                "skip leader transfer, gap under tolerance"
            );
            return None;
        }
        Some(create_transfer_leader_operator(
            "balance-leader",
            region,
            OpKind::BALANCE,
            target.id(),
        ))
    }
}

impl Scheduler for BalanceLeaderScheduler {
    fn name(&self) -> &str {
        BALANCE_LEADER_NAME
    }

    fn scheduler_type(&self) -> &'static str {
        "balance-leader"
    }

    fn kind(&self) -> OpKind {
        OpKind::LEADER | OpKind::BALANCE
    }

    fn is_schedule_allowed(&self, cluster: &dyn PlacementView) -> bool {
        self.controller.operator_count(OpKind::LEADER)
            < cluster.options().schedule_limit(OpKind::LEADER)
    }

    fn schedule(&mut self, cluster: &dyn PlacementView) -> Vec<Operator> {
        let opts = cluster.options();
        let stores = cluster.get_stores();
        let taint_filter: Vec<Box<dyn Filter>> = vec![Box::new(CacheFilter::new(
            BALANCE_LEADER_NAME,
            self.taint.clone(),
        ))];

        if let Some(source) = self.selector.select_source(opts, &stores, &taint_filter) {
            if let Some(op) = self.transfer_leader_out(cluster, &source) {
                return vec![op];
            }
            self.taint.put(source.id());
        }

        if let Some(target) = self.selector.select_target(opts, &stores, &[]) {
            if let Some(op) = self.transfer_leader_in(cluster, &target) {
                return vec![op];
            }
        }
        Vec::new()
    }
}
