//! Drains leaders off stores whose labels carry the reject-leader property.

use std::sync::Arc;

use tracing::debug;

use crate::basic_cluster::HealthPolicy;
use crate::error::Result;
use crate::filter::{filter_target, Filter, NamespaceFilter, StoreStateFilter};
use crate::operator::{create_transfer_leader_operator, OpKind, Operator};
use crate::operator_controller::OperatorController;
use crate::options::{ResourceKind, REJECT_LEADER};
use crate::scheduler::{PlacementView, Scheduler};
use crate::selector::resource_score;

pub const LABEL_NAME: &str = "label-scheduler";

pub fn factory(
    controller: Arc<OperatorController>,
    _args: &[String],
) -> Result<Box<dyn Scheduler>> {
    Ok(Box::new(LabelScheduler::new(controller)))
}

pub struct LabelScheduler {
    controller: Arc<OperatorController>,
}

impl LabelScheduler {
    pub fn new(controller: Arc<OperatorController>) -> Self {
        LabelScheduler { controller }
    }
}

impl Scheduler for LabelScheduler {
    fn name(&self) -> &str {
        LABEL_NAME
    }

    fn scheduler_type(&self) -> &'static str {
        "label"
    }

    fn kind(&self) -> OpKind {
        OpKind::LEADER
    }

    fn is_schedule_allowed(&self, cluster: &dyn PlacementView) -> bool {
        self.controller.operator_count(OpKind::LEADER)
            < cluster.options().schedule_limit(OpKind::LEADER)
    }

    fn schedule(&mut self, cluster: &dyn PlacementView) -> Vec<Operator> {
        let opts = cluster.options();
        let classifier = cluster.classifier();

        for store in cluster.get_stores() {
            if !opts.check_label_property(REJECT_LEADER, store.labels()) {
                continue;
            }
            let Some(region) = cluster.rand_leader_region(store.id(), HealthPolicy::Healthy)
            else {
                continue;
            };
            let target_filters: Vec<Box<dyn Filter>> = vec![
                Box::new(StoreStateFilter {
                    scope: LABEL_NAME.to_string(),
                    transfer_leader: true,
                    move_region: false,
                }),
                Box::new(NamespaceFilter::new(
                    LABEL_NAME,
                    classifier.clone(),
                    classifier.region_namespace(&region),
                )),
            ];
            let Some(target) = cluster
                .get_follower_stores(&region)
                .into_iter()
                .filter(|s| !filter_target(opts, s, &target_filters))
                .min_by(|a, b| {
                    resource_score(a, ResourceKind::Leader, opts, 0)
                        .total_cmp(&resource_score(b, ResourceKind::Leader, opts, 0))
                })
            else {
                continue;
            };
            debug!(
                scheduler = LABEL_NAME,
                region_id = region.id(),
                store_id = store.id(),
                "evicting leader from reject-leader store"
            );
            return vec![create_transfer_leader_operator(
                "label-reject-leader",
                &region,
                OpKind::default(),
                target.id(),
            )];
        }
        Vec::new()
    }
}
