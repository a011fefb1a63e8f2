//! Score-based source/target selection over filtered stores.

use std::sync::Arc;

use crate::filter::{filter_source, filter_target, Filter};
use crate::options::{LeaderScheduleStrategy, ResourceKind, ScheduleOptions};
use crate::store::StoreInfo;

/// Rank a store for one resource kind; `delta` is the projected size (or
/// count) change from live operators.
pub fn resource_score(
    store: &StoreInfo,
    kind: ResourceKind,
    opts: &ScheduleOptions,
    delta: i64,
) -> f64 {
    match kind {
        ResourceKind::Region => {
            store.region_score(opts.high_space_ratio(), opts.low_space_ratio(), delta)
        }
        ResourceKind::Leader => {
            let by_size = opts.leader_schedule_strategy() == LeaderScheduleStrategy::Size;
            store.leader_score(by_size, delta)
        }
    }
}

/// Picks the most loaded admissible source and the least loaded admissible
/// target by resource score.
pub struct BalanceSelector {
    kind: ResourceKind,
    filters: Vec<Box<dyn Filter>>,
}

impl BalanceSelector {
    pub fn new(kind: ResourceKind, filters: Vec<Box<dyn Filter>>) -> Self {
        BalanceSelector { kind, filters }
    }

    pub fn select_source(
        &self,
        opts: &ScheduleOptions,
        stores: &[Arc<StoreInfo>],
        extra_filters: &[Box<dyn Filter>],
    ) -> Option<Arc<StoreInfo>> {
        stores
            .iter()
            .filter(|s| !filter_source(opts, s, &self.filters))
            .filter(|s| !filter_source(opts, s, extra_filters))
            .max_by(|a, b| {
                let sa = resource_score(a, self.kind, opts, 0);
                let sb = resource_score(b, self.kind, opts, 0);
                sa.total_cmp(&sb)
            })
            .cloned()
    }

    pub fn select_target(
        &self,
        opts: &ScheduleOptions,
        stores: &[Arc<StoreInfo>],
        extra_filters: &[Box<dyn Filter>],
    ) -> Option<Arc<StoreInfo>> {
        stores
            .iter()
            .filter(|s| !filter_target(opts, s, &self.filters))
            .filter(|s| !filter_target(opts, s, extra_filters))
            .min_by(|a, b| {
                let sa = resource_score(a, self.kind, opts, 0);
                let sb = resource_score(b, self.kind, opts, 0);
                sa.total_cmp(&sb)
            })
            .cloned()
    }
}
