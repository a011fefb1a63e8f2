//! Concrete schedulers and the helpers they share.

pub mod balance_leader;
pub mod balance_region;
pub mod hot_region;
pub mod label;
pub mod separate_cold_hot;

use crate::operator::OpInfluence;
use crate::options::{LeaderScheduleStrategy, ResourceKind, ScheduleOptions};
use crate::region::RegionInfo;
use crate::scheduler::register_scheduler;
use crate::selector::resource_score;
use crate::store::StoreInfo;

/// Make every built-in scheduler constructible by its config name.
pub fn register_builtin_schedulers() {
    register_scheduler("balance-region", balance_region::factory);
    register_scheduler("balance-leader", balance_leader::factory);
    register_scheduler("hot-region", hot_region::factory);
    register_scheduler("label", label::factory);
    register_scheduler("separate-cold-hot", separate_cold_hot::factory);
}

/// The balance gate: with live-operator influence projected onto both sides,
/// the source must still out-score the target by the tolerant margin,
/// otherwise the move would thrash.
pub fn should_balance(
    opts: &ScheduleOptions,
    source: &StoreInfo,
    target: &StoreInfo,
    region: &RegionInfo,
    kind: ResourceKind,
    influence: &OpInfluence,
) -> bool {
    let (source_delta, target_delta, tolerant) = match kind {
        ResourceKind::Region => (
            influence.store(source.id()).region_size,
            influence.store(target.id()).region_size,
            opts.tolerant_size_ratio() * region.approximate_size() as f64,
        ),
        ResourceKind::Leader => match opts.leader_schedule_strategy() {
            LeaderScheduleStrategy::Count => (
                influence.store(source.id()).leader_count,
                influence.store(target.id()).leader_count,
                opts.tolerant_size_ratio(),
            ),
            LeaderScheduleStrategy::Size => (
                influence.store(source.id()).leader_size,
                influence.store(target.id()).leader_size,
                opts.tolerant_size_ratio() * region.approximate_size() as f64,
            ),
        },
    };
    let source_score = resource_score(source, kind, opts, source_delta);
    let target_score = resource_score(target, kind, opts, target_delta);
    source_score > target_score && source_score - target_score >= tolerant
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{ReplicationConfig, ScheduleConfig};
    use crate::region::RegionMeta;
    use crate::store::{StoreMeta, StoreStats};

    fn store(id: u64, region_size: i64) -> StoreInfo {
        const GIB: u64 = 1 << 30;
        let stats = StoreStats {
            capacity: 1024 * GIB,
            available: 1024 * GIB - ((region_size.max(0) as u64) << 20),
            used_size: (region_size.max(0) as u64) << 20,
            ..Default::default()
        };
        StoreInfo::new(StoreMeta::new(id, format!("s{id}")))
            .with_stats(stats)
            .with_counts(0, 1, 0, 0, region_size)
    }

    fn region_of_size(size: i64) -> RegionInfo {
        RegionInfo::new(RegionMeta::new(1, vec![], vec![])).with_approximates(size, 0)
    }

    #[test]
    fn equal_scores_never_balance() {
        let opts = ScheduleOptions::default();
        let influence = OpInfluence::default();
        let a = store(1, 100);
        let b = store(2, 100);
        assert!(!should_balance(
            &opts,
            &a,
            &b,
            &region_of_size(10),
            ResourceKind::Region,
            &influence
        ));
    }

    #[test]
    fn influence_counts_toward_the_gap() {
        let cfg = ScheduleConfig {
            tolerant_size_ratio: 0.0,
            ..Default::default()
        };
        let opts = ScheduleOptions::new(cfg, ReplicationConfig::default());
        let source = store(1, 200);
        let target = store(2, 100);
        let region = region_of_size(10);

        let no_influence = OpInfluence::default();
        assert!(should_balance(
            &opts,
            &source,
            &target,
            &region,
            ResourceKind::Region,
            &no_influence
        ));

        // A pending 100 MiB inbound on the target erases the gap.
        let mut influence = OpInfluence::default();
        influence.store_mut(2).region_size = 100;
        assert!(!should_balance(
            &opts,
            &source,
            &target,
            &region,
            ResourceKind::Region,
            &influence
        ));
    }

    #[test]
    fn tolerant_ratio_widens_the_gate() {
        let cfg = ScheduleConfig {
            tolerant_size_ratio: 5.0,
            ..Default::default()
        };
        let opts = ScheduleOptions::new(cfg, ReplicationConfig::default());
        let source = store(1, 140);
        let target = store(2, 100);
        let influence = OpInfluence::default();

        // Gap 40 < 5 * 10: not worth moving.
        assert!(!should_balance(
            &opts,
            &source,
            &target,
            &region_of_size(10),
            ResourceKind::Region,
            &influence
        ));
        assert!(should_balance(
            &opts,
            &source,
            &target,
            &region_of_size(4),
            ResourceKind::Region,
            &influence
        ));
    }
}
