//! Scheduling scenarios: region balancing, operator admission limits, and
//! the hot-region guard, driven through real heartbeats.

use std::sync::Arc;

use keyplane::checker::{NamespaceChecker, ReplicaChecker};
use keyplane::cluster::RaftCluster;
use keyplane::namespace::Classifier;
use keyplane::operator::create_move_peer_operator;
use keyplane::options::{ReplicationConfig, ScheduleConfig, ScheduleOptions};
use keyplane::region::{Peer, RegionEpoch, RegionInfo, RegionMeta};
use keyplane::scheduler::{create_scheduler, is_scheduler_registered, PlacementView};
use keyplane::schedulers::balance_region::BalanceRegionScheduler;
use keyplane::schedulers::register_builtin_schedulers;
use keyplane::storage::MetaStorage;
use keyplane::store::{StoreInfo, StoreMeta, StoreStats};
use keyplane::{OpKind, OpStep, Scheduler};

fn new_cluster(schedule: ScheduleConfig) -> Arc<RaftCluster> {
    let opts = Arc::new(ScheduleOptions::new(schedule, ReplicationConfig::default()));
    RaftCluster::new(1, opts, MetaStorage::in_memory(1)).unwrap()
}

fn add_store_with_space(cluster: &RaftCluster, id: u64) {
    let mut meta = StoreMeta::new(id, format!("127.0.0.1:{}", 20160 + id));
    meta.version = "3.0.0".to_string();
    cluster.put_store(meta).unwrap();
    let stats = StoreStats {
        store_id: id,
        capacity: 100 << 30,
        available: 60 << 30,
        used_size: 40 << 30,
        ..Default::default()
    };
    cluster.handle_store_heartbeat(&stats).unwrap();
}

fn region(id: u64, start: &[u8], end: &[u8], stores: &[u64], size_mib: i64) -> RegionInfo {
    let mut meta = RegionMeta::new(id, start.to_vec(), end.to_vec());
    meta.epoch = RegionEpoch::new(1, 1);
    meta.peers = stores
        .iter()
        .enumerate()
        .map(|(i, &s)| Peer::new(id * 100 + i as u64, s))
        .collect();
    let leader = meta.peers[0];
    RegionInfo::new(meta)
        .with_leader(Some(leader))
        .with_approximates(size_mib, size_mib * 1000)
}

#[test]
fn fully_replicated_region_with_no_spare_store_yields_no_operator() {
    let cluster = new_cluster(ScheduleConfig::default());
    for id in 1..=3 {
        add_store_with_space(&cluster, id);
    }
    cluster
        .process_region_heartbeat(region(1, b"", b"", &[1, 2, 3], 100))
        .unwrap();
    // Skew the scores to {300, 200, 100} through region weights; the only
    // region already spans every store, so there is nowhere to move it.
    cluster.set_store_weight(1, 1.0, 1.0 / 3.0).unwrap();
    cluster.set_store_weight(2, 1.0, 0.5).unwrap();

    let mut scheduler = BalanceRegionScheduler::new(cluster.operator_controller());
    assert!(scheduler.schedule(cluster.as_ref()).is_empty());
}

#[test]
fn imbalance_moves_a_peer_off_the_heaviest_store() {
    let cluster = new_cluster(ScheduleConfig::default());
    for id in 1..=4 {
        add_store_with_space(&cluster, id);
    }
    // Store 1 hosts all three regions, the others two each: region scores
    // 300 vs 200, so store 1 is the source.
    cluster
        .process_region_heartbeat(region(1, b"a", b"b", &[1, 2, 3], 100))
        .unwrap();
    cluster
        .process_region_heartbeat(region(2, b"b", b"c", &[1, 2, 4], 100))
        .unwrap();
    cluster
        .process_region_heartbeat(region(3, b"c", b"d", &[1, 3, 4], 100))
        .unwrap();

    let mut scheduler = BalanceRegionScheduler::new(cluster.operator_controller());
    let ops = scheduler.schedule(cluster.as_ref());
    assert_eq!(ops.len(), 1);
    let op = &ops[0];
    assert_eq!(op.source_store(), Some(1));
    assert!(op.kind().contains(OpKind::REGION));
    assert!(op.kind().contains(OpKind::BALANCE));
    assert!(matches!(op.steps()[0], OpStep::AddPeer { .. }));
    assert!(op
        .steps()
        .iter()
        .any(|s| matches!(s, OpStep::RemovePeer { store_id: 1 })));
}

#[test]
fn hot_regions_are_never_balanced() {
    let cluster = new_cluster(ScheduleConfig::default());
    for id in 1..=4 {
        add_store_with_space(&cluster, id);
    }
    let hot = |id: u64, start: &[u8], end: &[u8], stores: &[u64]| {
        region(id, start, end, stores, 100).with_flow(10 << 30, 0, 1_000_000, 0)
    };
    // Same imbalance as above, but every region keeps reporting a huge write
    // flow until it crosses the cache hits threshold.
    for _ in 0..3 {
        cluster
            .process_region_heartbeat(hot(1, b"a", b"b", &[1, 2, 3]))
            .unwrap();
        cluster
            .process_region_heartbeat(hot(2, b"b", b"c", &[1, 2, 4]))
            .unwrap();
        cluster
            .process_region_heartbeat(hot(3, b"c", b"d", &[1, 3, 4]))
            .unwrap();
    }
    assert!(cluster.is_region_hot(&cluster.get_region(1).unwrap()));

    let mut scheduler = BalanceRegionScheduler::new(cluster.operator_controller());
    assert!(scheduler.schedule(cluster.as_ref()).is_empty());
}

#[test]
fn operator_admission_respects_region_limit() {
    let schedule = ScheduleConfig {
        region_schedule_limit: 2,
        store_balance_rate: 1000.0,
        ..Default::default()
    };
    let cluster = new_cluster(schedule);
    for id in 1..=5 {
        add_store_with_space(&cluster, id);
    }
    for rid in 1..=3u64 {
        let start = vec![b'a' + rid as u8];
        let end = vec![b'a' + rid as u8 + 1];
        cluster
            .process_region_heartbeat(region(rid, &start, &end, &[1, 2, 3], 50))
            .unwrap();
    }
    let controller = cluster.operator_controller();
    let mv = |rid: u64| {
        let r = cluster.get_region(rid).unwrap();
        create_move_peer_operator("balance-region", &r, OpKind::BALANCE, 3, 4 + (rid % 2), 900 + rid)
    };

    assert!(controller.add_operator(mv(1)));
    assert!(controller.add_operator(mv(2)));
    assert!(!controller.add_operator(mv(3)));

    // Completing region 1's operator frees a slot.
    let done = cluster.get_region(1).unwrap();
    let mut meta = done.meta().clone();
    meta.epoch = RegionEpoch::new(1, 3);
    meta.peers = vec![Peer::new(100, 1), Peer::new(101, 2), Peer::new(901, 5)];
    let finished = RegionInfo::new(meta).with_leader(Some(Peer::new(100, 1)));
    cluster.process_region_heartbeat(finished.clone()).unwrap();
    assert!(cluster.region_heartbeat(finished).unwrap().is_none());

    assert!(controller.add_operator(mv(3)));
}

/// Stores 1-3 belong to "alpha", everything else to "beta"; all regions
/// classify as "alpha".
struct TierNamespaces;

impl Classifier for TierNamespaces {
    fn store_namespace(&self, store: &StoreInfo) -> String {
        if store.id() <= 3 {
            "alpha".to_string()
        } else {
            "beta".to_string()
        }
    }

    fn region_namespace(&self, _region: &RegionInfo) -> String {
        "alpha".to_string()
    }
}

fn namespaced_cluster() -> Arc<RaftCluster> {
    let opts = Arc::new(ScheduleOptions::default());
    let cluster = RaftCluster::with_classifier(
        1,
        opts,
        MetaStorage::in_memory(1),
        Arc::new(TierNamespaces),
    )
    .unwrap();
    for id in 1..=4 {
        add_store_with_space(&cluster, id);
    }
    cluster
}

#[test]
fn namespace_checker_relocates_misplaced_peer() {
    let cluster = namespaced_cluster();
    // The peer on store 4 sits outside the region's namespace; store 3 is
    // the only admissible replacement.
    cluster
        .process_region_heartbeat(region(1, b"", b"", &[1, 2, 4], 100))
        .unwrap();

    let checker = NamespaceChecker::new("namespace-checker");
    let cached = cluster.get_region(1).unwrap();
    let op = checker.check(cluster.as_ref(), &cached).unwrap();
    assert_eq!(op.source_store(), Some(4));
    assert!(op
        .steps()
        .iter()
        .any(|s| matches!(s, OpStep::AddPeer { store_id: 3, .. })));

    // The disable flag gates the whole checker.
    let disabled = ScheduleConfig {
        disable_namespace_relocation: true,
        ..Default::default()
    };
    cluster
        .schedule_options()
        .update_schedule(disabled, |_| true)
        .unwrap();
    assert!(checker.check(cluster.as_ref(), &cached).is_none());
}

#[test]
fn replica_placement_stays_inside_the_region_namespace() {
    let cluster = namespaced_cluster();
    // Under-replicated: the make-up peer must land on the in-namespace
    // store 3, never on the idle "beta" store 4.
    cluster
        .process_region_heartbeat(region(1, b"", b"", &[1, 2], 100))
        .unwrap();

    let checker = ReplicaChecker::new("replica-checker");
    let cached = cluster.get_region(1).unwrap();
    let op = checker.check(cluster.as_ref(), &cached).unwrap();
    assert!(matches!(op.steps()[0], OpStep::AddPeer { store_id: 3, .. }));
}

#[test]
fn builtin_schedulers_materialize_by_name() {
    register_builtin_schedulers();
    let cluster = new_cluster(ScheduleConfig::default());
    let controller = cluster.operator_controller();

    for name in ["balance-region", "balance-leader", "hot-region", "label", "separate-cold-hot"] {
        assert!(is_scheduler_registered(name), "{name} is not registered");
        let scheduler = create_scheduler(name, controller.clone(), &[]).unwrap();
        assert_eq!(scheduler.scheduler_type(), name);
        assert!(scheduler.is_schedule_allowed(cluster.as_ref()));
    }
    assert!(create_scheduler("no-such-scheduler", controller, &[]).is_err());
}

#[test]
fn empty_source_tier_falls_through_to_performance_tier() {
    let cluster = new_cluster(ScheduleConfig::default());
    for id in 1..=4 {
        add_store_with_space(&cluster, id);
    }
    cluster
        .process_region_heartbeat(region(1, b"a", b"b", &[1, 2, 3], 100))
        .unwrap();
    cluster
        .process_region_heartbeat(region(2, b"b", b"c", &[1, 2, 4], 100))
        .unwrap();
    cluster
        .process_region_heartbeat(region(3, b"c", b"d", &[1, 3, 4], 100))
        .unwrap();

    // All stores are performance tier, so the storage-tier pass finds no
    // source and the performance pass still produces the move.
    let mut scheduler = BalanceRegionScheduler::new(cluster.operator_controller());
    let view: &dyn PlacementView = cluster.as_ref();
    assert_eq!(scheduler.schedule(view).len(), 1);
}
