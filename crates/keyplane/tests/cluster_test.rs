//! End-to-end scenarios for the heartbeat path and the store lifecycle,
//! driven through the public `RaftCluster` surface against the in-memory
//! metadata backend.

use std::sync::Arc;

use keyplane::cluster::{BootstrapRequest, RaftCluster};
use keyplane::error::Error;
use keyplane::scheduler::PlacementView;
use keyplane::options::{ReplicationConfig, ScheduleConfig, ScheduleOptions};
use keyplane::region::{Peer, RegionEpoch, RegionInfo, RegionMeta};
use keyplane::storage::MetaStorage;
use keyplane::store::{StoreLabel, StoreMeta, StoreStats};

fn new_cluster(schedule: ScheduleConfig, replication: ReplicationConfig) -> Arc<RaftCluster> {
    let opts = Arc::new(ScheduleOptions::new(schedule, replication));
    RaftCluster::new(1, opts, MetaStorage::in_memory(1)).unwrap()
}

fn default_cluster() -> Arc<RaftCluster> {
    new_cluster(ScheduleConfig::default(), ReplicationConfig::default())
}

fn add_store(cluster: &RaftCluster, id: u64) {
    let mut meta = StoreMeta::new(id, format!("127.0.0.1:{}", 20160 + id));
    meta.version = "3.0.0".to_string();
    cluster.put_store(meta).unwrap();
}

fn region(id: u64, start: &[u8], end: &[u8], epoch: RegionEpoch, stores: &[u64]) -> RegionInfo {
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
fn stale_heartbeat_is_rejected() {
    let cluster = default_cluster();
    for id in 1..=3 {
        add_store(&cluster, id);
    }

    let fresh = region(1, b"", b"", RegionEpoch::new(5, 2), &[1, 2, 3]);
    cluster.process_region_heartbeat(fresh).unwrap();

    // version 4 < 5 loses even with the higher conf version.
    let stale = region(1, b"", b"", RegionEpoch::new(4, 3), &[1, 2, 3]);
    assert!(matches!(
        cluster.process_region_heartbeat(stale),
        Err(Error::RegionStale { .. })
    ));
    assert_eq!(cluster.get_region(1).unwrap().epoch(), RegionEpoch::new(5, 2));
}

#[test]
fn ordered_heartbeats_settle_on_the_greater_epoch() {
    let cluster = default_cluster();
    for id in 1..=3 {
        add_store(&cluster, id);
    }
    cluster
        .process_region_heartbeat(region(1, b"", b"", RegionEpoch::new(5, 2), &[1, 2, 3]))
        .unwrap();
    cluster
        .process_region_heartbeat(region(1, b"", b"", RegionEpoch::new(5, 3), &[1, 2, 3]))
        .unwrap();
    assert_eq!(cluster.get_region(1).unwrap().epoch(), RegionEpoch::new(5, 3));
}

#[test]
fn overlap_eviction_covers_split_children() {
    let cluster = default_cluster();
    for id in 1..=3 {
        add_store(&cluster, id);
    }
    cluster
        .process_region_heartbeat(region(1, b"a", b"m", RegionEpoch::new(1, 1), &[1, 2, 3]))
        .unwrap();
    cluster
        .process_region_heartbeat(region(2, b"m", b"z", RegionEpoch::new(1, 1), &[1, 2, 3]))
        .unwrap();

    // A newer-version region covering both replaces them in cache and
    // storage.
    cluster
        .process_region_heartbeat(region(3, b"a", b"z", RegionEpoch::new(2, 1), &[1, 2, 3]))
        .unwrap();

    assert!(cluster.get_region(1).is_none());
    assert!(cluster.get_region(2).is_none());
    assert_eq!(cluster.get_region_by_key(b"q").unwrap().id(), 3);

    let storage = cluster.storage();
    assert!(storage.load_region(1).unwrap().is_none());
    assert!(storage.load_region(2).unwrap().is_none());
    assert!(storage.load_region(3).unwrap().is_some());
}

#[test]
fn strict_label_matching_gates_store_admission() {
    let replication = ReplicationConfig {
        max_replicas: 3,
        location_labels: vec!["zone".to_string(), "rack".to_string()],
        strictly_match_label: true,
    };
    let cluster = new_cluster(ScheduleConfig::default(), replication);

    let mut incomplete = StoreMeta::new(1, "127.0.0.1:20161");
    incomplete.version = "3.0.0".to_string();
    incomplete.labels = vec![StoreLabel::new("zone", "z1")];
    assert!(matches!(
        cluster.put_store(incomplete),
        Err(Error::Validation(_))
    ));

    let mut complete = StoreMeta::new(1, "127.0.0.1:20161");
    complete.version = "3.0.0".to_string();
    complete.labels = vec![StoreLabel::new("zone", "z1"), StoreLabel::new("rack", "r1")];
    cluster.put_store(complete).unwrap();

    let mut unknown_key = StoreMeta::new(2, "127.0.0.1:20162");
    unknown_key.version = "3.0.0".to_string();
    unknown_key.labels = vec![
        StoreLabel::new("zone", "z2"),
        StoreLabel::new("rack", "r2"),
        StoreLabel::new("floor", "f1"),
    ];
    assert!(matches!(
        cluster.put_store(unknown_key),
        Err(Error::Validation(_))
    ));
}

#[test]
fn store_bury_lifecycle() {
    let cluster = default_cluster();
    for id in 1..=4 {
        add_store(&cluster, id);
        let stats = StoreStats {
            store_id: id,
            capacity: 100 << 30,
            available: 80 << 30,
            ..Default::default()
        };
        cluster.handle_store_heartbeat(&stats).unwrap();
    }
    cluster
        .process_region_heartbeat(region(1, b"", b"", RegionEpoch::new(1, 1), &[1, 2, 3]))
        .unwrap();

    cluster.remove_store(3).unwrap();
    assert!(cluster.get_store(3).unwrap().is_offline());

    // Still holding a region: the background sweep leaves it offline.
    cluster.check_stores();
    assert!(cluster.get_store(3).unwrap().is_offline());

    // The heartbeat that moves the peer off store 3 drains it.
    let mut meta = RegionMeta::new(1, vec![], vec![]);
    meta.epoch = RegionEpoch::new(1, 2);
    meta.peers = vec![Peer::new(100, 1), Peer::new(101, 2), Peer::new(110, 4)];
    let moved = RegionInfo::new(meta).with_leader(Some(Peer::new(100, 1)));
    cluster.process_region_heartbeat(moved).unwrap();

    cluster.check_stores();
    assert!(cluster.get_store(3).unwrap().is_tombstone());

    cluster.remove_tombstone_records().unwrap();
    assert!(cluster.get_store(3).is_none());
    assert!(cluster.storage().load_store(3).unwrap().is_none());
}

#[test]
fn bootstrap_round_trip() {
    let cluster = default_cluster();
    let store = StoreMeta::new(1, "127.0.0.1:20161");
    let mut first_region = RegionMeta::new(1, vec![], vec![]);
    first_region.peers = vec![Peer::new(2, 1)];

    cluster
        .bootstrap(BootstrapRequest {
            store: store.clone(),
            region: first_region.clone(),
        })
        .unwrap();

    // The whole key space routes to the first region.
    assert_eq!(cluster.get_region_by_key(b"").unwrap().id(), 1);
    assert_eq!(cluster.get_region_by_key(b"anything").unwrap().id(), 1);
    assert_eq!(cluster.storage().load_stores().unwrap(), vec![store]);
    assert_eq!(cluster.storage().load_regions().unwrap(), vec![first_region]);
    assert!(cluster.storage().load_bootstrap_time().unwrap().is_some());
}

#[test]
fn heartbeats_drive_admitted_operators() {
    let cluster = default_cluster();
    for id in 1..=4 {
        add_store(&cluster, id);
    }
    let r = region(1, b"", b"", RegionEpoch::new(1, 1), &[1, 2, 3]);
    cluster.process_region_heartbeat(r.clone()).unwrap();

    let op = keyplane::operator::create_move_peer_operator(
        "balance-region",
        &r,
        keyplane::OpKind::BALANCE,
        3,
        4,
        999,
    );
    assert!(cluster.operator_controller().add_operator(op));

    // The next heartbeat is told to add the new peer.
    let step = cluster.region_heartbeat(r.clone()).unwrap().unwrap();
    assert!(matches!(
        step,
        keyplane::OpStep::AddPeer { store_id: 4, peer_id: 999 }
    ));

    // Once the region reports the new peer set, the next instruction is the
    // removal, and after that the operator retires.
    let mut meta = r.meta().clone();
    meta.epoch = RegionEpoch::new(1, 2);
    meta.peers.push(Peer::new(999, 4));
    let grown = RegionInfo::new(meta).with_leader(Some(Peer::new(100, 1)));
    cluster.process_region_heartbeat(grown.clone()).unwrap();
    let step = cluster.region_heartbeat(grown.clone()).unwrap().unwrap();
    assert!(matches!(step, keyplane::OpStep::RemovePeer { store_id: 3 }));

    let mut meta = grown.meta().clone();
    meta.epoch = RegionEpoch::new(1, 3);
    meta.peers.retain(|p| p.store_id != 3);
    let shrunk = RegionInfo::new(meta).with_leader(Some(Peer::new(100, 1)));
    assert!(cluster.region_heartbeat(shrunk).unwrap().is_none());
    assert!(cluster.operator_controller().get_operator(1).is_none());
}
