//! Scheduler framework: the read-only cluster facade handed to schedulers,
//! the scheduler capability trait, and the name -> factory registry that
//! materializes the configured scheduler list.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::basic_cluster::HealthPolicy;
use crate::error::{Error, Result};
use crate::hot_cache::{FlowKind, HotPeerStat};
use crate::namespace::Classifier;
use crate::operator::{OpInfluence, OpKind, Operator};
use crate::operator_controller::OperatorController;
use crate::options::ScheduleOptions;
use crate::region::{Peer, RegionInfo};
use crate::store::StoreInfo;

/// Consistent read-only view of the cluster for scheduling decisions.
pub trait PlacementView: Send + Sync {
    fn options(&self) -> &ScheduleOptions;
    fn get_stores(&self) -> Vec<Arc<StoreInfo>>;
    fn get_store(&self, store_id: u64) -> Option<Arc<StoreInfo>>;
    fn get_region(&self, region_id: u64) -> Option<Arc<RegionInfo>>;
    fn get_region_stores(&self, region: &RegionInfo) -> Vec<Arc<StoreInfo>>;
    fn get_follower_stores(&self, region: &RegionInfo) -> Vec<Arc<StoreInfo>>;
    fn get_leader_store(&self, region: &RegionInfo) -> Option<Arc<StoreInfo>>;
    fn rand_leader_region(&self, store_id: u64, policy: HealthPolicy) -> Option<Arc<RegionInfo>>;
    fn rand_follower_region(&self, store_id: u64, policy: HealthPolicy)
        -> Option<Arc<RegionInfo>>;
    fn rand_pending_region(&self, store_id: u64, policy: HealthPolicy) -> Option<Arc<RegionInfo>>;
    fn rand_hot_region_from_store(&self, store_id: u64, kind: FlowKind)
        -> Option<Arc<RegionInfo>>;
    fn is_region_hot(&self, region: &RegionInfo) -> bool;
    fn region_flow_stats(&self, kind: FlowKind) -> HashMap<u64, Vec<HotPeerStat>>;
    fn adjacent_regions(
        &self,
        region: &RegionInfo,
    ) -> (Option<Arc<RegionInfo>>, Option<Arc<RegionInfo>>);
    fn average_region_size(&self) -> i64;
    /// The namespace classifier placement decisions must respect.
    fn classifier(&self) -> Arc<dyn Classifier>;
    /// Allocate a fresh peer id for a new peer on `store_id`.
    fn alloc_peer(&self, store_id: u64) -> Result<Peer>;
    /// Projected per-store deltas of currently live operators.
    fn op_influence(&self) -> OpInfluence;
}

/// A scheduler produces operators when its kind has concurrency budget left.
pub trait Scheduler: Send + Sync {
    fn name(&self) -> &str;
    fn scheduler_type(&self) -> &'static str;
    fn kind(&self) -> OpKind;
    fn is_schedule_allowed(&self, cluster: &dyn PlacementView) -> bool;
    fn schedule(&mut self, cluster: &dyn PlacementView) -> Vec<Operator>;
}

pub type SchedulerFactory =
    fn(Arc<OperatorController>, &[String]) -> Result<Box<dyn Scheduler>>;

fn registry() -> &'static Mutex<HashMap<&'static str, SchedulerFactory>> {
    static REGISTRY: OnceLock<Mutex<HashMap<&'static str, SchedulerFactory>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Register a named scheduler factory. Later registrations win, which keeps
/// repeated test setup idempotent.
pub fn register_scheduler(name: &'static str, factory: SchedulerFactory) {
    registry().lock().unwrap().insert(name, factory);
}

pub fn is_scheduler_registered(name: &str) -> bool {
    registry().lock().unwrap().contains_key(name)
}

/// Materialize a scheduler by its configured type name.
pub fn create_scheduler(
    name: &str,
    controller: Arc<OperatorController>,
    args: &[String],
) -> Result<Box<dyn Scheduler>> {
    let factory = {
        let registry = registry().lock().unwrap();
        registry.get(name).copied()
    };
    match factory {
        Some(factory) => factory(controller, args),
        None => Err(Error::validation(format!("unknown scheduler type {name:?}"))),
    }
}
