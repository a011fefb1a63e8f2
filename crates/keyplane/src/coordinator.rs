//! The scheduling loop.
//!
//! One cooperative dispatch tick runs every enabled scheduler in sequence on
//! a shared clock; a separate patrol walks the region space through the
//! repair checkers. Both loops observe the cluster quit signal and finish
//! their current unit of work before exiting. Scheduling stays gated until
//! the prepare checker has seen enough of the cluster.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::checker::{MergeChecker, NamespaceChecker, ReplicaChecker};
use crate::cluster::RaftCluster;
use crate::error::Result;
use crate::operator::OpKind;
use crate::operator_controller::OperatorController;
use crate::scheduler::{create_scheduler, PlacementView, Scheduler};

/// Shared clock of the scheduler dispatch loop.
const DISPATCH_INTERVAL: Duration = Duration::from_millis(500);

/// Regions examined per patrol tick.
const PATROL_SCAN_LIMIT: usize = 128;

/// Poll cadence of the prepare gate.
const PREPARE_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct Coordinator {
    cluster: Arc<RaftCluster>,
    controller: Arc<OperatorController>,
    schedulers: Vec<Box<dyn Scheduler>>,
    namespace_checker: NamespaceChecker,
    replica_checker: ReplicaChecker,
    merge_checker: MergeChecker,
    patrol_cursor: Vec<u8>,
}

impl Coordinator {
    /// Materialize the configured scheduler list by name.
    pub fn new(cluster: Arc<RaftCluster>) -> Result<Self> {
        let controller = cluster.operator_controller();
        let mut schedulers = Vec::new();
        for entry in &cluster.schedule_options().schedule().schedulers {
            if entry.disable {
                info!(scheduler = %entry.kind, "scheduler is disabled");
                continue;
            }
            let scheduler = create_scheduler(&entry.kind, controller.clone(), &entry.args)?;
            info!(scheduler = scheduler.name(), "scheduler created");
            schedulers.push(scheduler);
        }
        Ok(Coordinator {
            cluster,
            controller,
            schedulers,
            namespace_checker: NamespaceChecker::new("namespace-checker"),
            replica_checker: ReplicaChecker::new("replica-checker"),
            merge_checker: MergeChecker::new("merge-checker"),
            patrol_cursor: Vec::new(),
        })
    }

    /// Run until the quit signal flips. Consumes the coordinator; spawn it
    /// on its own task.
    pub async fn run(mut self, mut quit: watch::Receiver<bool>) {
        if !self.wait_prepared(&mut quit).await {
            return;
        }
        info!("coordinator starts to schedule");

        let mut dispatch = tokio::time::interval(DISPATCH_INTERVAL);
        let mut patrol =
            tokio::time::interval(self.cluster.schedule_options().patrol_region_interval());
        loop {
            tokio::select! {
                _ = dispatch.tick() => self.dispatch_schedulers(),
                _ = patrol.tick() => self.patrol_regions(),
                _ = quit.changed() => {
                    info!("coordinator stopped");
                    return;
                }
            }
        }
    }

    async fn wait_prepared(&self, quit: &mut watch::Receiver<bool>) -> bool {
        loop {
            if self.cluster.is_prepared() {
                return true;
            }
            tokio::select! {
                _ = tokio::time::sleep(PREPARE_POLL_INTERVAL) => {}
                _ = quit.changed() => return false,
            }
        }
    }

    /// One pass of the shared clock: each allowed scheduler gets a shot and
    /// its operators are offered to admission control.
    pub fn dispatch_schedulers(&mut self) {
        let view: &dyn PlacementView = self.cluster.as_ref();
        for scheduler in &mut self.schedulers {
            if !scheduler.is_schedule_allowed(view) {
                continue;
            }
            for op in scheduler.schedule(view) {
                if !self.controller.add_operator(op) {
                    debug!(scheduler = scheduler.name(), "operator rejected by admission control");
                }
            }
        }
    }

    /// Walk the next slice of the region space through the checkers.
    pub fn patrol_regions(&mut self) {
        let regions = self
            .cluster
            .scan_regions(&self.patrol_cursor, &[], PATROL_SCAN_LIMIT);
        if regions.is_empty() {
            self.patrol_cursor.clear();
            return;
        }

        for region in &regions {
            if self.controller.get_operator(region.id()).is_some() {
                continue;
            }
            self.check_region(region);
        }

        // Wrap around once the scan hits the end of the key space.
        match regions.last() {
            Some(last) if !last.end_key().is_empty() && regions.len() == PATROL_SCAN_LIMIT => {
                self.patrol_cursor = last.end_key().to_vec();
            }
            _ => self.patrol_cursor.clear(),
        }
    }

    fn check_region(&self, region: &Arc<crate::region::RegionInfo>) {
        let view: &dyn PlacementView = self.cluster.as_ref();
        let opts = self.cluster.schedule_options();

        if self.controller.operator_count(OpKind::REGION) < opts.replica_schedule_limit() {
            // Misplaced namespaces are repaired before replica-count issues.
            if let Some(op) = self.namespace_checker.check(view, region) {
                self.controller.add_operator(op);
                return;
            }
            if let Some(op) = self.replica_checker.check(view, region) {
                self.controller.add_operator(op);
                return;
            }
        }

        if self.controller.operator_count(OpKind::MERGE) < opts.schedule_limit(OpKind::MERGE) {
            if let Some((active, passive)) = self.merge_checker.check(view, region) {
                let passive_region_id = passive.region_id();
                if self.controller.add_operator(active) {
                    if !self.controller.add_operator(passive) {
                        // Merge operators only make sense as a pair.
                        warn!(
                            region_id = region.id(),
                            target_id = passive_region_id,
                            "merge pair half-admitted, cancelling"
                        );
                        self.controller.remove_operator(region.id());
                    }
                }
            }
        }
    }

    pub fn schedulers(&self) -> Vec<&str> {
        self.schedulers.iter().map(|s| s.name()).collect()
    }
}
