//! Admission control and lifecycle of live operators.
//!
//! At most one live operator exists per region; per-kind live counts stay
//! strictly under their configured limits; and each store's outbound
//! region-moving rate is throttled by a token bucket refilled at
//! `store-balance-rate` tokens per minute. Rejections are counted, never
//! surfaced as errors; the scheduler that produced the operator records its
//! own cooldown.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::operator::{OpInfluence, OpKind, OpStatus, OpStep, Operator};
use crate::options::ScheduleOptions;
use crate::region::RegionInfo;

/// How long finished operators stay visible in history.
const HISTORY_KEEP: Duration = Duration::from_secs(10 * 60);

/// Record of a finished operator.
#[derive(Debug, Clone)]
pub struct OperatorRecord {
    pub region_id: u64,
    pub desc: &'static str,
    pub kind: OpKind,
    pub status: OpStatus,
    pub finished: Instant,
}

struct TokenBucket {
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    fn new(capacity: f64) -> Self {
        TokenBucket {
            tokens: capacity,
            last: Instant::now(),
        }
    }

    fn refill(&mut self, rate_per_min: f64) {
        let elapsed = self.last.elapsed().as_secs_f64();
        self.last = Instant::now();
        self.tokens = (self.tokens + elapsed * rate_per_min / 60.0).min(rate_per_min.max(1.0));
    }

    fn try_take(&mut self, rate_per_min: f64) -> bool {
        self.refill(rate_per_min);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn has_budget(&mut self, rate_per_min: f64) -> bool {
        self.refill(rate_per_min);
        self.tokens >= 1.0
    }
}

#[derive(Default)]
struct Inner {
    operators: HashMap<u64, Operator>,
    histories: VecDeque<OperatorRecord>,
    store_limits: HashMap<u64, TokenBucket>,
    rejected: u64,
}

impl Inner {
    fn live_count(&self, kind: OpKind) -> u64 {
        self.operators
            .values()
            .filter(|op| !op.is_end() && op.kind().intersects(kind))
            .count() as u64
    }

    fn retire(&mut self, mut op: Operator, status: OpStatus) {
        op.cancel(status);
        self.histories.push_back(OperatorRecord {
            region_id: op.region_id(),
            desc: op.desc(),
            kind: op.kind(),
            status: op.status(),
            finished: Instant::now(),
        });
    }
}

pub struct OperatorController {
    opts: Arc<ScheduleOptions>,
    inner: Mutex<Inner>,
}

impl OperatorController {
    pub fn new(opts: Arc<ScheduleOptions>) -> Arc<Self> {
        Arc::new(OperatorController {
            opts,
            inner: Mutex::new(Inner::default()),
        })
    }

    /// Live operators whose kind intersects `kind`.
    pub fn operator_count(&self, kind: OpKind) -> u64 {
        self.inner.lock().unwrap().live_count(kind)
    }

    pub fn get_operator(&self, region_id: u64) -> Option<Operator> {
        self.inner.lock().unwrap().operators.get(&region_id).cloned()
    }

    pub fn rejected_count(&self) -> u64 {
        self.inner.lock().unwrap().rejected
    }

    /// Admit an operator. Returns false (and counts the rejection) when any
    /// admission rule fails; the operator is dropped in that case.
    pub fn add_operator(&self, op: Operator) -> bool {
        let mut inner = self.inner.lock().unwrap();

        // One live operator per region. A strictly newer epoch replaces the
        // old operator, anything else loses the race.
        if let Some(existing) = inner.operators.get(&op.region_id()) {
            if !existing.is_end() {
                if op.region_epoch() > existing.region_epoch() {
                    info!(
                        region_id = op.region_id(),
                        old = %existing,
                        "replacing live operator with newer-epoch operator"
                    );
                    let old = inner.operators.remove(&op.region_id()).unwrap();
                    inner.retire(old, OpStatus::Replaced);
                } else {
                    inner.rejected += 1;
                    debug!(region_id = op.region_id(), op = %op, "region already has a live operator");
                    return false;
                }
            }
        }

        // Per-kind concurrency limits.
        for bit in op.kind().bits() {
            if inner.live_count(bit) >= self.opts.schedule_limit(bit) {
                inner.rejected += 1;
                debug!(region_id = op.region_id(), kind = %bit, "operator kind limit reached");
                return false;
            }
        }

        // Outbound rate of the source store, charged for peer movement only.
        if op.kind().contains(OpKind::REGION) {
            if let Some(source) = op.source_store() {
                let rate = self.opts.store_balance_rate();
                let bucket = inner
                    .store_limits
                    .entry(source)
                    .or_insert_with(|| TokenBucket::new(rate));
                if !bucket.try_take(rate) {
                    inner.rejected += 1;
                    debug!(store_id = source, "store operator rate exhausted");
                    return false;
                }
            }
        }

        info!(region_id = op.region_id(), op = %op, "operator admitted");
        inner.operators.insert(op.region_id(), op);
        true
    }

    /// Drive the live operator of a region one heartbeat further. Returns the
    /// step the region should execute next, if any.
    pub fn dispatch(&self, region: &RegionInfo) -> Option<OpStep> {
        let mut inner = self.inner.lock().unwrap();
        let (step, timed_out, op_version) = {
            let op = inner.operators.get_mut(&region.id())?;
            (op.check(region), op.is_timed_out(), op.region_epoch().version)
        };

        match step {
            None => {
                let op = inner.operators.remove(&region.id()).unwrap();
                let status = op.status();
                info!(region_id = region.id(), op = %op, status = ?status, "operator finished");
                inner.retire(op, status);
                None
            }
            Some(step) => {
                // A version bump the operator did not ask for (split or merge
                // landed underneath it) invalidates the remaining plan.
                let expects_version_change = matches!(
                    step,
                    OpStep::SplitRegion { .. } | OpStep::MergeRegion { .. }
                );
                if region.epoch().version > op_version && !expects_version_change {
                    let op = inner.operators.remove(&region.id()).unwrap();
                    info!(region_id = region.id(), op = %op, "operator cancelled by epoch change");
                    inner.retire(op, OpStatus::Cancelled);
                    return None;
                }
                if timed_out {
                    let op = inner.operators.remove(&region.id()).unwrap();
                    info!(region_id = region.id(), op = %op, "operator timed out");
                    inner.retire(op, OpStatus::Timeout);
                    return None;
                }
                Some(step)
            }
        }
    }

    pub fn remove_operator(&self, region_id: u64) -> Option<Operator> {
        let mut inner = self.inner.lock().unwrap();
        let op = inner.operators.remove(&region_id)?;
        inner.retire(op.clone(), OpStatus::Cancelled);
        Some(op)
    }

    /// Reap expired live operators and drop stale history.
    pub fn prune_history(&self) {
        let mut inner = self.inner.lock().unwrap();
        let expired: Vec<u64> = inner
            .operators
            .iter()
            .filter(|(_, op)| op.is_timed_out())
            .map(|(&id, _)| id)
            .collect();
        for region_id in expired {
            let op = inner.operators.remove(&region_id).unwrap();
            info!(region_id, op = %op, "reaping expired operator");
            inner.retire(op, OpStatus::Timeout);
        }
        while let Some(front) = inner.histories.front() {
            if front.finished.elapsed() > HISTORY_KEEP {
                inner.histories.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn history(&self) -> Vec<OperatorRecord> {
        self.inner.lock().unwrap().histories.iter().cloned().collect()
    }

    /// Per-store deltas the live operators will apply once they finish.
    pub fn op_influence(
        &self,
        get_region: impl Fn(u64) -> Option<Arc<RegionInfo>>,
    ) -> OpInfluence {
        let inner = self.inner.lock().unwrap();
        let mut influence = OpInfluence::default();
        for op in inner.operators.values() {
            if op.is_end() {
                continue;
            }
            if let Some(region) = get_region(op.region_id()) {
                op.influence(&mut influence, &region);
            }
        }
        influence
    }

    /// Whether the store still has outbound operator budget.
    pub fn store_has_budget(&self, store_id: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let rate = self.opts.store_balance_rate();
        inner
            .store_limits
            .entry(store_id)
            .or_insert_with(|| TokenBucket::new(rate))
            .has_budget(rate)
    }

    /// Forget a removed store's rate budget.
    pub fn remove_store_limit(&self, store_id: u64) {
        self.inner.lock().unwrap().store_limits.remove(&store_id);
    }
}
