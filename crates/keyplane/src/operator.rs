//! Operators: scheduled multi-step changes to one region.
//!
//! A step is a tagged variant; the heartbeat dispatch path is the only code
//! that interprets how a step lands in region state, by pattern-matching.
//! The operator itself is a cursor over its steps plus a status machine with
//! terminal states {Succeeded, Timeout, Cancelled, Replaced}.

use std::collections::HashMap;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::time::{Duration, Instant};

use crate::region::{Peer, RegionEpoch, RegionInfo, RegionMeta};

/// Leader-only operators settle in one heartbeat round.
const LEADER_OPERATOR_TIMEOUT: Duration = Duration::from_secs(10);
/// Anything moving data may wait on snapshots.
const REGION_OPERATOR_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Operator kind bitmask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct OpKind(u32);

impl OpKind {
    pub const LEADER: OpKind = OpKind(1 << 0);
    pub const REGION: OpKind = OpKind(1 << 1);
    pub const BALANCE: OpKind = OpKind(1 << 2);
    pub const ADMIN: OpKind = OpKind(1 << 3);
    pub const MERGE: OpKind = OpKind(1 << 4);
    pub const HOT: OpKind = OpKind(1 << 5);
    pub const ALL: OpKind = OpKind((1 << 6) - 1);

    pub fn contains(self, other: OpKind) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: OpKind) -> bool {
        self.0 & other.0 != 0
    }

    /// The individual bits set in this mask.
    pub fn bits(self) -> impl Iterator<Item = OpKind> {
        [
            OpKind::LEADER,
            OpKind::REGION,
            OpKind::BALANCE,
            OpKind::ADMIN,
            OpKind::MERGE,
            OpKind::HOT,
        ]
        .into_iter()
        .filter(move |k| self.contains(*k))
    }
}

impl BitOr for OpKind {
    type Output = OpKind;

    fn bitor(self, rhs: OpKind) -> OpKind {
        OpKind(self.0 | rhs.0)
    }
}

impl BitOrAssign for OpKind {
    fn bitor_assign(&mut self, rhs: OpKind) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (OpKind::LEADER, "leader"),
            (OpKind::REGION, "region"),
            (OpKind::BALANCE, "balance"),
            (OpKind::ADMIN, "admin"),
            (OpKind::MERGE, "merge"),
            (OpKind::HOT, "hot"),
        ];
        let mut first = true;
        for (kind, name) in names {
            if self.contains(kind) {
                if !first {
                    write!(f, ",")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        if first {
            write!(f, "none")?;
        }
        Ok(())
    }
}

/// One step of an operator.
#[derive(Debug, Clone, PartialEq)]
pub enum OpStep {
    AddPeer { store_id: u64, peer_id: u64 },
    AddLearner { store_id: u64, peer_id: u64 },
    PromoteLearner { store_id: u64, peer_id: u64 },
    RemovePeer { store_id: u64 },
    TransferLeader { from_store: u64, to_store: u64 },
    /// Finished once the region reports a version past the one it had when
    /// the split was requested.
    SplitRegion { since_version: u64 },
    /// Active side absorbs `target`; the passive side disappears from the
    /// cache when the merge lands.
    MergeRegion { target: RegionMeta, is_passive: bool, since_version: u64 },
}

impl OpStep {
    pub fn is_finished(&self, region: &RegionInfo) -> bool {
        match self {
            OpStep::AddPeer { store_id, peer_id } => region
                .store_peer(*store_id)
                .map(|p| p.id == *peer_id && !p.is_learner() && !region.is_pending(p.id))
                .unwrap_or(false),
            OpStep::AddLearner { store_id, peer_id } => region
                .store_peer(*store_id)
                .map(|p| p.id == *peer_id && p.is_learner() && !region.is_pending(p.id))
                .unwrap_or(false),
            OpStep::PromoteLearner { store_id, peer_id } => region
                .store_peer(*store_id)
                .map(|p| p.id == *peer_id && !p.is_learner())
                .unwrap_or(false),
            OpStep::RemovePeer { store_id } => region.store_peer(*store_id).is_none(),
            OpStep::TransferLeader { to_store, .. } => region.leader_store_id() == *to_store,
            OpStep::SplitRegion { since_version }
            | OpStep::MergeRegion { since_version, .. } => {
                region.epoch().version > *since_version
            }
        }
    }

    fn influence(&self, influence: &mut OpInfluence, region: &RegionInfo) {
        let size = region.approximate_size();
        match self {
            OpStep::AddPeer { store_id, .. } | OpStep::AddLearner { store_id, .. } => {
                let to = influence.store_mut(*store_id);
                to.region_count += 1;
                to.region_size += size;
                to.step_cost += size;
            }
            OpStep::PromoteLearner { .. } => {}
            OpStep::RemovePeer { store_id } => {
                let from = influence.store_mut(*store_id);
                from.region_count -= 1;
                from.region_size -= size;
            }
            OpStep::TransferLeader { from_store, to_store } => {
                let from = influence.store_mut(*from_store);
                from.leader_count -= 1;
                from.leader_size -= size;
                let to = influence.store_mut(*to_store);
                to.leader_count += 1;
                to.leader_size += size;
            }
            OpStep::SplitRegion { .. } | OpStep::MergeRegion { .. } => {}
        }
    }
}

impl fmt::Display for OpStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpStep::AddPeer { store_id, peer_id } => {
                write!(f, "add peer {peer_id} on store {store_id}")
            }
            OpStep::AddLearner { store_id, peer_id } => {
                write!(f, "add learner {peer_id} on store {store_id}")
            }
            OpStep::PromoteLearner { store_id, peer_id } => {
                write!(f, "promote learner {peer_id} on store {store_id}")
            }
            OpStep::RemovePeer { store_id } => write!(f, "remove peer on store {store_id}"),
            OpStep::TransferLeader { from_store, to_store } => {
                write!(f, "transfer leader from store {from_store} to store {to_store}")
            }
            OpStep::SplitRegion { .. } => write!(f, "split region"),
            OpStep::MergeRegion { target, is_passive, .. } => {
                if *is_passive {
                    write!(f, "merge into region {}", target.id)
                } else {
                    write!(f, "absorb region {}", target.id)
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    Created,
    Started,
    Succeeded,
    Timeout,
    Cancelled,
    Replaced,
}

impl OpStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, OpStatus::Created | OpStatus::Started)
    }
}

/// A scheduled multi-step change to one region.
#[derive(Debug, Clone)]
pub struct Operator {
    desc: &'static str,
    region_id: u64,
    region_epoch: RegionEpoch,
    kind: OpKind,
    steps: Vec<OpStep>,
    current: usize,
    created: Instant,
    timeout: Duration,
    status: OpStatus,
}

impl Operator {
    pub fn new(
        desc: &'static str,
        region_id: u64,
        region_epoch: RegionEpoch,
        kind: OpKind,
        steps: Vec<OpStep>,
    ) -> Self {
        let timeout = if kind.contains(OpKind::REGION) || kind.contains(OpKind::MERGE) {
            REGION_OPERATOR_TIMEOUT
        } else {
            LEADER_OPERATOR_TIMEOUT
        };
        Operator {
            desc,
            region_id,
            region_epoch,
            kind,
            steps,
            current: 0,
            created: Instant::now(),
            timeout,
            status: OpStatus::Created,
        }
    }

    pub fn desc(&self) -> &'static str {
        self.desc
    }

    pub fn region_id(&self) -> u64 {
        self.region_id
    }

    pub fn region_epoch(&self) -> RegionEpoch {
        self.region_epoch
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    pub fn steps(&self) -> &[OpStep] {
        &self.steps
    }

    pub fn status(&self) -> OpStatus {
        self.status
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn elapsed(&self) -> Duration {
        self.created.elapsed()
    }

    pub fn is_end(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_timed_out(&self) -> bool {
        !self.status.is_terminal() && self.created.elapsed() > self.timeout
    }

    pub fn cancel(&mut self, status: OpStatus) {
        if !self.status.is_terminal() {
            self.status = status;
        }
    }

    /// Advance past finished steps and return the one the region should act
    /// on next; `None` once every step has landed.
    pub fn check(&mut self, region: &RegionInfo) -> Option<OpStep> {
        if self.status.is_terminal() {
            return None;
        }
        while self.current < self.steps.len() {
            if self.steps[self.current].is_finished(region) {
                self.current += 1;
            } else {
                self.status = OpStatus::Started;
                return Some(self.steps[self.current].clone());
            }
        }
        self.status = OpStatus::Succeeded;
        None
    }

    /// Project the effect of the remaining steps onto per-store influence.
    pub fn influence(&self, influence: &mut OpInfluence, region: &RegionInfo) {
        for step in &self.steps[self.current.min(self.steps.len())..] {
            step.influence(influence, region);
        }
    }

    /// The store whose outbound operator budget this operator charges: the
    /// one losing a peer, or the one giving up leadership.
    pub fn source_store(&self) -> Option<u64> {
        for step in &self.steps {
            if let OpStep::RemovePeer { store_id } = step {
                return Some(*store_id);
            }
        }
        for step in &self.steps {
            if let OpStep::TransferLeader { from_store, .. } = step {
                return Some(*from_store);
            }
        }
        None
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (kind: {}, region: {}({}), steps: [",
            self.desc, self.kind, self.region_id, self.region_epoch
        )?;
        for (i, step) in self.steps.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{step}")?;
        }
        write!(f, "])")
    }
}

/// Per-store pending deltas contributed by live operators.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreInfluence {
    pub leader_count: i64,
    pub region_count: i64,
    pub leader_size: i64,
    pub region_size: i64,
    pub step_cost: i64,
}

#[derive(Debug, Clone, Default)]
pub struct OpInfluence {
    stores: HashMap<u64, StoreInfluence>,
}

impl OpInfluence {
    pub fn store(&self, store_id: u64) -> StoreInfluence {
        self.stores.get(&store_id).copied().unwrap_or_default()
    }

    pub fn store_mut(&mut self, store_id: u64) -> &mut StoreInfluence {
        self.stores.entry(store_id).or_default()
    }
}

// ---- constructors ----

/// Move one peer: add the replacement, hand leadership over if the outgoing
/// peer holds it, then remove the outgoing peer.
pub fn create_move_peer_operator(
    desc: &'static str,
    region: &RegionInfo,
    kind: OpKind,
    old_store: u64,
    new_store: u64,
    new_peer_id: u64,
) -> Operator {
    let mut steps = vec![OpStep::AddPeer {
        store_id: new_store,
        peer_id: new_peer_id,
    }];
    if region.leader_store_id() == old_store {
        steps.push(OpStep::TransferLeader {
            from_store: old_store,
            to_store: new_store,
        });
    }
    steps.push(OpStep::RemovePeer { store_id: old_store });
    Operator::new(desc, region.id(), region.epoch(), kind | OpKind::REGION, steps)
}

pub fn create_transfer_leader_operator(
    desc: &'static str,
    region: &RegionInfo,
    kind: OpKind,
    to_store: u64,
) -> Operator {
    let steps = vec![OpStep::TransferLeader {
        from_store: region.leader_store_id(),
        to_store,
    }];
    Operator::new(desc, region.id(), region.epoch(), kind | OpKind::LEADER, steps)
}

pub fn create_add_peer_operator(
    desc: &'static str,
    region: &RegionInfo,
    kind: OpKind,
    store_id: u64,
    peer_id: u64,
) -> Operator {
    let steps = vec![OpStep::AddPeer { store_id, peer_id }];
    Operator::new(desc, region.id(), region.epoch(), kind | OpKind::REGION, steps)
}

/// Remove a peer; if it leads, leadership moves to `transferee` first.
pub fn create_remove_peer_operator(
    desc: &'static str,
    region: &RegionInfo,
    kind: OpKind,
    store_id: u64,
    transferee: Option<Peer>,
) -> Operator {
    let mut steps = Vec::new();
    if region.leader_store_id() == store_id {
        if let Some(peer) = transferee {
            steps.push(OpStep::TransferLeader {
                from_store: store_id,
                to_store: peer.store_id,
            });
        }
    }
    steps.push(OpStep::RemovePeer { store_id });
    Operator::new(desc, region.id(), region.epoch(), kind | OpKind::REGION, steps)
}

pub fn create_split_region_operator(
    desc: &'static str,
    region: &RegionInfo,
    kind: OpKind,
) -> Operator {
    let steps = vec![OpStep::SplitRegion {
        since_version: region.epoch().version,
    }];
    Operator::new(desc, region.id(), region.epoch(), kind | OpKind::ADMIN, steps)
}

/// The paired merge operators: the source absorbs, the target yields.
pub fn create_merge_region_operators(
    desc: &'static str,
    source: &RegionInfo,
    target: &RegionInfo,
    kind: OpKind,
) -> (Operator, Operator) {
    let active = Operator::new(
        desc,
        source.id(),
        source.epoch(),
        kind | OpKind::MERGE,
        vec![OpStep::MergeRegion {
            target: target.meta().clone(),
            is_passive: false,
            since_version: source.epoch().version,
        }],
    );
    let passive = Operator::new(
        desc,
        target.id(),
        target.epoch(),
        kind | OpKind::MERGE,
        vec![OpStep::MergeRegion {
            target: source.meta().clone(),
            is_passive: true,
            since_version: target.epoch().version,
        }],
    );
    (active, passive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::RegionMeta;

    fn region(peers: &[(u64, u64)], leader: usize) -> RegionInfo {
        let mut meta = RegionMeta::new(1, vec![], vec![]);
        meta.epoch = RegionEpoch::new(1, 1);
        meta.peers = peers.iter().map(|&(id, store)| Peer::new(id, store)).collect();
        let leader = meta.peers[leader];
        RegionInfo::new(meta).with_leader(Some(leader))
    }

    #[test]
    fn kind_mask_operations() {
        let kind = OpKind::REGION | OpKind::BALANCE;
        assert!(kind.contains(OpKind::REGION));
        assert!(kind.intersects(OpKind::BALANCE | OpKind::HOT));
        assert!(!kind.contains(OpKind::HOT));
        assert_eq!(kind.bits().count(), 2);
        assert_eq!(kind.to_string(), "region,balance");
    }

    #[test]
    fn move_peer_walks_through_steps() {
        let r = region(&[(10, 1), (11, 2), (12, 3)], 0);
        let mut op = create_move_peer_operator("balance-region", &r, OpKind::BALANCE, 3, 4, 13);
        assert_eq!(op.source_store(), Some(3));

        // Nothing landed yet: first step is pending.
        let step = op.check(&r).unwrap();
        assert_eq!(step, OpStep::AddPeer { store_id: 4, peer_id: 13 });
        assert_eq!(op.status(), OpStatus::Started);

        // Peer added: the remove step becomes current.
        let grown = r.with_peers(vec![
            Peer::new(10, 1),
            Peer::new(11, 2),
            Peer::new(12, 3),
            Peer::new(13, 4),
        ]);
        let step = op.check(&grown).unwrap();
        assert_eq!(step, OpStep::RemovePeer { store_id: 3 });

        // Peer removed: the operator succeeds.
        let shrunk = grown.with_peers(vec![Peer::new(10, 1), Peer::new(11, 2), Peer::new(13, 4)]);
        assert!(op.check(&shrunk).is_none());
        assert_eq!(op.status(), OpStatus::Succeeded);
    }

    #[test]
    fn moving_the_leader_inserts_transfer() {
        let r = region(&[(10, 1), (11, 2)], 0);
        let op = create_move_peer_operator("balance-region", &r, OpKind::BALANCE, 1, 3, 12);
        assert_eq!(op.steps().len(), 3);
        assert!(matches!(op.steps()[1], OpStep::TransferLeader { from_store: 1, to_store: 3 }));
    }

    #[test]
    fn influence_projects_remaining_steps() {
        let r = region(&[(10, 1), (11, 2), (12, 3)], 0).with_approximates(64, 0);
        let op = create_move_peer_operator("balance-region", &r, OpKind::BALANCE, 3, 4, 13);

        let mut inf = OpInfluence::default();
        op.influence(&mut inf, &r);
        assert_eq!(inf.store(4).region_size, 64);
        assert_eq!(inf.store(4).region_count, 1);
        assert_eq!(inf.store(3).region_size, -64);
        assert_eq!(inf.store(3).region_count, -1);
    }

    #[test]
    fn transfer_leader_finishes_on_new_leader() {
        let r = region(&[(10, 1), (11, 2)], 0);
        let mut op = create_transfer_leader_operator("balance-leader", &r, OpKind::BALANCE, 2);
        assert!(op.check(&r).is_some());

        let moved = r.with_leader(Some(Peer::new(11, 2)));
        assert!(op.check(&moved).is_none());
        assert_eq!(op.status(), OpStatus::Succeeded);
    }

    #[test]
    fn terminal_status_sticks() {
        let r = region(&[(10, 1), (11, 2)], 0);
        let mut op = create_transfer_leader_operator("test", &r, OpKind::ADMIN, 2);
        op.cancel(OpStatus::Cancelled);
        assert!(op.check(&r).is_none());
        assert_eq!(op.status(), OpStatus::Cancelled);
        op.cancel(OpStatus::Replaced);
        assert_eq!(op.status(), OpStatus::Cancelled);
    }
}
