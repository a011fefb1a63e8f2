//! Scheduling configuration: the serde surface, validation, and the
//! atomically swappable snapshot the schedulers read.
//!
//! `ScheduleOptions` publishes immutable config snapshots through `ArcSwap`:
//! an update builds a whole new config, validates it, and swaps the pointer,
//! so readers observe either the old or the new config but never a torn view.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};
use crate::operator::OpKind;
use crate::store::{StoreLabel, Version};

/// Label property key whose matching stores must not hold leaders.
pub const REJECT_LEADER: &str = "reject-leader";

/// A duration that reads and writes the compact `1h` / `30m` / `100ms` form
/// in config files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigDuration(pub Duration);

impl ConfigDuration {
    pub const fn from_secs(secs: u64) -> Self {
        ConfigDuration(Duration::from_secs(secs))
    }

    pub const fn from_millis(ms: u64) -> Self {
        ConfigDuration(Duration::from_millis(ms))
    }

    pub fn get(&self) -> Duration {
        self.0
    }
}

impl FromStr for ConfigDuration {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        let split = s
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(|| format!("missing unit in duration {s:?}"))?;
        let (num, unit) = s.split_at(split);
        let value: f64 = num.parse().map_err(|_| format!("bad duration {s:?}"))?;
        let secs = match unit.trim() {
            "ms" => value / 1000.0,
            "s" => value,
            "m" => value * 60.0,
            "h" => value * 3600.0,
            "d" => value * 86400.0,
            other => return Err(format!("unknown duration unit {other:?}")),
        };
        Ok(ConfigDuration(Duration::from_secs_f64(secs)))
    }
}

impl fmt::Display for ConfigDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = self.0;
        if d.subsec_millis() != 0 || (d.as_secs() == 0 && !d.is_zero()) {
            return write!(f, "{}ms", d.as_millis());
        }
        let secs = d.as_secs();
        if secs % 3600 == 0 && secs != 0 {
            write!(f, "{}h", secs / 3600)
        } else if secs % 60 == 0 && secs != 0 {
            write!(f, "{}m", secs / 60)
        } else {
            write!(f, "{secs}s")
        }
    }
}

impl Serialize for ConfigDuration {
    fn serialize<S: Serializer>(&self, ser: S) -> std::result::Result<S::Ok, S::Error> {
        ser.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ConfigDuration {
    fn deserialize<D: Deserializer<'de>>(de: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(de)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LeaderScheduleStrategy {
    #[default]
    Count,
    Size,
}

/// What a schedule moves, and by which measure stores are ranked for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Leader,
    Region,
}

/// One configured scheduler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SchedulerEntry {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub disable: bool,
}

impl SchedulerEntry {
    pub fn new(kind: &str) -> Self {
        SchedulerEntry {
            kind: kind.to_string(),
            args: Vec::new(),
            disable: false,
        }
    }
}

pub fn default_schedulers() -> Vec<SchedulerEntry> {
    ["balance-region", "balance-leader", "hot-region", "label", "separate-cold-hot"]
        .iter()
        .map(|name| SchedulerEntry::new(name))
        .collect()
}

/// Scheduling tunables. Field defaults are the documented config defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ScheduleConfig {
    pub max_snapshot_count: u64,
    pub max_pending_peer_count: u64,
    /// MiB.
    pub max_merge_region_size: u64,
    pub max_merge_region_keys: u64,
    pub split_merge_interval: ConfigDuration,
    pub patrol_region_interval: ConfigDuration,
    pub max_store_down_time: ConfigDuration,
    /// Reserved for a future cold-data checker; nothing consumes it yet.
    pub max_cold_data_time: ConfigDuration,
    pub leader_schedule_limit: u64,
    pub region_schedule_limit: u64,
    pub replica_schedule_limit: u64,
    pub merge_schedule_limit: u64,
    pub hot_region_schedule_limit: u64,
    pub hot_region_cache_hits_threshold: u64,
    /// Operators per minute a single store may source.
    pub store_balance_rate: f64,
    pub tolerant_size_ratio: f64,
    pub low_space_ratio: f64,
    pub high_space_ratio: f64,
    pub scheduler_max_waiting_operator: u64,
    pub leader_schedule_strategy: LeaderScheduleStrategy,
    pub disable_remove_down_replica: bool,
    pub disable_replace_offline_replica: bool,
    pub disable_make_up_replica: bool,
    pub disable_remove_extra_replica: bool,
    pub disable_location_replacement: bool,
    pub disable_namespace_relocation: bool,
    pub schedulers: Vec<SchedulerEntry>,
    /// label property name -> labels; stores carrying one of the labels get
    /// the property (e.g. `reject-leader`).
    pub label_property: std::collections::HashMap<String, Vec<StoreLabel>>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        ScheduleConfig {
            max_snapshot_count: 3,
            max_pending_peer_count: 16,
            max_merge_region_size: 20,
            max_merge_region_keys: 200_000,
            split_merge_interval: ConfigDuration::from_secs(3600),
            patrol_region_interval: ConfigDuration::from_millis(100),
            max_store_down_time: ConfigDuration::from_secs(30 * 60),
            max_cold_data_time: ConfigDuration::from_secs(0),
            leader_schedule_limit: 4,
            region_schedule_limit: 2048,
            replica_schedule_limit: 64,
            merge_schedule_limit: 8,
            hot_region_schedule_limit: 4,
            hot_region_cache_hits_threshold: 3,
            store_balance_rate: 15.0,
            tolerant_size_ratio: 0.0,
            low_space_ratio: 0.8,
            high_space_ratio: 0.6,
            scheduler_max_waiting_operator: 3,
            leader_schedule_strategy: LeaderScheduleStrategy::Count,
            disable_remove_down_replica: false,
            disable_replace_offline_replica: false,
            disable_make_up_replica: false,
            disable_remove_extra_replica: false,
            disable_location_replacement: false,
            disable_namespace_relocation: false,
            schedulers: default_schedulers(),
            label_property: Default::default(),
        }
    }
}

impl ScheduleConfig {
    pub fn validate(&self, scheduler_registered: impl Fn(&str) -> bool) -> Result<()> {
        if !(0.0..=1.0).contains(&self.high_space_ratio) {
            return Err(Error::validation("high-space-ratio should be between 0 and 1"));
        }
        if !(0.0..=1.0).contains(&self.low_space_ratio) {
            return Err(Error::validation("low-space-ratio should be between 0 and 1"));
        }
        if self.low_space_ratio <= self.high_space_ratio {
            return Err(Error::validation(
                "low-space-ratio should be larger than high-space-ratio",
            ));
        }
        if self.tolerant_size_ratio < 0.0 {
            return Err(Error::validation("tolerant-size-ratio should be non-negative"));
        }
        if self.store_balance_rate < 0.0 {
            return Err(Error::validation("store-balance-rate should be non-negative"));
        }
        for entry in &self.schedulers {
            if !scheduler_registered(&entry.kind) {
                return Err(Error::validation(format!(
                    "unknown scheduler type {:?}",
                    entry.kind
                )));
            }
        }
        Ok(())
    }
}

/// Replication tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ReplicationConfig {
    pub max_replicas: u64,
    /// Ordered fault-domain axes, highest priority first.
    pub location_labels: Vec<String>,
    pub strictly_match_label: bool,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        ReplicationConfig {
            max_replicas: 3,
            location_labels: Vec::new(),
            strictly_match_label: false,
        }
    }
}

/// The swappable view of all tunables the scheduling paths consult.
pub struct ScheduleOptions {
    schedule: ArcSwap<ScheduleConfig>,
    replication: ArcSwap<ReplicationConfig>,
    cluster_version: ArcSwap<Version>,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        ScheduleOptions::new(ScheduleConfig::default(), ReplicationConfig::default())
    }
}

impl ScheduleOptions {
    pub fn new(schedule: ScheduleConfig, replication: ReplicationConfig) -> Self {
        ScheduleOptions {
            schedule: ArcSwap::from_pointee(schedule),
            replication: ArcSwap::from_pointee(replication),
            cluster_version: ArcSwap::from_pointee(Version::default()),
        }
    }

    pub fn schedule(&self) -> Arc<ScheduleConfig> {
        self.schedule.load_full()
    }

    pub fn replication(&self) -> Arc<ReplicationConfig> {
        self.replication.load_full()
    }

    /// Swap in a new schedule config after validating it.
    pub fn update_schedule(
        &self,
        config: ScheduleConfig,
        scheduler_registered: impl Fn(&str) -> bool,
    ) -> Result<()> {
        config.validate(scheduler_registered)?;
        self.schedule.store(Arc::new(config));
        Ok(())
    }

    pub fn update_replication(&self, config: ReplicationConfig) {
        self.replication.store(Arc::new(config));
    }

    pub fn cluster_version(&self) -> Version {
        **self.cluster_version.load()
    }

    /// Raise the cluster version; never lowers it.
    pub fn ratchet_cluster_version(&self, version: Version) -> bool {
        let current = self.cluster_version();
        if version > current {
            self.cluster_version.store(Arc::new(version));
            true
        } else {
            false
        }
    }

    // ---- frequently read scalars ----

    pub fn max_replicas(&self) -> usize {
        self.replication.load().max_replicas as usize
    }

    pub fn location_labels(&self) -> Vec<String> {
        self.replication.load().location_labels.clone()
    }

    pub fn strictly_match_label(&self) -> bool {
        self.replication.load().strictly_match_label
    }

    pub fn max_snapshot_count(&self) -> u64 {
        self.schedule.load().max_snapshot_count
    }

    pub fn max_pending_peer_count(&self) -> u64 {
        self.schedule.load().max_pending_peer_count
    }

    pub fn max_merge_region_size(&self) -> u64 {
        self.schedule.load().max_merge_region_size
    }

    pub fn max_merge_region_keys(&self) -> u64 {
        self.schedule.load().max_merge_region_keys
    }

    pub fn split_merge_interval(&self) -> Duration {
        self.schedule.load().split_merge_interval.get()
    }

    pub fn patrol_region_interval(&self) -> Duration {
        self.schedule.load().patrol_region_interval.get()
    }

    pub fn max_store_down_time(&self) -> Duration {
        self.schedule.load().max_store_down_time.get()
    }

    /// Live-operator cap for one kind bit; unlimited kinds return `u64::MAX`.
    pub fn schedule_limit(&self, kind: OpKind) -> u64 {
        let cfg = self.schedule.load();
        if kind == OpKind::LEADER {
            cfg.leader_schedule_limit
        } else if kind == OpKind::REGION {
            cfg.region_schedule_limit
        } else if kind == OpKind::MERGE {
            cfg.merge_schedule_limit
        } else if kind == OpKind::HOT {
            cfg.hot_region_schedule_limit
        } else {
            u64::MAX
        }
    }

    /// Cap on live repair operators produced by the patrol checkers.
    pub fn replica_schedule_limit(&self) -> u64 {
        self.schedule.load().replica_schedule_limit
    }

    pub fn hot_region_cache_hits_threshold(&self) -> u64 {
        self.schedule.load().hot_region_cache_hits_threshold
    }

    pub fn store_balance_rate(&self) -> f64 {
        self.schedule.load().store_balance_rate
    }

    pub fn tolerant_size_ratio(&self) -> f64 {
        self.schedule.load().tolerant_size_ratio
    }

    pub fn low_space_ratio(&self) -> f64 {
        self.schedule.load().low_space_ratio
    }

    pub fn high_space_ratio(&self) -> f64 {
        self.schedule.load().high_space_ratio
    }

    pub fn scheduler_max_waiting_operator(&self) -> u64 {
        self.schedule.load().scheduler_max_waiting_operator
    }

    pub fn leader_schedule_strategy(&self) -> LeaderScheduleStrategy {
        self.schedule.load().leader_schedule_strategy
    }

    pub fn is_remove_down_replica_enabled(&self) -> bool {
        !self.schedule.load().disable_remove_down_replica
    }

    pub fn is_replace_offline_replica_enabled(&self) -> bool {
        !self.schedule.load().disable_replace_offline_replica
    }

    pub fn is_make_up_replica_enabled(&self) -> bool {
        !self.schedule.load().disable_make_up_replica
    }

    pub fn is_remove_extra_replica_enabled(&self) -> bool {
        !self.schedule.load().disable_remove_extra_replica
    }

    pub fn is_location_replacement_enabled(&self) -> bool {
        !self.schedule.load().disable_location_replacement
    }

    pub fn is_namespace_relocation_enabled(&self) -> bool {
        !self.schedule.load().disable_namespace_relocation
    }

    /// True when any of the store's labels matches the named label property.
    pub fn check_label_property(&self, name: &str, labels: &[StoreLabel]) -> bool {
        let cfg = self.schedule.load();
        cfg.label_property
            .get(name)
            .map(|props| {
                props.iter().any(|p| {
                    labels
                        .iter()
                        .any(|l| l.key.eq_ignore_ascii_case(&p.key) && l.value == p.value)
                })
            })
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_parse_round_trip() {
        for (text, expect) in [
            ("1h", Duration::from_secs(3600)),
            ("30m", Duration::from_secs(1800)),
            ("100ms", Duration::from_millis(100)),
            ("15s", Duration::from_secs(15)),
            ("1.5s", Duration::from_millis(1500)),
        ] {
            let parsed: ConfigDuration = text.parse().unwrap();
            assert_eq!(parsed.get(), expect, "{text}");
        }
        assert_eq!(ConfigDuration::from_secs(3600).to_string(), "1h");
        assert_eq!(ConfigDuration::from_millis(100).to_string(), "100ms");
        assert!("12".parse::<ConfigDuration>().is_err());
        assert!("1fortnight".parse::<ConfigDuration>().is_err());
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = ScheduleConfig::default();
        assert_eq!(cfg.max_snapshot_count, 3);
        assert_eq!(cfg.max_pending_peer_count, 16);
        assert_eq!(cfg.leader_schedule_limit, 4);
        assert_eq!(cfg.region_schedule_limit, 2048);
        assert_eq!(cfg.replica_schedule_limit, 64);
        assert_eq!(cfg.merge_schedule_limit, 8);
        assert_eq!(cfg.hot_region_schedule_limit, 4);
        assert_eq!(cfg.hot_region_cache_hits_threshold, 3);
        assert_eq!(cfg.store_balance_rate, 15.0);
        assert_eq!(cfg.low_space_ratio, 0.8);
        assert_eq!(cfg.high_space_ratio, 0.6);
        assert_eq!(cfg.split_merge_interval.get(), Duration::from_secs(3600));
        assert_eq!(cfg.patrol_region_interval.get(), Duration::from_millis(100));
        assert_eq!(cfg.max_store_down_time.get(), Duration::from_secs(1800));
        assert_eq!(cfg.schedulers.len(), 5);
        assert_eq!(ReplicationConfig::default().max_replicas, 3);
    }

    #[test]
    fn validation_rejects_inverted_space_ratios() {
        let mut cfg = ScheduleConfig {
            low_space_ratio: 0.5,
            high_space_ratio: 0.6,
            ..Default::default()
        };
        assert!(cfg.validate(|_| true).is_err());
        cfg.low_space_ratio = 0.6;
        assert!(cfg.validate(|_| true).is_err());
        cfg.low_space_ratio = 0.8;
        assert!(cfg.validate(|_| true).is_ok());

        cfg.tolerant_size_ratio = -1.0;
        assert!(cfg.validate(|_| true).is_err());
    }

    #[test]
    fn validation_rejects_unknown_scheduler() {
        let cfg = ScheduleConfig::default();
        assert!(cfg.validate(|name| name != "hot-region").is_err());
        assert!(cfg.validate(|_| true).is_ok());
    }

    #[test]
    fn options_swap_is_coherent() {
        let opts = ScheduleOptions::default();
        assert_eq!(opts.max_snapshot_count(), 3);
        let updated = ScheduleConfig {
            max_snapshot_count: 7,
            ..Default::default()
        };
        opts.update_schedule(updated, |_| true).unwrap();
        assert_eq!(opts.max_snapshot_count(), 7);
    }

    #[test]
    fn cluster_version_only_ratchets_up() {
        let opts = ScheduleOptions::default();
        assert!(opts.ratchet_cluster_version(Version::parse("3.0.1").unwrap()));
        assert!(!opts.ratchet_cluster_version(Version::parse("2.9.9").unwrap()));
        assert_eq!(opts.cluster_version(), Version::parse("3.0.1").unwrap());
    }

    #[test]
    fn label_property_matches_store_labels() {
        let mut cfg = ScheduleConfig::default();
        cfg.label_property.insert(
            REJECT_LEADER.to_string(),
            vec![StoreLabel::new("disk", "hdd")],
        );
        let opts = ScheduleOptions::new(cfg, ReplicationConfig::default());
        assert!(opts.check_label_property(REJECT_LEADER, &[StoreLabel::new("disk", "hdd")]));
        assert!(!opts.check_label_property(REJECT_LEADER, &[StoreLabel::new("disk", "ssd")]));
    }

    #[test]
    fn toml_kebab_case_round_trip() {
        let text = r#"
            max-snapshot-count = 5
            split-merge-interval = "2h"
            leader-schedule-strategy = "size"

            [[schedulers]]
            type = "balance-region"
        "#;
        let cfg: ScheduleConfig = toml::from_str(text).unwrap();
        assert_eq!(cfg.max_snapshot_count, 5);
        assert_eq!(cfg.split_merge_interval.get(), Duration::from_secs(7200));
        assert_eq!(cfg.leader_schedule_strategy, LeaderScheduleStrategy::Size);
        assert_eq!(cfg.schedulers.len(), 1);
        // Unspecified keys keep their defaults.
        assert_eq!(cfg.region_schedule_limit, 2048);
    }
}
