//! Metadata persistence.
//!
//! `MetaStorage` is the typed facade over a raw key-value backend (`KvBase`).
//! The production backend is a fjall partition; tests use the in-memory
//! backend. Values are JSON; keys live under the cluster root
//! `/{cluster_id}/raft` with numeric components zero-padded to 20 digits so
//! lexicographic order equals numeric order:
//!
//! - `/{root}/s/{store_id:020}`  -> store meta
//! - `/{root}/r/{region_id:020}` -> region meta
//! - `/{root}/status/raft_bootstrap_time` -> textual unix-millisecond stamp
//! - `/{root}/alloc_id` -> id allocator high-water mark

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use anyhow::Context;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::options::{ReplicationConfig, ScheduleConfig};
use crate::region::RegionMeta;
use crate::store::StoreMeta;

/// Persisted descriptor of the cluster itself.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ClusterMeta {
    pub id: u64,
    pub max_peer_count: u64,
}

/// The tunables snapshot written on every config update; on restart it wins
/// over whatever the config file says.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PersistedOptions {
    pub schedule: ScheduleConfig,
    pub replication: ReplicationConfig,
}

/// Raw byte-oriented backend under the typed storage facade.
pub trait KvBase: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn save(&self, key: &str, value: &[u8]) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
    /// Key-ordered scan of every entry under `prefix`.
    fn load_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;
}

/// fjall-backed metadata partition.
pub struct FjallKv {
    keyspace: Keyspace,
    partition: PartitionHandle,
}

impl FjallKv {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let keyspace = fjall::Config::new(path)
            .open()
            .context("open metadata keyspace")
            .map_err(Error::persistence)?;
        let partition = keyspace
            .open_partition("meta", PartitionCreateOptions::default())
            .context("open metadata partition")
            .map_err(Error::persistence)?;
        Ok(FjallKv { keyspace, partition })
    }
}

impl KvBase for FjallKv {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let value = self
            .partition
            .get(key)
            .map_err(Error::persistence)?
            .map(|slice| slice.to_vec());
        Ok(value)
    }

    fn save(&self, key: &str, value: &[u8]) -> Result<()> {
        self.partition
            .insert(key, value)
            .map_err(Error::persistence)?;
        self.keyspace
            .persist(PersistMode::Buffer)
            .map_err(Error::persistence)
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.partition.remove(key).map_err(Error::persistence)?;
        self.keyspace
            .persist(PersistMode::Buffer)
            .map_err(Error::persistence)
    }

    fn load_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut out = Vec::new();
        for item in self.partition.prefix(prefix) {
            let (key, value) = item.map_err(Error::persistence)?;
            let key = String::from_utf8_lossy(&key).into_owned();
            out.push((key, value.to_vec()));
        }
        Ok(out)
    }
}

/// In-memory backend for tests and throwaway clusters.
#[derive(Default)]
pub struct MemKv {
    inner: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemKv {
    pub fn new() -> Self {
        MemKv::default()
    }
}

impl KvBase for MemKv {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.read().unwrap().get(key).cloned())
    }

    fn save(&self, key: &str, value: &[u8]) -> Result<()> {
        self.inner
            .write()
            .unwrap()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.inner.write().unwrap().remove(key);
        Ok(())
    }

    fn load_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Typed metadata storage under one cluster root.
pub struct MetaStorage {
    kv: Box<dyn KvBase>,
    root: String,
}

impl MetaStorage {
    pub fn new(kv: Box<dyn KvBase>, cluster_id: u64) -> Self {
        MetaStorage {
            kv,
            root: format!("/{cluster_id}/raft"),
        }
    }

    pub fn in_memory(cluster_id: u64) -> Arc<Self> {
        Arc::new(MetaStorage::new(Box::new(MemKv::new()), cluster_id))
    }

    pub fn fjall(path: impl AsRef<Path>, cluster_id: u64) -> Result<Arc<Self>> {
        Ok(Arc::new(MetaStorage::new(
            Box::new(FjallKv::open(path)?),
            cluster_id,
        )))
    }

    fn store_key(&self, store_id: u64) -> String {
        format!("{}/s/{:020}", self.root, store_id)
    }

    fn region_key(&self, region_id: u64) -> String {
        format!("{}/r/{:020}", self.root, region_id)
    }

    fn bootstrap_time_key(&self) -> String {
        format!("{}/status/raft_bootstrap_time", self.root)
    }

    fn alloc_id_key(&self) -> String {
        format!("{}/alloc_id", self.root)
    }

    fn config_key(&self) -> String {
        format!("{}/config", self.root)
    }

    fn save_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value).map_err(Error::persistence)?;
        self.kv.save(key, &bytes)
    }

    fn load_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.kv.load(key)? {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes).map_err(Error::persistence)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub fn save_cluster_meta(&self, meta: &ClusterMeta) -> Result<()> {
        let key = self.root.clone();
        self.save_json(&key, meta)
    }

    pub fn load_cluster_meta(&self) -> Result<Option<ClusterMeta>> {
        let key = self.root.clone();
        self.load_json(&key)
    }

    pub fn save_store(&self, store: &StoreMeta) -> Result<()> {
        self.save_json(&self.store_key(store.id), store)
    }

    pub fn delete_store(&self, store_id: u64) -> Result<()> {
        self.kv.remove(&self.store_key(store_id))
    }

    pub fn load_store(&self, store_id: u64) -> Result<Option<StoreMeta>> {
        self.load_json(&self.store_key(store_id))
    }

    /// All persisted stores, id-ordered (the key padding guarantees it).
    pub fn load_stores(&self) -> Result<Vec<StoreMeta>> {
        let prefix = format!("{}/s/", self.root);
        self.kv
            .load_prefix(&prefix)?
            .into_iter()
            .map(|(_, bytes)| serde_json::from_slice(&bytes).map_err(Error::persistence))
            .collect()
    }

    pub fn save_region(&self, region: &RegionMeta) -> Result<()> {
        self.save_json(&self.region_key(region.id), region)
    }

    pub fn delete_region(&self, region_id: u64) -> Result<()> {
        self.kv.remove(&self.region_key(region_id))
    }

    pub fn load_region(&self, region_id: u64) -> Result<Option<RegionMeta>> {
        self.load_json(&self.region_key(region_id))
    }

    pub fn load_regions(&self) -> Result<Vec<RegionMeta>> {
        let prefix = format!("{}/r/", self.root);
        self.kv
            .load_prefix(&prefix)?
            .into_iter()
            .map(|(_, bytes)| serde_json::from_slice(&bytes).map_err(Error::persistence))
            .collect()
    }

    pub fn save_bootstrap_time(&self, unix_ms: u64) -> Result<()> {
        self.kv
            .save(&self.bootstrap_time_key(), unix_ms.to_string().as_bytes())
    }

    pub fn load_bootstrap_time(&self) -> Result<Option<u64>> {
        match self.kv.load(&self.bootstrap_time_key())? {
            Some(bytes) => {
                let text = String::from_utf8(bytes)
                    .context("bootstrap time is not utf-8")
                    .map_err(Error::persistence)?;
                let ms = text
                    .trim()
                    .parse()
                    .context("bootstrap time is not a timestamp")
                    .map_err(Error::persistence)?;
                Ok(Some(ms))
            }
            None => Ok(None),
        }
    }

    pub fn save_options(&self, options: &PersistedOptions) -> Result<()> {
        self.save_json(&self.config_key(), options)
    }

    pub fn load_options(&self) -> Result<Option<PersistedOptions>> {
        self.load_json(&self.config_key())
    }

    pub fn save_id_alloc(&self, end: u64) -> Result<()> {
        self.kv
            .save(&self.alloc_id_key(), end.to_string().as_bytes())
    }

    pub fn load_id_alloc(&self) -> Result<u64> {
        match self.kv.load(&self.alloc_id_key())? {
            Some(bytes) => String::from_utf8_lossy(&bytes)
                .trim()
                .parse()
                .context("corrupt id allocator record")
                .map_err(Error::persistence),
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::{Peer, RegionEpoch};

    fn sample_region(id: u64) -> RegionMeta {
        let mut meta = RegionMeta::new(id, b"a".to_vec(), b"z".to_vec());
        meta.epoch = RegionEpoch::new(3, 2);
        meta.peers = vec![Peer::new(id * 10, 1), Peer::learner(id * 10 + 1, 2)];
        meta
    }

    fn exercise(storage: &MetaStorage) {
        let store = StoreMeta::new(4, "127.0.0.1:20164");
        storage.save_store(&store).unwrap();
        assert_eq!(storage.load_store(4).unwrap().unwrap(), store);

        let region = sample_region(7);
        storage.save_region(&region).unwrap();
        assert_eq!(storage.load_region(7).unwrap().unwrap(), region);

        storage.delete_region(7).unwrap();
        assert!(storage.load_region(7).unwrap().is_none());

        storage.save_bootstrap_time(1_700_000_000_000).unwrap();
        assert_eq!(storage.load_bootstrap_time().unwrap(), Some(1_700_000_000_000));

        let meta = ClusterMeta { id: 1, max_peer_count: 3 };
        storage.save_cluster_meta(&meta).unwrap();
        assert_eq!(storage.load_cluster_meta().unwrap().unwrap(), meta);

        let options = PersistedOptions {
            schedule: ScheduleConfig {
                max_snapshot_count: 9,
                ..Default::default()
            },
            replication: ReplicationConfig::default(),
        };
        storage.save_options(&options).unwrap();
        assert_eq!(storage.load_options().unwrap().unwrap(), options);
    }

    #[test]
    fn mem_round_trip() {
        exercise(&MetaStorage::in_memory(1));
    }

    #[test]
    fn fjall_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = MetaStorage::fjall(dir.path(), 1).unwrap();
        exercise(&storage);
    }

    #[test]
    fn padded_keys_scan_in_numeric_order() {
        let storage = MetaStorage::in_memory(1);
        for id in [2u64, 100, 9, 31] {
            storage.save_store(&StoreMeta::new(id, format!("s{id}"))).unwrap();
        }
        let ids: Vec<u64> = storage.load_stores().unwrap().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![2, 9, 31, 100]);
    }

    #[test]
    fn store_and_region_keys_do_not_collide() {
        let storage = MetaStorage::in_memory(1);
        storage.save_store(&StoreMeta::new(5, "s5")).unwrap();
        storage.save_region(&sample_region(5)).unwrap();
        assert_eq!(storage.load_stores().unwrap().len(), 1);
        assert_eq!(storage.load_regions().unwrap().len(), 1);
    }
}
