//! Node cache and blob persistence for one account tree.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind};
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use tally_common::{Result, StorageConfig, TallyError};

use crate::node::{Node, NodeId, ROOT_NODE_ID};

/// Per-account node store: an in-memory cache in front of one blob per node
/// on disk.
///
/// Reads are lazy: a cache miss materializes the node from its blob. Writes
/// go to the cache only; `save` flushes every cached node in one batch. The
/// store is unsynchronized and requires exclusive access, which the owning
/// tree provides by taking `&mut self` on every operation.
pub struct NodeStore {
    /// Directory holding this account's node blobs.
    dir: PathBuf,
    /// Fsync each blob after writing it.
    fsync_enabled: bool,
    /// Cached nodes keyed by id.
    cache: HashMap<NodeId, Node>,
    /// Source of fresh node ids.
    rng: StdRng,
}

impl NodeStore {
    /// Creates a store for one account, rooted under the configured data
    /// directory. Nothing is read or created on disk until first use.
    pub fn new(config: &StorageConfig, account: &str) -> Self {
        Self::with_rng(config, account, StdRng::from_entropy())
    }

    /// Creates a store with a caller-supplied RNG for deterministic tests.
    pub fn with_rng(config: &StorageConfig, account: &str, rng: StdRng) -> Self {
        Self {
            dir: config.node_dir(account),
            fsync_enabled: config.fsync_enabled,
            cache: HashMap::new(),
            rng,
        }
    }

    /// Directory holding this account's node blobs.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the node with the given id, reading its blob on a cache miss.
    /// Absent if the id is unknown to both the cache and the backing store.
    pub fn get(&mut self, id: NodeId) -> Result<Option<&Node>> {
        if !self.cache.contains_key(&id) {
            if let Some(node) = self.read_blob(id)? {
                self.cache.insert(id, node);
            }
        }
        Ok(self.cache.get(&id))
    }

    /// Inserts or replaces the cache entry keyed by the node's id. The
    /// backing store is untouched until the next `save`.
    pub fn put(&mut self, node: Node) {
        self.cache.insert(node.id(), node);
    }

    /// Evicts the node from the cache and removes its blob if one exists.
    pub fn delete(&mut self, node: &Node) -> Result<()> {
        self.cache.remove(&node.id());
        match fs::remove_file(self.blob_path(node.id())) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Iterates over the currently cached nodes. Order is unspecified but
    /// stable within one traversal.
    pub fn list(&self) -> impl Iterator<Item = &Node> {
        self.cache.values()
    }

    /// Number of cached nodes.
    pub fn cache_len(&self) -> u64 {
        self.cache.len() as u64
    }

    /// Serializes every cached node to its blob, creating the account
    /// directory if needed. Existing blobs are overwritten so the on-disk
    /// state matches the cache on return.
    ///
    /// A fault mid-flush leaves the directory partially updated; the cache
    /// itself is unchanged, so a retry is safe in memory.
    pub fn save(&mut self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;

        for node in self.cache.values() {
            let path = self.blob_path(node.id());
            let mut writer = BufWriter::new(File::create(&path)?);
            serde_json::to_writer(&mut writer, node)
                .map_err(|e| TallyError::Io(e.into()))?;
            let file = writer
                .into_inner()
                .map_err(|e| TallyError::Io(e.into_error()))?;
            if self.fsync_enabled {
                file.sync_all()?;
            }
        }

        debug!(
            nodes = self.cache.len(),
            dir = %self.dir.display(),
            "flushed node cache"
        );
        Ok(())
    }

    /// Returns a fresh id drawn uniformly from the 63-bit space, retrying on
    /// collision with the cache. Id 0 is reserved for the root and never
    /// returned here.
    pub fn new_id(&mut self) -> NodeId {
        loop {
            let id = self.rng.gen::<u64>() >> 1;
            if id != ROOT_NODE_ID && !self.cache.contains_key(&id) {
                return id;
            }
        }
    }

    fn blob_path(&self, id: NodeId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn read_blob(&self, id: NodeId) -> Result<Option<Node>> {
        let file = match File::open(self.blob_path(id)) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let node: Node = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            TallyError::NodeCorrupted {
                id,
                reason: e.to_string(),
            }
        })?;

        if node.id() != id {
            return Err(TallyError::NodeCorrupted {
                id,
                reason: format!("blob claims id {}", node.id()),
            });
        }

        Ok(Some(node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tally_common::{Record, RecordKey};

    use chrono::{TimeZone, Utc};
    use std::io::Write;
    use tempfile::{tempdir, TempDir};

    fn test_config(dir: &TempDir) -> StorageConfig {
        StorageConfig {
            data_dir: dir.path().to_path_buf(),
            degree: 4,
            fsync_enabled: false,
        }
    }

    fn test_store(dir: &TempDir) -> NodeStore {
        NodeStore::with_rng(&test_config(dir), "A", StdRng::seed_from_u64(42))
    }

    fn record(seq: u32) -> Record {
        Record::new(
            RecordKey::new("A", Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(), seq),
            "sample",
            dec!(1.25),
        )
    }

    #[test]
    fn test_get_absent_id() {
        let dir = tempdir().unwrap();
        let mut store = test_store(&dir);
        assert!(store.get(99).unwrap().is_none());
    }

    #[test]
    fn test_put_then_get() {
        let dir = tempdir().unwrap();
        let mut store = test_store(&dir);

        store.put(Node::leaf(ROOT_NODE_ID, vec![record(0)]));

        let node = store.get(ROOT_NODE_ID).unwrap().unwrap();
        assert_eq!(node.id(), ROOT_NODE_ID);
        assert_eq!(node.len(), 1);
        assert_eq!(store.cache_len(), 1);
    }

    #[test]
    fn test_put_replaces_cache_entry() {
        let dir = tempdir().unwrap();
        let mut store = test_store(&dir);

        store.put(Node::leaf(ROOT_NODE_ID, vec![record(0)]));
        store.put(Node::leaf(ROOT_NODE_ID, vec![record(0), record(1)]));

        assert_eq!(store.get(ROOT_NODE_ID).unwrap().unwrap().len(), 2);
        assert_eq!(store.cache_len(), 1);
    }

    #[test]
    fn test_save_then_lazy_get() {
        let dir = tempdir().unwrap();
        {
            let mut store = test_store(&dir);
            store.put(Node::leaf(ROOT_NODE_ID, vec![record(0), record(1)]));
            store.put(Node::leaf(17, vec![record(2)]));
            store.save().unwrap();
        }

        // Fresh store: cache is empty, blobs load on demand.
        let mut store = test_store(&dir);
        assert_eq!(store.cache_len(), 0);

        let root = store.get(ROOT_NODE_ID).unwrap().unwrap();
        assert_eq!(root.len(), 2);
        assert_eq!(store.cache_len(), 1);

        let other = store.get(17).unwrap().unwrap();
        assert_eq!(other.len(), 1);
        assert_eq!(store.cache_len(), 2);
    }

    #[test]
    fn test_save_overwrites_existing_blobs() {
        let dir = tempdir().unwrap();
        let mut store = test_store(&dir);

        store.put(Node::leaf(ROOT_NODE_ID, vec![record(0)]));
        store.save().unwrap();

        store.put(Node::leaf(ROOT_NODE_ID, vec![record(0), record(1), record(2)]));
        store.save().unwrap();

        let mut fresh = test_store(&dir);
        assert_eq!(fresh.get(ROOT_NODE_ID).unwrap().unwrap().len(), 3);
    }

    #[test]
    fn test_delete_evicts_cache_and_blob() {
        let dir = tempdir().unwrap();
        let mut store = test_store(&dir);

        let node = Node::leaf(17, vec![record(0)]);
        store.put(node.clone());
        store.save().unwrap();
        assert!(store.dir().join("17.json").exists());

        store.delete(&node).unwrap();
        assert_eq!(store.cache_len(), 0);
        assert!(!store.dir().join("17.json").exists());
        assert!(store.get(17).unwrap().is_none());
    }

    #[test]
    fn test_delete_without_blob_is_ok() {
        let dir = tempdir().unwrap();
        let mut store = test_store(&dir);

        let node = Node::leaf(17, vec![record(0)]);
        store.put(node.clone());
        store.delete(&node).unwrap();
        assert_eq!(store.cache_len(), 0);
    }

    #[test]
    fn test_list_sees_all_cached_nodes() {
        let dir = tempdir().unwrap();
        let mut store = test_store(&dir);

        store.put(Node::leaf(ROOT_NODE_ID, vec![record(0)]));
        store.put(Node::leaf(5, vec![record(1)]));
        store.put(Node::leaf(9, vec![record(2)]));

        let mut ids: Vec<NodeId> = store.list().map(|n| n.id()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 5, 9]);
    }

    #[test]
    fn test_new_id_never_zero_and_never_cached() {
        let dir = tempdir().unwrap();
        let mut store = test_store(&dir);

        store.put(Node::leaf(ROOT_NODE_ID, vec![record(0)]));

        for _ in 0..1000 {
            let id = store.new_id();
            assert_ne!(id, ROOT_NODE_ID);
            assert!(id < (1 << 63));
            assert!(store.get(id).unwrap().is_none());
        }
    }

    #[test]
    fn test_new_id_deterministic_under_seed() {
        let dir = tempdir().unwrap();
        let mut a = NodeStore::with_rng(&test_config(&dir), "A", StdRng::seed_from_u64(7));
        let mut b = NodeStore::with_rng(&test_config(&dir), "A", StdRng::seed_from_u64(7));
        for _ in 0..10 {
            assert_eq!(a.new_id(), b.new_id());
        }
    }

    #[test]
    fn test_corrupt_blob_is_surfaced() {
        let dir = tempdir().unwrap();
        let config = test_config(&dir);
        fs::create_dir_all(config.node_dir("A")).unwrap();
        let mut file = File::create(config.node_dir("A").join("0.json")).unwrap();
        file.write_all(b"{ this is not a node").unwrap();

        let mut store = test_store(&dir);
        let err = store.get(ROOT_NODE_ID).unwrap_err();
        assert!(matches!(err, TallyError::NodeCorrupted { id: 0, .. }));
    }

    #[test]
    fn test_blob_with_mismatched_id_is_corrupt() {
        let dir = tempdir().unwrap();
        let config = test_config(&dir);

        // Persist node 5, then copy its blob over node 9's slot.
        let mut store = test_store(&dir);
        store.put(Node::leaf(5, vec![record(0)]));
        store.save().unwrap();
        fs::copy(
            config.node_dir("A").join("5.json"),
            config.node_dir("A").join("9.json"),
        )
        .unwrap();

        let mut fresh = test_store(&dir);
        let err = fresh.get(9).unwrap_err();
        assert!(matches!(err, TallyError::NodeCorrupted { id: 9, .. }));
    }

    #[test]
    fn test_save_creates_directory_structure() {
        let dir = tempdir().unwrap();
        let mut store = test_store(&dir);

        store.put(Node::leaf(ROOT_NODE_ID, vec![record(0)]));
        store.save().unwrap();

        assert!(dir.path().join("Nodes").join("A").join("0.json").exists());
    }
}
