//! In-place B-tree engine.
//!
//! Every insert pays for one simulated node rewrite on the [`BlockDevice`]
//! before the tree is touched. Which part of the call runs under the engine
//! lock is chosen by [`LockScope`]; searches always take the shared side of the
//! same lock.

mod iter;
mod node;
mod tree;

pub use iter::Keys;
pub use node::Node;
pub use tree::Tree;

use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};

use crate::config::{BTreeConfig, LockScope};
use crate::engine::{Key, StorageEngine, Value, ENTRY_SIZE};
use crate::error::{Error, Result};
use crate::io::BlockDevice;
use crate::metrics::MetricsContext;

pub struct BTree {
    tree: RwLock<Tree>,
    device: BlockDevice,
    metrics: Arc<MetricsContext>,
    lock_scope: LockScope,
}

impl BTree {
    /// Creates an empty tree backed by the simulated device at
    /// `config.device_path`. The device file is created if missing.
    pub fn open(config: BTreeConfig, metrics: Arc<MetricsContext>) -> Result<Self> {
        config.validate()?;

        let tree = Tree::new(config.degree)?;
        let device = BlockDevice::open(
            &config.device_path,
            config.direct_io,
            config.device_blocks,
            Arc::clone(&metrics),
        )?;

        tracing::info!(
            degree = config.degree,
            lock_scope = ?config.lock_scope,
            direct_io = device.is_direct(),
            "Opened B-tree engine"
        );

        Ok(Self {
            tree: RwLock::new(tree),
            device,
            metrics,
            lock_scope: config.lock_scope,
        })
    }

    /// Upserts `key`.
    ///
    /// The node write is charged first and the tree is updated whatever its
    /// outcome; a failed write comes back as [`Error::Unpersisted`].
    pub fn insert(&self, key: Key, value: Value) -> Result<()> {
        let persisted = match self.lock_scope {
            LockScope::Operation => {
                let mut tree = self.tree.write();
                let persisted = self.persist_node();
                tree.insert(key, value);
                persisted
            }
            LockScope::Structure => {
                let persisted = self.persist_node();
                self.tree.write().insert(key, value);
                persisted
            }
        };

        persisted.map_err(|e| {
            tracing::warn!(key = key, error = %e, "B-tree node write failed");
            Error::unpersisted("insert", e)
        })
    }

    pub fn search(&self, key: Key) -> Option<Value> {
        self.tree.read().search(key)
    }

    /// Removes `key` with full rebalancing. Returns the removed value, `None`
    /// when the key was absent.
    pub fn delete(&self, key: Key) -> Option<Value> {
        self.tree.write().delete(key)
    }

    pub fn contains(&self, key: Key) -> bool {
        self.search(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.tree.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.read().is_empty()
    }

    pub fn height(&self) -> usize {
        self.tree.read().height()
    }

    /// Holds the shared lock for a consistent view across several reads.
    /// Mutators block until the guard is dropped.
    pub fn read(&self) -> ReadGuard<'_> {
        ReadGuard {
            tree: self.tree.read(),
        }
    }

    pub fn metrics(&self) -> &Arc<MetricsContext> {
        &self.metrics
    }

    pub fn device(&self) -> &BlockDevice {
        &self.device
    }

    fn persist_node(&self) -> Result<()> {
        self.metrics.record_logical(ENTRY_SIZE);
        self.device.simulate_write(ENTRY_SIZE as usize)?;
        Ok(())
    }
}

/// A shared-lock view of the tree.
pub struct ReadGuard<'a> {
    tree: RwLockReadGuard<'a, Tree>,
}

impl ReadGuard<'_> {
    pub fn search(&self, key: Key) -> Option<Value> {
        self.tree.search(key)
    }

    /// Lazy in-order key traversal. Call again to start over.
    pub fn traverse(&self) -> Keys<'_> {
        self.tree.keys()
    }

    pub fn validate(&self) -> Result<()> {
        self.tree.validate()
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn height(&self) -> usize {
        self.tree.height()
    }

    pub fn degree(&self) -> usize {
        self.tree.degree()
    }
}

impl StorageEngine for BTree {
    fn name(&self) -> &'static str {
        "btree"
    }

    fn insert(&self, key: Key, value: Value) -> Result<()> {
        BTree::insert(self, key, value)
    }

    fn search(&self, key: Key) -> Result<Option<Value>> {
        Ok(BTree::search(self, key))
    }

    fn delete(&self, key: Key) -> Result<()> {
        BTree::delete(self, key);
        Ok(())
    }

    fn metrics(&self) -> &Arc<MetricsContext> {
        &self.metrics
    }
}

impl std::fmt::Debug for BTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BTree")
            .field("device", &self.device)
            .field("lock_scope", &self.lock_scope)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::TempDir;

    fn open_btree(dir: &TempDir, degree: usize, scope: LockScope) -> BTree {
        let config = BTreeConfig::new(dir.path().join("btree_disk_sim.dat"))
            .degree(degree)
            .device_blocks(256)
            .lock_scope(scope);
        BTree::open(config, Arc::new(MetricsContext::new())).expect("Failed to open B-tree")
    }

    #[test]
    fn test_open_rejects_invalid_degree() {
        let dir = tempfile::tempdir().unwrap();
        let config = BTreeConfig::new(dir.path().join("dev.dat")).degree(1);
        let err = BTree::open(config, Arc::new(MetricsContext::new())).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_insert_then_search_returns_last_write() {
        let dir = tempfile::tempdir().unwrap();
        let btree = open_btree(&dir, 2, LockScope::Operation);

        btree.insert(5, 10).unwrap();
        btree.insert(5, 20).unwrap();

        assert_eq!(btree.search(5), Some(20));
        assert_eq!(btree.search(6), None);
        assert_eq!(btree.len(), 1);
    }

    #[test]
    fn test_delete_even_keys() {
        let dir = tempfile::tempdir().unwrap();
        let btree = open_btree(&dir, 3, LockScope::Operation);

        for key in 1..=20 {
            btree.insert(key, key * 100).unwrap();
        }
        for key in (2..=20).step_by(2) {
            assert_eq!(btree.delete(key), Some(key * 100));
        }
        assert_eq!(btree.delete(2), None);

        let view = btree.read();
        view.validate().unwrap();
        for key in 1..=20 {
            let expected = if key % 2 == 1 { Some(key * 100) } else { None };
            assert_eq!(view.search(key), expected, "key {}", key);
        }
        let keys: Vec<_> = view.traverse().collect();
        assert_eq!(keys, (1..=20).step_by(2).collect::<Vec<_>>());
    }

    #[test]
    fn test_insert_charges_every_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let btree = open_btree(&dir, 4, LockScope::Operation);

        let k = 100;
        for key in 0..k {
            btree.insert(key, key).unwrap();
        }
        btree.insert(0, 1).unwrap();
        btree.delete(1);

        let snapshot = btree.metrics().snapshot();
        assert_eq!(snapshot.logical_bytes, (k + 1) * ENTRY_SIZE);
        assert_eq!(snapshot.physical_bytes % crate::io::BLOCK_SIZE as u64, 0);
        assert!(snapshot.physical_bytes >= snapshot.logical_bytes);
        assert_eq!(snapshot.physical_bytes, (k + 1) * crate::io::BLOCK_SIZE as u64);
    }

    fn concurrent_disjoint_inserts(scope: LockScope) {
        let dir = tempfile::tempdir().unwrap();
        let btree = open_btree(&dir, 8, scope);
        let threads = 4;
        let per_thread = 500;

        thread::scope(|s| {
            for t in 0..threads {
                let btree = &btree;
                s.spawn(move || {
                    let start = t * per_thread;
                    for key in start..start + per_thread {
                        btree.insert(key, key + 1).unwrap();
                    }
                });
            }
        });

        assert_eq!(btree.len() as u64, threads * per_thread);
        for key in 0..threads * per_thread {
            assert_eq!(btree.search(key), Some(key + 1));
        }
        btree.read().validate().unwrap();
        assert_eq!(
            btree.metrics().logical_bytes(),
            threads * per_thread * ENTRY_SIZE
        );
    }

    #[test]
    fn test_concurrent_inserts_operation_scope() {
        concurrent_disjoint_inserts(LockScope::Operation);
    }

    #[test]
    fn test_concurrent_inserts_structure_scope() {
        concurrent_disjoint_inserts(LockScope::Structure);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_failed_node_write_still_applies_insert() {
        let device = std::path::Path::new("/dev/full");
        if !device.exists() {
            return;
        }

        for scope in [LockScope::Operation, LockScope::Structure] {
            let config = BTreeConfig::new(device).device_blocks(16).lock_scope(scope);
            let btree = BTree::open(config, Arc::new(MetricsContext::new())).unwrap();

            let err = btree.insert(1, 10).unwrap_err();
            assert!(err.is_unpersisted(), "{:?}", err);
            assert!(matches!(
                err,
                Error::Unpersisted {
                    op: "insert",
                    ..
                }
            ));

            assert_eq!(btree.search(1), Some(10));
            assert_eq!(btree.len(), 1);
            assert_eq!(btree.metrics().logical_bytes(), ENTRY_SIZE);
            assert_eq!(btree.metrics().physical_bytes(), 0);
        }
    }

    #[test]
    fn test_search_during_concurrent_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let btree = open_btree(&dir, 2, LockScope::Operation);
        for key in 0..1000 {
            btree.insert(key, key).unwrap();
        }

        thread::scope(|s| {
            s.spawn(|| {
                for key in (0..1000).filter(|k| k % 2 == 0) {
                    btree.delete(key);
                }
            });
            s.spawn(|| {
                for _ in 0..5 {
                    for key in (0..1000).filter(|k| k % 2 == 1) {
                        assert_eq!(btree.search(key), Some(key));
                    }
                }
            });
        });

        assert_eq!(btree.len(), 500);
        btree.read().validate().unwrap();
    }

    #[test]
    fn test_storage_engine_trait() {
        let dir = tempfile::tempdir().unwrap();
        let btree = open_btree(&dir, 2, LockScope::Operation);
        let engine: &dyn StorageEngine = &btree;

        engine.insert(1, 2).unwrap();
        engine.flush().unwrap();
        assert_eq!(engine.search(1).unwrap(), Some(2));
        engine.delete(1).unwrap();
        engine.delete(1).unwrap();
        assert_eq!(engine.search(1).unwrap(), None);
        assert_eq!(engine.name(), "btree");
        assert_eq!(engine.metrics().logical_bytes(), ENTRY_SIZE);
    }
}
