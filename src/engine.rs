use std::sync::Arc;

use crate::error::Result;
use crate::metrics::MetricsContext;

pub type Key = u64;
pub type Value = u64;

/// Logical size of one persisted key/value pair.
pub const ENTRY_SIZE: u64 = (std::mem::size_of::<Key>() + std::mem::size_of::<Value>()) as u64;

/// The operations a workload driver issues against either engine.
///
/// Implementations are shared across worker threads by reference; every method
/// takes `&self` and does its own locking.
pub trait StorageEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Upserts `key`. An `Error::Unpersisted` result means the value is visible
    /// but its durability write failed.
    fn insert(&self, key: Key, value: Value) -> Result<()>;

    /// Returns an owned copy of the current value. Deleted and never-written
    /// keys both yield `None`.
    fn search(&self, key: Key) -> Result<Option<Value>>;

    /// Removes `key`. Deleting a missing key succeeds.
    fn delete(&self, key: Key) -> Result<()>;

    /// Forces buffered state to storage. Engines that write in place have
    /// nothing to do.
    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn metrics(&self) -> &Arc<MetricsContext>;
}
