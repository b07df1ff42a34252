//! B-tree and LSM key-value engines instrumented to measure write amplification.
//!
//! Both engines charge every durability write to a shared [`MetricsContext`]:
//! logical bytes for the user data, physical bytes for the whole blocks that
//! reach the device. A workload driver runs either engine through
//! [`StorageEngine`] and reads the counters between phases.

pub mod btree;
pub mod config;
pub mod engine;
pub mod error;
pub mod io;
pub mod lsm;
pub mod metrics;

pub use btree::BTree;
pub use config::{BTreeConfig, LockScope, LsmConfig};
pub use engine::{Key, StorageEngine, Value, ENTRY_SIZE};
pub use error::{Error, Result};
pub use io::BLOCK_SIZE;
pub use lsm::LsmEngine;
pub use metrics::{MetricsContext, MetricsSnapshot};
