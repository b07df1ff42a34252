use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::io::BLOCK_SIZE;

/// How much of a mutating call runs under the engine's lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockScope {
    /// The lock covers the whole call, including the simulated storage write
    /// and any flush it triggers.
    #[default]
    Operation,
    /// The lock covers only in-memory structural work. Storage writes (the
    /// B-tree node write, the LSM segment write) happen outside it.
    Structure,
}

/// Configuration for the B-tree engine
#[derive(Debug, Clone)]
pub struct BTreeConfig {
    /// Minimum degree `t` (default: 64)
    pub degree: usize,

    /// File backing the simulated block device (default: ./btree_disk_sim.dat)
    pub device_path: PathBuf,

    /// Open the device with direct I/O when the platform supports it (default: true)
    pub direct_io: bool,

    /// Number of blocks the simulated writes are spread over (default: 25600, 100MB)
    pub device_blocks: u64,

    pub lock_scope: LockScope,
}

impl Default for BTreeConfig {
    fn default() -> Self {
        Self {
            degree: 64,
            device_path: PathBuf::from("./btree_disk_sim.dat"),
            direct_io: true,
            device_blocks: 25_600,
            lock_scope: LockScope::Operation,
        }
    }
}

impl BTreeConfig {
    /// Create a new config with the given device file
    pub fn new(device_path: impl Into<PathBuf>) -> Self {
        Self {
            device_path: device_path.into(),
            ..Default::default()
        }
    }

    /// Set the minimum degree
    pub fn degree(mut self, degree: usize) -> Self {
        self.degree = degree;
        self
    }

    /// Enable direct I/O on the simulated device
    pub fn direct_io(mut self, enabled: bool) -> Self {
        self.direct_io = enabled;
        self
    }

    /// Set the simulated device span in blocks
    pub fn device_blocks(mut self, blocks: u64) -> Self {
        self.device_blocks = blocks;
        self
    }

    /// Set the lock scope
    pub fn lock_scope(mut self, scope: LockScope) -> Self {
        self.lock_scope = scope;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.degree < 2 {
            return Err(Error::InvalidConfig(format!(
                "B-tree minimum degree must be at least 2, got {}",
                self.degree
            )));
        }
        if self.device_blocks == 0 {
            return Err(Error::InvalidConfig(
                "simulated device must span at least one block".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration for the LSM engine
#[derive(Debug, Clone)]
pub struct LsmConfig {
    /// Segment directory. Created and cleaned by the caller, never by the engine.
    pub dir: PathBuf,

    /// Memtable entry count that triggers a flush (default: 1000)
    pub threshold: usize,

    /// Write segments with direct I/O when the platform supports it (default: true)
    pub direct_io: bool,

    /// Aligned staging buffer for segment writes (default: 16KB)
    pub write_buffer_size: usize,

    pub lock_scope: LockScope,
}

impl Default for LsmConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./lsm_data"),
            threshold: 1000,
            direct_io: true,
            write_buffer_size: 4 * BLOCK_SIZE,
            lock_scope: LockScope::Operation,
        }
    }
}

impl LsmConfig {
    /// Create a new config with the given segment directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the flush threshold
    pub fn threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    /// Enable direct I/O for segment writes
    pub fn direct_io(mut self, enabled: bool) -> Self {
        self.direct_io = enabled;
        self
    }

    /// Set the segment write buffer size
    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    /// Set the lock scope
    pub fn lock_scope(mut self, scope: LockScope) -> Self {
        self.lock_scope = scope;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.threshold == 0 {
            return Err(Error::InvalidConfig(
                "LSM flush threshold must be at least 1".to_string(),
            ));
        }
        if self.write_buffer_size == 0 || self.write_buffer_size % BLOCK_SIZE != 0 {
            return Err(Error::InvalidConfig(format!(
                "write buffer size must be a non-zero multiple of {} bytes, got {}",
                BLOCK_SIZE, self.write_buffer_size
            )));
        }
        Ok(())
    }
}
