use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::{open_block_file, round_up_to_block, write_all_at, AlignedBuffer, BLOCK_SIZE};
use crate::error::{Error, Result};
use crate::metrics::MetricsContext;

/// A file standing in for a block device that an in-place engine rewrites
/// pages on.
///
/// Each [`simulate_write`](Self::simulate_write) rewrites whole blocks at a
/// scattered, block-aligned offset inside the device span, so the cost looks
/// like a random page rewrite rather than an append. The source page is a
/// single shared, immutable aligned block; concurrent callers need no lock.
pub struct BlockDevice {
    file: File,
    path: PathBuf,
    page: AlignedBuffer,
    blocks: u64,
    direct: bool,
    writes: AtomicU64,
    metrics: Arc<MetricsContext>,
}

impl BlockDevice {
    pub fn open(
        path: impl AsRef<Path>,
        direct_io: bool,
        blocks: u64,
        metrics: Arc<MetricsContext>,
    ) -> Result<Self> {
        let path = path.as_ref();
        if blocks == 0 {
            return Err(Error::InvalidConfig(
                "simulated device must span at least one block".to_string(),
            ));
        }

        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true);
        let (file, direct) = open_block_file(path, &options, direct_io)?;

        let mut page = AlignedBuffer::new(BLOCK_SIZE)?;
        page[0] = 1;

        tracing::debug!(
            path = %path.display(),
            direct_io = direct,
            blocks = blocks,
            "Opened simulated block device"
        );

        Ok(Self {
            file,
            path: path.to_path_buf(),
            page,
            blocks,
            direct,
            writes: AtomicU64::new(0),
            metrics,
        })
    }

    /// Issues one durability write covering at least `byte_count` bytes.
    ///
    /// The physical cost is `byte_count` rounded up to whole blocks (a zero-byte
    /// request still costs one block). Returns the physical bytes written.
    /// Logical bytes are the caller's to record.
    pub fn simulate_write(&self, byte_count: usize) -> Result<u64> {
        let rounded = round_up_to_block(byte_count.max(1));
        let count = (rounded / BLOCK_SIZE) as u64;
        let start = self.next_block();

        for i in 0..count {
            let offset = ((start + i) % self.blocks) * BLOCK_SIZE as u64;
            write_all_at(&self.file, &self.page, offset).map_err(|source| Error::Write {
                path: self.path.clone(),
                source,
            })?;
        }

        self.metrics.record_physical(rounded as u64);
        Ok(rounded as u64)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether writes bypass the page cache.
    pub fn is_direct(&self) -> bool {
        self.direct
    }

    pub fn metrics(&self) -> &Arc<MetricsContext> {
        &self.metrics
    }

    /// Scatters successive writes over the span (splitmix64 of a write counter).
    fn next_block(&self) -> u64 {
        let mut z = self
            .writes
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(0x9E37_79B9_7F4A_7C15);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        (z ^ (z >> 31)) % self.blocks
    }
}

impl std::fmt::Debug for BlockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockDevice")
            .field("path", &self.path)
            .field("blocks", &self.blocks)
            .field("direct", &self.direct)
            .finish()
    }
}
