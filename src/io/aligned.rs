//! Block-aligned buffers and a writer for direct I/O.
//!
//! Direct I/O (`O_DIRECT` on Linux) bypasses the page cache, which is what makes
//! the physical byte count meaningful: every block handed to the kernel reaches
//! the device. It also imposes alignment rules:
//! 1. The memory buffer's starting address must be aligned to the block size.
//! 2. The number of bytes to write must be a multiple of the block size.
//! 3. The file offset must be a multiple of the block size.
//!
//! [`AlignedWriter`] satisfies all three while exposing `std::io::Write`. Bytes
//! are staged in an [`AlignedBuffer`]; when the buffer fills, or on `flush()`,
//! the staged bytes are zero-padded to the next block boundary and written out.
//! Every block written is charged to the shared [`MetricsContext`].

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fs::File;
use std::io::{self, Write};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use super::BLOCK_SIZE;
use crate::error::{Error, Result};
use crate::metrics::MetricsContext;

/// Rounds `n` up to the next multiple of [`BLOCK_SIZE`].
pub fn round_up_to_block(n: usize) -> usize {
    n.div_ceil(BLOCK_SIZE) * BLOCK_SIZE
}

/// A buffered writer that only ever issues whole, aligned blocks.
pub struct AlignedWriter {
    /// Should be opened with `O_DIRECT` where available; works on buffered files too.
    file: File,
    /// Staging area. Always a whole number of blocks.
    buffer: AlignedBuffer,
    /// Bytes currently staged in `buffer` (not the file position).
    position: usize,
    /// Payload bytes accepted so far, padding excluded.
    written: u64,
    metrics: Arc<MetricsContext>,
}

impl AlignedWriter {
    pub fn new(file: File, capacity: usize, metrics: Arc<MetricsContext>) -> Result<Self> {
        Ok(Self {
            file,
            buffer: AlignedBuffer::new(capacity)?,
            position: 0,
            written: 0,
            metrics,
        })
    }

    /// Payload bytes written through this writer, excluding block padding.
    pub fn payload_len(&self) -> u64 {
        self.written
    }

    /// Flushes the staged tail and hands back the file.
    pub fn into_inner(mut self) -> io::Result<File> {
        self.flush()?;
        let Self { file, .. } = self;
        Ok(file)
    }

    fn write_blocks(&mut self, len: usize) -> io::Result<()> {
        self.file.write_all(&self.buffer[..len])?;
        self.metrics.record_physical(len as u64);
        Ok(())
    }
}

impl Write for AlignedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let capacity = self.buffer.len();
        let mut remaining = buf;

        while !remaining.is_empty() {
            let space = capacity - self.position;
            let take = space.min(remaining.len());
            let end = self.position + take;
            self.buffer[self.position..end].copy_from_slice(&remaining[..take]);
            self.position = end;
            remaining = &remaining[take..];

            if self.position == capacity {
                self.write_blocks(capacity)?;
                self.position = 0;
            }
        }

        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.position == 0 {
            return Ok(());
        }

        let aligned_size = round_up_to_block(self.position);
        self.buffer[self.position..aligned_size].fill(0);
        self.write_blocks(aligned_size)?;
        self.position = 0;

        Ok(())
    }
}

/// Zeroed heap memory aligned to [`BLOCK_SIZE`], sized in whole blocks.
pub struct AlignedBuffer {
    data: *mut u8,
    layout: Layout,
}

// The buffer exclusively owns its allocation.
unsafe impl Send for AlignedBuffer {}
// Shared access only hands out `&[u8]`.
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocates `round_up_to_block(capacity)` zeroed bytes.
    pub fn new(capacity: usize) -> Result<Self> {
        let size = round_up_to_block(capacity.max(1));
        let layout = Layout::from_size_align(size, BLOCK_SIZE).map_err(|_| Error::Allocation {
            size,
            align: BLOCK_SIZE,
        })?;
        // SAFETY: `layout` has non-zero size.
        let data = unsafe { alloc_zeroed(layout) };
        if data.is_null() {
            return Err(Error::Allocation {
                size,
                align: BLOCK_SIZE,
            });
        }

        Ok(Self { data, layout })
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this exact layout.
        unsafe { dealloc(self.data, self.layout) }
    }
}

impl Deref for AlignedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: `data` points to `layout.size()` initialized bytes.
        unsafe { std::slice::from_raw_parts(self.data, self.layout.size()) }
    }
}

impl DerefMut for AlignedBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.data, self.layout.size()) }
    }
}
