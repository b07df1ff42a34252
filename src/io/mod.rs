//! Block I/O cost model.
//!
//! Everything the engines persist goes through this module so that physical
//! bytes are counted the same way for both: whole [`BLOCK_SIZE`] blocks, padding
//! included, written with direct I/O when the platform and filesystem allow it.

pub mod aligned;
pub mod device;

pub use aligned::{round_up_to_block, AlignedBuffer, AlignedWriter};
pub use device::BlockDevice;

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use crate::error::{Error, Result};

/// Physical block size. Direct I/O needs buffers, lengths and offsets aligned to it.
pub const BLOCK_SIZE: usize = 4096;

/// Opens `path` with `options`, adding `O_DIRECT` when `direct_io` is requested
/// and supported. Returns the file and whether direct I/O is actually in effect.
///
/// Filesystems without direct I/O reject the flag with `EINVAL` at open time; in
/// that case, and on platforms without the flag, the file is reopened buffered.
pub(crate) fn open_block_file(
    path: &Path,
    options: &OpenOptions,
    direct_io: bool,
) -> Result<(File, bool)> {
    if direct_io {
        match open_direct(path, options) {
            Ok(file) => return Ok((file, true)),
            Err(e) if direct_io_unsupported(&e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Direct I/O unavailable, falling back to buffered writes"
                );
            }
            Err(source) => {
                return Err(Error::Open {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
    }

    let file = options.open(path).map_err(|source| Error::Open {
        path: path.to_path_buf(),
        source,
    })?;
    Ok((file, false))
}

#[cfg(target_os = "linux")]
fn open_direct(path: &Path, options: &OpenOptions) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;

    let mut options = options.clone();
    options.custom_flags(libc::O_DIRECT);
    options.open(path)
}

#[cfg(not(target_os = "linux"))]
fn open_direct(_path: &Path, _options: &OpenOptions) -> io::Result<File> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "direct I/O is not supported on this platform",
    ))
}

fn direct_io_unsupported(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::Unsupported || err.raw_os_error() == Some(libc::EINVAL)
}

/// Makes a rename or create inside `dir` durable.
#[cfg(unix)]
pub(crate) fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
pub(crate) fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
pub(crate) fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
pub(crate) fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset)? {
            0 => return Err(io::ErrorKind::WriteZero.into()),
            n => {
                buf = &buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_block_file_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks.dat");
        let mut options = OpenOptions::new();
        options.create(true).write(true);

        let (file, _direct) = open_block_file(&path, &options, true).unwrap();
        drop(file);
        assert!(path.exists());

        let (_file, direct) = open_block_file(&path, &options, false).unwrap();
        assert!(!direct);
    }

    #[test]
    fn test_open_block_file_reports_open_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("blocks.dat");
        let mut options = OpenOptions::new();
        options.create(true).write(true);

        let err = open_block_file(&path, &options, false).unwrap_err();
        assert!(matches!(err, Error::Open { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_sync_dir() {
        let dir = tempfile::tempdir().unwrap();
        sync_dir(dir.path()).unwrap();
        assert!(sync_dir(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_unsupported_detection() {
        assert!(direct_io_unsupported(&io::Error::from_raw_os_error(libc::EINVAL)));
        assert!(direct_io_unsupported(&io::ErrorKind::Unsupported.into()));
        assert!(!direct_io_unsupported(&io::ErrorKind::PermissionDenied.into()));
    }
}
