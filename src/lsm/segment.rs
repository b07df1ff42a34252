//! Immutable on-disk segments.
//!
//! A segment is the text dump of one flushed memtable, one entry per line in
//! ascending key order:
//!
//! ```text
//! <key> <value> <tombstone>\n
//! ```
//!
//! All three fields are decimal; `tombstone` is `0` or `1` and a tombstone's
//! value is written as `0`. The file name carries the flush sequence number
//! (`sst_<seq, 20 digits>.txt`), which orders segments from oldest to newest.
//!
//! Segments are staged in `<name>.tmp` through an [`AlignedWriter`], cut back to
//! their text length, synced, and renamed into place; the directory is synced
//! after the rename. A reader therefore never sees a partial segment, and a
//! leftover `.tmp` is never mistaken for one.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::memtable::Entry;
use crate::engine::Key;
use crate::error::{Error, Result};
use crate::io::{open_block_file, sync_dir, AlignedWriter};
use crate::metrics::MetricsContext;

const PREFIX: &str = "sst_";
const SUFFIX: &str = ".txt";

pub fn segment_file_name(seq: u64) -> String {
    format!("{}{:020}{}", PREFIX, seq, SUFFIX)
}

/// The sequence number encoded in a segment file name, if it is one.
pub fn parse_segment_file_name(name: &str) -> Option<u64> {
    let digits = name.strip_prefix(PREFIX)?.strip_suffix(SUFFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Options for writing one segment.
pub(crate) struct WriteOptions<'a> {
    pub direct_io: bool,
    pub buffer_size: usize,
    pub metrics: &'a Arc<MetricsContext>,
}

#[derive(Debug, Clone)]
pub struct Segment {
    seq: u64,
    path: PathBuf,
}

impl Segment {
    pub(crate) fn new(seq: u64, path: PathBuf) -> Self {
        Self { seq, path }
    }

    /// Writes `entries` (ascending by key) as segment `seq` in `dir` and
    /// publishes it under its final name.
    pub(crate) fn write(
        dir: &Path,
        seq: u64,
        entries: impl IntoIterator<Item = (Key, Entry)>,
        options: WriteOptions<'_>,
    ) -> Result<Self> {
        let name = segment_file_name(seq);
        let path = dir.join(&name);
        let tmp_path = dir.join(format!("{}.tmp", name));

        let result = write_tmp(&tmp_path, entries, &options);
        let (count, payload) = match result {
            Ok(written) => written,
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                return Err(e);
            }
        };

        fs::rename(&tmp_path, &path).map_err(|source| Error::Write {
            path: path.clone(),
            source,
        })?;
        sync_dir(dir).map_err(|source| Error::Write {
            path: dir.to_path_buf(),
            source,
        })?;

        tracing::info!(
            seq = seq,
            entries = count,
            bytes = payload,
            path = %path.display(),
            "Flushed memtable to segment"
        );

        Ok(Self { seq, path })
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Looks `key` up, stopping at the first line whose key is larger.
    pub fn get(&self, key: Key) -> Result<Option<Entry>> {
        let mut lines = self.lines()?;
        while let Some((k, entry)) = lines.next_entry()? {
            if k == key {
                return Ok(Some(entry));
            }
            if k > key {
                break;
            }
        }
        Ok(None)
    }

    /// Every entry in file order.
    pub fn read_all(&self) -> Result<Vec<(Key, Entry)>> {
        let mut lines = self.lines()?;
        let mut entries = Vec::new();
        while let Some(entry) = lines.next_entry()? {
            entries.push(entry);
        }
        Ok(entries)
    }

    fn lines(&self) -> Result<Lines<'_>> {
        let file = File::open(&self.path).map_err(|source| Error::Open {
            path: self.path.clone(),
            source,
        })?;
        Ok(Lines {
            path: &self.path,
            reader: BufReader::new(file),
            buf: String::new(),
            line: 0,
            last_key: None,
        })
    }
}

/// Stages the segment text in the `.tmp` file. Returns (entries, payload bytes).
fn write_tmp(
    tmp_path: &Path,
    entries: impl IntoIterator<Item = (Key, Entry)>,
    options: &WriteOptions<'_>,
) -> Result<(usize, u64)> {
    let write_err = |source| Error::Write {
        path: tmp_path.to_path_buf(),
        source,
    };

    let mut open = OpenOptions::new();
    open.write(true).create(true).truncate(true);
    let (file, _direct) = open_block_file(tmp_path, &open, options.direct_io)?;

    let mut writer = AlignedWriter::new(file, options.buffer_size, Arc::clone(options.metrics))?;
    let mut count = 0;
    for (key, entry) in entries {
        writer.write_all(encode_line(key, entry).as_bytes()).map_err(write_err)?;
        count += 1;
    }

    let payload = writer.payload_len();
    let file = writer.into_inner().map_err(write_err)?;
    // Drop the zero padding of the last block; it was written and counted.
    file.set_len(payload).map_err(write_err)?;
    file.sync_all().map_err(write_err)?;

    Ok((count, payload))
}

pub(crate) fn encode_line(key: Key, entry: Entry) -> String {
    match entry {
        Entry::Put(value) => format!("{} {} 0\n", key, value),
        Entry::Tombstone => format!("{} 0 1\n", key),
    }
}

fn decode_line(line: &str) -> std::result::Result<(Key, Entry), String> {
    let mut fields = line.split(' ');
    let (Some(key), Some(value), Some(flag), None) =
        (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        return Err(format!("expected 3 fields in {:?}", line));
    };

    let key = key
        .parse()
        .map_err(|e| format!("bad key {:?}: {}", key, e))?;
    let value = value
        .parse()
        .map_err(|e| format!("bad value {:?}: {}", value, e))?;
    let entry = match flag {
        "0" => Entry::Put(value),
        "1" => Entry::Tombstone,
        other => return Err(format!("bad tombstone flag {:?}", other)),
    };
    Ok((key, entry))
}

/// Line reader that validates ordering as it goes.
struct Lines<'a> {
    path: &'a Path,
    reader: BufReader<File>,
    buf: String,
    line: usize,
    last_key: Option<Key>,
}

impl Lines<'_> {
    fn next_entry(&mut self) -> Result<Option<(Key, Entry)>> {
        self.buf.clear();
        let read = self.reader.read_line(&mut self.buf);
        self.line += 1;
        match read {
            Ok(0) => return Ok(None),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                return Err(self.corrupt(e.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        // Block padding from a segment that was never cut back ends the data.
        if self.buf.starts_with('\0') {
            return Ok(None);
        }

        let Some(text) = self.buf.strip_suffix('\n') else {
            return Err(self.corrupt("missing line terminator".to_string()));
        };
        let (key, entry) = decode_line(text).map_err(|reason| self.corrupt(reason))?;

        if let Some(last) = self.last_key {
            if key <= last {
                return Err(self.corrupt(format!("key {} follows key {}", key, last)));
            }
        }
        self.last_key = Some(key);
        Ok(Some((key, entry)))
    }

    fn corrupt(&self, reason: String) -> Error {
        Error::CorruptSegment {
            path: self.path.to_path_buf(),
            line: self.line,
            reason,
        }
    }
}

/// Segments already present in `dir`, oldest first. Files that are not named
/// like a segment (including `.tmp` leftovers) are skipped.
pub fn discover(dir: &Path) -> Result<Vec<Segment>> {
    let read_dir = fs::read_dir(dir).map_err(|source| Error::Open {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut segments = Vec::new();
    for entry in read_dir {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        match parse_segment_file_name(name) {
            Some(seq) => segments.push(Segment::new(seq, entry.path())),
            None => {
                tracing::debug!(file = name, "Skipping non-segment file");
            }
        }
    }

    segments.sort_by_key(Segment::seq);
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_segment(
        dir: &TempDir,
        seq: u64,
        entries: &[(Key, Entry)],
        metrics: &Arc<MetricsContext>,
    ) -> Segment {
        Segment::write(
            dir.path(),
            seq,
            entries.iter().copied(),
            WriteOptions {
                direct_io: true,
                buffer_size: 4096,
                metrics,
            },
        )
        .expect("Failed to write segment")
    }

    #[test]
    fn test_file_name_round_trip() {
        let name = segment_file_name(42);
        assert_eq!(name, "sst_00000000000000000042.txt");
        assert_eq!(parse_segment_file_name(&name), Some(42));

        assert_eq!(parse_segment_file_name("sst_00000000000000000042.txt.tmp"), None);
        assert_eq!(parse_segment_file_name("sst_.txt"), None);
        assert_eq!(parse_segment_file_name("sst_-1.txt"), None);
        assert_eq!(parse_segment_file_name("notes.txt"), None);
    }

    #[test]
    fn test_segment_text_format() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(MetricsContext::new());
        let segment = write_segment(
            &dir,
            1,
            &[(1, Entry::Put(100)), (2, Entry::Tombstone), (3, Entry::Put(300))],
            &metrics,
        );

        let content = fs::read_to_string(segment.path()).unwrap();
        assert_eq!(content, "1 100 0\n2 0 1\n3 300 0\n");
        assert_eq!(segment.seq(), 1);

        // The padded block was still written and counted.
        assert_eq!(metrics.physical_bytes(), 4096);
        assert!(!dir.path().join(format!("{}.tmp", segment_file_name(1))).exists());
    }

    #[test]
    fn test_large_segment_spans_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(MetricsContext::new());
        let entries: Vec<_> = (0..2000u64).map(|k| (k, Entry::Put(k * 7))).collect();
        let segment = write_segment(&dir, 9, &entries, &metrics);

        let len = fs::metadata(segment.path()).unwrap().len();
        let expected: usize = entries
            .iter()
            .map(|&(k, e)| encode_line(k, e).len())
            .sum();
        assert_eq!(len, expected as u64);
        assert_eq!(
            metrics.physical_bytes(),
            crate::io::round_up_to_block(expected) as u64
        );
        assert_eq!(segment.read_all().unwrap(), entries);
    }

    #[test]
    fn test_get_finds_entries_and_tombstones() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(MetricsContext::new());
        let segment = write_segment(
            &dir,
            3,
            &[(10, Entry::Put(1)), (20, Entry::Tombstone), (30, Entry::Put(3))],
            &metrics,
        );

        assert_eq!(segment.get(10).unwrap(), Some(Entry::Put(1)));
        assert_eq!(segment.get(20).unwrap(), Some(Entry::Tombstone));
        assert_eq!(segment.get(30).unwrap(), Some(Entry::Put(3)));
        assert_eq!(segment.get(15).unwrap(), None);
        assert_eq!(segment.get(31).unwrap(), None);
    }

    #[test]
    fn test_reader_stops_at_padding() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(segment_file_name(1));
        let mut data = b"1 10 0\n2 20 0\n".to_vec();
        data.resize(4096, 0);
        fs::write(&path, &data).unwrap();

        let segment = Segment::new(1, path);
        assert_eq!(segment.get(2).unwrap(), Some(Entry::Put(20)));
        assert_eq!(segment.get(3).unwrap(), None);
        assert_eq!(segment.read_all().unwrap().len(), 2);
    }

    #[test]
    fn test_corrupt_lines_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let cases: &[&[u8]] = &[
            b"1 10 0\nnot a line\n",
            b"1 10 2\n",
            b"1 10\n",
            b"5 1 0\n4 1 0\n",
            b"1 10 0",
        ];

        for (i, data) in cases.iter().enumerate() {
            let path = dir.path().join(segment_file_name(i as u64));
            fs::write(&path, data).unwrap();
            let segment = Segment::new(i as u64, path);
            let err = segment.read_all().unwrap_err();
            assert!(
                matches!(err, Error::CorruptSegment { .. }),
                "case {} gave {:?}",
                i,
                err
            );
        }
    }

    #[test]
    fn test_invalid_utf8_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(segment_file_name(1));
        fs::write(&path, b"1 10 0\n2 \xff 0\n").unwrap();

        let segment = Segment::new(1, path);
        assert_eq!(segment.get(1).unwrap(), Some(Entry::Put(10)));
        let err = segment.get(2).unwrap_err();
        assert!(
            matches!(err, Error::CorruptSegment { line: 2, .. }),
            "{:?}",
            err
        );
    }

    #[test]
    fn test_discover_orders_by_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(MetricsContext::new());
        for seq in [12, 3, 7] {
            write_segment(&dir, seq, &[(seq, Entry::Put(seq))], &metrics);
        }
        fs::write(dir.path().join("sst_00000000000000000099.txt.tmp"), b"1 1 0\n").unwrap();
        fs::write(dir.path().join("README"), b"hello").unwrap();

        let segments = discover(dir.path()).unwrap();
        let seqs: Vec<_> = segments.iter().map(Segment::seq).collect();
        assert_eq!(seqs, vec![3, 7, 12]);
    }

    #[test]
    fn test_discover_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let err = discover(&dir.path().join("absent")).unwrap_err();
        assert!(matches!(err, Error::Open { .. }));
    }

    #[test]
    fn test_write_into_missing_dir_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(MetricsContext::new());
        let err = Segment::write(
            &dir.path().join("absent"),
            1,
            [(1, Entry::Put(1))],
            WriteOptions {
                direct_io: false,
                buffer_size: 4096,
                metrics: &metrics,
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::Open { .. }));
        assert_eq!(metrics.physical_bytes(), 0);
    }
}
