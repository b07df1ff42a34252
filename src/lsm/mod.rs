//! Log-structured engine: a memtable flushed to immutable text segments.
//!
//! Writes land in the memtable. Once it holds `threshold` keys it is written
//! out as the next segment. Searches consult the memtable first and then the
//! segments newest first; the first generation that knows the key answers, a
//! tombstone answering "not found". Segments are never merged or removed.

mod memtable;
mod segment;

pub use memtable::{Entry, Memtable};
pub use segment::{discover, parse_segment_file_name, segment_file_name, Segment};

use std::mem;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::config::{LockScope, LsmConfig};
use crate::engine::{Key, StorageEngine, Value, ENTRY_SIZE};
use crate::error::{Error, Result};
use crate::metrics::MetricsContext;
use segment::WriteOptions;

pub struct LsmEngine {
    config: LsmConfig,
    state: Mutex<LsmState>,
    metrics: Arc<MetricsContext>,
}

struct LsmState {
    memtable: Arc<Memtable>,
    /// Memtables cut off for a flush that has not been published yet,
    /// ascending by sequence number. Only used with [`LockScope::Structure`].
    frozen: Vec<FrozenMemtable>,
    /// Published segments, ascending by sequence number. Replaced rather than
    /// mutated while searchers hold a snapshot.
    segments: Arc<Vec<Arc<Segment>>>,
    next_seq: u64,
}

struct FrozenMemtable {
    seq: u64,
    memtable: Arc<Memtable>,
    /// A writer currently owns this flush. Cleared when its write fails so a
    /// later flush picks it up again.
    in_flight: bool,
}

/// One generation a search may consult, tagged by sequence number.
enum Generation {
    Frozen(u64, Arc<Memtable>),
    Segment(Arc<Segment>),
}

impl LsmState {
    fn take_sequence(&mut self) -> Result<u64> {
        let seq = self.next_seq;
        self.next_seq = following(seq)?;
        Ok(seq)
    }

    /// Swaps in an empty memtable and parks the full one as an in-flight flush.
    fn freeze(&mut self) -> Result<(u64, Arc<Memtable>)> {
        let seq = self.take_sequence()?;
        let memtable = mem::replace(&mut self.memtable, Arc::new(Memtable::new()));
        self.frozen.push(FrozenMemtable {
            seq,
            memtable: Arc::clone(&memtable),
            in_flight: true,
        });
        Ok((seq, memtable))
    }

    /// Claims every frozen memtable whose earlier flush failed.
    fn claim_failed(&mut self) -> Vec<(u64, Arc<Memtable>)> {
        self.frozen
            .iter_mut()
            .filter(|f| !f.in_flight)
            .map(|f| {
                f.in_flight = true;
                (f.seq, Arc::clone(&f.memtable))
            })
            .collect()
    }

    fn publish(&mut self, segment: Segment) {
        self.frozen.retain(|f| f.seq != segment.seq());
        let segments = Arc::make_mut(&mut self.segments);
        let pos = segments.partition_point(|s| s.seq() < segment.seq());
        segments.insert(pos, Arc::new(segment));
    }

    /// Frozen memtables and segments, newest first.
    fn generations(&self) -> Vec<Generation> {
        let mut generations: Vec<_> = self
            .frozen
            .iter()
            .map(|f| Generation::Frozen(f.seq, Arc::clone(&f.memtable)))
            .chain(self.segments.iter().cloned().map(Generation::Segment))
            .collect();
        generations.sort_by_key(|g| std::cmp::Reverse(g.seq()));
        generations
    }
}

/// The sequence number after `seq`. Numbers never wrap, so newer segments
/// always sort after older ones.
fn following(seq: u64) -> Result<u64> {
    seq.checked_add(1).ok_or_else(|| {
        Error::InvalidState(format!("flush sequence exhausted after {}", seq))
    })
}

impl Generation {
    fn seq(&self) -> u64 {
        match self {
            Generation::Frozen(seq, _) => *seq,
            Generation::Segment(segment) => segment.seq(),
        }
    }

    fn get(&self, key: Key) -> Result<Option<Entry>> {
        match self {
            Generation::Frozen(_, memtable) => Ok(memtable.get(key)),
            Generation::Segment(segment) => segment.get(key),
        }
    }
}

impl LsmEngine {
    /// Opens an engine over `config.dir`, which must already exist.
    ///
    /// Segments left in the directory by an earlier engine are searched as
    /// older generations and numbering continues after the highest one.
    pub fn open(config: LsmConfig, metrics: Arc<MetricsContext>) -> Result<Self> {
        config.validate()?;

        let segments = segment::discover(&config.dir)?;
        let next_seq = match segments.last() {
            Some(newest) => following(newest.seq())?,
            None => 1,
        };

        tracing::info!(
            dir = %config.dir.display(),
            segments = segments.len(),
            next_seq = next_seq,
            threshold = config.threshold,
            lock_scope = ?config.lock_scope,
            "Opened LSM engine"
        );

        Ok(Self {
            state: Mutex::new(LsmState {
                memtable: Arc::new(Memtable::new()),
                frozen: Vec::new(),
                segments: Arc::new(segments.into_iter().map(Arc::new).collect()),
                next_seq,
            }),
            config,
            metrics,
        })
    }

    /// Upserts `key`, flushing first-hand if the memtable reaches the threshold.
    pub fn insert(&self, key: Key, value: Value) -> Result<()> {
        self.apply("insert", key, Entry::Put(value))
    }

    /// Records a tombstone for `key`. Deleting a missing key succeeds.
    pub fn delete(&self, key: Key) -> Result<()> {
        self.apply("delete", key, Entry::Tombstone)
    }

    pub fn search(&self, key: Key) -> Result<Option<Value>> {
        let generations = {
            let state = self.state.lock();
            if let Some(entry) = state.memtable.get(key) {
                return Ok(entry.value());
            }
            state.generations()
        };

        // Published segments and frozen memtables are immutable, so the scan
        // runs without the lock.
        for generation in &generations {
            if let Some(entry) = generation.get(key)? {
                return Ok(entry.value());
            }
        }
        Ok(None)
    }

    /// Writes the memtable out as a new segment. No-op when it is empty.
    ///
    /// Under [`LockScope::Structure`] this also retries frozen memtables whose
    /// earlier flush failed.
    pub fn flush(&self) -> Result<()> {
        let state = self.state.lock();
        match self.config.lock_scope {
            LockScope::Operation => self.flush_locked(state),
            LockScope::Structure => self.flush_unlocked(state),
        }
    }

    /// Segments published so far, including ones found at open.
    pub fn segment_count(&self) -> usize {
        self.state.lock().segments.len()
    }

    /// Segment files oldest first.
    pub fn segment_paths(&self) -> Vec<PathBuf> {
        let state = self.state.lock();
        state.segments.iter().map(|s| s.path().to_path_buf()).collect()
    }

    pub fn memtable_len(&self) -> usize {
        self.state.lock().memtable.len()
    }

    /// Memtables cut off for a flush but not yet published.
    pub fn pending_flushes(&self) -> usize {
        self.state.lock().frozen.len()
    }

    /// Sequence number the next flush will take.
    pub fn next_sequence(&self) -> u64 {
        self.state.lock().next_seq
    }

    pub fn metrics(&self) -> &Arc<MetricsContext> {
        &self.metrics
    }

    pub fn config(&self) -> &LsmConfig {
        &self.config
    }

    fn apply(&self, op: &'static str, key: Key, entry: Entry) -> Result<()> {
        self.metrics.record_logical(ENTRY_SIZE);

        let state = self.state.lock();
        state.memtable.put(key, entry);
        if state.memtable.len() < self.config.threshold {
            return Ok(());
        }

        let flushed = match self.config.lock_scope {
            LockScope::Operation => self.flush_locked(state),
            LockScope::Structure => self.flush_unlocked(state),
        };
        flushed.map_err(|e| {
            tracing::warn!(op = op, key = key, error = %e, "Memtable flush failed");
            Error::unpersisted(op, e)
        })
    }

    /// Writes and publishes the memtable while holding the engine lock. On
    /// failure the memtable is kept and the sequence number is not consumed.
    fn flush_locked(&self, mut state: MutexGuard<'_, LsmState>) -> Result<()> {
        if state.memtable.is_empty() {
            return Ok(());
        }

        let seq = state.next_seq;
        let next_seq = following(seq)?;
        let segment = Segment::write(
            &self.config.dir,
            seq,
            state.memtable.iter(),
            self.write_options(),
        )?;

        state.next_seq = next_seq;
        state.publish(segment);
        state.memtable = Arc::new(Memtable::new());
        Ok(())
    }

    /// Freezes the memtable under the lock, then writes every claimed frozen
    /// memtable with the lock released. Reports the first failure after
    /// attempting all of them.
    fn flush_unlocked(&self, mut state: MutexGuard<'_, LsmState>) -> Result<()> {
        let frozen = if state.memtable.is_empty() {
            None
        } else {
            Some(state.freeze()?)
        };
        let mut pending = state.claim_failed();
        pending.extend(frozen);
        drop(state);

        let mut result = Ok(());
        for (seq, memtable) in pending {
            let written = Segment::write(
                &self.config.dir,
                seq,
                memtable.iter(),
                self.write_options(),
            );

            let mut state = self.state.lock();
            match written {
                Ok(segment) => state.publish(segment),
                Err(e) => {
                    if let Some(frozen) = state.frozen.iter_mut().find(|f| f.seq == seq) {
                        frozen.in_flight = false;
                    }
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
        }
        result
    }

    fn write_options(&self) -> WriteOptions<'_> {
        WriteOptions {
            direct_io: self.config.direct_io,
            buffer_size: self.config.write_buffer_size,
            metrics: &self.metrics,
        }
    }
}

impl StorageEngine for LsmEngine {
    fn name(&self) -> &'static str {
        "lsm"
    }

    fn insert(&self, key: Key, value: Value) -> Result<()> {
        LsmEngine::insert(self, key, value)
    }

    fn search(&self, key: Key) -> Result<Option<Value>> {
        LsmEngine::search(self, key)
    }

    fn delete(&self, key: Key) -> Result<()> {
        LsmEngine::delete(self, key)
    }

    fn flush(&self) -> Result<()> {
        LsmEngine::flush(self)
    }

    fn metrics(&self) -> &Arc<MetricsContext> {
        &self.metrics
    }
}

impl std::fmt::Debug for LsmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LsmEngine")
            .field("config", &self.config)
            .finish()
    }
}
