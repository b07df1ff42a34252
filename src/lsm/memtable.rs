use crossbeam_skiplist::SkipMap;

use crate::engine::{Key, Value};

/// What the engine knows about a key: a live value or a deletion marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    Put(Value),
    Tombstone,
}

impl Entry {
    /// The value a search reports. Tombstones read as absent.
    pub fn value(self) -> Option<Value> {
        match self {
            Entry::Put(value) => Some(value),
            Entry::Tombstone => None,
        }
    }

    pub fn is_tombstone(self) -> bool {
        matches!(self, Entry::Tombstone)
    }
}

/// Ordered in-memory index of entries not yet flushed.
///
/// Mutated only under the engine lock. Once frozen for a flush it is shared
/// read-only with searchers, which the skip list allows without further locking.
#[derive(Debug, Default)]
pub struct Memtable {
    data: SkipMap<Key, Entry>,
}

impl Memtable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `entry` for `key`; the last write wins.
    pub fn put(&self, key: Key, entry: Entry) {
        self.data.insert(key, entry);
    }

    pub fn get(&self, key: Key) -> Option<Entry> {
        self.data.get(&key).map(|e| *e.value())
    }

    /// Distinct keys held, tombstones included.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Entries in ascending key order.
    pub fn iter(&self) -> impl Iterator<Item = (Key, Entry)> + '_ {
        self.data.iter().map(|e| (*e.key(), *e.value()))
    }
}
