//! Multi-version overlay over the persistent key/value store.
//!
//! Every applied task leaves its writes here tagged with its global sequence
//! number. A reader executing task `n` only observes versions written by tasks
//! with a lower sequence number and falls back to the persistent snapshot when
//! no version exists.
//!
//! The overlay is not meant to be mutated while a worker executes against it:
//! callers serialize [`VersionedState::apply`] with task execution through the
//! shared execution lock.

use crate::kv::MemDb;
use crate::types::{KvList, KvLists, Table, TxNum};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Multi-version overlay of applied task effects.
///
/// Structure: (Table, Key) -> BTreeMap<TxNum -> Value>
///
/// The BTreeMap is keyed by sequence number for efficient range queries to
/// find the latest version written by a task with a lower sequence number.
pub struct VersionedState {
    data: DashMap<(Table, Vec<u8>), BTreeMap<TxNum, Vec<u8>>>,
    /// First sequence number whose effects are not yet applied.
    frontier: AtomicU64,
}

impl VersionedState {
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
            frontier: AtomicU64::new(0),
        }
    }

    /// Reads the latest version of `key` visible to task `tx_num`.
    ///
    /// Returns `None` when no applied task wrote the key, in which case the
    /// caller reads from persistent storage.
    pub fn get(&self, table: Table, key: &[u8], tx_num: TxNum) -> Option<Vec<u8>> {
        let versions = self.data.get(&(table, key.to_vec()))?;
        versions
            .range(..tx_num)
            .next_back()
            .map(|(_, value)| value.clone())
    }

    /// Writes a single version.
    pub fn put(&self, table: Table, key: Vec<u8>, tx_num: TxNum, value: Vec<u8>) {
        self.data
            .entry((table, key))
            .or_default()
            .insert(tx_num, value);
    }

    /// Applies the write lists of task `tx_num`.
    pub fn apply(&self, tx_num: TxNum, writes: &KvLists) {
        for (table, list) in writes {
            for (key, value) in list.iter() {
                self.put(*table, key.to_vec(), tx_num, value.to_vec());
            }
        }
    }

    /// Checks that every value task `tx_num` read is still the value it would
    /// read now.
    ///
    /// Reads that were served from persistent storage stay valid as long as
    /// no applied task has written the key since.
    pub fn reads_valid(&self, tx_num: TxNum, reads: &KvLists) -> bool {
        reads.iter().all(|(table, list)| self.list_valid(*table, tx_num, list))
    }

    fn list_valid(&self, table: Table, tx_num: TxNum, list: &KvList) -> bool {
        list.iter().all(|(key, read)| match self.get(table, key, tx_num) {
            Some(current) => current == read,
            None => true,
        })
    }

    pub fn frontier(&self) -> TxNum {
        self.frontier.load(Ordering::Acquire)
    }

    /// Marks every task below `tx_num` as applied.
    pub fn advance_frontier(&self, tx_num: TxNum) {
        self.frontier.fetch_max(tx_num, Ordering::AcqRel);
    }

    /// Number of keys with at least one version.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Persists the latest version of every key and clears the overlay.
    ///
    /// Empty values are deletions.
    pub fn flush(&self, db: &MemDb) -> usize {
        let mut flushed = 0;
        for entry in self.data.iter() {
            let (table, key) = entry.key();
            if let Some((_, value)) = entry.value().iter().next_back() {
                if value.is_empty() {
                    db.delete(*table, key);
                } else {
                    db.put(*table, key.clone(), value.clone());
                }
                flushed += 1;
            }
        }
        self.data.clear();
        debug!(keys = flushed, "flushed versioned state");
        flushed
    }
}

impl Default for VersionedState {
    fn default() -> Self {
        Self::new()
    }
}
