//! Core types shared by the store, the scheduler and the execution workers.

use std::collections::BTreeMap;
use std::fmt;

/// Global transaction sequence number (unique across all blocks).
pub type TxNum = u64;

/// Logical tables of the key/value store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Table {
    /// Plain account state keyed by address.
    Account,
    /// Contract storage keyed by address, incarnation and slot.
    Storage,
    /// Contract bytecode keyed by address and incarnation.
    Code,
    /// Last incarnation of a deleted contract keyed by address.
    IncarnationMap,
    /// RLP encoded headers keyed by number and hash.
    Headers,
    /// Header number keyed by header hash.
    HeaderNumbers,
    /// Canonical header hash keyed by number.
    CanonicalHashes,
    /// Total difficulty keyed by number and hash.
    TotalDifficulty,
    /// Consensus epoch transition proofs keyed by number and hash.
    Epochs,
    /// Pending consensus epoch transition proofs keyed by number and hash.
    PendingEpochs,
}

impl Table {
    pub fn name(&self) -> &'static str {
        match self {
            Table::Account => "Account",
            Table::Storage => "Storage",
            Table::Code => "Code",
            Table::IncarnationMap => "IncarnationMap",
            Table::Headers => "Headers",
            Table::HeaderNumbers => "HeaderNumbers",
            Table::CanonicalHashes => "CanonicalHashes",
            Table::TotalDifficulty => "TotalDifficulty",
            Table::Epochs => "Epochs",
            Table::PendingEpochs => "PendingEpochs",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Ordered list of key/value pairs observed or produced by a single task.
///
/// An empty value stands for "absent" in read lists and for "delete" in
/// write lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvList {
    pub keys: Vec<Vec<u8>>,
    pub vals: Vec<Vec<u8>>,
}

impl KvList {
    pub fn push(&mut self, key: Vec<u8>, val: Vec<u8>) {
        self.keys.push(key);
        self.vals.push(val);
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.keys
            .iter()
            .zip(self.vals.iter())
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    /// Sum of all key and value lengths.
    pub fn byte_size(&self) -> usize {
        self.keys.iter().map(Vec::len).sum::<usize>() + self.vals.iter().map(Vec::len).sum::<usize>()
    }
}

/// Per-table lists, iterated in table order.
pub type KvLists = BTreeMap<Table, KvList>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_size_counts_keys_and_values() {
        let mut list = KvList::default();
        list.push(vec![1, 2, 3], vec![4]);
        list.push(vec![5], Vec::new());

        assert_eq!(list.len(), 2);
        assert_eq!(list.byte_size(), 5);
        let pairs: Vec<_> = list.iter().collect();
        assert_eq!(pairs[1], (&[5u8][..], &[][..]));
    }
}
