//! Chain metadata access for consensus callbacks, bound to a worker's chain
//! transaction.

use crate::chain::{rawdb, ChainConfig};
use crate::consensus::{ChainHeaderReader, ConsensusError, EpochStore};
use crate::state::StateError;
use alloy_consensus::Header;
use alloy_primitives::{B256, U256};
use std::sync::Arc;
use tracing::error;
use versioned_state::RoTx;

fn logged<T>(what: &str, result: Result<Option<T>, StateError>) -> Option<T> {
    result.unwrap_or_else(|err| {
        error!(%err, "reading {what} failed");
        None
    })
}

/// Header and total difficulty lookups. Storage errors are logged and read
/// as "not found".
pub struct ChainReader {
    config: Arc<ChainConfig>,
    tx: Arc<dyn RoTx>,
}

impl ChainReader {
    pub fn new(config: Arc<ChainConfig>, tx: Arc<dyn RoTx>) -> Self {
        Self { config, tx }
    }
}

impl ChainHeaderReader for ChainReader {
    fn config(&self) -> &ChainConfig {
        &self.config
    }

    fn header(&self, hash: B256, number: u64) -> Option<Header> {
        logged("header", rawdb::read_header(self.tx.as_ref(), hash, number))
    }

    fn header_by_number(&self, number: u64) -> Option<Header> {
        logged("header", rawdb::read_header_by_number(self.tx.as_ref(), number))
    }

    fn header_by_hash(&self, hash: B256) -> Option<Header> {
        logged("header", rawdb::read_header_by_hash(self.tx.as_ref(), hash))
    }

    fn td(&self, hash: B256, number: u64) -> Option<U256> {
        logged("total difficulty", rawdb::read_td(self.tx.as_ref(), hash, number))
    }
}

/// Read-only view of the epoch transition proofs.
pub struct EpochReader {
    tx: Arc<dyn RoTx>,
}

impl EpochReader {
    pub fn new(tx: Arc<dyn RoTx>) -> Self {
        Self { tx }
    }
}

impl EpochStore for EpochReader {
    fn epoch(&self, number: u64, hash: B256) -> Result<Option<Vec<u8>>, ConsensusError> {
        Ok(rawdb::read_epoch(self.tx.as_ref(), number, hash)?)
    }

    fn put_epoch(&self, _number: u64, _hash: B256, _proof: Vec<u8>) -> Result<(), ConsensusError> {
        Err(ConsensusError::ReadOnly)
    }

    fn pending_epoch(&self, number: u64, hash: B256) -> Result<Option<Vec<u8>>, ConsensusError> {
        Ok(rawdb::read_pending_epoch(self.tx.as_ref(), number, hash)?)
    }

    fn put_pending_epoch(&self, _number: u64, _hash: B256, _proof: Vec<u8>) -> Result<(), ConsensusError> {
        Err(ConsensusError::ReadOnly)
    }

    fn find_before_or_equal_number(
        &self,
        number: u64,
    ) -> Result<Option<(u64, B256, Vec<u8>)>, ConsensusError> {
        Ok(rawdb::find_epoch_before_or_equal_number(self.tx.as_ref(), number)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use versioned_state::{MemDb, RoDb, Table};

    #[test]
    fn test_chain_reader_swallows_errors() {
        let db = MemDb::new();
        let hash = rawdb::write_canonical_header(
            &db,
            &Header {
                number: 2,
                ..Default::default()
            },
            U256::from(9),
        );
        db.put(Table::CanonicalHashes, rawdb::number_key(3), vec![0xde, 0xad]);
        let reader = ChainReader::new(Arc::new(ChainConfig::all_forks(1)), db.begin_ro().unwrap());

        assert_eq!(reader.header_by_number(2).map(|h| h.number), Some(2));
        assert_eq!(reader.td(hash, 2), Some(U256::from(9)));
        // Malformed canonical hash.
        assert_eq!(reader.header_by_number(3), None);
        assert_eq!(reader.config().chain_id, 1);
    }

    #[test]
    fn test_epoch_reader_is_read_only() {
        let db = MemDb::new();
        rawdb::write_epoch(&db, 4, B256::repeat_byte(4), vec![1, 2]);
        let reader = EpochReader::new(db.begin_ro().unwrap());

        assert_eq!(reader.epoch(4, B256::repeat_byte(4)).unwrap(), Some(vec![1, 2]));
        assert_eq!(
            reader.find_before_or_equal_number(100).unwrap(),
            Some((4, B256::repeat_byte(4), vec![1, 2]))
        );
        assert_eq!(reader.put_epoch(5, B256::ZERO, vec![]), Err(ConsensusError::ReadOnly));
        assert_eq!(
            reader.put_pending_epoch(5, B256::ZERO, vec![]),
            Err(ConsensusError::ReadOnly)
        );
    }
}
