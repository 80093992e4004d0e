//! Encoding of block metadata in the key/value store.
//!
//! | table              | key              | value            |
//! |--------------------|------------------|------------------|
//! | `Headers`          | number ++ hash   | RLP header       |
//! | `HeaderNumbers`    | hash             | number           |
//! | `CanonicalHashes`  | number           | hash             |
//! | `TotalDifficulty`  | number ++ hash   | 32 byte BE value |
//! | `Epochs`           | number ++ hash   | transition proof |
//! | `PendingEpochs`    | number ++ hash   | transition proof |
//!
//! Numbers are 8 byte big endian, so keys sort by block number.

use crate::state::StateError;
use alloy_consensus::Header;
use alloy_primitives::{B256, U256};
use alloy_rlp::Decodable;
use versioned_state::{MemDb, RoTx, Table};

pub fn number_key(number: u64) -> Vec<u8> {
    number.to_be_bytes().to_vec()
}

pub fn header_key(number: u64, hash: B256) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + 32);
    key.extend_from_slice(&number.to_be_bytes());
    key.extend_from_slice(hash.as_slice());
    key
}

fn malformed(table: Table, reason: impl ToString) -> StateError {
    StateError::Decode {
        table,
        reason: reason.to_string(),
    }
}

fn decode_number(table: Table, bytes: &[u8]) -> Result<u64, StateError> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| malformed(table, format!("{} byte block number", bytes.len())))?;
    Ok(u64::from_be_bytes(raw))
}

fn decode_hash(table: Table, bytes: &[u8]) -> Result<B256, StateError> {
    B256::try_from(bytes).map_err(|_| malformed(table, format!("{} byte hash", bytes.len())))
}

pub fn read_header(tx: &dyn RoTx, hash: B256, number: u64) -> Result<Option<Header>, StateError> {
    let Some(bytes) = tx.get(Table::Headers, &header_key(number, hash))? else {
        return Ok(None);
    };
    let header = Header::decode(&mut bytes.as_slice()).map_err(|err| malformed(Table::Headers, err))?;
    Ok(Some(header))
}

pub fn read_header_number(tx: &dyn RoTx, hash: B256) -> Result<Option<u64>, StateError> {
    tx.get(Table::HeaderNumbers, hash.as_slice())?
        .map(|bytes| decode_number(Table::HeaderNumbers, &bytes))
        .transpose()
}

pub fn read_canonical_hash(tx: &dyn RoTx, number: u64) -> Result<Option<B256>, StateError> {
    tx.get(Table::CanonicalHashes, &number_key(number))?
        .map(|bytes| decode_hash(Table::CanonicalHashes, &bytes))
        .transpose()
}

pub fn read_header_by_number(tx: &dyn RoTx, number: u64) -> Result<Option<Header>, StateError> {
    match read_canonical_hash(tx, number)? {
        Some(hash) => read_header(tx, hash, number),
        None => Ok(None),
    }
}

pub fn read_header_by_hash(tx: &dyn RoTx, hash: B256) -> Result<Option<Header>, StateError> {
    match read_header_number(tx, hash)? {
        Some(number) => read_header(tx, hash, number),
        None => Ok(None),
    }
}

pub fn read_td(tx: &dyn RoTx, hash: B256, number: u64) -> Result<Option<U256>, StateError> {
    let Some(bytes) = tx.get(Table::TotalDifficulty, &header_key(number, hash))? else {
        return Ok(None);
    };
    U256::try_from_be_slice(&bytes)
        .map(Some)
        .ok_or_else(|| malformed(Table::TotalDifficulty, format!("{} byte difficulty", bytes.len())))
}

pub fn read_epoch(tx: &dyn RoTx, number: u64, hash: B256) -> Result<Option<Vec<u8>>, StateError> {
    Ok(tx.get(Table::Epochs, &header_key(number, hash))?)
}

pub fn read_pending_epoch(tx: &dyn RoTx, number: u64, hash: B256) -> Result<Option<Vec<u8>>, StateError> {
    Ok(tx.get(Table::PendingEpochs, &header_key(number, hash))?)
}

/// Latest epoch transition at or below `number`.
pub fn find_epoch_before_or_equal_number(
    tx: &dyn RoTx,
    number: u64,
) -> Result<Option<(u64, B256, Vec<u8>)>, StateError> {
    let mut seek = number_key(number);
    seek.extend_from_slice(&[0xff; 32]);
    let Some((key, proof)) = tx.last_le(Table::Epochs, &seek)? else {
        return Ok(None);
    };
    if key.len() != 40 {
        return Err(malformed(Table::Epochs, format!("{} byte key", key.len())));
    }
    let found = decode_number(Table::Epochs, &key[..8])?;
    let hash = decode_hash(Table::Epochs, &key[8..])?;
    Ok(Some((found, hash, proof)))
}

/// Stores a header and its hash-to-number index.
pub fn write_header(db: &MemDb, header: &Header) -> B256 {
    let hash = header.hash_slow();
    db.put(
        Table::Headers,
        header_key(header.number, hash),
        alloy_rlp::encode(header),
    );
    db.put(Table::HeaderNumbers, hash.to_vec(), number_key(header.number));
    hash
}

pub fn write_canonical_hash(db: &MemDb, number: u64, hash: B256) {
    db.put(Table::CanonicalHashes, number_key(number), hash.to_vec());
}

pub fn write_td(db: &MemDb, hash: B256, number: u64, td: U256) {
    db.put(
        Table::TotalDifficulty,
        header_key(number, hash),
        td.to_be_bytes::<32>().to_vec(),
    );
}

pub fn write_epoch(db: &MemDb, number: u64, hash: B256, proof: Vec<u8>) {
    db.put(Table::Epochs, header_key(number, hash), proof);
}

pub fn write_pending_epoch(db: &MemDb, number: u64, hash: B256, proof: Vec<u8>) {
    db.put(Table::PendingEpochs, header_key(number, hash), proof);
}

/// Stores `header` as the canonical header at its height.
pub fn write_canonical_header(db: &MemDb, header: &Header, td: U256) -> B256 {
    let hash = write_header(db, header);
    write_canonical_hash(db, header.number, hash);
    write_td(db, hash, header.number, td);
    hash
}
