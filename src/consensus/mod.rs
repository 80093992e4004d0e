//! Consensus engines as seen by the replay workers.
//!
//! Workers never validate blocks. They only run the state-changing hooks an
//! engine attaches to a block: [`Engine::initialize`] before the first
//! transaction and [`Engine::finalize`] after the last one. Proof-of-staked-
//! authority engines additionally classify system transactions, which the
//! workers skip.

pub mod dao;
mod ethash;
mod posa;
pub mod system_contracts;

pub use ethash::Ethash;
pub use posa::{Posa, SLASH_CONTRACT, SYSTEM_REWARD_CONTRACT, VALIDATOR_CONTRACT};

use crate::chain::{ChainConfig, SignedTransaction};
use crate::state::{IntraBlockState, StateError};
use crate::vm::{BlockContext, ExecError, Vm};
use alloy_consensus::Header;
use alloy_primitives::{Address, Bytes, B256, U256};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsensusError {
    #[error("system call to {contract} failed: {source}")]
    SystemCall { contract: Address, source: ExecError },
    #[error("epoch store is read-only")]
    ReadOnly,
    #[error(transparent)]
    State(#[from] StateError),
    #[error("invalid block: {0}")]
    InvalidBlock(String),
}

impl ConsensusError {
    /// Whether the error comes from the state layer rather than the block.
    pub fn is_fatal(&self) -> bool {
        match self {
            ConsensusError::State(_) => true,
            ConsensusError::SystemCall { source, .. } => source.is_fatal(),
            ConsensusError::ReadOnly | ConsensusError::InvalidBlock(_) => false,
        }
    }
}

/// Read access to canonical chain metadata.
pub trait ChainHeaderReader {
    fn config(&self) -> &ChainConfig;

    fn header(&self, hash: B256, number: u64) -> Option<Header>;

    fn header_by_number(&self, number: u64) -> Option<Header>;

    fn header_by_hash(&self, hash: B256) -> Option<Header>;

    /// Total difficulty of the chain up to and including the block.
    fn td(&self, hash: B256, number: u64) -> Option<U256>;
}

/// Storage of epoch transition proofs.
pub trait EpochStore {
    fn epoch(&self, number: u64, hash: B256) -> Result<Option<Vec<u8>>, ConsensusError>;

    fn put_epoch(&self, number: u64, hash: B256, proof: Vec<u8>) -> Result<(), ConsensusError>;

    fn pending_epoch(&self, number: u64, hash: B256) -> Result<Option<Vec<u8>>, ConsensusError>;

    fn put_pending_epoch(&self, number: u64, hash: B256, proof: Vec<u8>) -> Result<(), ConsensusError>;

    fn find_before_or_equal_number(
        &self,
        number: u64,
    ) -> Result<Option<(u64, B256, Vec<u8>)>, ConsensusError>;
}

/// Contract calls on behalf of the protocol, executed against the state of
/// the block being processed.
pub struct SystemCall<'a, 'r> {
    vm: &'a dyn Vm,
    ctx: BlockContext<'a>,
    state: &'a mut IntraBlockState<'r>,
}

impl<'a, 'r> SystemCall<'a, 'r> {
    pub fn new(vm: &'a dyn Vm, ctx: BlockContext<'a>, state: &'a mut IntraBlockState<'r>) -> Self {
        Self { vm, ctx, state }
    }

    pub fn call(&mut self, contract: Address, data: Bytes) -> Result<Bytes, ConsensusError> {
        self.vm
            .system_call(&mut self.ctx, contract, data, self.state)
            .map_err(|source| match source {
                ExecError::State(err) => ConsensusError::State(err),
                source => ConsensusError::SystemCall { contract, source },
            })
    }

    /// State the calls run against, for direct balance changes.
    pub fn state(&mut self) -> &mut IntraBlockState<'r> {
        self.state
    }

    pub fn header(&self) -> &Header {
        self.ctx.header
    }
}

/// Block-level hooks of a consensus engine.
pub trait Engine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Address credited with the block's fees.
    fn author(&self, header: &Header) -> Address {
        header.beneficiary
    }

    /// Runs before the first transaction of `header`'s block.
    #[allow(clippy::too_many_arguments)]
    fn initialize(
        &self,
        config: &ChainConfig,
        chain: &dyn ChainHeaderReader,
        epoch: &dyn EpochStore,
        header: &Header,
        txs: &[SignedTransaction],
        uncles: &[Header],
        syscall: &mut SystemCall<'_, '_>,
    ) -> Result<(), ConsensusError>;

    /// Runs after the last transaction of `header`'s block.
    #[allow(clippy::too_many_arguments)]
    fn finalize(
        &self,
        config: &ChainConfig,
        header: &Header,
        txs: &[SignedTransaction],
        uncles: &[Header],
        epoch: &dyn EpochStore,
        chain: &dyn ChainHeaderReader,
        syscall: &mut SystemCall<'_, '_>,
    ) -> Result<(), ConsensusError>;
}

/// Proof-of-staked-authority capabilities.
pub trait PoSA: Engine {
    fn is_system_transaction(&self, tx: &SignedTransaction, header: &Header) -> Result<bool, ConsensusError>;

    fn is_system_contract(&self, address: &Address) -> bool;
}

/// Engine handle shared by the workers.
///
/// The PoSA capability is resolved once here so workers only check an
/// `Option`.
#[derive(Clone)]
pub struct Consensus {
    engine: Arc<dyn Engine>,
    posa: Option<Arc<dyn PoSA>>,
}

impl Consensus {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self { engine, posa: None }
    }

    pub fn with_posa<E: PoSA + 'static>(engine: Arc<E>) -> Self {
        Self {
            engine: engine.clone(),
            posa: Some(engine),
        }
    }

    /// Engine selected by the chain configuration.
    pub fn from_config(config: &ChainConfig) -> Self {
        if config.is_posa() {
            Self::with_posa(Arc::new(Posa::new()))
        } else {
            Self::new(Arc::new(Ethash::new()))
        }
    }

    pub fn engine(&self) -> &dyn Engine {
        self.engine.as_ref()
    }

    pub fn posa(&self) -> Option<&dyn PoSA> {
        self.posa.as_deref()
    }

    pub fn is_posa(&self) -> bool {
        self.posa.is_some()
    }
}

impl std::fmt::Debug for Consensus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consensus")
            .field("engine", &self.engine.name())
            .field("posa", &self.is_posa())
            .finish()
    }
}
