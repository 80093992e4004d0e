//! Contract the replay workers expect from an EVM.
//!
//! The worker only needs two operations: applying a transaction message and
//! calling a contract on behalf of the protocol. [`RevmVm`] provides both on
//! top of revm, with [`IntraBlockState`] as the backing database.

mod evm;
pub mod tracer;

pub use evm::RevmVm;
pub use tracer::{CallTracer, Tracer};

use crate::chain::{Message, Rules};
use crate::state::{IntraBlockState, StateError};
use alloy_consensus::Header;
use alloy_primitives::{address, Address, Bytes, B256};
use thiserror::Error;

/// Sender of protocol-level contract calls.
pub const SYSTEM_ADDRESS: Address = address!("fffffffffffffffffffffffffffffffffffffffe");

/// Errors raised while executing a message.
///
/// Only [`ExecError::State`] is fatal; everything else is a divergence of the
/// transaction itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    #[error("execution reverted")]
    Reverted { output: Bytes },
    #[error("execution halted: {reason}")]
    Halted { reason: String },
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("gas limit reached")]
    GasLimitReached,
    #[error("unsupported execution option: {0}")]
    Unsupported(&'static str),
    #[error(transparent)]
    State(#[from] StateError),
}

impl ExecError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ExecError::State(_))
    }
}

/// Gas available to the transactions of a block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GasPool(u64);

impl GasPool {
    pub fn new(gas: u64) -> Self {
        Self(gas)
    }

    pub fn gas(&self) -> u64 {
        self.0
    }

    pub fn add_gas(&mut self, amount: u64) {
        self.0 = self.0.saturating_add(amount);
    }

    pub fn sub_gas(&mut self, amount: u64) -> Result<(), ExecError> {
        self.0 = self.0.checked_sub(amount).ok_or(ExecError::GasLimitReached)?;
        Ok(())
    }
}

/// Options of a single message application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOptions {
    pub refunds: bool,
    pub gas_bailout: bool,
}

/// Result of a successful message application.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub gas_used: u64,
    pub output: Bytes,
}

pub type GetHashFn<'a> = Box<dyn FnMut(u64) -> Result<B256, StateError> + 'a>;

/// Block-level inputs of the EVM.
pub struct BlockContext<'a> {
    pub header: &'a Header,
    /// Receiver of transaction fees.
    pub author: Address,
    pub rules: Rules,
    /// Hash of a recent ancestor, for `BLOCKHASH`.
    pub get_hash: GetHashFn<'a>,
    /// Whether the contract with the given code hash has an alternative
    /// (pre-translated) bytecode to run instead.
    pub has_alternate_bytecode: fn(B256) -> bool,
}

impl<'a> BlockContext<'a> {
    pub fn new(header: &'a Header, author: Address, rules: Rules, get_hash: GetHashFn<'a>) -> Self {
        Self {
            header,
            author,
            rules,
            get_hash,
            has_alternate_bytecode: no_alternate_bytecode,
        }
    }
}

pub fn no_alternate_bytecode(_code_hash: B256) -> bool {
    false
}

/// Builds the `BLOCKHASH` lookup for a block.
///
/// Ancestors are resolved by walking parent hashes from `header`; hashes
/// found on the way are cached. Unknown ancestors hash to zero.
pub fn get_hash_fn<'a, F>(header: &Header, mut get_header: F) -> GetHashFn<'a>
where
    F: FnMut(B256, u64) -> Result<Option<Header>, StateError> + 'a,
{
    let number = header.number;
    let mut cache = vec![header.parent_hash];
    Box::new(move |n: u64| {
        if n >= number {
            return Ok(B256::ZERO);
        }
        let idx = (number - n - 1) as usize;
        if let Some(hash) = cache.get(idx) {
            return Ok(*hash);
        }
        let mut last_hash = cache[cache.len() - 1];
        let mut last_number = number - cache.len() as u64;
        while let Some(ancestor) = get_header(last_hash, last_number)? {
            cache.push(ancestor.parent_hash);
            last_hash = ancestor.parent_hash;
            if ancestor.number == 0 {
                break;
            }
            last_number = ancestor.number - 1;
            if n == last_number {
                return Ok(last_hash);
            }
        }
        Ok(B256::ZERO)
    })
}

/// An EVM as seen by the replay workers.
pub trait Vm: Send + Sync {
    /// Executes `msg` against `ibs`. Reverts and halts are reported as
    /// errors and leave `ibs` untouched.
    fn apply_message(
        &self,
        ctx: &mut BlockContext<'_>,
        msg: &Message,
        ibs: &mut IntraBlockState<'_>,
        gas_pool: &mut GasPool,
        tracer: &mut dyn Tracer,
        opts: ApplyOptions,
    ) -> Result<ExecutionOutcome, ExecError>;

    /// Calls `contract` from [`SYSTEM_ADDRESS`] without gas payment.
    fn system_call(
        &self,
        ctx: &mut BlockContext<'_>,
        contract: Address,
        data: Bytes,
        ibs: &mut IntraBlockState<'_>,
    ) -> Result<Bytes, ExecError>;
}
