//! Replay tasks and their classification.

use crate::chain::{Block, ChainConfig, Rules, SignedTransaction};
use crate::consensus::ConsensusError;
use crate::state::PriorValues;
use crate::vm::ExecError;
use alloy_consensus::Header;
use alloy_primitives::{Address, Log, B256, U256};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;
use versioned_state::{KvLists, Task, TxNum};

/// Bytes accounted per deferred balance increase: address plus value.
const BALANCE_INCREASE_SIZE: u64 = 20 + 32;

/// Position of a task inside its block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Before the first transaction.
    Init,
    /// The transaction at this index.
    Tx(usize),
    /// After the last transaction.
    Final,
}

/// What a task executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Builds the genesis state image.
    Genesis,
    /// Applies the DAO hard-fork state change.
    HardFork,
    /// Runs the engine's block initialisation, after PoSA contract upgrades.
    BlockInit,
    /// Runs the engine's block finalisation and reward crediting.
    BlockFinal,
    /// Executes the block transaction at `index`.
    Transaction { index: usize },
}

impl TaskKind {
    /// Genesis wins over the DAO fork at block 0.
    pub fn classify(block_num: u64, slot: Slot, config: &ChainConfig) -> Self {
        match slot {
            Slot::Init if block_num == 0 => TaskKind::Genesis,
            Slot::Init if config.is_dao_fork_block(block_num) => TaskKind::HardFork,
            Slot::Init => TaskKind::BlockInit,
            Slot::Final => TaskKind::BlockFinal,
            Slot::Tx(index) => TaskKind::Transaction { index },
        }
    }
}

/// Non-fatal failure of a task. The task produced no effects.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The transaction was rejected, reverted or halted.
    #[error(transparent)]
    Execution(#[from] ExecError),
    /// An engine hook failed.
    #[error(transparent)]
    Consensus(#[from] ConsensusError),
}

/// Unit of replay work: one block-level step or one transaction.
#[derive(Debug, Clone)]
pub struct TxTask {
    /// Global sequence number; also the scheduling priority.
    pub tx_num: TxNum,
    pub block_num: u64,
    pub kind: TaskKind,
    /// The whole block, shared by every task of it.
    pub block: Arc<Block>,
    pub block_hash: B256,
    /// Protocol rules active at `block_num`.
    pub rules: Rules,

    /// Set when execution diverged; the effect fields are then empty.
    pub error: Option<TaskError>,
    /// Logs emitted by a transaction task.
    pub logs: Vec<Log>,
    /// Callers seen by the call tracer.
    pub trace_froms: BTreeSet<Address>,
    /// Callees seen by the call tracer, plus rewarded coinbases of final tasks.
    pub trace_tos: BTreeSet<Address>,
    /// Every key read and the value observed, per table.
    pub read_lists: KvLists,
    /// Every key written and its new value, per table. Empty values are deletions.
    pub write_lists: KvLists,
    /// Values the written keys held before this task.
    pub prevs: PriorValues,
    /// Credits to accounts the task never read, applied on top of the
    /// committed balance.
    pub balance_increase_set: BTreeMap<Address, U256>,
    /// Memory estimate of the effect sets, set after a successful execution.
    pub results_size: Option<u64>,
    /// First sequence number not yet applied when execution started.
    pub frontier: TxNum,
    /// System transactions are not executed.
    pub skipped: bool,
}

impl TxTask {
    pub fn new(tx_num: TxNum, block: Arc<Block>, slot: Slot, config: &ChainConfig) -> Self {
        let block_num = block.number();
        Self {
            tx_num,
            block_num,
            kind: TaskKind::classify(block_num, slot, config),
            block_hash: block.hash(),
            rules: config.rules(block_num),
            block,
            error: None,
            logs: Vec::new(),
            trace_froms: BTreeSet::new(),
            trace_tos: BTreeSet::new(),
            read_lists: KvLists::new(),
            write_lists: KvLists::new(),
            prevs: PriorValues::default(),
            balance_increase_set: BTreeMap::new(),
            results_size: None,
            frontier: 0,
            skipped: false,
        }
    }

    /// Header of the task's block.
    pub fn header(&self) -> &Header {
        &self.block.header
    }

    /// The transaction of a [`TaskKind::Transaction`] task.
    pub fn transaction(&self) -> Option<&SignedTransaction> {
        match self.kind {
            TaskKind::Transaction { index } => self.block.transactions.get(index),
            _ => None,
        }
    }

    /// Bytes held by the effect lists and balance increases.
    pub fn estimate_results_size(&self) -> u64 {
        let lists: usize = self
            .read_lists
            .values()
            .chain(self.write_lists.values())
            .map(|list| list.byte_size())
            .sum();
        BALANCE_INCREASE_SIZE * self.balance_increase_set.len() as u64 + lists as u64
    }
}

impl Task for TxTask {
    fn sequence(&self) -> TxNum {
        self.tx_num
    }

    fn reset(&mut self) {
        self.error = None;
        self.logs.clear();
        self.trace_froms.clear();
        self.trace_tos.clear();
        self.read_lists.clear();
        self.write_lists.clear();
        self.prevs = PriorValues::default();
        self.balance_increase_set.clear();
        self.results_size = None;
        self.frontier = 0;
        self.skipped = false;
    }
}
