//! Replay worker: executes one task at a time against the versioned state.

use super::readers::{ChainReader, EpochReader};
use super::task::{TaskError, TaskKind, TxTask};
use crate::chain::{rawdb, ChainConfig, Genesis, GenesisError, Rules, Signer, SignerError};
use crate::consensus::{dao, system_contracts, Consensus, ConsensusError, SystemCall};
use crate::state::{IntraBlockState, StateError, StateReader22, StateWriter22};
use crate::vm::{get_hash_fn, ApplyOptions, BlockContext, CallTracer, ExecError, GasPool, Vm};
use alloy_consensus::Header;
use alloy_primitives::{Address, B256};
use crossbeam::channel::Sender;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, trace};
use versioned_state::{KvError, RoDb, RoTx, Scheduler, TxNum, VersionedState};

/// Unrecoverable worker failure. The replay cannot make progress past it.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("cannot open state transaction: {0}")]
    OpenTx(#[source] KvError),
    #[error("cannot open chain transaction: {0}")]
    OpenChainTx(#[source] KvError),
    #[error(transparent)]
    Genesis(#[from] GenesisError),
    #[error("task {tx_num}: cannot resolve sender: {source}")]
    Signer { tx_num: TxNum, source: SignerError },
    #[error("task {tx_num}: state access failed: {source}")]
    State { tx_num: TxNum, source: StateError },
    #[error("task {tx_num}: execution failed: {source}")]
    Execution { tx_num: TxNum, source: ExecError },
    #[error("task {tx_num}: consensus callback failed: {source}")]
    Consensus { tx_num: TxNum, source: ConsensusError },
    #[error("task {tx_num} has no transaction")]
    MissingTransaction { tx_num: TxNum },
    #[error("result queue closed")]
    ResultQueueClosed,
}

/// Everything the workers of one pool share.
#[derive(Clone)]
pub struct PoolContext {
    /// Serialises task execution with the consumer applying results.
    pub lock: Arc<Mutex<()>>,
    /// Committed plain state.
    pub db: Arc<dyn RoDb>,
    /// Headers, canonical hashes and epochs.
    pub chain_db: Arc<dyn RoDb>,
    /// Applied but not yet flushed effects.
    pub rs: Arc<VersionedState>,
    pub scheduler: Arc<Scheduler<TxTask>>,
    pub config: Arc<ChainConfig>,
    pub genesis: Arc<Genesis>,
    pub consensus: Consensus,
    pub vm: Arc<dyn Vm>,
}

/// Outcome of the kind-specific part of a task. `Err` is fatal, `Ok(Some)`
/// is recorded on the task.
type StepResult = Result<Option<TaskError>, WorkerError>;

fn consensus_step(tx_num: TxNum, result: Result<(), ConsensusError>) -> StepResult {
    match result {
        Ok(()) => Ok(None),
        Err(source) if source.is_fatal() => Err(WorkerError::Consensus { tx_num, source }),
        Err(err) => Ok(Some(err.into())),
    }
}

/// Rolls back `current` unless it is the transaction being adopted.
fn release(current: Option<Arc<dyn RoTx>>, next: &Option<Arc<dyn RoTx>>) {
    if let Some(current) = current {
        let adopted = next.as_ref().is_some_and(|next| Arc::ptr_eq(&current, next));
        if !adopted {
            current.rollback();
        }
    }
}

pub struct Worker {
    id: usize,
    ctx: PoolContext,
    tx: Option<Arc<dyn RoTx>>,
    chain_tx: Option<Arc<dyn RoTx>>,
    state_reader: StateReader22,
    state_writer: StateWriter22,
    chain: Option<ChainReader>,
    epoch: Option<EpochReader>,
    results: Sender<Box<TxTask>>,
}

impl Worker {
    pub fn new(id: usize, ctx: PoolContext, results: Sender<Box<TxTask>>) -> Self {
        Self {
            id,
            state_reader: StateReader22::new(ctx.rs.clone()),
            state_writer: StateWriter22::new(ctx.rs.clone()),
            ctx,
            tx: None,
            chain_tx: None,
            chain: None,
            epoch: None,
            results,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Whether the worker holds open transactions.
    pub fn is_idle(&self) -> bool {
        self.tx.is_none() && self.chain_tx.is_none()
    }

    /// Pulls and executes tasks until the scheduler is exhausted.
    pub fn run(&mut self) -> Result<(), WorkerError> {
        let scheduler = self.ctx.scheduler.clone();
        while let Some(mut task) = scheduler.schedule() {
            if let Err(err) = self.run_task(&mut task) {
                error!(worker = self.id, tx_num = task.tx_num, %err, "worker stopped");
                return Err(err);
            }
            self.results
                .send(task)
                .map_err(|_| WorkerError::ResultQueueClosed)?;
        }
        debug!(worker = self.id, "scheduler exhausted");
        Ok(())
    }

    /// Replaces the worker's transactions. Current ones are rolled back;
    /// `(None, None)` leaves the worker idle until the next task opens fresh
    /// ones.
    pub fn reset_tx(&mut self, tx: Option<Arc<dyn RoTx>>, chain_tx: Option<Arc<dyn RoTx>>) {
        release(self.tx.take(), &tx);
        release(self.chain_tx.take(), &chain_tx);
        self.tx = tx;
        self.chain_tx = chain_tx;
        self.bind();
    }

    fn bind(&mut self) {
        self.state_reader.set_tx(self.tx.clone());
        self.state_writer.set_tx(self.tx.clone());
        self.chain = self
            .chain_tx
            .clone()
            .map(|tx| ChainReader::new(self.ctx.config.clone(), tx));
        self.epoch = self.chain_tx.clone().map(EpochReader::new);
    }

    fn ensure_open(&mut self) -> Result<(), WorkerError> {
        if self.tx.is_some() && self.chain_tx.is_some() {
            return Ok(());
        }
        if self.tx.is_none() {
            self.tx = Some(self.ctx.db.begin_ro().map_err(WorkerError::OpenTx)?);
        }
        if self.chain_tx.is_none() {
            self.chain_tx = Some(self.ctx.chain_db.begin_ro().map_err(WorkerError::OpenChainTx)?);
        }
        self.bind();
        Ok(())
    }

    /// Executes `task` and fills its result fields.
    ///
    /// Divergences of the task itself end up in `task.error`; only failures
    /// of the replay machinery are returned.
    pub fn run_task(&mut self, task: &mut TxTask) -> Result<(), WorkerError> {
        let lock = self.ctx.lock.clone();
        let _guard = lock.lock();
        self.ensure_open()?;

        let tx_num = task.tx_num;
        task.error = None;
        task.frontier = self.ctx.rs.frontier();
        self.state_reader.set_tx_num(tx_num);
        self.state_writer.set_tx_num(tx_num);
        self.state_reader.reset_read_set();
        self.state_writer.reset_write_set();

        let (mut ibs, rules): (IntraBlockState<'_>, Rules) = match task.kind {
            // Empty rules keep empty genesis accounts.
            TaskKind::Genesis => (self.ctx.genesis.to_block()?.1, Rules::default()),
            _ => (IntraBlockState::new(&self.state_reader), task.rules),
        };

        trace!(worker = self.id, tx_num, block = task.block_num, kind = ?task.kind, "running task");
        let error = match task.kind {
            TaskKind::Genesis => None,
            TaskKind::HardFork => {
                debug!(block = task.block_num, "applying DAO hard fork");
                dao::apply_dao_hard_fork(&mut ibs, &self.ctx.config.dao_drain_list)
                    .map_err(|source| WorkerError::State { tx_num, source })?;
                ibs.soft_finalise();
                None
            }
            TaskKind::BlockInit => self.initialize_block(task, &mut ibs)?,
            TaskKind::BlockFinal if task.block_num == 0 => None,
            TaskKind::BlockFinal => self.finalize_block(task, &mut ibs)?,
            TaskKind::Transaction { .. } => self.execute_transaction(task, &mut ibs)?,
        };
        task.error = error;

        if task.error.is_some() || task.skipped {
            return Ok(());
        }
        task.balance_increase_set = ibs.balance_increase_set();
        ibs.make_write_set(&rules, &mut self.state_writer)
            .map_err(|source| WorkerError::State { tx_num, source })?;
        drop(ibs);

        task.read_lists = self.state_reader.take_read_set();
        task.write_lists = self.state_writer.take_write_set();
        task.prevs = self.state_writer.take_prevs();
        task.results_size = Some(task.estimate_results_size());
        Ok(())
    }

    fn readers(&self) -> Result<(&ChainReader, &EpochReader), WorkerError> {
        match (&self.chain, &self.epoch) {
            (Some(chain), Some(epoch)) => Ok((chain, epoch)),
            _ => Err(WorkerError::OpenChainTx(KvError::TxClosed)),
        }
    }

    fn block_context<'a>(&self, header: &'a Header, author: Address, rules: Rules) -> BlockContext<'a> {
        let chain_tx = self.chain_tx.clone();
        let get_header = move |hash: B256, number: u64| match &chain_tx {
            Some(tx) => rawdb::read_header(tx.as_ref(), hash, number),
            None => Err(StateError::NoTransaction),
        };
        BlockContext::new(header, author, rules, get_hash_fn(header, get_header))
    }

    fn initialize_block(&self, task: &TxTask, ibs: &mut IntraBlockState<'_>) -> StepResult {
        let config = self.ctx.config.as_ref();
        if self.ctx.consensus.is_posa() {
            system_contracts::upgrade_build_in_system_contract(config, task.block_num, ibs).map_err(
                |source| WorkerError::State {
                    tx_num: task.tx_num,
                    source,
                },
            )?;
        }

        let (chain, epoch) = self.readers()?;
        let engine = self.ctx.consensus.engine();
        let header = task.header();
        let ctx = self.block_context(header, engine.author(header), task.rules);
        let mut syscall = SystemCall::new(self.ctx.vm.as_ref(), ctx, ibs);
        let result = engine.initialize(
            config,
            chain,
            epoch,
            header,
            &task.block.transactions,
            &task.block.uncles,
            &mut syscall,
        );
        consensus_step(task.tx_num, result)
    }

    fn finalize_block(&self, task: &mut TxTask, ibs: &mut IntraBlockState<'_>) -> StepResult {
        let (chain, epoch) = self.readers()?;
        let engine = self.ctx.consensus.engine();
        let block = task.block.clone();
        let header = &block.header;
        let ctx = self.block_context(header, engine.author(header), task.rules);
        let mut syscall = SystemCall::new(self.ctx.vm.as_ref(), ctx, ibs);
        let result = engine.finalize(
            &self.ctx.config,
            header,
            &block.transactions,
            &block.uncles,
            epoch,
            chain,
            &mut syscall,
        );
        let step = consensus_step(task.tx_num, result)?;
        if step.is_none() {
            task.trace_tos.insert(block.coinbase());
            task.trace_tos
                .extend(block.uncles.iter().map(|uncle| uncle.beneficiary));
        }
        Ok(step)
    }

    fn execute_transaction(&self, task: &mut TxTask, ibs: &mut IntraBlockState<'_>) -> StepResult {
        let tx_num = task.tx_num;
        let block = task.block.clone();
        let header = &block.header;
        let txn = task
            .transaction()
            .cloned()
            .ok_or(WorkerError::MissingTransaction { tx_num })?;

        if let Some(posa) = self.ctx.consensus.posa() {
            let system_tx = posa
                .is_system_transaction(&txn, header)
                .map_err(|source| WorkerError::Consensus { tx_num, source })?;
            if system_tx {
                trace!(tx_num, "skipping system transaction");
                task.skipped = true;
                return Ok(None);
            }
        }

        let index = match task.kind {
            TaskKind::Transaction { index } => index,
            _ => 0,
        };
        let mut gas_pool = GasPool::new(txn.gas_limit);
        let mut tracer = CallTracer::new();
        ibs.prepare(txn.hash(), task.block_hash, index);

        let engine = self.ctx.consensus.engine();
        let mut ctx = self.block_context(header, engine.author(header), task.rules);
        let signer = Signer::new(&self.ctx.config, task.block_num);
        let msg = txn
            .as_message(&signer, header.base_fee_per_gas)
            .map_err(|source| WorkerError::Signer { tx_num, source })?;

        let opts = ApplyOptions {
            refunds: true,
            gas_bailout: false,
        };
        match self
            .ctx
            .vm
            .apply_message(&mut ctx, &msg, ibs, &mut gas_pool, &mut tracer, opts)
        {
            Ok(_) => {
                ibs.soft_finalise();
                task.logs = ibs.current_logs();
                let (froms, tos) = tracer.into_sets();
                task.trace_froms = froms;
                task.trace_tos = tos;
                Ok(None)
            }
            Err(source) if source.is_fatal() => Err(WorkerError::Execution { tx_num, source }),
            Err(err) => {
                debug!(
                    tx_num,
                    tx_index = ibs.tx_index(),
                    block_hash = %ibs.block_hash(),
                    tx_hash = %ibs.tx_hash(),
                    %err,
                    "transaction failed"
                );
                Ok(Some(err.into()))
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        release(self.tx.take(), &None);
        release(self.chain_tx.take(), &None);
    }
}
