//! revm-backed [`Vm`].

use super::{
    ApplyOptions, BlockContext, ExecError, ExecutionOutcome, GasPool, Tracer, Vm, SYSTEM_ADDRESS,
};
use crate::chain::{Message, Rules};
use crate::state::{IntraBlockState, StateError};
use alloy_primitives::{Address, Bytes, TxKind, B256, U256};
use revm::{
    bytecode::Bytecode,
    context::{
        result::{EVMError, ExecutionResult},
        BlockEnv, TxEnv,
    },
    context_interface::ContextTr,
    handler::MainnetContext,
    interpreter::{CallInputs, CallOutcome, CreateInputs, CreateOutcome},
    primitives::{hardfork::SpecId, KECCAK_EMPTY},
    state::{AccountInfo, EvmState},
    Context, Database, InspectEvm, Inspector, MainBuilder,
};
use std::collections::HashMap;

/// Gas given to protocol-level contract calls.
const SYSTEM_CALL_GAS: u64 = 30_000_000;

/// Exposes an [`IntraBlockState`] to revm. Every account revm loads goes
/// through the intra-block state, so its reads are tracked.
struct StateDb<'a, 'r> {
    ibs: &'a mut IntraBlockState<'r>,
    get_hash: &'a mut dyn FnMut(u64) -> Result<B256, StateError>,
    codes: HashMap<B256, Bytecode>,
}

impl<'a, 'r> StateDb<'a, 'r> {
    fn new(
        ibs: &'a mut IntraBlockState<'r>,
        get_hash: &'a mut dyn FnMut(u64) -> Result<B256, StateError>,
    ) -> Self {
        Self {
            ibs,
            get_hash,
            codes: HashMap::new(),
        }
    }
}

impl Database for StateDb<'_, '_> {
    type Error = StateError;

    fn basic(&mut self, address: Address) -> Result<Option<AccountInfo>, Self::Error> {
        if !self.ibs.exist(address)? {
            return Ok(None);
        }
        let code_hash = self.ibs.get_code_hash(address)?;
        let code = self.ibs.get_code(address)?.map(Bytecode::new_raw);
        if let Some(code) = &code {
            self.codes.insert(code_hash, code.clone());
        }
        Ok(Some(AccountInfo {
            balance: self.ibs.get_balance(address)?,
            nonce: self.ibs.get_nonce(address)?,
            code_hash,
            code,
        }))
    }

    fn code_by_hash(&mut self, code_hash: B256) -> Result<Bytecode, Self::Error> {
        Ok(self.codes.get(&code_hash).cloned().unwrap_or_default())
    }

    fn storage(&mut self, address: Address, index: U256) -> Result<U256, Self::Error> {
        self.ibs.get_state(address, &B256::from(index))
    }

    fn block_hash(&mut self, number: u64) -> Result<B256, Self::Error> {
        (self.get_hash)(number)
    }
}

/// Forwards the nested calls and creations of an execution to a [`Tracer`].
///
/// The outermost frame is skipped, it is reported through
/// [`Tracer::capture_start`] before execution.
struct TraceInspector<'t> {
    tracer: Option<&'t mut dyn Tracer>,
    depth: usize,
}

impl<'t> TraceInspector<'t> {
    fn new(tracer: Option<&'t mut dyn Tracer>) -> Self {
        Self { tracer, depth: 0 }
    }
}

impl<CTX: ContextTr> Inspector<CTX> for TraceInspector<'_> {
    fn call(&mut self, context: &mut CTX, inputs: &mut CallInputs) -> Option<CallOutcome> {
        if self.depth > 0 {
            if let Some(tracer) = self.tracer.as_mut() {
                let input = inputs.input.bytes(&*context);
                // Delegated calls report the account whose code runs.
                tracer.capture_enter(
                    inputs.caller,
                    inputs.bytecode_address,
                    false,
                    &input,
                    inputs.gas_limit,
                    inputs.value.get(),
                );
            }
        }
        self.depth += 1;
        None
    }

    fn call_end(&mut self, _context: &mut CTX, _inputs: &CallInputs, _outcome: &mut CallOutcome) {
        self.depth = self.depth.saturating_sub(1);
    }

    fn create(&mut self, _context: &mut CTX, _inputs: &mut CreateInputs) -> Option<CreateOutcome> {
        self.depth += 1;
        None
    }

    fn create_end(&mut self, _context: &mut CTX, inputs: &CreateInputs, outcome: &mut CreateOutcome) {
        self.depth = self.depth.saturating_sub(1);
        if self.depth == 0 {
            return;
        }
        // The address is only known once the creation ran.
        if let (Some(tracer), Some(address)) = (self.tracer.as_mut(), outcome.address) {
            tracer.capture_enter(
                inputs.caller,
                address,
                true,
                &inputs.init_code,
                inputs.gas_limit,
                inputs.value,
            );
        }
    }
}

fn spec_id(rules: &Rules) -> SpecId {
    if rules.is_london {
        SpecId::LONDON
    } else if rules.is_berlin {
        SpecId::BERLIN
    } else if rules.is_istanbul {
        SpecId::ISTANBUL
    } else if rules.is_petersburg {
        SpecId::PETERSBURG
    } else if rules.is_constantinople {
        SpecId::CONSTANTINOPLE
    } else if rules.is_byzantium {
        SpecId::BYZANTIUM
    } else if rules.is_spurious_dragon {
        SpecId::SPURIOUS_DRAGON
    } else if rules.is_tangerine_whistle {
        SpecId::TANGERINE
    } else if rules.is_homestead {
        SpecId::HOMESTEAD
    } else {
        SpecId::FRONTIER
    }
}

fn block_env(ctx: &BlockContext<'_>) -> BlockEnv {
    let header = ctx.header;
    BlockEnv {
        number: U256::from(header.number),
        beneficiary: ctx.author,
        timestamp: U256::from(header.timestamp),
        gas_limit: header.gas_limit,
        basefee: header.base_fee_per_gas.unwrap_or_default(),
        difficulty: header.difficulty,
        prevrandao: Some(header.mix_hash),
        ..Default::default()
    }
}

/// Copies the accounts revm changed into the intra-block state.
///
/// `skip` is never written. With `touch_unchanged` set, accounts revm only
/// touched are touched in `ibs` as well, which matters for empty-account
/// removal.
fn commit(
    ibs: &mut IntraBlockState<'_>,
    state: EvmState,
    skip: Option<Address>,
    touch_unchanged: bool,
) -> Result<(), StateError> {
    for (address, account) in state {
        if Some(address) == skip || !account.is_touched() {
            continue;
        }
        if account.is_selfdestructed() {
            ibs.self_destruct(address)?;
            continue;
        }
        if account.is_created() {
            ibs.create_account(address, true)?;
        }

        let info = &account.info;
        let mut changed = account.is_created();
        if ibs.get_balance(address)? != info.balance {
            ibs.set_balance(address, info.balance)?;
            changed = true;
        }
        if ibs.get_nonce(address)? != info.nonce {
            ibs.set_nonce(address, info.nonce)?;
            changed = true;
        }
        if info.code_hash != KECCAK_EMPTY && ibs.get_code_hash(address)? != info.code_hash {
            let code = info
                .code
                .as_ref()
                .map(|code| code.original_bytes())
                .unwrap_or_default();
            ibs.set_code(address, code)?;
            changed = true;
        }
        for (slot, value) in account.changed_storage_slots() {
            ibs.set_state(address, B256::from(*slot), value.present_value)?;
            changed = true;
        }
        if !changed && touch_unchanged {
            ibs.touch(address)?;
        }
    }
    Ok(())
}

/// [`Vm`] running mainnet revm.
///
/// Every call and creation, nested ones included, is reported to the tracer
/// of [`Vm::apply_message`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RevmVm;

impl RevmVm {
    pub fn new() -> Self {
        Self
    }

    fn transact(
        ctx: &mut BlockContext<'_>,
        ibs: &mut IntraBlockState<'_>,
        block: BlockEnv,
        tx: TxEnv,
        check_nonce: bool,
        tracer: Option<&mut dyn Tracer>,
    ) -> Result<(ExecutionResult, EvmState), ExecError> {
        let spec = spec_id(&ctx.rules);
        let chain_id = ctx.rules.chain_id;
        let db = StateDb::new(ibs, &mut *ctx.get_hash);

        let mut evm_ctx: MainnetContext<StateDb<'_, '_>> = Context::new(db, spec);
        evm_ctx.cfg.chain_id = chain_id;
        evm_ctx.cfg.disable_nonce_check = !check_nonce;
        evm_ctx.block = block;
        let mut evm = evm_ctx.build_mainnet_with_inspector(TraceInspector::new(tracer));

        let result = evm.inspect_tx(tx);
        match result {
            Ok(outcome) => Ok((outcome.result, outcome.state)),
            Err(EVMError::Database(err)) => Err(ExecError::State(err)),
            Err(err) => Err(ExecError::InvalidMessage(err.to_string())),
        }
    }
}

impl Vm for RevmVm {
    fn apply_message(
        &self,
        ctx: &mut BlockContext<'_>,
        msg: &Message,
        ibs: &mut IntraBlockState<'_>,
        gas_pool: &mut GasPool,
        tracer: &mut dyn Tracer,
        opts: ApplyOptions,
    ) -> Result<ExecutionOutcome, ExecError> {
        if !opts.refunds {
            return Err(ExecError::Unsupported("execution without refunds"));
        }
        if opts.gas_bailout {
            return Err(ExecError::Unsupported("gas bailout"));
        }

        gas_pool.sub_gas(msg.gas_limit)?;
        tracer.capture_start(
            msg.from,
            msg.target(),
            msg.to.is_create(),
            &msg.data,
            msg.gas_limit,
            msg.value,
        );

        let tx = TxEnv {
            tx_type: if msg.max_priority_fee_per_gas.is_some() { 2 } else { 0 },
            caller: msg.from,
            gas_limit: msg.gas_limit,
            gas_price: msg.gas_price,
            gas_priority_fee: msg.max_priority_fee_per_gas,
            kind: msg.to,
            value: msg.value,
            data: msg.data.clone(),
            nonce: msg.nonce,
            chain_id: msg.chain_id,
            ..Default::default()
        };
        let block = block_env(ctx);
        let (result, state) = Self::transact(ctx, ibs, block, tx, msg.check_nonce, Some(tracer))?;

        let gas_used = result.gas_used();
        gas_pool.add_gas(msg.gas_limit.saturating_sub(gas_used));

        match result {
            ExecutionResult::Success { logs, output, .. } => {
                commit(ibs, state, None, true)?;
                for log in logs {
                    ibs.add_log(log);
                }
                Ok(ExecutionOutcome {
                    gas_used,
                    output: output.into_data(),
                })
            }
            ExecutionResult::Revert { output, .. } => Err(ExecError::Reverted { output }),
            ExecutionResult::Halt { reason, .. } => Err(ExecError::Halted {
                reason: format!("{reason:?}"),
            }),
        }
    }

    fn system_call(
        &self,
        ctx: &mut BlockContext<'_>,
        contract: Address,
        data: Bytes,
        ibs: &mut IntraBlockState<'_>,
    ) -> Result<Bytes, ExecError> {
        let tx = TxEnv {
            caller: SYSTEM_ADDRESS,
            gas_limit: SYSTEM_CALL_GAS,
            gas_price: 0,
            kind: TxKind::Call(contract),
            data,
            chain_id: Some(ctx.rules.chain_id),
            ..Default::default()
        };
        let mut block = block_env(ctx);
        block.basefee = 0;
        block.gas_limit = block.gas_limit.max(SYSTEM_CALL_GAS);

        let (result, state) = Self::transact(ctx, ibs, block, tx, false, None)?;
        match result {
            ExecutionResult::Success { logs, output, .. } => {
                commit(ibs, state, Some(SYSTEM_ADDRESS), false)?;
                for log in logs {
                    ibs.add_log(log);
                }
                Ok(output.into_data())
            }
            ExecutionResult::Revert { output, .. } => Err(ExecError::Reverted { output }),
            ExecutionResult::Halt { reason, .. } => Err(ExecError::Halted {
                reason: format!("{reason:?}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainConfig;
    use crate::state::{account_key, code_key, Account, StateReader22};
    use crate::vm::{get_hash_fn, BlockContext, CallTracer};
    use alloy_consensus::Header;
    use std::sync::Arc;
    use versioned_state::{MemDb, RoDb, Table, VersionedState};

    const ONE_ETH: u128 = 1_000_000_000_000_000_000;

    fn reader_with(accounts: &[(Address, Account)]) -> StateReader22 {
        reader_with_code(accounts, &[])
    }

    fn reader_with_code(accounts: &[(Address, Account)], contracts: &[(Address, Bytes)]) -> StateReader22 {
        let db = MemDb::new();
        for (address, account) in accounts {
            db.put(Table::Account, account_key(*address), account.to_bytes());
        }
        for (address, code) in contracts {
            let account = Account {
                code_hash: alloy_primitives::keccak256(code),
                incarnation: 1,
                ..Default::default()
            };
            db.put(Table::Account, account_key(*address), account.to_bytes());
            db.put(Table::Code, code_key(*address, 1), code.to_vec());
        }
        let mut reader = StateReader22::new(Arc::new(VersionedState::new()));
        reader.set_tx(Some(db.begin_ro().unwrap()));
        reader
    }

    fn header() -> Header {
        Header {
            number: 1,
            gas_limit: 30_000_000,
            beneficiary: Address::repeat_byte(0xcb),
            base_fee_per_gas: Some(7),
            ..Default::default()
        }
    }

    fn message(from: Address, to: TxKind, data: Bytes) -> Message {
        Message {
            from,
            to,
            nonce: 0,
            value: U256::from(1000),
            gas_limit: 100_000,
            gas_price: 10,
            max_priority_fee_per_gas: None,
            effective_gas_price: 10,
            chain_id: Some(1),
            data,
            check_nonce: true,
        }
    }

    fn apply<'r>(
        reader: &'r StateReader22,
        msg: &Message,
    ) -> (Result<ExecutionOutcome, ExecError>, IntraBlockState<'r>, CallTracer) {
        let header = header();
        let rules = ChainConfig::all_forks(1).rules(1);
        let get_hash = get_hash_fn(&header, |_, _| Ok(None));
        let mut ctx = BlockContext::new(&header, header.beneficiary, rules, get_hash);
        let mut ibs = IntraBlockState::new(reader);
        let mut tracer = CallTracer::new();
        let result = RevmVm::new().apply_message(
            &mut ctx,
            msg,
            &mut ibs,
            &mut GasPool::new(header.gas_limit),
            &mut tracer,
            ApplyOptions {
                refunds: true,
                gas_bailout: false,
            },
        );
        (result, ibs, tracer)
    }

    #[test]
    fn test_value_transfer() {
        let sender = Address::repeat_byte(0x01);
        let receiver = Address::repeat_byte(0x02);
        let reader = reader_with(&[(
            sender,
            Account {
                balance: U256::from(ONE_ETH),
                ..Default::default()
            },
        )]);

        let msg = message(sender, TxKind::Call(receiver), Bytes::new());
        let (result, mut ibs, tracer) = apply(&reader, &msg);
        let outcome = result.unwrap();

        assert_eq!(outcome.gas_used, 21_000);
        assert_eq!(ibs.get_balance(receiver).unwrap(), U256::from(1000));
        assert_eq!(ibs.get_nonce(sender).unwrap(), 1);
        assert_eq!(
            ibs.get_balance(sender).unwrap(),
            U256::from(ONE_ETH - 1000 - 21_000 * 10)
        );
        assert!(tracer.froms().contains(&sender));
        assert!(tracer.tos().contains(&receiver));
    }

    #[test]
    fn test_nested_calls_are_traced() {
        let sender = Address::repeat_byte(0x01);
        let outer = Address::repeat_byte(0xaa);
        let inner = Address::repeat_byte(0xbb);

        // PUSH1 0 (x5) PUSH20 inner PUSH2 0xffff CALL STOP
        let mut code = [0x60, 0x00].repeat(5);
        code.push(0x73);
        code.extend_from_slice(inner.as_slice());
        code.extend_from_slice(&[0x61, 0xff, 0xff, 0xf1, 0x00]);
        let reader = reader_with_code(
            &[(
                sender,
                Account {
                    balance: U256::from(ONE_ETH),
                    ..Default::default()
                },
            )],
            &[(outer, code.into()), (inner, Bytes::from_static(&[0x00]))],
        );

        let msg = message(sender, TxKind::Call(outer), Bytes::new());
        let (result, _, tracer) = apply(&reader, &msg);
        result.unwrap();

        assert_eq!(tracer.froms().iter().copied().collect::<Vec<_>>(), vec![sender, outer]);
        assert_eq!(tracer.tos().iter().copied().collect::<Vec<_>>(), vec![outer, inner]);
    }

    #[test]
    fn test_nonce_check_can_be_disabled() {
        let sender = Address::repeat_byte(0x05);
        let reader = reader_with(&[(
            sender,
            Account {
                nonce: 5,
                balance: U256::from(ONE_ETH),
                ..Default::default()
            },
        )]);

        let msg = Message {
            check_nonce: false,
            ..message(sender, TxKind::Call(Address::ZERO), Bytes::new())
        };
        let (result, _, _) = apply(&reader, &msg);
        assert_eq!(result.unwrap().gas_used, 21_000);
    }

    #[test]
    fn test_revert_leaves_state_untouched() {
        let sender = Address::repeat_byte(0x03);
        let reader = reader_with(&[(
            sender,
            Account {
                balance: U256::from(ONE_ETH),
                ..Default::default()
            },
        )]);

        // Init code: PUSH1 0 PUSH1 0 REVERT
        let init = Bytes::from_static(&[0x60, 0x00, 0x60, 0x00, 0xfd]);
        let msg = message(sender, TxKind::Create, init);
        let (result, mut ibs, _) = apply(&reader, &msg);

        assert!(matches!(result, Err(ExecError::Reverted { .. })));
        assert_eq!(ibs.get_nonce(sender).unwrap(), 0);
        assert_eq!(ibs.get_balance(sender).unwrap(), U256::from(ONE_ETH));
    }

    #[test]
    fn test_invalid_nonce_is_not_fatal() {
        let sender = Address::repeat_byte(0x04);
        let reader = reader_with(&[(
            sender,
            Account {
                nonce: 5,
                balance: U256::from(ONE_ETH),
                ..Default::default()
            },
        )]);

        let msg = message(sender, TxKind::Call(Address::ZERO), Bytes::new());
        let (result, _, _) = apply(&reader, &msg);
        let err = result.unwrap_err();
        assert!(matches!(err, ExecError::InvalidMessage(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_system_call_to_empty_contract() {
        let reader = reader_with(&[]);
        let header = header();
        let rules = ChainConfig::all_forks(1).rules(1);
        let get_hash = get_hash_fn(&header, |_, _| Ok(None));
        let mut ctx = BlockContext::new(&header, header.beneficiary, rules, get_hash);
        let mut ibs = IntraBlockState::new(&reader);

        let output = RevmVm::new()
            .system_call(&mut ctx, Address::with_last_byte(0x10), Bytes::new(), &mut ibs)
            .unwrap();
        assert!(output.is_empty());
        assert_eq!(ibs.get_nonce(SYSTEM_ADDRESS).unwrap(), 0);
    }

    #[test]
    fn test_spec_follows_rules() {
        assert_eq!(spec_id(&Rules::default()), SpecId::FRONTIER);
        assert_eq!(spec_id(&ChainConfig::all_forks(1).rules(0)), SpecId::LONDON);
    }
}
