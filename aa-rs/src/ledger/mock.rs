//! In-memory ledger emulating a local dev chain with an EntryPoint v0.6 and an
//! account factory deployed the way the hardhat scripts do it.

use crate::encoding::{
    decode_call, encode_call, BALANCE_OF, CREATE_ACCOUNT, CREATE_ACCOUNT_WITH_SALT, DEPOSIT_TO,
    GET_NONCE, GET_SENDER_ADDRESS, GET_USER_OP_HASH, HANDLE_OPS, USER_OPERATION_EVENT,
};
use crate::error::LedgerError;
use crate::ledger::{Ledger, LedgerReceipt, ReceiptWait, TxHandle};
use crate::revert::{RawRevert, FAILED_OP, SENDER_ADDRESS_RESULT};
use crate::signer::user_op_hash;
use crate::submit::USER_OPERATION_REVERT_REASON;
use crate::types::{FeeConditions, UserOperation};
use async_trait::async_trait;
use ethers::abi::{self, ParamType, Token};
use ethers::signers::LocalWallet;
use ethers::types::{Address, Bytes, Log, Signature, H256, U256};
use ethers::utils::{get_contract_address, id, keccak256};
use std::collections::HashMap;
use std::sync::Mutex;

/// Hardhat's first dev account.
pub(crate) const OWNER_KEY: &str =
    "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

pub(crate) const ENTRY_POINT: &str = "0x5FbDB2315678afecb367f032d93F642f64180aa3";
pub(crate) const FACTORY: &str = "0xe7f1725E7734CE288F8367e1Bb143E90bb3F0512";

/// Gas the mock charges per executed operation.
pub(crate) const GAS_PER_OP: u64 = 100_000;

/// Account calldata that makes the mocked account call revert.
pub(crate) const FAIL: &str = "fail()";

pub(crate) fn owner_wallet() -> LocalWallet {
    OWNER_KEY.parse().unwrap()
}

#[derive(Clone, Default)]
struct State {
    code: HashMap<Address, Bytes>,
    tx_counts: HashMap<Address, U256>,
    owners: HashMap<Address, Address>,
    nonces: HashMap<(Address, U256), U256>,
    deposits: HashMap<Address, U256>,
    receipts: HashMap<H256, LedgerReceipt>,
    fees: Option<FeeConditions>,
    mined_revert: bool,
    front_run: bool,
    withhold_receipts: bool,
    sent: usize,
}

pub(crate) struct MockLedger {
    pub entry_point: Address,
    pub factory: Address,
    pub chain_id: u64,
    /// Key the ledger sends transactions from.
    pub eoa: Address,
    state: Mutex<State>,
}

impl MockLedger {
    pub fn new() -> Self {
        let entry_point: Address = ENTRY_POINT.parse().unwrap();
        let factory: Address = FACTORY.parse().unwrap();
        let eoa = ethers::signers::Signer::address(&owner_wallet());

        let mut state = State::default();
        state.code.insert(entry_point, Bytes::from(vec![0x60, 0x80]));
        state.code.insert(factory, Bytes::from(vec![0x60, 0x80]));
        // Contracts start at nonce 1 (EIP-161).
        state.tx_counts.insert(factory, U256::one());
        state.tx_counts.insert(eoa, U256::from(2));
        state.fees = Some(FeeConditions {
            base_fee: U256::from(1_000_000_000u64),
            suggested_priority_fee: U256::from(1_500_000_000u64),
        });

        Self {
            entry_point,
            factory,
            chain_id: 31337,
            eoa,
            state: Mutex::new(state),
        }
    }

    pub fn set_fees(&self, fees: Option<FeeConditions>) {
        self.state.lock().unwrap().fees = fees;
    }

    /// Included transactions report status 0 and change nothing.
    pub fn set_mined_revert(&self, on: bool) {
        self.state.lock().unwrap().mined_revert = on;
    }

    /// A competing bundle carrying the same operations lands first, so ours is
    /// mined with status 0 after the nonces were already consumed.
    pub fn set_front_run(&self, on: bool) {
        self.state.lock().unwrap().front_run = on;
    }

    /// Receipts never show up.
    pub fn set_withhold_receipts(&self, on: bool) {
        self.state.lock().unwrap().withhold_receipts = on;
    }

    /// Places an already-deployed account owned by `owner` at `address`.
    pub fn install_account(&self, address: Address, owner: Address) {
        let mut state = self.state.lock().unwrap();
        state.code.insert(address, Bytes::from(vec![0x60, 0x80]));
        state.owners.insert(address, owner);
    }

    pub fn deposit_of(&self, address: Address) -> U256 {
        let state = self.state.lock().unwrap();
        state.deposits.get(&address).copied().unwrap_or_default()
    }

    pub fn sent_transactions(&self) -> usize {
        self.state.lock().unwrap().sent
    }

    fn handle_ops(&self, state: &mut State, data: &[u8]) -> Result<Vec<Log>, RawRevert> {
        let mut args = decode_call(
            HANDLE_OPS,
            &[
                ParamType::Array(Box::new(UserOperation::param_type())),
                ParamType::Address,
            ],
            data,
        )
        .ok_or_else(RawRevert::default)?;
        let _beneficiary = args.pop().and_then(Token::into_address);
        let ops: Vec<UserOperation> = args
            .pop()
            .and_then(Token::into_array)
            .unwrap_or_default()
            .into_iter()
            .filter_map(UserOperation::from_token)
            .collect();

        let mut logs = Vec::new();
        for (i, op) in ops.iter().enumerate() {
            self.apply_op(state, op, &mut logs)
                .map_err(|reason| failed_op(i, reason))?;
        }
        Ok(logs)
    }

    fn apply_op(
        &self,
        state: &mut State,
        op: &UserOperation,
        logs: &mut Vec<Log>,
    ) -> Result<(), &'static str> {
        let has_code = state.code.get(&op.sender).is_some_and(|c| !c.is_empty());
        if !op.init_code.is_empty() {
            if has_code {
                return Err("AA10 sender already constructed");
            }
            let factory = op.factory().ok_or("AA13 initCode failed or OOG")?;
            if !state.code.contains_key(&factory) {
                return Err("AA13 initCode failed or OOG");
            }
            let owner = decode_owner(&op.init_code[20..]).ok_or("AA13 initCode failed or OOG")?;
            let counter = state.tx_counts.get(&factory).copied().unwrap_or_default();
            state.tx_counts.insert(factory, counter + 1);
            if get_contract_address(factory, counter) != op.sender {
                return Err("AA14 initCode must return sender");
            }
            state.code.insert(op.sender, Bytes::from(vec![0x60, 0x80]));
            state.owners.insert(op.sender, owner);
        } else if !has_code {
            return Err("AA20 account not deployed");
        }

        let hash = user_op_hash(op, self.entry_point, self.chain_id);
        let signer = Signature::try_from(op.signature.as_ref())
            .ok()
            .and_then(|sig| sig.recover(hash.as_bytes()).ok());
        if signer.is_none() || signer != state.owners.get(&op.sender).copied() {
            return Err("AA24 signature error");
        }

        let key = op.nonce >> 64usize;
        let seq = op.nonce & U256::from(u64::MAX);
        let expected = state
            .nonces
            .get(&(op.sender, key))
            .copied()
            .unwrap_or_default();
        if seq != expected {
            return Err("AA25 invalid account nonce");
        }
        state.nonces.insert((op.sender, key), expected + 1);

        let paymaster = op.paymaster();
        let payer = paymaster.unwrap_or(op.sender);
        let deposit = state.deposits.get(&payer).copied().unwrap_or_default();
        if deposit < op.max_gas_cost() {
            return Err(if paymaster.is_some() {
                "AA31 paymaster deposit too low"
            } else {
                "AA21 didn't pay prefund"
            });
        }
        let limits = op.call_gas_limit + op.verification_gas_limit + op.pre_verification_gas;
        let gas_used = limits.min(U256::from(GAS_PER_OP));
        let gas_cost = gas_used * op.max_fee_per_gas;
        state.deposits.insert(payer, deposit - gas_cost);

        let success = op.call_data.as_ref() != encode_call(FAIL, &[]).as_ref();
        let sender_topic = H256::from(op.sender);
        if !success {
            let reason =
                RawRevert::custom_error("Error(string)", &[Token::String("mock failure".into())]);
            logs.push(Log {
                address: self.entry_point,
                topics: vec![
                    H256::from(keccak256(USER_OPERATION_REVERT_REASON)),
                    hash,
                    sender_topic,
                ],
                data: abi::encode(&[Token::Uint(op.nonce), Token::Bytes(reason.data.to_vec())])
                    .into(),
                ..Default::default()
            });
        }
        logs.push(Log {
            address: self.entry_point,
            topics: vec![
                H256::from(keccak256(USER_OPERATION_EVENT)),
                hash,
                sender_topic,
                H256::from(paymaster.unwrap_or_default()),
            ],
            data: abi::encode(&[
                Token::Uint(op.nonce),
                Token::Bool(success),
                Token::Uint(gas_cost),
                Token::Uint(gas_used),
            ])
            .into(),
            ..Default::default()
        });
        Ok(())
    }

    fn record(&self, state: &mut State, success: bool, gas_used: U256, logs: Vec<Log>) -> H256 {
        state.sent += 1;
        *state.tx_counts.entry(self.eoa).or_default() += U256::one();
        let tx_hash = H256::from(keccak256(format!("mock-tx-{}", state.sent)));
        state.receipts.insert(
            tx_hash,
            LedgerReceipt {
                tx_hash,
                success,
                gas_used,
                logs,
            },
        );
        tx_hash
    }
}

fn failed_op(index: usize, reason: &str) -> RawRevert {
    let mut raw = RawRevert::custom_error(
        FAILED_OP,
        &[Token::Uint(U256::from(index)), Token::String(reason.to_string())],
    );
    raw.message = "execution reverted".into();
    raw
}

fn decode_owner(create_call: &[u8]) -> Option<Address> {
    decode_call(CREATE_ACCOUNT, &[ParamType::Address], create_call)
        .or_else(|| {
            decode_call(
                CREATE_ACCOUNT_WITH_SALT,
                &[ParamType::Address, ParamType::Uint(256)],
                create_call,
            )
        })?
        .into_iter()
        .next()?
        .into_address()
}

fn selector(data: &[u8]) -> Option<[u8; 4]> {
    (data.len() >= 4).then(|| [data[0], data[1], data[2], data[3]])
}

#[async_trait]
impl Ledger for MockLedger {
    async fn chain_id(&self) -> Result<u64, LedgerError> {
        Ok(self.chain_id)
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, LedgerError> {
        if to != self.entry_point {
            return Err(LedgerError::Reverted(RawRevert::default()));
        }
        let state = self.state.lock().unwrap();
        let sel = selector(&data).ok_or(LedgerError::Reverted(RawRevert::default()))?;

        if sel == id(GET_NONCE) {
            let mut args =
                decode_call(GET_NONCE, &[ParamType::Address, ParamType::Uint(192)], &data)
                    .ok_or(LedgerError::Reverted(RawRevert::default()))?;
            let key = args.pop().and_then(Token::into_uint).unwrap_or_default();
            let sender = args.pop().and_then(Token::into_address).unwrap_or_default();
            let seq = state.nonces.get(&(sender, key)).copied().unwrap_or_default();
            return Ok(abi::encode(&[Token::Uint((key << 64usize) | seq)]).into());
        }
        if sel == id(GET_SENDER_ADDRESS) {
            let init_code = decode_call(GET_SENDER_ADDRESS, &[ParamType::Bytes], &data)
                .and_then(|mut t| t.pop())
                .and_then(Token::into_bytes)
                .unwrap_or_default();
            if init_code.len() < 20 {
                return Err(LedgerError::Reverted(RawRevert::custom_error(
                    "Error(string)",
                    &[Token::String("AA13 initCode failed or OOG".into())],
                )));
            }
            let factory = Address::from_slice(&init_code[..20]);
            let counter = state.tx_counts.get(&factory).copied().unwrap_or_default();
            let mut raw = RawRevert::custom_error(
                SENDER_ADDRESS_RESULT,
                &[Token::Address(get_contract_address(factory, counter))],
            );
            raw.message = "execution reverted".into();
            return Err(LedgerError::Reverted(raw));
        }
        if sel == id(GET_USER_OP_HASH) {
            let op = decode_call(GET_USER_OP_HASH, &[UserOperation::param_type()], &data)
                .and_then(|mut t| t.pop())
                .and_then(UserOperation::from_token)
                .ok_or(LedgerError::Reverted(RawRevert::default()))?;
            let hash = user_op_hash(&op, self.entry_point, self.chain_id);
            return Ok(Bytes::from(hash.as_bytes().to_vec()));
        }
        if sel == id(BALANCE_OF) {
            let account = decode_call(BALANCE_OF, &[ParamType::Address], &data)
                .and_then(|mut t| t.pop())
                .and_then(Token::into_address)
                .unwrap_or_default();
            let deposit = state.deposits.get(&account).copied().unwrap_or_default();
            return Ok(abi::encode(&[Token::Uint(deposit)]).into());
        }
        if sel == id(HANDLE_OPS) {
            let mut scratch = state.clone();
            return self
                .handle_ops(&mut scratch, &data)
                .map(|_| Bytes::new())
                .map_err(LedgerError::Reverted);
        }
        Err(LedgerError::Reverted(RawRevert::default()))
    }

    async fn get_code(&self, address: Address) -> Result<Bytes, LedgerError> {
        let state = self.state.lock().unwrap();
        Ok(state.code.get(&address).cloned().unwrap_or_default())
    }

    async fn transaction_count(&self, address: Address) -> Result<U256, LedgerError> {
        let state = self.state.lock().unwrap();
        Ok(state.tx_counts.get(&address).copied().unwrap_or_default())
    }

    async fn fee_conditions(&self) -> Result<FeeConditions, LedgerError> {
        self.state
            .lock()
            .unwrap()
            .fees
            .ok_or_else(|| {
                LedgerError::Transport("eth_getBlockByNumber: connection refused".into())
            })
    }

    async fn send_transaction(
        &self,
        to: Address,
        data: Bytes,
        value: U256,
    ) -> Result<TxHandle, LedgerError> {
        if to != self.entry_point {
            return Err(LedgerError::Transport(format!("no contract at {to:?}")));
        }
        let mut state = self.state.lock().unwrap();
        let sel = selector(&data).ok_or(LedgerError::Reverted(RawRevert::default()))?;

        if sel == id(HANDLE_OPS) {
            // Gas estimation runs the whole batch first; a FailedOp never gets mined.
            let mut next = state.clone();
            let logs = self
                .handle_ops(&mut next, &data)
                .map_err(LedgerError::Reverted)?;
            let ops = logs
                .iter()
                .filter(|l| l.topics[0] == H256::from(keccak256(USER_OPERATION_EVENT)))
                .count() as u64;
            let gas_used = U256::from(21_000 + GAS_PER_OP * ops);

            let hash = if state.front_run {
                *state = next;
                self.record(&mut state, false, gas_used, Vec::new())
            } else if state.mined_revert {
                self.record(&mut state, false, gas_used, Vec::new())
            } else {
                let hash = self.record(&mut next, true, gas_used, logs);
                *state = next;
                hash
            };
            return Ok(TxHandle { hash });
        }
        if sel == id(DEPOSIT_TO) {
            let account = decode_call(DEPOSIT_TO, &[ParamType::Address], &data)
                .and_then(|mut t| t.pop())
                .and_then(Token::into_address)
                .ok_or(LedgerError::Reverted(RawRevert::default()))?;
            *state.deposits.entry(account).or_default() += value;
            let hash = self.record(&mut state, true, U256::from(45_000), Vec::new());
            return Ok(TxHandle { hash });
        }
        Err(LedgerError::Reverted(RawRevert::default()))
    }

    async fn await_receipt(
        &self,
        handle: TxHandle,
        _wait: ReceiptWait,
    ) -> Result<LedgerReceipt, LedgerError> {
        let state = self.state.lock().unwrap();
        if state.withhold_receipts {
            return Err(LedgerError::Timeout(handle.hash));
        }
        state
            .receipts
            .get(&handle.hash)
            .cloned()
            .ok_or(LedgerError::Dropped(handle.hash))
    }

    fn sender(&self) -> Option<Address> {
        Some(self.eoa)
    }
}
