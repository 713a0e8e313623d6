use crate::encoding::{
    decode_uint, encode_call, BALANCE_OF, DEPOSIT_TO, HANDLE_OPS, USER_OPERATION_EVENT,
};
use crate::error::{LedgerError, PipelineError, Result};
use crate::ledger::{Ledger, LedgerReceipt, ReceiptWait, TxHandle};
use crate::revert::{decode_reason, failed_op, RawRevert};
use crate::types::{OperationOutcome, Receipt, SignedUserOperation};
use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Bytes, Log, H256, U256};
use ethers::utils::keccak256;
use once_cell::sync::Lazy;
use std::sync::Arc;

pub(crate) const USER_OPERATION_REVERT_REASON: &str =
    "UserOperationRevertReason(bytes32,address,uint256,bytes)";

static USER_OPERATION_EVENT_TOPIC: Lazy<H256> =
    Lazy::new(|| H256::from(keccak256(USER_OPERATION_EVENT)));
static USER_OPERATION_REVERT_REASON_TOPIC: Lazy<H256> =
    Lazy::new(|| H256::from(keccak256(USER_OPERATION_REVERT_REASON)));

/// EntryPoint nonce validation failure prefix.
const NONCE_ERROR_CODE: &str = "AA25";

/// Submits signed operations to the EntryPoint with `handleOps` and waits for
/// the result.
///
/// Operations sharing a sender and nonce key must appear in increasing nonce
/// order; the EntryPoint rejects the whole batch otherwise.
pub struct SubmissionClient<L: ?Sized> {
    ledger: Arc<L>,
    entry_point: Address,
    wait: ReceiptWait,
}

impl<L: Ledger + ?Sized> SubmissionClient<L> {
    pub fn new(ledger: Arc<L>, entry_point: Address) -> Self {
        Self {
            ledger,
            entry_point,
            wait: ReceiptWait::default(),
        }
    }

    pub fn with_wait(mut self, wait: ReceiptWait) -> Self {
        self.wait = wait;
        self
    }

    pub async fn submit(
        &self,
        ops: &[SignedUserOperation],
        beneficiary: Address,
    ) -> Result<Receipt> {
        if ops.is_empty() {
            return Err(PipelineError::EmptyBatch);
        }

        let data = handle_ops_calldata(ops, beneficiary);

        let handle = match self
            .ledger
            .send_transaction(self.entry_point, data.clone(), U256::zero())
            .await
        {
            Ok(handle) => handle,
            Err(LedgerError::Reverted(raw)) => return Err(classify_revert(raw, None)),
            Err(e) => return Err(e.into()),
        };
        tracing::info!(tx = ?handle.hash, ops = ops.len(), "handleOps sent");

        let receipt = self.wait_for(handle).await?;
        if !receipt.success {
            // Replaying against the current state is best effort: the revert
            // reason is not part of the receipt.
            let err = match self.ledger.call(self.entry_point, data).await {
                Err(LedgerError::Reverted(raw)) => classify_revert(raw, Some(receipt.tx_hash)),
                _ => PipelineError::SubmissionReverted {
                    reason: "handleOps reverted on-chain".to_string(),
                    raw: None,
                    tx_hash: Some(receipt.tx_hash),
                },
            };
            tracing::warn!(tx = ?receipt.tx_hash, reason = %err.reason(), "handleOps reverted");
            return Err(err);
        }

        let operations = parse_outcomes(&receipt.logs, self.entry_point);
        tracing::info!(
            tx = ?receipt.tx_hash,
            gas_used = %receipt.gas_used,
            executed = operations.iter().filter(|o| o.success).count(),
            failed = operations.iter().filter(|o| !o.success).count(),
            "handleOps included"
        );
        Ok(Receipt {
            tx_hash: receipt.tx_hash,
            success: receipt.success,
            gas_used: receipt.gas_used,
            operations,
        })
    }

    /// Adds `amount` to `account`'s EntryPoint deposit, which pays for its ops.
    pub async fn deposit_to(&self, account: Address, amount: U256) -> Result<H256> {
        let data = encode_call(DEPOSIT_TO, &[Token::Address(account)]);
        let handle = self
            .ledger
            .send_transaction(self.entry_point, data, amount)
            .await?;
        let receipt = self.wait_for(handle).await?;
        if !receipt.success {
            return Err(PipelineError::SubmissionReverted {
                reason: "depositTo reverted".into(),
                raw: None,
                tx_hash: Some(receipt.tx_hash),
            });
        }
        tracing::info!(account = ?account, amount = %amount, tx = ?receipt.tx_hash, "deposited");
        Ok(receipt.tx_hash)
    }

    pub async fn balance_of(&self, account: Address) -> Result<U256> {
        let data = encode_call(BALANCE_OF, &[Token::Address(account)]);
        let out = self.ledger.call(self.entry_point, data).await?;
        Ok(decode_uint(&out)?)
    }

    async fn wait_for(&self, handle: TxHandle) -> Result<LedgerReceipt> {
        match self.ledger.await_receipt(handle, self.wait).await {
            Ok(receipt) => Ok(receipt),
            Err(LedgerError::Timeout(hash)) => Err(PipelineError::ReceiptTimeout(hash)),
            Err(e) => Err(e.into()),
        }
    }
}

fn classify_revert(raw: RawRevert, tx_hash: Option<H256>) -> PipelineError {
    match failed_op(&raw) {
        Some((op_index, reason)) if reason.starts_with(NONCE_ERROR_CODE) => {
            PipelineError::NonceConflict {
                op_index,
                reason,
                tx_hash,
            }
        }
        _ => PipelineError::SubmissionReverted {
            reason: decode_reason(&raw),
            raw: Some(raw),
            tx_hash,
        },
    }
}

/// Reads `UserOperationEvent` (and any `UserOperationRevertReason`) logs emitted
/// by `entry_point`, in log order.
pub fn parse_outcomes(logs: &[Log], entry_point: Address) -> Vec<OperationOutcome> {
    let mut reverts: Vec<(H256, RawRevert)> = Vec::new();
    let mut outcomes = Vec::new();

    for log in logs.iter().filter(|l| l.address == entry_point) {
        let Some(topic0) = log.topics.first() else {
            continue;
        };
        if *topic0 == *USER_OPERATION_REVERT_REASON_TOPIC && log.topics.len() >= 2 {
            if let Some(data) = abi::decode(&[ParamType::Uint(256), ParamType::Bytes], &log.data)
                .ok()
                .and_then(|mut t| t.pop())
                .and_then(Token::into_bytes)
            {
                reverts.push((log.topics[1], RawRevert::from_data(data)));
            }
        } else if *topic0 == *USER_OPERATION_EVENT_TOPIC && log.topics.len() >= 4 {
            let Ok(tokens) = abi::decode(
                &[
                    ParamType::Uint(256),
                    ParamType::Bool,
                    ParamType::Uint(256),
                    ParamType::Uint(256),
                ],
                &log.data,
            ) else {
                tracing::warn!(tx = ?log.transaction_hash, "malformed UserOperationEvent");
                continue;
            };
            let mut tokens = tokens.into_iter();
            let user_op_hash = log.topics[1];
            let revert = reverts
                .iter()
                .position(|(h, _)| *h == user_op_hash)
                .map(|i| reverts.swap_remove(i).1);
            outcomes.push(OperationOutcome {
                user_op_hash,
                sender: Address::from(log.topics[2]),
                paymaster: Address::from(log.topics[3]),
                nonce: tokens.next().and_then(Token::into_uint).unwrap_or_default(),
                success: tokens.next().and_then(Token::into_bool).unwrap_or_default(),
                actual_gas_cost: tokens.next().and_then(Token::into_uint).unwrap_or_default(),
                actual_gas_used: tokens.next().and_then(Token::into_uint).unwrap_or_default(),
                revert,
            });
        }
    }
    outcomes
}

/// Calldata of a `handleOps` batch, for dry runs and diagnostics.
pub fn handle_ops_calldata(ops: &[SignedUserOperation], beneficiary: Address) -> Bytes {
    encode_call(
        HANDLE_OPS,
        &[
            Token::Array(ops.iter().map(|s| s.op().to_token()).collect()),
            Token::Address(beneficiary),
        ],
    )
}
