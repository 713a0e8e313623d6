use crate::types::UserOperation;
use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::id;

// Calling conventions of the EntryPoint (v0.6), the account factory and the account.
pub const HANDLE_OPS: &str = "handleOps((address,uint256,bytes,bytes,uint256,uint256,uint256,uint256,uint256,bytes,bytes)[],address)";
pub const GET_USER_OP_HASH: &str = "getUserOpHash((address,uint256,bytes,bytes,uint256,uint256,uint256,uint256,uint256,bytes,bytes))";
pub const GET_NONCE: &str = "getNonce(address,uint192)";
pub const GET_SENDER_ADDRESS: &str = "getSenderAddress(bytes)";
pub const DEPOSIT_TO: &str = "depositTo(address)";
pub const BALANCE_OF: &str = "balanceOf(address)";
pub const CREATE_ACCOUNT: &str = "createAccount(address)";
pub const CREATE_ACCOUNT_WITH_SALT: &str = "createAccount(address,uint256)";
pub const EXECUTE_NOOP: &str = "execute()";
pub const EXECUTE: &str = "execute(address,uint256,bytes)";
pub const EXECUTE_BATCH: &str = "executeBatch(address[],bytes[])";
pub const USER_OPERATION_EVENT: &str =
    "UserOperationEvent(bytes32,address,address,uint256,bool,uint256,uint256)";

/// Selector followed by the ABI-encoded arguments.
pub fn encode_call(signature: &str, args: &[Token]) -> Bytes {
    let mut data = id(signature).to_vec();
    data.extend(abi::encode(args));
    Bytes::from(data)
}

/// Splits calldata into `(selector, args)` when the selector matches `signature`.
pub fn decode_call(
    signature: &str,
    types: &[ParamType],
    data: &[u8],
) -> Option<Vec<Token>> {
    if data.len() < 4 || data[..4] != id(signature) {
        return None;
    }
    abi::decode(types, &data[4..]).ok()
}

/// Decodes a single `uint256` return value.
pub fn decode_uint(data: &[u8]) -> Result<U256, abi::Error> {
    abi::decode(&[ParamType::Uint(256)], data)?
        .pop()
        .and_then(Token::into_uint)
        .ok_or(abi::Error::InvalidData)
}

pub fn decode_h256(data: &[u8]) -> Result<H256, abi::Error> {
    abi::decode(&[ParamType::FixedBytes(32)], data)?
        .pop()
        .and_then(Token::into_fixed_bytes)
        .map(|b| H256::from_slice(&b))
        .ok_or(abi::Error::InvalidData)
}

pub fn fmt_address(addr: Address) -> String {
    format!("0x{}", hex::encode(addr.as_bytes()))
}

pub fn fmt_h256(h: H256) -> String {
    format!("0x{}", hex::encode(h.as_bytes()))
}

/// JSON-RPC "quantity" encoding.
pub fn fmt_u256(v: U256) -> String {
    if v.is_zero() {
        "0x0".to_string()
    } else {
        format!("0x{:x}", v)
    }
}

pub fn fmt_bytes(b: &Bytes) -> String {
    format!("0x{}", hex::encode(b.as_ref()))
}

pub fn user_op_to_json(op: &UserOperation) -> serde_json::Value {
    serde_json::json!({
        "sender": fmt_address(op.sender),
        "nonce": fmt_u256(op.nonce),
        "initCode": fmt_bytes(&op.init_code),
        "callData": fmt_bytes(&op.call_data),
        "callGasLimit": fmt_u256(op.call_gas_limit),
        "verificationGasLimit": fmt_u256(op.verification_gas_limit),
        "preVerificationGas": fmt_u256(op.pre_verification_gas),
        "maxFeePerGas": fmt_u256(op.max_fee_per_gas),
        "maxPriorityFeePerGas": fmt_u256(op.max_priority_fee_per_gas),
        "paymasterAndData": fmt_bytes(&op.paymaster_and_data),
        "signature": fmt_bytes(&op.signature),
    })
}
