use crate::revert::{decode_reason, RawRevert};
use ethers::abi::{ParamType, Token};
use ethers::types::{Address, Bytes, H256, U256};

/// ERC-4337 UserOperation (EntryPoint v0.6 layout).
///
/// This is the unsigned, still-editable form produced by the builder. Signing
/// consumes it and yields a [`SignedUserOperation`], which is the only form the
/// submission client accepts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    pub init_code: Bytes,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub paymaster_and_data: Bytes,
    pub signature: Bytes,
}

impl UserOperation {
    /// ABI type of the Solidity `UserOperation` struct.
    pub fn param_type() -> ParamType {
        ParamType::Tuple(vec![
            ParamType::Address,
            ParamType::Uint(256),
            ParamType::Bytes,
            ParamType::Bytes,
            ParamType::Uint(256),
            ParamType::Uint(256),
            ParamType::Uint(256),
            ParamType::Uint(256),
            ParamType::Uint(256),
            ParamType::Bytes,
            ParamType::Bytes,
        ])
    }

    /// Returns a tuple token matching the Solidity struct layout, suitable for
    /// `handleOps` and `getUserOpHash`.
    pub fn to_token(&self) -> Token {
        Token::Tuple(vec![
            Token::Address(self.sender),
            Token::Uint(self.nonce),
            Token::Bytes(self.init_code.to_vec()),
            Token::Bytes(self.call_data.to_vec()),
            Token::Uint(self.call_gas_limit),
            Token::Uint(self.verification_gas_limit),
            Token::Uint(self.pre_verification_gas),
            Token::Uint(self.max_fee_per_gas),
            Token::Uint(self.max_priority_fee_per_gas),
            Token::Bytes(self.paymaster_and_data.to_vec()),
            Token::Bytes(self.signature.to_vec()),
        ])
    }

    pub fn from_token(token: Token) -> Option<Self> {
        let mut fields = token.into_tuple()?.into_iter();
        let mut next = || fields.next();
        Some(Self {
            sender: next()?.into_address()?,
            nonce: next()?.into_uint()?,
            init_code: next()?.into_bytes()?.into(),
            call_data: next()?.into_bytes()?.into(),
            call_gas_limit: next()?.into_uint()?,
            verification_gas_limit: next()?.into_uint()?,
            pre_verification_gas: next()?.into_uint()?,
            max_fee_per_gas: next()?.into_uint()?,
            max_priority_fee_per_gas: next()?.into_uint()?,
            paymaster_and_data: next()?.into_bytes()?.into(),
            signature: next()?.into_bytes()?.into(),
        })
    }

    /// Factory address at the head of `init_code`, if any.
    pub fn factory(&self) -> Option<Address> {
        address_prefix(&self.init_code)
    }

    /// Paymaster address at the head of `paymaster_and_data`, if any.
    pub fn paymaster(&self) -> Option<Address> {
        address_prefix(&self.paymaster_and_data)
    }

    pub fn with_fees(mut self, fees: GasFees) -> Self {
        self.max_fee_per_gas = fees.max_fee_per_gas;
        self.max_priority_fee_per_gas = fees.max_priority_fee_per_gas;
        self
    }

    /// Upper bound on what the sender (or paymaster) pays for this op.
    pub fn max_gas_cost(&self) -> U256 {
        self.call_gas_limit
            .saturating_add(self.verification_gas_limit)
            .saturating_add(self.pre_verification_gas)
            .saturating_mul(self.max_fee_per_gas)
    }
}

fn address_prefix(data: &Bytes) -> Option<Address> {
    (data.len() >= 20).then(|| Address::from_slice(&data[..20]))
}

/// A UserOperation together with the signature over its hash.
///
/// Fields are read-only: any change needs a fresh hash and signature, so the
/// only way back to an editable op is [`SignedUserOperation::into_unsigned`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedUserOperation {
    op: UserOperation,
    hash: H256,
}

impl SignedUserOperation {
    pub(crate) fn new(op: UserOperation, hash: H256) -> Self {
        Self { op, hash }
    }

    pub fn op(&self) -> &UserOperation {
        &self.op
    }

    /// The digest the signature was computed over.
    pub fn hash(&self) -> H256 {
        self.hash
    }

    pub fn signature(&self) -> &Bytes {
        &self.op.signature
    }

    /// Drops the signature, returning an editable op.
    pub fn into_unsigned(self) -> UserOperation {
        let mut op = self.op;
        op.signature = Bytes::new();
        op
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeploymentStatus {
    Undeployed,
    Deployed,
}

impl DeploymentStatus {
    pub fn from_code(code: &Bytes) -> Self {
        if code.as_ref().is_empty() {
            DeploymentStatus::Undeployed
        } else {
            DeploymentStatus::Deployed
        }
    }

    pub fn is_deployed(self) -> bool {
        self == DeploymentStatus::Deployed
    }
}

/// A smart-contract wallet, possibly not yet deployed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Account {
    pub address: Address,
    pub owner: Address,
    pub status: DeploymentStatus,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GasFees {
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

/// Fee market snapshot read from the ledger.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FeeConditions {
    pub base_fee: U256,
    pub suggested_priority_fee: U256,
}

/// Per-operation outcome reported by the EntryPoint's `UserOperationEvent`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationOutcome {
    pub user_op_hash: H256,
    pub sender: Address,
    pub paymaster: Address,
    pub nonce: U256,
    pub success: bool,
    pub actual_gas_cost: U256,
    pub actual_gas_used: U256,
    /// Revert payload of the account call, from `UserOperationRevertReason`.
    pub revert: Option<RawRevert>,
}

impl OperationOutcome {
    pub fn reason(&self) -> Option<String> {
        self.revert.as_ref().map(decode_reason)
    }
}

/// Outcome of a `handleOps` submission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: H256,
    pub success: bool,
    pub gas_used: U256,
    pub operations: Vec<OperationOutcome>,
}

impl Receipt {
    /// True when the transaction succeeded and every reported op executed.
    pub fn all_succeeded(&self) -> bool {
        self.success && self.operations.iter().all(|o| o.success)
    }
}
