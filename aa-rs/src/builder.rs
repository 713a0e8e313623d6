use crate::config::DeploymentConfig;
use crate::encoding::{
    self, encode_call, CREATE_ACCOUNT, CREATE_ACCOUNT_WITH_SALT, EXECUTE, EXECUTE_BATCH,
    EXECUTE_NOOP, GET_NONCE,
};
use crate::error::{PipelineError, Result};
use crate::ledger::Ledger;
use crate::oracle::{predict, AddressOracle};
use crate::types::UserOperation;
use ethers::abi::Token;
use ethers::types::{Address, Bytes, U256};
use std::sync::Arc;

/// Where the operation's sender comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SenderSpec {
    /// An account address the caller already knows.
    Known(Address),
    /// The factory's `counter`-th deployment. `None` reads the live counter.
    Counterfactual { counter: Option<u64> },
}

/// Calling convention of the account factory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FactoryCall {
    /// `createAccount(address owner)`
    #[default]
    Owner,
    /// `createAccount(address owner, uint256 salt)`
    OwnerWithSalt(U256),
}

impl FactoryCall {
    pub fn encode(&self, owner: Address) -> Bytes {
        match self {
            FactoryCall::Owner => encode_call(CREATE_ACCOUNT, &[Token::Address(owner)]),
            FactoryCall::OwnerWithSalt(salt) => encode_call(
                CREATE_ACCOUNT_WITH_SALT,
                &[Token::Address(owner), Token::Uint(*salt)],
            ),
        }
    }
}

/// What the account should do once validated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TargetCall {
    /// `execute()`, useful for a deploy-only operation.
    Noop,
    /// `execute(address dest, uint256 value, bytes func)`
    Execute {
        dest: Address,
        value: U256,
        func: Bytes,
    },
    /// `executeBatch(address[] dest, bytes[] func)`
    ExecuteBatch { dest: Vec<Address>, func: Vec<Bytes> },
    /// Account calldata passed through verbatim.
    Raw(Bytes),
}

impl TargetCall {
    pub fn encode(&self) -> Result<Bytes> {
        Ok(match self {
            TargetCall::Noop => encode_call(EXECUTE_NOOP, &[]),
            TargetCall::Execute { dest, value, func } => encode_call(
                EXECUTE,
                &[
                    Token::Address(*dest),
                    Token::Uint(*value),
                    Token::Bytes(func.to_vec()),
                ],
            ),
            TargetCall::ExecuteBatch { dest, func } => {
                if dest.len() != func.len() {
                    return Err(PipelineError::Encoding(format!(
                        "executeBatch needs one call per destination ({} dest, {} func)",
                        dest.len(),
                        func.len()
                    )));
                }
                encode_call(
                    EXECUTE_BATCH,
                    &[
                        Token::Array(dest.iter().copied().map(Token::Address).collect()),
                        Token::Array(func.iter().map(|f| Token::Bytes(f.to_vec())).collect()),
                    ],
                )
            }
            TargetCall::Raw(data) => data.clone(),
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GasLimits {
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
}

/// Everything the caller decides about an operation. The rest is read from the ledger.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Intent {
    pub owner: Address,
    pub sender: SenderSpec,
    pub target: TargetCall,
    /// Nonce key (`uint192`). Zero unless the account uses parallel nonce lanes.
    pub nonce_key: U256,
    /// Sponsor data, copied verbatim into `paymaster_and_data`.
    pub paymaster_and_data: Option<Bytes>,
    pub gas: GasLimits,
    /// Cross-check a predicted sender against the EntryPoint's `getSenderAddress`.
    pub confirm_sender: bool,
}

impl Intent {
    pub fn new(owner: Address, sender: SenderSpec, target: TargetCall) -> Self {
        Self {
            owner,
            sender,
            target,
            nonce_key: U256::zero(),
            paymaster_and_data: None,
            gas: GasLimits::default(),
            confirm_sender: false,
        }
    }

    pub fn with_nonce_key(mut self, key: U256) -> Self {
        self.nonce_key = key;
        self
    }

    pub fn with_paymaster(mut self, paymaster_and_data: Bytes) -> Self {
        self.paymaster_and_data = Some(paymaster_and_data);
        self
    }

    pub fn with_gas(mut self, gas: GasLimits) -> Self {
        self.gas = gas;
        self
    }

    pub fn with_sender_confirmation(mut self) -> Self {
        self.confirm_sender = true;
        self
    }
}

/// Turns an [`Intent`] into a well-formed, unsigned, unpriced [`UserOperation`].
pub struct OperationBuilder<L: ?Sized> {
    ledger: Arc<L>,
    oracle: AddressOracle<L>,
    entry_point: Address,
    factory: Address,
    factory_call: FactoryCall,
}

impl<L: Ledger + ?Sized> OperationBuilder<L> {
    pub fn new(ledger: Arc<L>, config: &DeploymentConfig) -> Self {
        Self {
            oracle: AddressOracle::new(ledger.clone(), config.entry_point),
            ledger,
            entry_point: config.entry_point,
            factory: config.factory,
            factory_call: FactoryCall::default(),
        }
    }

    pub fn with_factory_call(mut self, factory_call: FactoryCall) -> Self {
        self.factory_call = factory_call;
        self
    }

    pub fn oracle(&self) -> &AddressOracle<L> {
        &self.oracle
    }

    /// `factory ++ createAccount(...)`, as the EntryPoint expects it.
    pub fn init_code(&self, owner: Address) -> Bytes {
        let create_calldata = self.factory_call.encode(owner);
        let mut v = Vec::with_capacity(20 + create_calldata.len());
        v.extend_from_slice(self.factory.as_bytes());
        v.extend_from_slice(create_calldata.as_ref());
        Bytes::from(v)
    }

    /// Next nonce for `sender` in lane `key`, straight from the EntryPoint.
    pub async fn nonce(&self, sender: Address, key: U256) -> Result<U256> {
        if key.bits() > 192 {
            return Err(PipelineError::Encoding(format!(
                "nonce key {key:#x} does not fit in uint192"
            )));
        }
        let data = encode_call(GET_NONCE, &[Token::Address(sender), Token::Uint(key)]);
        let out = self.ledger.call(self.entry_point, data).await?;
        Ok(encoding::decode_uint(&out)?)
    }

    pub async fn build(&self, intent: &Intent) -> Result<UserOperation> {
        let sender = match intent.sender {
            SenderSpec::Known(address) => address,
            SenderSpec::Counterfactual { counter } => {
                let counter = match counter {
                    Some(c) => c,
                    None => self.oracle.current_counter(self.factory).await?,
                };
                predict(self.factory, counter)
            }
        };

        let init_code = if self.oracle.is_deployed(sender).await? {
            Bytes::new()
        } else {
            let init_code = self.init_code(intent.owner);
            if intent.confirm_sender {
                let confirmed = self
                    .oracle
                    .predict_via_simulated_revert(init_code.clone())
                    .await?;
                if confirmed != sender {
                    return Err(PipelineError::AddressResolution(format!(
                        "predicted sender {sender:?} but EntryPoint would deploy {confirmed:?}"
                    )));
                }
            }
            tracing::info!(
                sender = ?sender,
                factory = ?self.factory,
                "account not deployed; attaching initCode"
            );
            init_code
        };

        let call_data = intent.target.encode()?;
        let nonce = self.nonce(sender, intent.nonce_key).await?;
        tracing::debug!(sender = ?sender, nonce = %nonce, "built user operation");

        Ok(UserOperation {
            sender,
            nonce,
            init_code,
            call_data,
            call_gas_limit: intent.gas.call_gas_limit,
            verification_gas_limit: intent.gas.verification_gas_limit,
            pre_verification_gas: intent.gas.pre_verification_gas,
            max_fee_per_gas: U256::zero(),
            max_priority_fee_per_gas: U256::zero(),
            paymaster_and_data: intent.paymaster_and_data.clone().unwrap_or_default(),
            signature: Bytes::new(),
        })
    }
}
