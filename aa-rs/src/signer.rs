use crate::encoding::{self, GET_USER_OP_HASH};
use crate::error::{PipelineError, Result};
use crate::ledger::Ledger;
use crate::types::{SignedUserOperation, UserOperation};
use ethers::abi::{encode, Token};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes, Signature, H256};
use ethers::utils::{hash_message, keccak256};

/// Packs every field except the signature, hashing the dynamic ones, in the
/// order the EntryPoint v0.6 uses.
pub fn pack(op: &UserOperation) -> Bytes {
    encode(&[
        Token::Address(op.sender),
        Token::Uint(op.nonce),
        Token::FixedBytes(keccak256(&op.init_code).to_vec()),
        Token::FixedBytes(keccak256(&op.call_data).to_vec()),
        Token::Uint(op.call_gas_limit),
        Token::Uint(op.verification_gas_limit),
        Token::Uint(op.pre_verification_gas),
        Token::Uint(op.max_fee_per_gas),
        Token::Uint(op.max_priority_fee_per_gas),
        Token::FixedBytes(keccak256(&op.paymaster_and_data).to_vec()),
    ])
    .into()
}

/// Hash a user operation with the given entry point and chain ID.
///
/// Binding both means a signature cannot be replayed against another EntryPoint
/// deployment or another network.
pub fn user_op_hash(op: &UserOperation, entry_point: Address, chain_id: u64) -> H256 {
    keccak256(encode(&[
        Token::FixedBytes(keccak256(pack(op)).to_vec()),
        Token::Address(entry_point),
        Token::Uint(chain_id.into()),
    ]))
    .into()
}

/// EIP-191 personal-message signature over the 32 digest bytes. Local and
/// deterministic (RFC 6979).
pub fn sign_digest(digest: H256, wallet: &LocalWallet) -> Result<Signature> {
    if digest.is_zero() {
        return Err(PipelineError::Signing("refusing to sign the zero digest".into()));
    }
    wallet
        .sign_hash(hash_message(digest.as_bytes()))
        .map_err(|e| PipelineError::Signing(e.to_string()))
}

/// Address that produced the operation's signature.
pub fn recover(signed: &SignedUserOperation) -> Result<Address> {
    let sig = Signature::try_from(signed.signature().as_ref())
        .map_err(|e| PipelineError::Signing(e.to_string()))?;
    sig.recover(signed.hash().as_bytes())
        .map_err(|e| PipelineError::Signing(e.to_string()))
}

/// Signs operations for one owner key against one EntryPoint on one chain.
#[derive(Debug, Clone)]
pub struct OperationSigner {
    wallet: LocalWallet,
    entry_point: Address,
    chain_id: u64,
}

impl OperationSigner {
    pub fn new(wallet: LocalWallet, entry_point: Address, chain_id: u64) -> Self {
        Self {
            wallet,
            entry_point,
            chain_id,
        }
    }

    /// The owner address the account will check signatures against.
    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    pub fn hash(&self, op: &UserOperation) -> H256 {
        user_op_hash(op, self.entry_point, self.chain_id)
    }

    /// Hashes and signs `op`. Any existing signature is replaced.
    pub fn sign(&self, mut op: UserOperation) -> Result<SignedUserOperation> {
        op.signature = Bytes::new();
        let hash = self.hash(&op);
        let sig = sign_digest(hash, &self.wallet)?;
        op.signature = Bytes::from(sig.to_vec());
        tracing::debug!(
            sender = ?op.sender,
            nonce = %op.nonce,
            hash = ?hash,
            "signed user operation"
        );
        Ok(SignedUserOperation::new(op, hash))
    }

    /// Checks the local hash against the EntryPoint's own `getUserOpHash`.
    pub async fn confirm_with_dispatcher<L: Ledger + ?Sized>(
        &self,
        ledger: &L,
        op: &UserOperation,
    ) -> Result<H256> {
        let local = self.hash(op);
        let data = encoding::encode_call(GET_USER_OP_HASH, &[op.to_token()]);
        let out = ledger.call(self.entry_point, data).await?;
        let remote = encoding::decode_h256(&out)?;
        if remote != local {
            return Err(PipelineError::Signing(format!(
                "local userOpHash {local:?} differs from EntryPoint {remote:?}; check entryPoint/chainId"
            )));
        }
        Ok(local)
    }
}
