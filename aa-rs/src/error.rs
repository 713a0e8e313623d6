use crate::revert::{decode_reason, RawRevert};
use ethers::types::H256;
use thiserror::Error;

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

/// Failure surfaced by the ledger boundary.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// A call or transaction was rejected by the EVM. The payload is kept so
    /// callers can decode it further.
    #[error("reverted: {}", decode_reason(.0))]
    Reverted(RawRevert),

    #[error("transaction {0:?} dropped before inclusion")]
    Dropped(H256),

    #[error("timed out waiting for transaction {0:?}")]
    Timeout(H256),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Neither the structural nor the textual strategy found an address.
#[derive(Debug, Clone, Error)]
#[error("undecodable revert: {reason}")]
pub struct UndecodableRevert {
    pub reason: String,
    pub raw: RawRevert,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("address resolution failed: {0}")]
    AddressResolution(String),

    #[error(transparent)]
    UndecodableRevert(#[from] UndecodableRevert),

    #[error("fee data unavailable: {0}")]
    FeeUnavailable(String),

    /// `tx_hash` is set when the conflict was only seen after inclusion.
    #[error("nonce conflict in op #{op_index}: {reason}")]
    NonceConflict {
        op_index: usize,
        reason: String,
        tx_hash: Option<H256>,
    },

    #[error("submission reverted: {reason}")]
    SubmissionReverted {
        reason: String,
        raw: Option<RawRevert>,
        tx_hash: Option<H256>,
    },

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("cannot submit an empty batch")]
    EmptyBatch,

    #[error("no receipt for {0:?} yet; re-query its status before resubmitting")]
    ReceiptTimeout(H256),

    #[error("abi encoding error: {0}")]
    Encoding(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl PipelineError {
    /// Whether retrying the same step (without rebuilding the operation) can help.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::FeeUnavailable(_)
                | PipelineError::ReceiptTimeout(_)
                | PipelineError::Ledger(LedgerError::Transport(_))
        )
    }

    /// Human-readable reason, decoded from the revert payload when one exists.
    pub fn reason(&self) -> String {
        match self {
            PipelineError::UndecodableRevert(e) => e.reason.clone(),
            PipelineError::NonceConflict { reason, .. }
            | PipelineError::SubmissionReverted { reason, .. } => reason.clone(),
            PipelineError::Ledger(LedgerError::Reverted(raw)) => decode_reason(raw),
            other => other.to_string(),
        }
    }
}

impl From<ethers::abi::Error> for PipelineError {
    fn from(e: ethers::abi::Error) -> Self {
        PipelineError::Encoding(e.to_string())
    }
}
