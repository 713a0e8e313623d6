//! Client-side ERC-4337 (EntryPoint v0.6) operation pipeline: predict a smart
//! account's address, build and price a UserOperation, sign it, and submit it
//! to the EntryPoint directly with `handleOps`.

pub mod builder;
pub mod config;
pub mod encoding;
pub mod error;
pub mod fees;
pub mod ledger;
pub mod oracle;
pub mod pipeline;
pub mod revert;
pub mod signer;
pub mod submit;
pub mod types;

pub use builder::{FactoryCall, GasLimits, Intent, OperationBuilder, SenderSpec, TargetCall};
pub use config::{load_deployment, DeploymentConfig};
pub use error::{LedgerError, PipelineError, Result, UndecodableRevert};
pub use fees::{FeeEstimator, FeePolicy};
pub use ledger::{EthersLedger, Ledger, ReceiptWait};
pub use oracle::{predict, AddressOracle};
pub use pipeline::Pipeline;
pub use revert::{decode_address, decode_reason, RawRevert};
pub use signer::{user_op_hash, OperationSigner};
pub use submit::SubmissionClient;
pub use types::{
    Account, DeploymentStatus, GasFees, OperationOutcome, Receipt, SignedUserOperation,
    UserOperation,
};
