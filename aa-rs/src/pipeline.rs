use crate::builder::{FactoryCall, Intent, OperationBuilder};
use crate::config::DeploymentConfig;
use crate::error::{PipelineError, Result};
use crate::fees::{FeeEstimator, FeePolicy};
use crate::ledger::{Ledger, ReceiptWait};
use crate::signer::OperationSigner;
use crate::submit::SubmissionClient;
use crate::types::{Receipt, SignedUserOperation, UserOperation};
use ethers::signers::LocalWallet;
use ethers::types::Address;
use std::sync::Arc;

/// Build, price, sign and submit in one place, for one owner key.
///
/// Every stage reads fresh ledger state; nothing is cached between calls.
pub struct Pipeline<L: ?Sized> {
    builder: OperationBuilder<L>,
    fees: FeeEstimator<L>,
    signer: OperationSigner,
    client: SubmissionClient<L>,
    ledger: Arc<L>,
    beneficiary: Option<Address>,
    confirm_hash: bool,
}

impl<L: Ledger + ?Sized> Pipeline<L> {
    pub fn new(
        ledger: Arc<L>,
        config: &DeploymentConfig,
        wallet: LocalWallet,
        policy: FeePolicy,
    ) -> Self {
        Self {
            builder: OperationBuilder::new(ledger.clone(), config),
            fees: FeeEstimator::new(ledger.clone(), policy),
            signer: OperationSigner::new(wallet, config.entry_point, config.chain_id),
            client: SubmissionClient::new(ledger.clone(), config.entry_point),
            ledger,
            beneficiary: config.beneficiary,
            confirm_hash: false,
        }
    }

    pub fn with_factory_call(mut self, factory_call: FactoryCall) -> Self {
        self.builder = self.builder.with_factory_call(factory_call);
        self
    }

    pub fn with_wait(mut self, wait: ReceiptWait) -> Self {
        self.client = self.client.with_wait(wait);
        self
    }

    /// Check each hash against the EntryPoint's `getUserOpHash` before signing.
    pub fn with_hash_confirmation(mut self) -> Self {
        self.confirm_hash = true;
        self
    }

    pub fn builder(&self) -> &OperationBuilder<L> {
        &self.builder
    }

    pub fn fees(&self) -> &FeeEstimator<L> {
        &self.fees
    }

    pub fn signer(&self) -> &OperationSigner {
        &self.signer
    }

    pub fn client(&self) -> &SubmissionClient<L> {
        &self.client
    }

    /// Builds and prices an operation without signing it.
    pub async fn prepare(&self, intent: &Intent) -> Result<UserOperation> {
        let op = self.builder.build(intent).await?;
        self.fees.price(op).await
    }

    pub async fn sign(&self, op: UserOperation) -> Result<SignedUserOperation> {
        if self.confirm_hash {
            self.signer
                .confirm_with_dispatcher(self.ledger.as_ref(), &op)
                .await?;
        }
        self.signer.sign(op)
    }

    /// Full round trip for a single intent.
    pub async fn send(&self, intent: &Intent) -> Result<Receipt> {
        let op = self.prepare(intent).await?;
        let signed = self.sign(op).await?;
        let beneficiary = self.beneficiary()?;
        self.client.submit(&[signed], beneficiary).await
    }

    /// Configured beneficiary, else the ledger's own sending key.
    pub fn beneficiary(&self) -> Result<Address> {
        self.beneficiary
            .or_else(|| self.ledger.sender())
            .ok_or_else(|| {
                PipelineError::AddressResolution(
                    "no beneficiary configured and the ledger has no sender".into(),
                )
            })
    }
}
