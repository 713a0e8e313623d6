use crate::encoding::{encode_call, GET_SENDER_ADDRESS};
use crate::error::{LedgerError, PipelineError, Result};
use crate::ledger::Ledger;
use crate::revert::decode_address;
use crate::types::{Account, DeploymentStatus};
use ethers::abi::Token;
use ethers::types::{Address, Bytes, U256};
use ethers::utils::get_contract_address;
use std::sync::Arc;

/// Address the factory's `counter`-th CREATE will land at.
///
/// This is the ledger's own rule (`keccak256(rlp([factory, counter]))[12..]`).
/// A contract's first CREATE uses counter 1.
pub fn predict(factory: Address, counter: u64) -> Address {
    get_contract_address(factory, counter)
}

/// Forecasts and observes smart-account addresses.
///
/// `predict` is pure; everything else reads the ledger. Only observed code is
/// authoritative for deployment status.
pub struct AddressOracle<L: ?Sized> {
    ledger: Arc<L>,
    entry_point: Address,
}

impl<L: Ledger + ?Sized> AddressOracle<L> {
    pub fn new(ledger: Arc<L>, entry_point: Address) -> Self {
        Self {
            ledger,
            entry_point,
        }
    }

    /// The factory's live CREATE nonce, i.e. the counter its next deployment uses.
    pub async fn current_counter(&self, factory: Address) -> Result<u64> {
        let count = self.ledger.transaction_count(factory).await?;
        if count > U256::from(u64::MAX) {
            return Err(PipelineError::AddressResolution(format!(
                "factory nonce {count} does not fit in u64"
            )));
        }
        Ok(count.as_u64())
    }

    pub async fn status(&self, address: Address) -> Result<DeploymentStatus> {
        let code = self.ledger.get_code(address).await?;
        Ok(DeploymentStatus::from_code(&code))
    }

    pub async fn is_deployed(&self, address: Address) -> Result<bool> {
        Ok(self.status(address).await?.is_deployed())
    }

    pub async fn account(&self, factory: Address, counter: u64, owner: Address) -> Result<Account> {
        let address = predict(factory, counter);
        let status = self.status(address).await?;
        tracing::debug!(
            factory = ?factory,
            counter,
            address = ?address,
            ?status,
            "predicted account"
        );
        Ok(Account {
            address,
            owner,
            status,
        })
    }

    /// Asks the EntryPoint where `init_code` would deploy via `getSenderAddress`.
    ///
    /// The view always reverts; the address is carried in the revert payload.
    pub async fn predict_via_simulated_revert(&self, init_code: Bytes) -> Result<Address> {
        let data = encode_call(GET_SENDER_ADDRESS, &[Token::Bytes(init_code.to_vec())]);
        match self.ledger.call(self.entry_point, data).await {
            Ok(out) => Err(PipelineError::AddressResolution(format!(
                "getSenderAddress returned without reverting (0x{})",
                hex::encode(&out)
            ))),
            Err(LedgerError::Reverted(raw)) => decode_address(&raw).map_err(|e| {
                tracing::debug!(reason = %e.reason, "getSenderAddress revert not decodable");
                PipelineError::AddressResolution(e.reason)
            }),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::CREATE_ACCOUNT;
    use crate::ledger::mock::MockLedger;

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    #[test]
    fn predicts_hardhat_deployment_addresses() {
        let deployer = addr("0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266");
        assert_eq!(
            predict(deployer, 0),
            addr("0x5FbDB2315678afecb367f032d93F642f64180aa3")
        );
        assert_eq!(
            predict(deployer, 1),
            addr("0xe7f1725E7734CE288F8367e1Bb143E90bb3F0512")
        );
    }

    #[test]
    fn prediction_is_pure_and_counter_sensitive() {
        let factory = addr("0xe7f1725E7734CE288F8367e1Bb143E90bb3F0512");
        assert_eq!(predict(factory, 1), predict(factory, 1));
        assert_ne!(predict(factory, 1), predict(factory, 2));
        assert_ne!(predict(factory, 1), predict(Address::repeat_byte(1), 1));
    }

    #[tokio::test]
    async fn fresh_factory_counter_and_undeployed_account() {
        let ledger = Arc::new(MockLedger::new());
        let oracle = AddressOracle::new(ledger.clone(), ledger.entry_point);

        let counter = oracle.current_counter(ledger.factory).await.unwrap();
        assert_eq!(counter, 1);

        let owner = Address::repeat_byte(0x0a);
        let account = oracle.account(ledger.factory, counter, owner).await.unwrap();
        assert_eq!(account.address, predict(ledger.factory, 1));
        assert_eq!(account.status, DeploymentStatus::Undeployed);
        assert!(!oracle.is_deployed(account.address).await.unwrap());
        assert!(oracle.is_deployed(ledger.entry_point).await.unwrap());
    }

    #[tokio::test]
    async fn simulated_revert_agrees_with_local_prediction() {
        let ledger = Arc::new(MockLedger::new());
        let oracle = AddressOracle::new(ledger.clone(), ledger.entry_point);

        let mut init_code = ledger.factory.as_bytes().to_vec();
        init_code.extend_from_slice(&encode_call(
            CREATE_ACCOUNT,
            &[Token::Address(Address::repeat_byte(0x0a))],
        ));
        let via_revert = oracle
            .predict_via_simulated_revert(init_code.into())
            .await
            .unwrap();
        assert_eq!(via_revert, predict(ledger.factory, 1));
    }

    #[tokio::test]
    async fn undecodable_revert_is_an_address_resolution_error() {
        let ledger = Arc::new(MockLedger::new());
        let oracle = AddressOracle::new(ledger.clone(), ledger.entry_point);

        let err = oracle
            .predict_via_simulated_revert(Bytes::from(vec![0x01, 0x02]))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::AddressResolution(ref r) if r.contains("AA13")));
    }
}
