//! The ledger boundary: read calls, code and nonce reads, fee conditions, and
//! submit-and-wait. Everything above this trait is network-agnostic.

#[cfg(test)]
pub(crate) mod mock;

use crate::error::LedgerError;
use crate::revert::RawRevert;
use crate::types::FeeConditions;
use async_trait::async_trait;
use ethers::providers::{Middleware, MiddlewareError};
use ethers::types::{
    transaction::eip2718::TypedTransaction, Address, BlockNumber, Bytes, Log, TransactionReceipt,
    TransactionRequest, H256, U256, U64,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Handle to a submitted transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TxHandle {
    pub hash: H256,
}

/// How long to wait for inclusion and how often to poll.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReceiptWait {
    /// Zero disables the timeout.
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ReceiptWait {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(180),
            poll_interval: Duration::from_millis(1500),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LedgerReceipt {
    pub tx_hash: H256,
    pub success: bool,
    pub gas_used: U256,
    pub logs: Vec<Log>,
}

impl From<TransactionReceipt> for LedgerReceipt {
    fn from(r: TransactionReceipt) -> Self {
        Self {
            tx_hash: r.transaction_hash,
            success: r.status == Some(U64::from(1)),
            gas_used: r.gas_used.unwrap_or_default(),
            logs: r.logs,
        }
    }
}

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn chain_id(&self) -> Result<u64, LedgerError>;

    /// Read-only call. A revert comes back as [`LedgerError::Reverted`] with its payload.
    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, LedgerError>;

    async fn get_code(&self, address: Address) -> Result<Bytes, LedgerError>;

    /// The account's transaction count; for contracts, the next CREATE nonce.
    async fn transaction_count(&self, address: Address) -> Result<U256, LedgerError>;

    async fn fee_conditions(&self) -> Result<FeeConditions, LedgerError>;

    /// Signs and broadcasts a state-changing call from the ledger's own key.
    async fn send_transaction(
        &self,
        to: Address,
        data: Bytes,
        value: U256,
    ) -> Result<TxHandle, LedgerError>;

    /// Suspends until the transaction is included or `wait.timeout` passes.
    async fn await_receipt(
        &self,
        handle: TxHandle,
        wait: ReceiptWait,
    ) -> Result<LedgerReceipt, LedgerError>;

    /// Address transactions are sent from, if the ledger signs.
    fn sender(&self) -> Option<Address>;
}

/// [`Ledger`] over any ethers middleware stack (typically a `SignerMiddleware`).
#[derive(Debug, Clone)]
pub struct EthersLedger<M> {
    client: Arc<M>,
}

impl<M: Middleware + 'static> EthersLedger<M> {
    pub fn new(client: Arc<M>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Arc<M> {
        &self.client
    }
}

fn from_middleware_error<E: MiddlewareError>(err: E) -> LedgerError {
    if let Some(resp) = err.as_error_response() {
        if let Some(data) = resp.as_revert_data() {
            return LedgerError::Reverted(RawRevert::new(data, resp.message.clone()));
        }
        if resp.message.contains("revert") {
            return LedgerError::Reverted(RawRevert::from_message(resp.message.clone()));
        }
    }
    LedgerError::Transport(err.to_string())
}

#[async_trait]
impl<M: Middleware + 'static> Ledger for EthersLedger<M> {
    async fn chain_id(&self) -> Result<u64, LedgerError> {
        let id = self
            .client
            .get_chainid()
            .await
            .map_err(from_middleware_error)?;
        Ok(id.as_u64())
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, LedgerError> {
        let tx: TypedTransaction = TransactionRequest::new().to(to).data(data).into();
        self.client
            .call(&tx, None)
            .await
            .map_err(from_middleware_error)
    }

    async fn get_code(&self, address: Address) -> Result<Bytes, LedgerError> {
        self.client
            .get_code(address, None)
            .await
            .map_err(from_middleware_error)
    }

    async fn transaction_count(&self, address: Address) -> Result<U256, LedgerError> {
        self.client
            .get_transaction_count(address, None)
            .await
            .map_err(from_middleware_error)
    }

    async fn fee_conditions(&self) -> Result<FeeConditions, LedgerError> {
        let block = self
            .client
            .get_block(BlockNumber::Latest)
            .await
            .map_err(from_middleware_error)?
            .ok_or_else(|| LedgerError::Transport("latest block not available".into()))?;
        let base_fee = block.base_fee_per_gas.ok_or_else(|| {
            LedgerError::Transport("latest block has no base fee (pre-London chain?)".into())
        })?;

        let suggested_priority_fee = match self
            .client
            .provider()
            .request::<_, U256>("eth_maxPriorityFeePerGas", ())
            .await
        {
            Ok(fee) => fee,
            Err(e) => {
                // Not every node implements it; derive from the legacy gas price.
                tracing::debug!(
                    error = %e,
                    "eth_maxPriorityFeePerGas unavailable; using gasPrice - baseFee"
                );
                let gas_price = self
                    .client
                    .get_gas_price()
                    .await
                    .map_err(from_middleware_error)?;
                gas_price.saturating_sub(base_fee)
            }
        };

        Ok(FeeConditions {
            base_fee,
            suggested_priority_fee,
        })
    }

    async fn send_transaction(
        &self,
        to: Address,
        data: Bytes,
        value: U256,
    ) -> Result<TxHandle, LedgerError> {
        let tx = TransactionRequest::new().to(to).data(data).value(value);
        let pending = self
            .client
            .send_transaction(tx, None)
            .await
            .map_err(from_middleware_error)?;
        Ok(TxHandle {
            hash: pending.tx_hash(),
        })
    }

    async fn await_receipt(
        &self,
        handle: TxHandle,
        wait: ReceiptWait,
    ) -> Result<LedgerReceipt, LedgerError> {
        let start = Instant::now();
        loop {
            match self.client.get_transaction_receipt(handle.hash).await {
                Ok(Some(receipt)) => return Ok(receipt.into()),
                Ok(None) => {}
                Err(e) => {
                    // transient errors are common on public RPCs; keep polling
                    tracing::warn!(tx = ?handle.hash, error = %e, "receipt poll error");
                }
            }

            if !wait.timeout.is_zero() && start.elapsed() > wait.timeout {
                return Err(LedgerError::Timeout(handle.hash));
            }

            tokio::time::sleep(wait.poll_interval).await;
        }
    }

    fn sender(&self) -> Option<Address> {
        self.client.default_sender()
    }
}
