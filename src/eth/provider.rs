//! Ethereum JSON-RPC provider wrapper
//!
//! Every external call takes a per-call timeout so no loop can block
//! unboundedly on a stuck node.

use crate::error::{OrchestratorError, OrchestratorResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::types::transaction::eip2718::TypedTransaction;
use std::time::Duration;
use tokio::time::timeout;

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// The set of node capabilities the orchestrator consumes. Implemented by
/// [`EthProvider`] in production and by mocks in tests.
#[async_trait]
pub trait EthereumRpc: Send + Sync {
    async fn get_block_number(&self) -> OrchestratorResult<u64>;
    async fn get_logs(&self, filter: &Filter) -> OrchestratorResult<Vec<Log>>;
    async fn get_transaction(&self, hash: H256) -> OrchestratorResult<Option<Transaction>>;
    async fn get_transaction_receipt(
        &self,
        hash: H256,
    ) -> OrchestratorResult<Option<TransactionReceipt>>;
    /// Pending nonce for an account, including mempool transactions
    async fn pending_nonce(&self, account: Address) -> OrchestratorResult<u64>;
    async fn gas_price(&self) -> OrchestratorResult<U256>;
    async fn estimate_gas(&self, tx: &TypedTransaction) -> OrchestratorResult<U256>;
    async fn call(&self, tx: &TypedTransaction) -> OrchestratorResult<Bytes>;
    async fn send_raw_transaction(&self, raw: Bytes) -> OrchestratorResult<H256>;
}

/// HTTP provider used in production
pub struct EthProvider {
    inner: Provider<Http>,
    call_timeout: Duration,
}

impl EthProvider {
    pub fn new(rpc_url: &str) -> OrchestratorResult<Self> {
        let inner = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| OrchestratorError::Config(format!("Invalid eth_rpc url: {}", e)))?
            .interval(Duration::from_millis(100));

        Ok(Self {
            inner,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    async fn bounded<T, F>(&self, operation: &str, fut: F) -> OrchestratorResult<T>
    where
        F: std::future::Future<Output = Result<T, ProviderError>> + Send,
    {
        match timeout(self.call_timeout, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(OrchestratorError::EthRpc(e.to_string())),
            Err(_) => Err(OrchestratorError::Timeout {
                operation: operation.to_string(),
            }),
        }
    }
}

#[async_trait]
impl EthereumRpc for EthProvider {
    async fn get_block_number(&self) -> OrchestratorResult<u64> {
        self.bounded("eth_blockNumber", self.inner.get_block_number())
            .await
            .map(|n| n.as_u64())
    }

    async fn get_logs(&self, filter: &Filter) -> OrchestratorResult<Vec<Log>> {
        self.bounded("eth_getLogs", self.inner.get_logs(filter)).await
    }

    async fn get_transaction(&self, hash: H256) -> OrchestratorResult<Option<Transaction>> {
        self.bounded("eth_getTransactionByHash", self.inner.get_transaction(hash))
            .await
    }

    async fn get_transaction_receipt(
        &self,
        hash: H256,
    ) -> OrchestratorResult<Option<TransactionReceipt>> {
        self.bounded(
            "eth_getTransactionReceipt",
            self.inner.get_transaction_receipt(hash),
        )
        .await
    }

    async fn pending_nonce(&self, account: Address) -> OrchestratorResult<u64> {
        self.bounded(
            "eth_getTransactionCount",
            self.inner
                .get_transaction_count(account, Some(BlockNumber::Pending.into())),
        )
        .await
        .map(|n| n.as_u64())
    }

    async fn gas_price(&self) -> OrchestratorResult<U256> {
        self.bounded("eth_gasPrice", self.inner.get_gas_price()).await
    }

    async fn estimate_gas(&self, tx: &TypedTransaction) -> OrchestratorResult<U256> {
        self.bounded("eth_estimateGas", self.inner.estimate_gas(tx, None))
            .await
    }

    async fn call(&self, tx: &TypedTransaction) -> OrchestratorResult<Bytes> {
        self.bounded("eth_call", self.inner.call(tx, None)).await
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> OrchestratorResult<H256> {
        match timeout(self.call_timeout, self.inner.send_raw_transaction(raw)).await {
            Ok(Ok(pending)) => Ok(pending.tx_hash()),
            Ok(Err(e)) => Err(OrchestratorError::EthRpc(e.to_string())),
            Err(_) => Err(OrchestratorError::Timeout {
                operation: "eth_sendRawTransaction".to_string(),
            }),
        }
    }
}
