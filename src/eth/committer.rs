//! Signed transaction submitter for the Ethereum side
//!
//! All outbound Ethereum transactions go through here. Submission for a
//! given account is serialized through the [`NonceCache`] so the reserve ->
//! build -> sign -> broadcast region is exclusive, keeping the account's
//! nonce stream gap-free.

use super::nonce::NonceCache;
use super::provider::EthereumRpc;
use crate::error::{is_nonce_too_low_err, OrchestratorError, OrchestratorResult};

use ethers::prelude::*;
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Extra headroom on top of the node's gas estimate
const GAS_LIMIT_BUFFER_PERCENT: u64 = 20;
/// Attempts per submission; only nonce-too-low triggers another attempt
const MAX_SUBMIT_ATTEMPTS: u32 = 3;

pub struct EthCommitter {
    provider: Arc<dyn EthereumRpc>,
    nonce_cache: Arc<NonceCache>,
    wallet: LocalWallet,
    from_address: Address,
    gas_price_adjustment: f64,
    max_gas_price: U256,
}

impl EthCommitter {
    pub fn new(
        provider: Arc<dyn EthereumRpc>,
        nonce_cache: Arc<NonceCache>,
        wallet: LocalWallet,
        chain_id: u64,
        gas_price_adjustment: f64,
        max_gas_price_gwei: u64,
    ) -> Self {
        let wallet = wallet.with_chain_id(chain_id);
        let from_address = wallet.address();
        Self {
            provider,
            nonce_cache,
            wallet,
            from_address,
            gas_price_adjustment,
            max_gas_price: U256::from(max_gas_price_gwei) * U256::exp10(9),
        }
    }

    pub fn from_address(&self) -> Address {
        self.from_address
    }

    pub fn provider(&self) -> Arc<dyn EthereumRpc> {
        self.provider.clone()
    }

    /// Suggested gas price scaled by the configured adjustment, capped at
    /// the configured ceiling.
    pub async fn adjusted_gas_price(&self) -> OrchestratorResult<U256> {
        let suggested = self.provider.gas_price().await?;
        let adjusted = (suggested.as_u128() as f64 * self.gas_price_adjustment) as u128;
        Ok(std::cmp::min(U256::from(adjusted), self.max_gas_price))
    }

    /// Build, sign and broadcast a transaction to `to` carrying `calldata`.
    ///
    /// Runs entirely inside the account's serialize lock. On a successful
    /// broadcast the reserved nonce is kept; on a nonce-too-low rejection
    /// the cache is re-synced from the node and the send retried; on any
    /// other failure the reserved nonce is handed back.
    pub async fn submit_tx(&self, to: Address, calldata: Vec<u8>) -> OrchestratorResult<H256> {
        let account = self.from_address;
        self.nonce_cache
            .serialize(account, || async {
                let gas_price = self.adjusted_gas_price().await?;

                let estimate_tx: TypedTransaction = TransactionRequest::new()
                    .from(account)
                    .to(to)
                    .data(calldata.clone())
                    .gas_price(gas_price)
                    .into();
                let gas_estimate = self.provider.estimate_gas(&estimate_tx).await?;
                let gas_limit = gas_estimate + gas_estimate * GAS_LIMIT_BUFFER_PERCENT / 100;

                let (_, loaded) = self.nonce_cache.get(account);
                if !loaded {
                    self.sync_nonce(account).await?;
                }

                let mut attempts = 0;
                loop {
                    attempts += 1;

                    let (nonce, _) = self.nonce_cache.get(account);
                    self.nonce_cache.incr(account);

                    let tx: TypedTransaction = TransactionRequest::new()
                        .from(account)
                        .to(to)
                        .data(calldata.clone())
                        .gas(gas_limit)
                        .gas_price(gas_price)
                        .nonce(nonce)
                        .into();

                    let signature = self
                        .wallet
                        .sign_transaction(&tx)
                        .await
                        .map_err(|e| OrchestratorError::Wallet(e.to_string()))?;
                    let raw = tx.rlp_signed(&signature);

                    match self.provider.send_raw_transaction(raw).await {
                        Ok(hash) => {
                            info!(
                                "sent Ethereum tx {:?} from {:?} with nonce {}",
                                hash, account, nonce
                            );
                            return Ok(hash);
                        }
                        Err(e) => {
                            let message = e.to_string();
                            if is_nonce_too_low_err(&message) && attempts < MAX_SUBMIT_ATTEMPTS {
                                warn!(
                                    "nonce {} too low for {:?}, resyncing from node",
                                    nonce, account
                                );
                                self.sync_nonce(account).await?;
                                continue;
                            }

                            // broadcast never happened, give the nonce back
                            let restored = self.nonce_cache.decr(account);
                            debug!("returned nonce {} to cache for {:?}", restored, account);
                            return Err(e);
                        }
                    }
                }
            })
            .await
    }

    async fn sync_nonce(&self, account: Address) -> OrchestratorResult<()> {
        let provider = self.provider.clone();
        self.nonce_cache
            .sync(account, || async move { provider.pending_nonce(account).await })
            .await
            .map_err(|e| OrchestratorError::Nonce {
                account: format!("{:?}", account),
                message: e.to_string(),
            })
    }
}
