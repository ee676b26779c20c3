//! Ethereum oracle loop
//!
//! Scans the bridge contract for new events and attests to them on the
//! sidechain, preserving total order by event nonce. Never scans closer to
//! head than the confirmation delay, so short reorgs cannot produce claims
//! for events that later vanish.

use crate::cosmos::broadcast::BroadcastClient;
use crate::cosmos::query::SidechainQuery;
use crate::error::{is_unknown_block_err, OrchestratorError, OrchestratorResult};
use crate::estimator::BatchGasEstimator;
use crate::eth::contract::BridgeContract;
use crate::eth::events::{self, BridgeEvent};
use crate::eth::provider::EthereumRpc;
use crate::types::Erc20Metadata;

use ethers::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub struct EthOracle {
    query: Arc<dyn SidechainQuery>,
    broadcast: Arc<BroadcastClient>,
    contract: Arc<BridgeContract>,
    provider: Arc<dyn EthereumRpc>,
    estimator: Arc<BatchGasEstimator>,
    blocks_per_loop: u64,
    confirmation_delay: u64,
    last_scanned: Mutex<u64>,
    /// ERC20 metadata for deposit claims, filled lazily from the contract
    metadata: Mutex<HashMap<Address, Erc20Metadata>>,
}

impl EthOracle {
    pub fn new(
        query: Arc<dyn SidechainQuery>,
        broadcast: Arc<BroadcastClient>,
        contract: Arc<BridgeContract>,
        estimator: Arc<BatchGasEstimator>,
        blocks_per_loop: u64,
        confirmation_delay: u64,
    ) -> Self {
        let provider = contract.provider();
        Self {
            query,
            broadcast,
            contract,
            provider,
            estimator,
            blocks_per_loop,
            confirmation_delay,
            last_scanned: Mutex::new(0),
            metadata: Mutex::new(HashMap::new()),
        }
    }

    /// Resume scanning from where this validator's attestations left off.
    /// A validator that has never attested starts at the finality horizon.
    pub async fn bootstrap(&self) -> OrchestratorResult<u64> {
        let last_event = self
            .query
            .last_event_by_addr(self.broadcast.orchestrator_address())
            .await?;

        let start = if last_event.ethereum_height > 0 {
            last_event.ethereum_height
        } else {
            let head = self.provider.get_block_number().await?;
            head.saturating_sub(self.confirmation_delay)
        };

        info!(
            "oracle starting from block {} (last attested nonce {})",
            start, last_event.event_nonce
        );
        *self.last_scanned.lock().await = start;
        Ok(start)
    }

    pub async fn run_iteration(&self) -> OrchestratorResult<()> {
        let last_observed = self
            .query
            .last_event_by_addr(self.broadcast.orchestrator_address())
            .await?;

        let head = self.provider.get_block_number().await?;
        let start = *self.last_scanned.lock().await;

        // wait for finality before touching new blocks
        let latest_allowed = head.saturating_sub(self.confirmation_delay);
        if latest_allowed < start {
            debug!(
                "head {} within confirmation delay of block {}, skipping scan",
                head, start
            );
            return Ok(());
        }

        // bound the catch-up so a long outage does not turn into one huge
        // filter query
        let end = std::cmp::min(start + self.blocks_per_loop, latest_allowed);

        let scanned = match self.scan_events(start, end).await {
            Ok(events) => events,
            Err(OrchestratorError::EthRpc(message)) if is_unknown_block_err(&message) => {
                // the filter crossed a reorg; rescan the same window next tick
                warn!("filter hit a reorg boundary, retrying next iteration: {}", message);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        for event in &scanned {
            crate::metrics::record_event_observed(event.name());
            // executed batches feed the gas estimator regardless of whether
            // we already attested to them
            if let BridgeEvent::BatchExecuted { token, tx_hash, .. } = event {
                self.estimator.record_executed(*token, *tx_hash);
            }
        }

        let fresh = events::filter_by_nonce(scanned, last_observed.event_nonce);
        let ordered = events::merge_by_nonce(fresh)?;

        if !ordered.is_empty() {
            debug!(
                "attesting {} events in range [{}, {}]",
                ordered.len(),
                start,
                end
            );
            let metadata = self.deposit_metadata(&ordered).await;
            self.broadcast
                .send_ethereum_claims(&ordered, &metadata)
                .await?;
            for event in &ordered {
                crate::metrics::record_claim_submitted(event.name());
            }
        }

        *self.last_scanned.lock().await = end;
        crate::metrics::record_last_scanned_block(end);
        Ok(())
    }

    async fn scan_events(&self, start: u64, end: u64) -> OrchestratorResult<Vec<BridgeEvent>> {
        use crate::eth::events::topics;

        let mut all = Vec::new();
        for topic in [
            *topics::SEND_TO_COSMOS,
            *topics::BATCH_EXECUTED,
            *topics::VALSET_UPDATED,
            *topics::ERC20_DEPLOYED,
        ] {
            let filter = Filter::new()
                .address(self.contract.address())
                .topic0(topic)
                .from_block(start)
                .to_block(end);

            let logs = self.provider.get_logs(&filter).await?;
            for log in logs {
                all.push(events::parse_log(&log)?);
            }
        }

        debug!("scanned [{}, {}]: {} events", start, end, all.len());
        Ok(all)
    }

    /// Token metadata for every deposit in the claim set, served from the
    /// process-lifetime cache and filled from ERC20 queries on miss. A
    /// token that fails all three queries gets default metadata; the claim
    /// is still submitted.
    async fn deposit_metadata(
        &self,
        events: &[BridgeEvent],
    ) -> HashMap<Address, Erc20Metadata> {
        let mut cache = self.metadata.lock().await;

        for event in events {
            let erc20 = match event {
                BridgeEvent::SendToCosmos { erc20, .. } => *erc20,
                _ => continue,
            };
            if cache.contains_key(&erc20) {
                continue;
            }

            let name = self.contract.get_erc20_name(erc20).await;
            let symbol = self.contract.get_erc20_symbol(erc20).await;
            let decimals = self.contract.get_erc20_decimals(erc20).await;
            match (name, symbol, decimals) {
                (Ok(name), Ok(symbol), Ok(decimals)) => {
                    cache.insert(
                        erc20,
                        Erc20Metadata {
                            name,
                            symbol,
                            decimals,
                        },
                    );
                }
                _ => {
                    warn!("could not resolve metadata for {:?}", erc20);
                    cache.insert(erc20, Erc20Metadata::default());
                }
            }
        }

        cache.clone()
    }
}
