//! Batch relay
//!
//! For every token with signed batches ahead of the contract, relays the
//! oldest one, provided its accumulated fee covers the predicted gas cost
//! with margin.

use super::{Relayer, LOW_CONFIDENCE_MARGIN};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::pricefeed::{gas_cost_usd, token_amount_usd};
use crate::types::{OutgoingBatch, Valset};

use ethers::types::Address;
use std::collections::HashMap;
use tracing::{debug, info};

impl Relayer {
    pub(super) async fn relay_batches(&self, current_valset: &Valset) -> OrchestratorResult<()> {
        let latest = self.query.latest_batches().await?;

        let mut by_token: HashMap<Address, Vec<OutgoingBatch>> = HashMap::new();
        for batch in latest {
            by_token.entry(batch.token_contract).or_default().push(batch);
        }

        for (token, mut batches) in by_token {
            batches.sort_by_key(|b| b.nonce);
            if let Err(e) = self
                .relay_oldest_batch(current_valset, token, batches)
                .await
            {
                return Err(e);
            }
        }

        Ok(())
    }

    async fn relay_oldest_batch(
        &self,
        current_valset: &Valset,
        token: Address,
        batches: Vec<OutgoingBatch>,
    ) -> OrchestratorResult<()> {
        let eth_nonce = self.contract.get_tx_batch_nonce(token).await?;
        let batch = match batches.into_iter().find(|b| b.nonce > eth_nonce) {
            Some(batch) => batch,
            None => return Ok(()),
        };

        let confirms = self
            .query
            .batch_confirms_by_nonce_and_token(batch.nonce, token)
            .await?;
        if confirms.is_empty() {
            debug!("batch {} for {:?} has no signatures yet", batch.nonce, token);
            return Ok(());
        }

        if self.already_sent(token, batch.nonce) {
            debug!("batch {} for {:?} was just sent by us", batch.nonce, token);
            crate::metrics::record_relay_skipped("batch_self_duplicate");
            return Ok(());
        }

        if !self.batch_is_profitable(&batch).await? {
            crate::metrics::record_relay_skipped("batch_unprofitable");
            return Ok(());
        }

        let calldata = match self.contract.encode_transaction_batch(
            self.bridge_id,
            current_valset,
            &batch,
            &confirms,
        ) {
            Ok(calldata) => calldata,
            Err(OrchestratorError::InsufficientVotingPower { aggregated, total }) => {
                // wait for more validators to confirm
                debug!(
                    "batch {} has {} of {} power signed, waiting",
                    batch.nonce, aggregated, total
                );
                crate::metrics::record_relay_skipped("batch_insufficient_power");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        // someone else may have relayed it in the interim
        let eth_nonce_now = self.contract.get_tx_batch_nonce(token).await?;
        if batch.nonce <= eth_nonce_now {
            crate::metrics::record_relay_skipped("batch_state_advanced");
            return Ok(());
        }

        if self
            .contract
            .is_pending_tx_input(&calldata, self.pending_tx_wait)
        {
            debug!("identical batch submission already pending, skipping");
            crate::metrics::record_relay_skipped("batch_pending");
            return Ok(());
        }

        info!(
            "relaying batch {} for token {:?} ({} transfers)",
            batch.nonce,
            token,
            batch.transfers.len()
        );
        let tx_hash = self.contract.submit(calldata).await?;
        self.mark_sent(token, batch.nonce);
        crate::metrics::record_eth_tx_submitted("submit_batch");
        info!("sent Ethereum tx (submit batch): {:?}", tx_hash);

        Ok(())
    }

    /// Compare the batch's aggregated fee against the predicted gas cost.
    /// Estimates without observed samples get a wider margin.
    async fn batch_is_profitable(&self, batch: &OutgoingBatch) -> OrchestratorResult<bool> {
        let estimate = self
            .estimator
            .estimate(batch.token_contract, batch.transfers.len());
        let gas_price = self.provider.gas_price().await?;
        let eth_price = self.pricefeed.eth_usd_price().await?;
        let token_price = self.pricefeed.token_usd_price(batch.token_contract).await?;
        let decimals = self
            .contract
            .get_erc20_decimals(batch.token_contract)
            .await?;

        let fee_usd = token_amount_usd(batch.total_fee(), decimals, token_price);
        let cost_usd = gas_cost_usd(estimate.gas, gas_price, eth_price);
        let margin = if estimate.low_confidence {
            self.profitability_margin * LOW_CONFIDENCE_MARGIN
        } else {
            self.profitability_margin
        };

        let profitable = fee_usd >= cost_usd * margin;
        debug!(
            "batch {} for {:?}: fees {:.2} USD vs cost {:.2} USD (margin {:.2}) -> {}",
            batch.nonce,
            batch.token_contract,
            fee_usd,
            cost_usd,
            margin,
            if profitable { "relay" } else { "skip" }
        );
        Ok(profitable)
    }
}
