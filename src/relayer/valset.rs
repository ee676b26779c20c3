//! Valset relay
//!
//! Finds the newest sidechain valset that has confirmations, and pushes it
//! to the contract if its nonce is ahead of the contract's.

use super::Relayer;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::types::{Valset, ValsetConfirm};

use tracing::{debug, info};

impl Relayer {
    pub(super) async fn relay_valsets(&self, current_valset: &Valset) -> OrchestratorResult<()> {
        // newest confirmed valset wins; older ones are subsumed by it
        let latest = self.query.latest_valsets().await?;
        let mut confirmed: Option<(Valset, Vec<ValsetConfirm>)> = None;
        for valset in latest {
            let confirms = self.query.valset_confirms_by_nonce(valset.nonce).await?;
            if !confirms.is_empty() {
                confirmed = Some((valset, confirms));
                break;
            }
        }

        let (valset, confirms) = match confirmed {
            Some(found) => found,
            None => {
                debug!("no confirmed valsets, nothing to relay");
                return Ok(());
            }
        };

        let eth_nonce = self.contract.get_valset_nonce().await?;
        if valset.nonce <= eth_nonce {
            debug!(
                "contract valset nonce {} is already at or past {}",
                eth_nonce, valset.nonce
            );
            return Ok(());
        }

        let calldata = match self.contract.encode_valset_update(
            self.bridge_id,
            current_valset,
            &valset,
            &confirms,
        ) {
            Ok(calldata) => calldata,
            Err(OrchestratorError::InsufficientVotingPower { aggregated, total }) => {
                // wait for more validators to confirm
                debug!(
                    "valset {} has {} of {} power signed, waiting",
                    valset.nonce, aggregated, total
                );
                crate::metrics::record_relay_skipped("valset_insufficient_power");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        // someone else may have relayed it while we were encoding
        let eth_nonce_now = self.contract.get_valset_nonce().await?;
        if valset.nonce <= eth_nonce_now {
            crate::metrics::record_relay_skipped("valset_state_advanced");
            return Ok(());
        }

        if self
            .contract
            .is_pending_tx_input(&calldata, self.pending_tx_wait)
        {
            debug!("identical valset update already pending, skipping");
            crate::metrics::record_relay_skipped("valset_pending");
            return Ok(());
        }

        info!(
            "relaying valset update {} -> {} to Ethereum",
            eth_nonce, valset.nonce
        );
        let tx_hash = self.contract.submit(calldata).await?;
        crate::metrics::record_eth_tx_submitted("valset_update");
        info!("sent Ethereum tx (valset update): {:?}", tx_hash);

        Ok(())
    }
}
