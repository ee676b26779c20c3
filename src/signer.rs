//! Ethereum signer loop
//!
//! Signs whatever unsigned valsets and batches the sidechain reports for
//! this validator and queues the confirms back. The sidechain deduplicates
//! confirms, so re-signing an already-confirmed nonce is harmless and the
//! loop keeps no local memo.

use crate::cosmos::broadcast::BroadcastClient;
use crate::cosmos::query::SidechainQuery;
use crate::error::OrchestratorResult;

use ethers::types::H256;
use std::sync::Arc;
use tracing::{debug, info};

pub struct EthSigner {
    query: Arc<dyn SidechainQuery>,
    broadcast: Arc<BroadcastClient>,
    /// The contract's bridge ID, mixed into every checkpoint digest
    bridge_id: H256,
}

impl EthSigner {
    pub fn new(
        query: Arc<dyn SidechainQuery>,
        broadcast: Arc<BroadcastClient>,
        bridge_id: H256,
    ) -> Self {
        Self {
            query,
            broadcast,
            bridge_id,
        }
    }

    pub async fn run_iteration(&self) -> OrchestratorResult<()> {
        self.sign_valsets().await?;
        self.sign_batch().await?;
        Ok(())
    }

    async fn sign_valsets(&self) -> OrchestratorResult<()> {
        let unsigned = self
            .query
            .oldest_unsigned_valsets(self.broadcast.orchestrator_address())
            .await?;
        if unsigned.is_empty() {
            debug!("no unsigned valsets");
            return Ok(());
        }

        for valset in &unsigned {
            info!("confirming valset nonce {}", valset.nonce);
            self.broadcast
                .send_valset_confirm(self.bridge_id, valset)
                .await?;
            crate::metrics::record_confirm_submitted("valset");
        }
        Ok(())
    }

    async fn sign_batch(&self) -> OrchestratorResult<()> {
        let batch = match self
            .query
            .oldest_unsigned_batch(self.broadcast.orchestrator_address())
            .await?
        {
            Some(batch) => batch,
            None => {
                debug!("no unsigned batches");
                return Ok(());
            }
        };

        info!(
            "confirming batch nonce {} for token {:?}",
            batch.nonce, batch.token_contract
        );
        self.broadcast
            .send_batch_confirm(self.bridge_id, &batch)
            .await?;
        crate::metrics::record_confirm_submitted("batch");
        Ok(())
    }
}
