//! Relayer loop
//!
//! Submits signed valset updates and transaction batches to the bridge
//! contract once they advance past the contract's recorded state, guarded
//! by profitability and duplicate-suppression checks. The valset and batch
//! relays run as siblings in a paranoid group: the first failure cancels
//! the other and surfaces as the iteration error.

mod batch;
mod valset;

use crate::cosmos::query::SidechainQuery;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::estimator::BatchGasEstimator;
use crate::eth::contract::BridgeContract;
use crate::eth::provider::EthereumRpc;
use crate::pricefeed::PriceOracle;
use crate::supervisor::{retry_with_backoff, ParanoidGroup};

use ethers::types::{Address, H256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

const VALSET_FETCH_ATTEMPTS: u32 = 5;
/// Extra profitability margin applied when the gas estimate has no
/// observed samples behind it
const LOW_CONFIDENCE_MARGIN: f64 = 1.5;

pub struct Relayer {
    query: Arc<dyn SidechainQuery>,
    contract: Arc<BridgeContract>,
    provider: Arc<dyn EthereumRpc>,
    pricefeed: Arc<dyn PriceOracle>,
    estimator: Arc<BatchGasEstimator>,
    bridge_id: H256,
    valset_relay_enabled: bool,
    batch_relay_enabled: bool,
    profitability_margin: f64,
    pending_tx_wait: Duration,
    /// Last batch nonce this process sent, per token, to suppress
    /// immediate self-duplicates
    last_sent_batch: Mutex<HashMap<Address, u64>>,
}

impl Relayer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        query: Arc<dyn SidechainQuery>,
        contract: Arc<BridgeContract>,
        pricefeed: Arc<dyn PriceOracle>,
        estimator: Arc<BatchGasEstimator>,
        bridge_id: H256,
        valset_relay_enabled: bool,
        batch_relay_enabled: bool,
        profitability_margin: f64,
        pending_tx_wait: Duration,
    ) -> Self {
        let provider = contract.provider();
        Self {
            query,
            contract,
            provider,
            pricefeed,
            estimator,
            bridge_id,
            valset_relay_enabled,
            batch_relay_enabled,
            profitability_margin,
            pending_tx_wait,
            last_sent_batch: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run_iteration(
        self: &Arc<Self>,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<()> {
        self.maintain_estimator().await;

        // nothing can be relayed without knowing the contract's active
        // valset; exhausting retries here means the sidechain is gone
        let current_valset = retry_with_backoff(cancel, "fetch current valset", VALSET_FETCH_ATTEMPTS, || {
            self.query.current_valset()
        })
        .await
        .map_err(|e| OrchestratorError::Fatal(format!("could not fetch current valset: {}", e)))?;

        let mut group = ParanoidGroup::new(cancel);

        if self.valset_relay_enabled {
            let relayer = self.clone();
            let valset = current_valset.clone();
            group.go(move |_| async move { relayer.relay_valsets(&valset).await });
        }

        if self.batch_relay_enabled {
            let relayer = self.clone();
            let valset = current_valset.clone();
            group.go(move |_| async move { relayer.relay_batches(&valset).await });
        }

        group.wait().await
    }

    /// Receipt reconciliation, average recomputation and pruning for the
    /// gas store. Failures here never block relaying.
    async fn maintain_estimator(&self) {
        crate::metrics::record_pending_tx_set_size(self.contract.pending_tx_count());

        if let Err(e) = self.estimator.reconcile(self.provider.as_ref()).await {
            warn!("gas store reconciliation failed: {}", e);
        }
        self.estimator.recompute();
        match self.provider.get_block_number().await {
            Ok(head) => self.estimator.prune(head),
            Err(e) => warn!("skipping gas store prune: {}", e),
        }
    }

    fn already_sent(&self, token: Address, nonce: u64) -> bool {
        self.last_sent_batch.lock().unwrap().get(&token) == Some(&nonce)
    }

    fn mark_sent(&self, token: Address, nonce: u64) {
        self.last_sent_batch.lock().unwrap().insert(token, nonce);
    }
}
