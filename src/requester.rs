//! Batch requester loop
//!
//! On every tick, sums the bridge fees of unbatched send-to-Ethereum
//! transfers per token and asks the sidechain to cut a batch for each
//! denom whose accumulated fee clears the USD threshold. Nothing is
//! persisted between ticks; the filter is recomputed from fresh snapshots.

use crate::cosmos::broadcast::BroadcastClient;
use crate::cosmos::denom::Erc20DenomCache;
use crate::cosmos::query::SidechainQuery;
use crate::error::OrchestratorResult;
use crate::eth::contract::BridgeContract;
use crate::pricefeed::{token_amount_usd, PriceOracle};

use ethers::types::{Address, U256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub struct BatchRequester {
    query: Arc<dyn SidechainQuery>,
    broadcast: Arc<BroadcastClient>,
    contract: Arc<BridgeContract>,
    denom_cache: Arc<Erc20DenomCache>,
    pricefeed: Arc<dyn PriceOracle>,
    min_batch_fee_usd: f64,
    /// ERC20 decimals never change; cached for the process lifetime
    decimals: Mutex<HashMap<Address, u8>>,
}

impl BatchRequester {
    pub fn new(
        query: Arc<dyn SidechainQuery>,
        broadcast: Arc<BroadcastClient>,
        contract: Arc<BridgeContract>,
        denom_cache: Arc<Erc20DenomCache>,
        pricefeed: Arc<dyn PriceOracle>,
        min_batch_fee_usd: f64,
    ) -> Self {
        Self {
            query,
            broadcast,
            contract,
            denom_cache,
            pricefeed,
            min_batch_fee_usd,
            decimals: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run_iteration(&self) -> OrchestratorResult<()> {
        let pending = self
            .query
            .pending_send_to_eth_by_addr(self.broadcast.orchestrator_address())
            .await?;
        if pending.is_empty() {
            debug!("no unbatched transfers");
            return Ok(());
        }

        // accumulate bridge fees per token
        let mut fees: HashMap<Address, U256> = HashMap::new();
        for transfer in &pending {
            *fees.entry(transfer.token_contract).or_insert_with(U256::zero) += transfer.fee;
        }

        for (token, total_fee) in fees {
            let usd = match self.fee_in_usd(token, total_fee).await {
                Ok(usd) => usd,
                Err(e) => {
                    // a token the feed cannot price just waits for a later tick
                    warn!("cannot price fees for {:?}: {}", token, e);
                    continue;
                }
            };

            if usd < self.min_batch_fee_usd {
                debug!(
                    "token {:?} fees {:.2} USD below threshold {:.2}, skipping",
                    token, usd, self.min_batch_fee_usd
                );
                continue;
            }

            let denom = self.denom_cache.denom_for(token).await?;
            info!(
                "requesting batch for {} ({:.2} USD of fees pending)",
                denom, usd
            );
            self.broadcast.send_request_batch(&denom).await?;
            crate::metrics::record_batch_request(&denom);
        }

        Ok(())
    }

    async fn fee_in_usd(&self, token: Address, fee: U256) -> OrchestratorResult<f64> {
        let decimals = {
            let mut cache = self.decimals.lock().await;
            match cache.get(&token) {
                Some(d) => *d,
                None => {
                    let d = self.contract.get_erc20_decimals(token).await?;
                    cache.insert(token, d);
                    d
                }
            }
        };
        let unit_price = self.pricefeed.token_usd_price(token).await?;
        Ok(token_amount_usd(fee, decimals, unit_price))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cosmos::msgs::SidechainMsg;
    use crate::test_utils::*;
    use crate::types::PendingSendToEth;

    struct Fixture {
        requester: BatchRequester,
        submitter: Arc<MockSubmitter>,
        sidechain: Arc<MockSidechain>,
        pricefeed: Arc<MockPriceOracle>,
    }

    fn fixture(min_batch_fee_usd: f64) -> Fixture {
        let provider = Arc::new(MockEthereumRpc::default());
        let sidechain = Arc::new(MockSidechain::default());
        let submitter = Arc::new(MockSubmitter::default());
        let pricefeed = Arc::new(MockPriceOracle::default());
        let contract = mock_bridge_contract(provider);
        let broadcast = Arc::new(mock_broadcast_client(submitter.clone()));
        let denom_cache = Arc::new(Erc20DenomCache::new(sidechain.clone()));

        let requester = BatchRequester::new(
            sidechain.clone(),
            broadcast,
            contract,
            denom_cache,
            pricefeed.clone(),
            min_batch_fee_usd,
        );
        Fixture {
            requester,
            submitter,
            sidechain,
            pricefeed,
        }
    }

    fn transfer(token: Address, fee: u64) -> PendingSendToEth {
        PendingSendToEth {
            sender: "cosmos1qypqxpq9qcrsszg2pvxq6rs0zqg3yyc5lzv7xu".to_string(),
            destination: Address::from([0xdd; 20]),
            token_contract: token,
            amount: U256::from(1_000_000u64),
            fee: U256::from(fee),
        }
    }

    #[tokio::test]
    async fn test_requests_batch_above_threshold() {
        let fx = fixture(10.0);
        let token = Address::from([0xaa; 20]);
        fx.sidechain.set_denom(token, "gantry0xaa");
        fx.pricefeed.set_token_price(token, 1.0);
        // mock ERC20s report 6 decimals: two transfers of 8 USD each
        fx.sidechain
            .set_pending_sends(vec![transfer(token, 8_000_000), transfer(token, 8_000_000)]);

        fx.requester.run_iteration().await.unwrap();

        let submissions = fx.submitter.submitted();
        assert_eq!(submissions.len(), 1);
        match &submissions[0][0] {
            SidechainMsg::RequestBatch(req) => assert_eq!(req.denom, "gantry0xaa"),
            other => panic!("queued wrong msg: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_below_threshold_skipped_this_tick() {
        let fx = fixture(10.0);
        let token = Address::from([0xaa; 20]);
        fx.sidechain.set_denom(token, "gantry0xaa");
        fx.pricefeed.set_token_price(token, 1.0);
        // 3 USD of accumulated fees
        fx.sidechain.set_pending_sends(vec![transfer(token, 3_000_000)]);

        fx.requester.run_iteration().await.unwrap();
        assert!(fx.submitter.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_threshold_applies_per_denom() {
        let fx = fixture(10.0);
        let rich = Address::from([0xaa; 20]);
        let poor = Address::from([0xbb; 20]);
        fx.sidechain.set_denom(rich, "gantry0xaa");
        fx.sidechain.set_denom(poor, "gantry0xbb");
        fx.pricefeed.set_token_price(rich, 1.0);
        fx.pricefeed.set_token_price(poor, 1.0);
        fx.sidechain.set_pending_sends(vec![
            transfer(rich, 20_000_000),
            transfer(poor, 1_000_000),
        ]);

        fx.requester.run_iteration().await.unwrap();

        let submissions = fx.submitter.submitted();
        assert_eq!(submissions.len(), 1);
        match &submissions[0][0] {
            SidechainMsg::RequestBatch(req) => assert_eq!(req.denom, "gantry0xaa"),
            other => panic!("queued wrong msg: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unpriceable_token_does_not_fail_tick() {
        let fx = fixture(10.0);
        let priced = Address::from([0xaa; 20]);
        let unlisted = Address::from([0xee; 20]);
        fx.sidechain.set_denom(priced, "gantry0xaa");
        fx.pricefeed.set_token_price(priced, 1.0);
        fx.sidechain.set_pending_sends(vec![
            transfer(unlisted, 50_000_000),
            transfer(priced, 20_000_000),
        ]);

        fx.requester.run_iteration().await.unwrap();

        // the priced token still got its request
        assert_eq!(fx.submitter.submitted().len(), 1);
    }
}
