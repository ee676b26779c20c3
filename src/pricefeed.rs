//! USD price feed over the CoinGecko simple-price API
//!
//! Quotes are cached with a short TTL; the requester and relayer loops both
//! query on every tick and would otherwise hammer the public API.

use crate::error::{OrchestratorError, OrchestratorResult};

use async_trait::async_trait;
use ethers::types::{Address, U256};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// USD pricing capability consumed by the requester and relayer
#[async_trait]
pub trait PriceOracle: Send + Sync {
    /// Spot USD price of one ETH
    async fn eth_usd_price(&self) -> OrchestratorResult<f64>;
    /// Spot USD price of one whole token of the ERC20
    async fn token_usd_price(&self, erc20: Address) -> OrchestratorResult<f64>;
}

pub struct CoinGeckoFeed {
    http: reqwest::Client,
    base_url: String,
    ttl: Duration,
    eth_cache: RwLock<Option<(f64, Instant)>>,
    token_cache: RwLock<HashMap<Address, (f64, Instant)>>,
}

impl CoinGeckoFeed {
    pub fn new(base_url: &str, ttl: Duration) -> OrchestratorResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| OrchestratorError::Config(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            ttl,
            eth_cache: RwLock::new(None),
            token_cache: RwLock::new(HashMap::new()),
        })
    }

    async fn get_json(&self, url: &str) -> OrchestratorResult<Value> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| OrchestratorError::PriceFeed(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(OrchestratorError::PriceFeed(format!(
                "GET {} returned {}",
                url,
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| OrchestratorError::PriceFeed(e.to_string()))
    }
}

#[async_trait]
impl PriceOracle for CoinGeckoFeed {
    async fn eth_usd_price(&self) -> OrchestratorResult<f64> {
        if let Some((price, at)) = *self.eth_cache.read().await {
            if at.elapsed() < self.ttl {
                return Ok(price);
            }
        }

        let url = format!(
            "{}/simple/price?ids=ethereum&vs_currencies=usd",
            self.base_url
        );
        let body = self.get_json(&url).await?;
        let price = body["ethereum"]["usd"]
            .as_f64()
            .ok_or_else(|| OrchestratorError::PriceFeed("no ethereum quote".to_string()))?;

        debug!("eth/usd quote: {}", price);
        *self.eth_cache.write().await = Some((price, Instant::now()));
        Ok(price)
    }

    async fn token_usd_price(&self, erc20: Address) -> OrchestratorResult<f64> {
        if let Some((price, at)) = self.token_cache.read().await.get(&erc20) {
            if at.elapsed() < self.ttl {
                return Ok(*price);
            }
        }

        let url = format!(
            "{}/simple/token_price/ethereum?contract_addresses={:?}&vs_currencies=usd",
            self.base_url, erc20
        );
        let body = self.get_json(&url).await?;
        let price = body[format!("{:?}", erc20)]["usd"]
            .as_f64()
            .ok_or_else(|| {
                OrchestratorError::PriceFeed(format!("no quote for token {:?}", erc20))
            })?;

        debug!("{:?}/usd quote: {}", erc20, price);
        self.token_cache
            .write()
            .await
            .insert(erc20, (price, Instant::now()));
        Ok(price)
    }
}

/// USD value of `amount` base units of a token with `decimals` and the
/// given USD unit price
pub fn token_amount_usd(amount: U256, decimals: u8, unit_price: f64) -> f64 {
    u256_to_f64(amount) / 10f64.powi(decimals as i32) * unit_price
}

/// USD cost of burning `gas` at `gas_price` wei with the given ETH price
pub fn gas_cost_usd(gas: u64, gas_price: U256, eth_price: f64) -> f64 {
    let wei = u256_to_f64(gas_price) * gas as f64;
    wei / 1e18 * eth_price
}

fn u256_to_f64(value: U256) -> f64 {
    // good to ~2^53 of precision, plenty for pricing decisions
    let mut result = 0f64;
    for limb in value.0.iter().rev() {
        result = result * 2f64.powi(64) + *limb as f64;
    }
    result
}
