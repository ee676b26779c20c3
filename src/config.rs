//! Configuration management for the Gantry orchestrator
//!
//! Loads configuration from a TOML file with environment variable
//! substitution. Every option can also be overridden through the
//! `GANTRY_*` environment prefix.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub ethereum: EthereumConfig,
    pub cosmos: CosmosConfig,
    pub relayer: RelayerConfig,
    pub pricefeed: PriceFeedConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EthereumConfig {
    /// Main JSON-RPC endpoint
    pub eth_rpc: String,
    /// Websocket endpoint supporting eth_subscribe("newPendingTransactions").
    /// Configured separately from the main RPC endpoint.
    pub eth_pending_tx_ws: String,
    pub eth_chain_id: u64,
    /// Bridge contract address
    pub bridge_contract: String,
    /// Multiplier applied to the node's suggested gas price
    pub eth_gas_price_adjustment: f64,
    /// Hard ceiling for the adjusted gas price, in gwei
    pub eth_max_gas_price_gwei: u64,
    /// How many blocks a single oracle iteration may advance
    pub eth_blocks_per_loop: u64,
    /// Never scan closer than this many blocks to head
    pub eth_block_confirmation_delay: u64,
    /// Ethereum account the orchestrator signs and submits from
    pub eth_from_address: String,
    /// Signer backend; only "local" is supported, key comes from
    /// GANTRY_ETH_PRIVATE_KEY
    pub eth_signer_backend: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CosmosConfig {
    /// grpc-gateway REST endpoint of the sidechain node
    pub cosmos_grpc: String,
    pub tendermint_rpc: String,
    pub cosmos_chain_id: String,
    /// Gas prices string, e.g. "500000000stake"
    pub cosmos_gas_prices: String,
    /// Keyring backend; only "local" is supported, key comes from
    /// GANTRY_COSMOS_PRIVATE_KEY
    pub cosmos_keyring_backend: String,
    /// Bech32 account address of this validator's orchestrator key
    pub cosmos_from_address: String,
    /// Bech32 valoper address used when registering orchestrator
    /// addresses; defaults to the orchestrator account address
    #[serde(default)]
    pub cosmos_validator_address: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayerConfig {
    pub valset_relay_enabled: bool,
    pub batch_relay_enabled: bool,
    /// Minimum accumulated batch fee, in USD, before requesting a batch
    pub min_batch_fee_usd: f64,
    /// Fee must cover estimated gas cost times this margin
    pub profitability_margin: f64,
    pub relayer_loop_duration_secs: u64,
    pub requester_loop_duration_secs: u64,
    pub oracle_loop_duration_secs: u64,
    pub cosmos_block_time_secs: u64,
    pub ethereum_block_time_secs: u64,
    /// Pending txs older than this are considered stale and re-sent
    pub pending_tx_wait_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriceFeedConfig {
    pub coingecko_url: String,
    /// How long a quoted USD price stays fresh
    pub cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Settings {
    /// Load settings from the configuration file
    pub fn load() -> Result<Self> {
        let config_path = env::var("GANTRY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        let config_str = substitute_env_vars(&config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.ethereum.eth_rpc.is_empty() {
            anyhow::bail!("ethereum.eth_rpc must be set");
        }
        if self.ethereum.bridge_contract.is_empty() {
            anyhow::bail!("ethereum.bridge_contract must be set");
        }
        if self.ethereum.eth_signer_backend != "local" {
            anyhow::bail!(
                "unsupported eth_signer_backend {:?}, only \"local\" is available",
                self.ethereum.eth_signer_backend
            );
        }
        if self.cosmos.cosmos_keyring_backend != "local" {
            anyhow::bail!(
                "unsupported cosmos_keyring_backend {:?}, only \"local\" is available",
                self.cosmos.cosmos_keyring_backend
            );
        }
        if self.ethereum.eth_block_confirmation_delay == 0 {
            tracing::warn!("eth_block_confirmation_delay is 0, reorgs will produce double claims");
        }
        if self.relayer.profitability_margin < 1.0 {
            tracing::warn!(
                "profitability_margin {} is below 1.0, batches may be relayed at a loss",
                self.relayer.profitability_margin
            );
        }
        Ok(())
    }

    pub fn oracle_loop_duration(&self) -> Duration {
        Duration::from_secs(self.relayer.oracle_loop_duration_secs)
    }

    pub fn relayer_loop_duration(&self) -> Duration {
        Duration::from_secs(self.relayer.relayer_loop_duration_secs)
    }

    pub fn requester_loop_duration(&self) -> Duration {
        Duration::from_secs(self.relayer.requester_loop_duration_secs)
    }

    pub fn pending_tx_wait(&self) -> Duration {
        Duration::from_secs(self.relayer.pending_tx_wait_secs)
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("GANTRY_TEST_VAR", "wss://node.example.com/ws");
        let input = "eth_pending_tx_ws = \"${GANTRY_TEST_VAR}\"";
        let result = substitute_env_vars(&input);
        assert_eq!(result, "eth_pending_tx_ws = \"wss://node.example.com/ws\"");
    }

    #[test]
    fn test_parse_full_config() {
        let raw = r#"
            [ethereum]
            eth_rpc = "http://localhost:8545"
            eth_pending_tx_ws = "ws://localhost:8546"
            eth_chain_id = 5
            bridge_contract = "0x3bdf8428734244c9e5d82c95d125081939d6d42d"
            eth_gas_price_adjustment = 1.3
            eth_max_gas_price_gwei = 500
            eth_blocks_per_loop = 2000
            eth_block_confirmation_delay = 12
            eth_from_address = "0xd8da6bf26964af9d7eed9e03e53415d37aa96045"
            eth_signer_backend = "local"

            [cosmos]
            cosmos_grpc = "http://localhost:1317"
            tendermint_rpc = "http://localhost:26657"
            cosmos_chain_id = "gantry-1"
            cosmos_gas_prices = "500000000stake"
            cosmos_keyring_backend = "local"
            cosmos_from_address = "cosmos1qypqxpq9qcrsszg2pvxq6rs0zqg3yyc5lzv7xu"

            [relayer]
            valset_relay_enabled = true
            batch_relay_enabled = true
            min_batch_fee_usd = 23.3
            profitability_margin = 1.1
            relayer_loop_duration_secs = 60
            requester_loop_duration_secs = 60
            oracle_loop_duration_secs = 13
            cosmos_block_time_secs = 6
            ethereum_block_time_secs = 13
            pending_tx_wait_secs = 1200

            [pricefeed]
            coingecko_url = "https://api.coingecko.com/api/v3"
            cache_ttl_secs = 90

            [metrics]
            enabled = true
            port = 9090
        "#;
        let settings: Settings = toml::from_str(raw).unwrap();
        settings.validate().unwrap();
        assert_eq!(settings.ethereum.eth_blocks_per_loop, 2000);
        assert_eq!(settings.relayer.oracle_loop_duration_secs, 13);
        assert!((settings.relayer.min_batch_fee_usd - 23.3).abs() < f64::EPSILON);
    }

    #[test]
    fn test_rejects_unknown_signer_backend() {
        let mut raw = String::new();
        raw.push_str("[ethereum]\n");
        raw.push_str("eth_rpc = \"http://localhost:8545\"\n");
        raw.push_str("eth_pending_tx_ws = \"ws://localhost:8546\"\n");
        raw.push_str("eth_chain_id = 1\n");
        raw.push_str("bridge_contract = \"0x00\"\n");
        raw.push_str("eth_gas_price_adjustment = 1.0\n");
        raw.push_str("eth_max_gas_price_gwei = 100\n");
        raw.push_str("eth_blocks_per_loop = 100\n");
        raw.push_str("eth_block_confirmation_delay = 6\n");
        raw.push_str("eth_from_address = \"0x00\"\n");
        raw.push_str("eth_signer_backend = \"ledger\"\n");
        raw.push_str("[cosmos]\n");
        raw.push_str("cosmos_grpc = \"http://localhost:1317\"\n");
        raw.push_str("tendermint_rpc = \"http://localhost:26657\"\n");
        raw.push_str("cosmos_chain_id = \"gantry-1\"\n");
        raw.push_str("cosmos_gas_prices = \"1stake\"\n");
        raw.push_str("cosmos_keyring_backend = \"local\"\n");
        raw.push_str("cosmos_from_address = \"cosmos1xyz\"\n");
        raw.push_str("[relayer]\n");
        raw.push_str("valset_relay_enabled = true\n");
        raw.push_str("batch_relay_enabled = true\n");
        raw.push_str("min_batch_fee_usd = 10.0\n");
        raw.push_str("profitability_margin = 1.0\n");
        raw.push_str("relayer_loop_duration_secs = 60\n");
        raw.push_str("requester_loop_duration_secs = 60\n");
        raw.push_str("oracle_loop_duration_secs = 13\n");
        raw.push_str("cosmos_block_time_secs = 6\n");
        raw.push_str("ethereum_block_time_secs = 13\n");
        raw.push_str("pending_tx_wait_secs = 1200\n");
        raw.push_str("[pricefeed]\n");
        raw.push_str("coingecko_url = \"https://api.coingecko.com/api/v3\"\n");
        raw.push_str("cache_ttl_secs = 90\n");
        raw.push_str("[metrics]\n");
        raw.push_str("enabled = false\n");
        raw.push_str("port = 9090\n");

        let settings: Settings = toml::from_str(&raw).unwrap();
        assert!(settings.validate().is_err());
    }
}
