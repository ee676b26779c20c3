//! Gantry Orchestrator - validator-side bridge orchestrator
//!
//! Connects the Ethereum bridge contract to the Cosmos-SDK sidechain
//! bridge module: witnesses deposits and executed batches on Ethereum,
//! attests to them on the sidechain, countersigns outbound valset and
//! batch updates, and relays the signed artifacts back to Ethereum.

use anyhow::{Context, Result};
use ethers::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod config;
mod cosmos;
mod error;
mod estimator;
mod eth;
mod metrics;
mod oracle;
mod pricefeed;
mod relayer;
mod requester;
mod signer;
mod supervisor;
#[cfg(test)]
mod test_utils;
mod types;

use config::Settings;
use cosmos::{BroadcastClient, Erc20DenomCache, GrpcGatewayClient, LcdSubmitter, SidechainQuery};
use error::OrchestratorResult;
use estimator::BatchGasEstimator;
use eth::{BridgeContract, EthCommitter, EthProvider, EthereumRpc, NonceCache, PendingTxSet};
use metrics::MetricsServer;
use oracle::EthOracle;
use pricefeed::{CoinGeckoFeed, PriceOracle};
use relayer::Relayer;
use requester::BatchRequester;
use signer::EthSigner;
use supervisor::run_loop;

/// Attempts for the startup fetches (bridge ID, oracle bootstrap) before
/// the process gives up
const BOOTSTRAP_ATTEMPTS: u32 = 10;
/// Gas records older than this many Ethereum blocks are pruned
const ESTIMATOR_KEEP_RECENT_BLOCKS: u64 = 100_000;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting Gantry orchestrator v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load()?;

    let eth_wallet = load_eth_wallet(&settings)?;
    let cosmos_key = std::env::var("GANTRY_COSMOS_PRIVATE_KEY")
        .context("GANTRY_COSMOS_PRIVATE_KEY is not set")?;

    let bridge_address: Address = settings
        .ethereum
        .bridge_contract
        .parse()
        .context("invalid bridge contract address")?;

    // Ethereum stack, bottom-up: provider -> nonce cache -> committer ->
    // contract. Nothing holds a back-reference.
    let provider: Arc<dyn EthereumRpc> = Arc::new(EthProvider::new(&settings.ethereum.eth_rpc)?);
    let nonce_cache = Arc::new(NonceCache::new());
    let pending_txs = Arc::new(PendingTxSet::new());
    let committer = Arc::new(EthCommitter::new(
        provider.clone(),
        nonce_cache,
        eth_wallet.clone(),
        settings.ethereum.eth_chain_id,
        settings.ethereum.eth_gas_price_adjustment,
        settings.ethereum.eth_max_gas_price_gwei,
    ));
    let contract = Arc::new(BridgeContract::new(
        committer,
        bridge_address,
        pending_txs.clone(),
    ));
    info!("Ethereum connection initialized, from {:?}", contract.from_address());

    // Sidechain stack
    let query: Arc<dyn SidechainQuery> = Arc::new(GrpcGatewayClient::new(&settings.cosmos.cosmos_grpc)?);
    let submitter = Arc::new(LcdSubmitter::new(
        &settings.cosmos.cosmos_grpc,
        &settings.cosmos.cosmos_chain_id,
        &settings.cosmos.cosmos_from_address,
        &cosmos_key,
        &settings.cosmos.cosmos_gas_prices,
    )?);
    let validator_address = settings
        .cosmos
        .cosmos_validator_address
        .clone()
        .unwrap_or_else(|| settings.cosmos.cosmos_from_address.clone());
    let broadcast = Arc::new(BroadcastClient::new(
        submitter,
        eth_wallet,
        settings.cosmos.cosmos_from_address.clone(),
        validator_address,
    ));

    let pricefeed: Arc<dyn PriceOracle> = Arc::new(CoinGeckoFeed::new(
        &settings.pricefeed.coingecko_url,
        Duration::from_secs(settings.pricefeed.cache_ttl_secs),
    )?);
    let estimator = Arc::new(BatchGasEstimator::new(ESTIMATOR_KEEP_RECENT_BLOCKS));
    let denom_cache = Arc::new(Erc20DenomCache::new(query.clone()));

    let cancel = CancellationToken::new();

    // the bridge ID is immutable contract state; without it no digest can
    // be produced, so failing to fetch it is fatal
    let bridge_id = supervisor::retry_with_backoff(&cancel, "fetch bridge ID", BOOTSTRAP_ATTEMPTS, || {
        contract.get_bridge_id()
    })
    .await
    .context("could not fetch the bridge ID from the contract")?;
    info!("bridge ID: {:?}", bridge_id);

    if let Err(e) = broadcast.register_orchestrator_addresses().await {
        // already-registered validators get a benign rejection here
        warn!("orchestrator address registration not accepted: {}", e);
    }

    // pending-tx feed runs for the life of the process
    let pending_feed = tokio::spawn(eth::pending::subscribe_pending_txs(
        pending_txs.clone(),
        settings.ethereum.eth_pending_tx_ws.clone(),
        bridge_address,
        cancel.clone(),
    ));

    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    let mut loops: JoinSet<OrchestratorResult<()>> = JoinSet::new();

    // Ethereum oracle loop
    let oracle = Arc::new(EthOracle::new(
        query.clone(),
        broadcast.clone(),
        contract.clone(),
        estimator.clone(),
        settings.ethereum.eth_blocks_per_loop,
        settings.ethereum.eth_block_confirmation_delay,
    ));
    supervisor::retry_with_backoff(&cancel, "oracle bootstrap", BOOTSTRAP_ATTEMPTS, || {
        oracle.bootstrap()
    })
    .await
    .context("could not bootstrap the oracle scan height")?;
    {
        let oracle = oracle.clone();
        loops.spawn(run_loop(
            cancel.clone(),
            settings.oracle_loop_duration(),
            "eth_oracle",
            move || {
                let oracle = oracle.clone();
                async move { oracle.run_iteration().await }
            },
        ));
    }

    // Ethereum signer loop
    let eth_signer = Arc::new(EthSigner::new(query.clone(), broadcast.clone(), bridge_id));
    {
        let eth_signer = eth_signer.clone();
        loops.spawn(run_loop(
            cancel.clone(),
            settings.oracle_loop_duration(),
            "eth_signer",
            move || {
                let eth_signer = eth_signer.clone();
                async move { eth_signer.run_iteration().await }
            },
        ));
    }

    // batch requester loop
    let requester = Arc::new(BatchRequester::new(
        query.clone(),
        broadcast.clone(),
        contract.clone(),
        denom_cache,
        pricefeed.clone(),
        settings.relayer.min_batch_fee_usd,
    ));
    {
        let requester = requester.clone();
        loops.spawn(run_loop(
            cancel.clone(),
            settings.requester_loop_duration(),
            "batch_requester",
            move || {
                let requester = requester.clone();
                async move { requester.run_iteration().await }
            },
        ));
    }

    // relayer loop
    let relayer = Arc::new(Relayer::new(
        query,
        contract,
        pricefeed,
        estimator,
        bridge_id,
        settings.relayer.valset_relay_enabled,
        settings.relayer.batch_relay_enabled,
        settings.relayer.profitability_margin,
        settings.pending_tx_wait(),
    ));
    {
        let relayer = relayer.clone();
        let relayer_cancel = cancel.clone();
        loops.spawn(run_loop(
            cancel.clone(),
            settings.relayer_loop_duration(),
            "relayer",
            move || {
                let relayer = relayer.clone();
                let cancel = relayer_cancel.clone();
                async move { relayer.run_iteration(&cancel).await }
            },
        ));
    }

    info!("Gantry orchestrator is running");

    // run until a shutdown signal or a fatal loop error
    let mut fatal = false;
    loop {
        tokio::select! {
            _ = shutdown_signal() => {
                info!("Shutdown signal received, stopping...");
                cancel.cancel();
                break;
            }
            joined = loops.join_next() => match joined {
                Some(Ok(Ok(()))) => continue,
                Some(Ok(Err(e))) => {
                    error!("loop aborted with fatal error: {}", e);
                    cancel.cancel();
                    fatal = true;
                    break;
                }
                Some(Err(e)) => {
                    error!("loop task panicked: {}", e);
                    cancel.cancel();
                    fatal = true;
                    break;
                }
                None => break,
            }
        }
    }

    // all loops observe the cancellation within one tick
    while loops.join_next().await.is_some() {}
    pending_feed.abort();
    if let Some(handle) = metrics_handle {
        handle.abort();
    }

    if fatal {
        std::process::exit(1);
    }

    info!("Gantry orchestrator stopped");
    Ok(())
}

fn load_eth_wallet(settings: &Settings) -> Result<LocalWallet> {
    let raw = std::env::var("GANTRY_ETH_PRIVATE_KEY")
        .context("GANTRY_ETH_PRIVATE_KEY is not set")?;
    let wallet: LocalWallet = raw
        .trim_start_matches("0x")
        .parse()
        .context("invalid Ethereum private key")?;

    let configured: Address = settings
        .ethereum
        .eth_from_address
        .parse()
        .context("invalid eth_from_address")?;
    if wallet.address() != configured {
        anyhow::bail!(
            "eth_from_address {:?} does not match the loaded key's address {:?}",
            configured,
            wallet.address()
        );
    }
    Ok(wallet)
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,gantry=debug,hyper=warn,reqwest=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
