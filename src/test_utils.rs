//! Hand-written mocks for the capability seams, shared by the unit tests

use crate::cosmos::broadcast::{BroadcastClient, MsgSubmitter};
use crate::cosmos::msgs::SidechainMsg;
use crate::cosmos::query::SidechainQuery;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::eth::committer::EthCommitter;
use crate::eth::contract::BridgeContract;
use crate::eth::events::topics;
use crate::eth::nonce::NonceCache;
use crate::eth::pending::PendingTxSet;
use crate::eth::provider::EthereumRpc;
use crate::pricefeed::PriceOracle;
use crate::types::{
    BatchConfirm, LastObservedEvent, OutgoingBatch, PendingSendToEth, Valset, ValsetConfirm,
};

use async_trait::async_trait;
use ethers::abi::{self, Token};
use ethers::prelude::*;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::utils::{id, keccak256, rlp};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub const TEST_BRIDGE_CONTRACT: [u8; 20] = [0x42; 20];

/// Configurable fake Ethereum node
#[derive(Default)]
pub struct MockEthereumRpc {
    block_number: AtomicU64,
    pending_nonce: AtomicU64,
    valset_nonce: AtomicU64,
    gas_price: Mutex<Option<U256>>,
    batch_nonces: Mutex<HashMap<Address, u64>>,
    logs: Mutex<Vec<Log>>,
    receipts: Mutex<HashMap<H256, TransactionReceipt>>,
    sent: Mutex<Vec<(u64, Vec<u8>)>>,
    fail_next_send: Mutex<Option<String>>,
    fail_next_get_logs: Mutex<Option<String>>,
    get_logs_calls: AtomicU64,
}

impl MockEthereumRpc {
    pub fn set_block_number(&self, block: u64) {
        self.block_number.store(block, Ordering::SeqCst);
    }

    pub fn set_pending_nonce(&self, nonce: u64) {
        self.pending_nonce.store(nonce, Ordering::SeqCst);
    }

    pub fn set_valset_nonce(&self, nonce: u64) {
        self.valset_nonce.store(nonce, Ordering::SeqCst);
    }

    pub fn set_batch_nonce(&self, token: Address, nonce: u64) {
        self.batch_nonces.lock().unwrap().insert(token, nonce);
    }

    pub fn set_gas_price(&self, price: U256) {
        *self.gas_price.lock().unwrap() = Some(price);
    }

    pub fn push_log(&self, log: Log) {
        self.logs.lock().unwrap().push(log);
    }

    /// Store a receipt with `log_count` logs and the given gas usage
    pub fn set_receipt(&self, tx_hash: H256, log_count: usize, gas_used: u64, block: u64) {
        let receipt = TransactionReceipt {
            transaction_hash: tx_hash,
            gas_used: Some(U256::from(gas_used)),
            block_number: Some(block.into()),
            logs: vec![Log::default(); log_count],
            ..Default::default()
        };
        self.receipts.lock().unwrap().insert(tx_hash, receipt);
    }

    pub fn fail_next_send(&self, message: &str) {
        *self.fail_next_send.lock().unwrap() = Some(message.to_string());
    }

    pub fn fail_next_get_logs(&self, message: &str) {
        *self.fail_next_get_logs.lock().unwrap() = Some(message.to_string());
    }

    /// Nonces of successfully broadcast transactions, in send order
    pub fn sent_nonces(&self) -> Vec<u64> {
        self.sent.lock().unwrap().iter().map(|(n, _)| *n).collect()
    }

    pub fn last_sent_calldata(&self) -> Option<Vec<u8>> {
        self.sent.lock().unwrap().last().map(|(_, d)| d.clone())
    }

    pub fn get_logs_calls(&self) -> u64 {
        self.get_logs_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EthereumRpc for MockEthereumRpc {
    async fn get_block_number(&self) -> OrchestratorResult<u64> {
        Ok(self.block_number.load(Ordering::SeqCst))
    }

    async fn get_logs(&self, filter: &Filter) -> OrchestratorResult<Vec<Log>> {
        self.get_logs_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.fail_next_get_logs.lock().unwrap().take() {
            return Err(OrchestratorError::EthRpc(message));
        }

        let (from, to) = match filter.block_option {
            FilterBlockOption::Range {
                from_block,
                to_block,
            } => (
                from_block
                    .and_then(|b| b.as_number())
                    .map(|n| n.as_u64())
                    .unwrap_or(0),
                to_block
                    .and_then(|b| b.as_number())
                    .map(|n| n.as_u64())
                    .unwrap_or(u64::MAX),
            ),
            _ => (0, u64::MAX),
        };
        let topic0 = match &filter.topics[0] {
            Some(ValueOrArray::Value(Some(topic))) => Some(*topic),
            _ => None,
        };

        let logs = self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|log| {
                let block = log.block_number.map(|b| b.as_u64()).unwrap_or(0);
                let topic_matches = match topic0 {
                    Some(topic) => log.topics.first() == Some(&topic),
                    None => true,
                };
                block >= from && block <= to && topic_matches
            })
            .cloned()
            .collect();
        Ok(logs)
    }

    async fn get_transaction(&self, _hash: H256) -> OrchestratorResult<Option<Transaction>> {
        Ok(None)
    }

    async fn get_transaction_receipt(
        &self,
        hash: H256,
    ) -> OrchestratorResult<Option<TransactionReceipt>> {
        Ok(self.receipts.lock().unwrap().get(&hash).cloned())
    }

    async fn pending_nonce(&self, _account: Address) -> OrchestratorResult<u64> {
        Ok(self.pending_nonce.load(Ordering::SeqCst))
    }

    async fn gas_price(&self) -> OrchestratorResult<U256> {
        Ok(self
            .gas_price
            .lock()
            .unwrap()
            .unwrap_or_else(|| U256::from(20u64) * U256::exp10(9)))
    }

    async fn estimate_gas(&self, _tx: &TypedTransaction) -> OrchestratorResult<U256> {
        Ok(U256::from(600_000u64))
    }

    async fn call(&self, tx: &TypedTransaction) -> OrchestratorResult<Bytes> {
        let data = tx.data().cloned().unwrap_or_default();
        if data.len() < 4 {
            return Err(OrchestratorError::EthRpc("empty calldata".to_string()));
        }
        let selector = &data[0..4];

        if selector == id("state_lastValsetNonce()") {
            let nonce = self.valset_nonce.load(Ordering::SeqCst);
            Ok(abi::encode(&[Token::Uint(U256::from(nonce))]).into())
        } else if selector == id("state_lastBatchNonces(address)") {
            let token = Address::from_slice(&data[16..36]);
            let nonce = self
                .batch_nonces
                .lock()
                .unwrap()
                .get(&token)
                .copied()
                .unwrap_or(0);
            Ok(abi::encode(&[Token::Uint(U256::from(nonce))]).into())
        } else if selector == id("state_peggyId()") {
            Ok(Bytes::from(keccak256(b"gantry-test").to_vec()))
        } else if selector == id("symbol()") {
            Ok(abi::encode(&[Token::String("MOCK".to_string())]).into())
        } else if selector == id("name()") {
            Ok(abi::encode(&[Token::String("Mock Token".to_string())]).into())
        } else if selector == id("decimals()") {
            Ok(abi::encode(&[Token::Uint(U256::from(6u64))]).into())
        } else {
            Err(OrchestratorError::EthRpc(format!(
                "mock has no handler for selector {:?}",
                hex::encode(selector)
            )))
        }
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> OrchestratorResult<H256> {
        if let Some(message) = self.fail_next_send.lock().unwrap().take() {
            return Err(OrchestratorError::EthRpc(message));
        }

        // legacy signed tx: [nonce, gasPrice, gas, to, value, data, v, r, s]
        let decoded = rlp::Rlp::new(&raw);
        let nonce: U256 = decoded
            .val_at(0)
            .map_err(|e| OrchestratorError::EthRpc(e.to_string()))?;
        let data: Vec<u8> = decoded
            .val_at(5)
            .map_err(|e| OrchestratorError::EthRpc(e.to_string()))?;

        self.sent.lock().unwrap().push((nonce.as_u64(), data));
        Ok(H256::from(keccak256(&raw)))
    }
}

/// Configurable fake sidechain node
#[derive(Default)]
pub struct MockSidechain {
    last_event: Mutex<LastObservedEvent>,
    current_valset: Mutex<Option<Valset>>,
    latest_valsets: Mutex<Vec<Valset>>,
    unsigned_valsets: Mutex<Vec<Valset>>,
    latest_batches: Mutex<Vec<OutgoingBatch>>,
    unsigned_batch: Mutex<Option<OutgoingBatch>>,
    valset_confirms: Mutex<HashMap<u64, Vec<ValsetConfirm>>>,
    batch_confirms: Mutex<HashMap<(u64, Address), Vec<BatchConfirm>>>,
    pending_sends: Mutex<Vec<PendingSendToEth>>,
    denoms: Mutex<HashMap<Address, String>>,
    denom_queries: AtomicU64,
}

impl MockSidechain {
    pub fn set_last_event(&self, event: LastObservedEvent) {
        *self.last_event.lock().unwrap() = event;
    }

    pub fn set_current_valset(&self, valset: Valset) {
        *self.current_valset.lock().unwrap() = Some(valset);
    }

    pub fn set_latest_valsets(&self, valsets: Vec<Valset>) {
        *self.latest_valsets.lock().unwrap() = valsets;
    }

    pub fn set_unsigned_valsets(&self, valsets: Vec<Valset>) {
        *self.unsigned_valsets.lock().unwrap() = valsets;
    }

    pub fn set_latest_batches(&self, batches: Vec<OutgoingBatch>) {
        *self.latest_batches.lock().unwrap() = batches;
    }

    pub fn set_unsigned_batch(&self, batch: Option<OutgoingBatch>) {
        *self.unsigned_batch.lock().unwrap() = batch;
    }

    pub fn set_valset_confirms(&self, nonce: u64, confirms: Vec<ValsetConfirm>) {
        self.valset_confirms.lock().unwrap().insert(nonce, confirms);
    }

    pub fn set_batch_confirms(&self, nonce: u64, token: Address, confirms: Vec<BatchConfirm>) {
        self.batch_confirms
            .lock()
            .unwrap()
            .insert((nonce, token), confirms);
    }

    pub fn set_pending_sends(&self, transfers: Vec<PendingSendToEth>) {
        *self.pending_sends.lock().unwrap() = transfers;
    }

    pub fn set_denom(&self, erc20: Address, denom: &str) {
        self.denoms.lock().unwrap().insert(erc20, denom.to_string());
    }

    pub fn denom_query_count(&self) -> u64 {
        self.denom_queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SidechainQuery for MockSidechain {
    async fn last_event_by_addr(
        &self,
        _orchestrator: &str,
    ) -> OrchestratorResult<LastObservedEvent> {
        Ok(*self.last_event.lock().unwrap())
    }

    async fn current_valset(&self) -> OrchestratorResult<Valset> {
        self.current_valset
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| OrchestratorError::SidechainRpc("no current valset".to_string()))
    }

    async fn latest_valsets(&self) -> OrchestratorResult<Vec<Valset>> {
        Ok(self.latest_valsets.lock().unwrap().clone())
    }

    async fn oldest_unsigned_valsets(
        &self,
        _orchestrator: &str,
    ) -> OrchestratorResult<Vec<Valset>> {
        Ok(self.unsigned_valsets.lock().unwrap().clone())
    }

    async fn latest_batches(&self) -> OrchestratorResult<Vec<OutgoingBatch>> {
        Ok(self.latest_batches.lock().unwrap().clone())
    }

    async fn oldest_unsigned_batch(
        &self,
        _orchestrator: &str,
    ) -> OrchestratorResult<Option<OutgoingBatch>> {
        Ok(self.unsigned_batch.lock().unwrap().clone())
    }

    async fn valset_confirms_by_nonce(
        &self,
        nonce: u64,
    ) -> OrchestratorResult<Vec<ValsetConfirm>> {
        Ok(self
            .valset_confirms
            .lock()
            .unwrap()
            .get(&nonce)
            .cloned()
            .unwrap_or_default())
    }

    async fn batch_confirms_by_nonce_and_token(
        &self,
        nonce: u64,
        token: Address,
    ) -> OrchestratorResult<Vec<BatchConfirm>> {
        Ok(self
            .batch_confirms
            .lock()
            .unwrap()
            .get(&(nonce, token))
            .cloned()
            .unwrap_or_default())
    }

    async fn pending_send_to_eth_by_addr(
        &self,
        _orchestrator: &str,
    ) -> OrchestratorResult<Vec<PendingSendToEth>> {
        Ok(self.pending_sends.lock().unwrap().clone())
    }

    async fn denom_by_erc20(&self, erc20: Address) -> OrchestratorResult<String> {
        self.denom_queries.fetch_add(1, Ordering::SeqCst);
        self.denoms
            .lock()
            .unwrap()
            .get(&erc20)
            .cloned()
            .ok_or_else(|| {
                OrchestratorError::SidechainRpc(format!("no denom for {:?}", erc20))
            })
    }
}

/// Captures queued sidechain transactions
#[derive(Default)]
pub struct MockSubmitter {
    submitted: Mutex<Vec<Vec<SidechainMsg>>>,
}

impl MockSubmitter {
    pub fn submitted(&self) -> Vec<Vec<SidechainMsg>> {
        self.submitted.lock().unwrap().clone()
    }
}

#[async_trait]
impl MsgSubmitter for MockSubmitter {
    async fn submit_msgs(&self, msgs: Vec<SidechainMsg>) -> OrchestratorResult<()> {
        self.submitted.lock().unwrap().push(msgs);
        Ok(())
    }
}

/// Fixed-quote price oracle
pub struct MockPriceOracle {
    eth_price: Mutex<f64>,
    token_prices: Mutex<HashMap<Address, f64>>,
}

impl Default for MockPriceOracle {
    fn default() -> Self {
        Self {
            eth_price: Mutex::new(2000.0),
            token_prices: Mutex::new(HashMap::new()),
        }
    }
}

impl MockPriceOracle {
    pub fn set_eth_price(&self, price: f64) {
        *self.eth_price.lock().unwrap() = price;
    }

    pub fn set_token_price(&self, token: Address, price: f64) {
        self.token_prices.lock().unwrap().insert(token, price);
    }
}

#[async_trait]
impl PriceOracle for MockPriceOracle {
    async fn eth_usd_price(&self) -> OrchestratorResult<f64> {
        Ok(*self.eth_price.lock().unwrap())
    }

    async fn token_usd_price(&self, erc20: Address) -> OrchestratorResult<f64> {
        self.token_prices
            .lock()
            .unwrap()
            .get(&erc20)
            .copied()
            .ok_or_else(|| OrchestratorError::PriceFeed(format!("no quote for {:?}", erc20)))
    }
}

/// Bridge contract over a mock provider and a throwaway key
pub fn mock_bridge_contract(provider: Arc<MockEthereumRpc>) -> Arc<BridgeContract> {
    let wallet: LocalWallet = "4c0883a69102937d6231471b5dbb6204fe51296170827936ea5cce4b76994b0f"
        .parse()
        .unwrap();
    let committer = Arc::new(EthCommitter::new(
        provider,
        Arc::new(NonceCache::new()),
        wallet,
        5,
        1.0,
        500,
    ));
    Arc::new(BridgeContract::new(
        committer,
        Address::from(TEST_BRIDGE_CONTRACT),
        Arc::new(PendingTxSet::new()),
    ))
}

/// Broadcast client wired to a mock submitter and a throwaway key
pub fn mock_broadcast_client(submitter: Arc<MockSubmitter>) -> BroadcastClient {
    let wallet: LocalWallet = "4c0883a69102937d6231471b5dbb6204fe51296170827936ea5cce4b76994b0f"
        .parse()
        .unwrap();
    BroadcastClient::new(
        submitter,
        wallet,
        "cosmos1qypqxpq9qcrsszg2pvxq6rs0zqg3yyc5lzv7xu".to_string(),
        "cosmosvaloper1qypqxpq9qcrsszg2pvxq6rs0zqg3yyc5ttk2dh".to_string(),
    )
}

fn padded_address(addr: Address) -> H256 {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(addr.as_bytes());
    H256::from(word)
}

/// A SendToCosmos log as the contract would emit it
pub fn deposit_log(
    erc20: Address,
    sender: Address,
    destination: [u8; 32],
    amount: u64,
    event_nonce: u64,
    block: u64,
) -> Log {
    Log {
        address: Address::from(TEST_BRIDGE_CONTRACT),
        topics: vec![
            *topics::SEND_TO_COSMOS,
            padded_address(erc20),
            padded_address(sender),
            H256::from(destination),
        ],
        data: abi::encode(&[
            Token::Uint(U256::from(amount)),
            Token::Uint(U256::from(event_nonce)),
        ])
        .into(),
        block_number: Some(block.into()),
        ..Default::default()
    }
}

/// A TransactionBatchExecuted log as the contract would emit it
pub fn batch_executed_log(batch_nonce: u64, token: Address, event_nonce: u64, block: u64) -> Log {
    Log {
        address: Address::from(TEST_BRIDGE_CONTRACT),
        topics: vec![
            *topics::BATCH_EXECUTED,
            H256::from_low_u64_be(batch_nonce),
            padded_address(token),
        ],
        data: abi::encode(&[Token::Uint(U256::from(event_nonce))]).into(),
        block_number: Some(block.into()),
        transaction_hash: Some(H256::from_low_u64_be(0xbeef)),
        ..Default::default()
    }
}
