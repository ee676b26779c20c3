//! Batch gas estimation from executed-batch history
//!
//! Every `TransactionBatchExecuted` receipt tells us how much gas a batch
//! of a given size actually burned for a given token. The estimator keeps a
//! rolling per-token history and serves averages per batch size, falling
//! back to a measured default table when a size has no samples yet.

pub mod store;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::eth::provider::EthereumRpc;

use ethers::types::{Address, H256};
use store::{MemStore, WriteBatch};
use tracing::{debug, warn};

/// Keyspace prefixes
const KEY_PREFIX_UNPROCESSED: u8 = 0x01;
const KEY_PREFIX_PROCESSED: u8 = 0x02;
const KEY_PREFIX_ESTIMATE: u8 = 0x03;

/// Batches are capped at 100 transfers by the sidechain
pub const MAX_BATCH_SIZE: usize = 100;
/// Samples per (token, size) kept in the rolling average
const ROLLING_WINDOW: usize = 100;

/// Default gas per batch size, derived from mainnet measurements of
/// executed batches. Sizes between anchors are interpolated linearly.
const DEFAULT_GAS_TABLE: &[(u64, u64)] = &[
    (1, 486_000),
    (5, 541_000),
    (10, 612_000),
    (25, 816_000),
    (50, 1_154_000),
    (100, 1_828_000),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasEstimate {
    pub gas: u64,
    /// True when the estimate comes from the default table rather than
    /// observed receipts; callers should widen their margin.
    pub low_confidence: bool,
}

pub struct BatchGasEstimator {
    store: MemStore,
    /// Processed records older than this many blocks are pruned
    prune_keep_recent: u64,
}

impl BatchGasEstimator {
    pub fn new(prune_keep_recent: u64) -> Self {
        Self {
            store: MemStore::new(),
            prune_keep_recent,
        }
    }

    /// Mark an executed batch tx as awaiting receipt reconciliation
    pub fn record_executed(&self, token: Address, tx_hash: H256) {
        self.store.put(unprocessed_key(token, tx_hash), Vec::new());
    }

    /// Fetch receipts for unprocessed markers, extract (txCount, gasUsed)
    /// and move them into the processed keyspace. Returns how many records
    /// were reconciled.
    pub async fn reconcile(&self, provider: &dyn EthereumRpc) -> OrchestratorResult<usize> {
        let pending = self.store.prefix_scan(&[KEY_PREFIX_UNPROCESSED]);
        let mut batch = WriteBatch::default();
        let mut processed = 0;

        for (key, _) in pending {
            if key.len() != 53 {
                return Err(OrchestratorError::Internal(format!(
                    "malformed unprocessed key of length {}",
                    key.len()
                )));
            }
            let token = Address::from_slice(&key[1..21]);
            let tx_hash = H256::from_slice(&key[21..53]);

            let receipt = match provider.get_transaction_receipt(tx_hash).await? {
                Some(r) => r,
                None => continue, // not yet available, try next pass
            };

            // two of the receipt logs are the batch bookkeeping events,
            // everything else is one ERC20 transfer per outgoing tx
            if receipt.logs.len() < 3 {
                warn!("receipt {:?} has too few logs, dropping marker", tx_hash);
                batch.delete(key);
                continue;
            }
            let tx_count = std::cmp::min(receipt.logs.len() - 2, MAX_BATCH_SIZE) as u8;
            let gas_used = receipt.gas_used.map(|g| g.as_u64()).unwrap_or(0);
            let block_number = receipt.block_number.map(|b| b.as_u64()).unwrap_or(0);

            let mut value = Vec::with_capacity(9);
            value.push(tx_count);
            value.extend_from_slice(&gas_used.to_be_bytes());

            batch.put(processed_key(block_number, token, tx_hash), value);
            batch.delete(key);
            processed += 1;
        }

        if !batch.is_empty() {
            self.store.apply(batch);
        }
        Ok(processed)
    }

    /// Rebuild the per-token average table from processed records. Each
    /// (token, size) average covers at most the newest [`ROLLING_WINDOW`]
    /// samples.
    pub fn recompute(&self) {
        use std::collections::HashMap;

        // (token, size) -> gas samples, ascending block order from the scan
        let mut samples: HashMap<(Address, u8), Vec<u64>> = HashMap::new();
        for (key, value) in self.store.prefix_scan(&[KEY_PREFIX_PROCESSED]) {
            if key.len() != 61 || value.len() != 9 {
                continue;
            }
            let token = Address::from_slice(&key[9..29]);
            let tx_count = value[0];
            let gas = u64::from_be_bytes(value[1..9].try_into().unwrap());
            samples.entry((token, tx_count)).or_default().push(gas);
        }

        let mut batch = WriteBatch::default();
        for ((token, size), gas_values) in samples {
            let recent: &[u64] = if gas_values.len() > ROLLING_WINDOW {
                &gas_values[gas_values.len() - ROLLING_WINDOW..]
            } else {
                &gas_values
            };
            let avg = recent.iter().sum::<u64>() / recent.len() as u64;

            let mut value = Vec::with_capacity(12);
            value.extend_from_slice(&avg.to_be_bytes());
            value.extend_from_slice(&(recent.len() as u32).to_be_bytes());
            batch.put(estimate_key(token, size), value);
        }

        if !batch.is_empty() {
            debug!("recomputed {} gas estimates", batch.len());
            self.store.apply(batch);
        }
    }

    /// Delete processed records older than the retention window
    pub fn prune(&self, current_block: u64) {
        let cutoff = current_block.saturating_sub(self.prune_keep_recent);
        let mut batch = WriteBatch::default();
        for (key, _) in self.store.prefix_scan(&[KEY_PREFIX_PROCESSED]) {
            if key.len() != 61 {
                continue;
            }
            let block = u64::from_be_bytes(key[1..9].try_into().unwrap());
            if block < cutoff {
                batch.delete(key);
            } else {
                // keys are block-ordered, nothing newer can be older
                break;
            }
        }
        if !batch.is_empty() {
            debug!("pruned {} gas records below block {}", batch.len(), cutoff);
            self.store.apply(batch);
        }
    }

    /// Expected gas for a batch of `size` transfers of `token`
    pub fn estimate(&self, token: Address, size: usize) -> GasEstimate {
        let size = size.clamp(1, MAX_BATCH_SIZE) as u8;
        match self.store.get(&estimate_key(token, size)) {
            Some(value) if value.len() == 12 => {
                let gas = u64::from_be_bytes(value[0..8].try_into().unwrap());
                let count = u32::from_be_bytes(value[8..12].try_into().unwrap());
                if count == 0 {
                    GasEstimate {
                        gas: default_gas(size as u64),
                        low_confidence: true,
                    }
                } else {
                    GasEstimate {
                        gas,
                        low_confidence: false,
                    }
                }
            }
            _ => GasEstimate {
                gas: default_gas(size as u64),
                low_confidence: true,
            },
        }
    }
}

/// Interpolated default gas for a batch of `size` transfers
fn default_gas(size: u64) -> u64 {
    let table = DEFAULT_GAS_TABLE;
    if size <= table[0].0 {
        return table[0].1;
    }
    for pair in table.windows(2) {
        let (lo_size, lo_gas) = pair[0];
        let (hi_size, hi_gas) = pair[1];
        if size <= hi_size {
            let span = hi_size - lo_size;
            let offset = size - lo_size;
            return lo_gas + (hi_gas - lo_gas) * offset / span;
        }
    }
    table[table.len() - 1].1
}

fn unprocessed_key(token: Address, tx_hash: H256) -> Vec<u8> {
    let mut key = Vec::with_capacity(53);
    key.push(KEY_PREFIX_UNPROCESSED);
    key.extend_from_slice(token.as_bytes());
    key.extend_from_slice(tx_hash.as_bytes());
    key
}

fn processed_key(block_number: u64, token: Address, tx_hash: H256) -> Vec<u8> {
    let mut key = Vec::with_capacity(61);
    key.push(KEY_PREFIX_PROCESSED);
    key.extend_from_slice(&block_number.to_be_bytes());
    key.extend_from_slice(token.as_bytes());
    key.extend_from_slice(tx_hash.as_bytes());
    key
}

fn estimate_key(token: Address, size: u8) -> Vec<u8> {
    let mut key = Vec::with_capacity(22);
    key.push(KEY_PREFIX_ESTIMATE);
    key.extend_from_slice(token.as_bytes());
    key.push(size);
    key
}
