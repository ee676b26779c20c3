//! Duplicate-submission suppression via the node's pending-tx feed
//!
//! The relayer can re-enter its loop while a prior submission still sits in
//! the mempool. Tracking the calldata digests of pending transactions to the
//! bridge contract lets it skip identical re-submissions instead of burning
//! gas on replacement-underpriced failures.

use crate::error::OrchestratorResult;

use dashmap::DashMap;
use ethers::prelude::*;
use ethers::utils::keccak256;
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// Set of calldata digests currently believed to be in the mempool,
/// keyed by keccak of the tx input data.
#[derive(Default)]
pub struct PendingTxSet {
    entries: DashMap<H256, Instant>,
}

impl PendingTxSet {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Record calldata seen in the pending feed (or just submitted by us)
    pub fn record(&self, input: &[u8]) {
        let digest = H256::from(keccak256(input));
        self.entries.insert(digest, Instant::now());
    }

    /// True iff the calldata is tracked and younger than `stale_after`.
    /// Entries past the staleness window are pruned and reported as not
    /// pending so the caller re-submits.
    pub fn is_pending(&self, input: &[u8], stale_after: Duration) -> bool {
        let digest = H256::from(keccak256(input));
        let age = match self.entries.get(&digest) {
            Some(entry) => entry.elapsed(),
            None => return false,
        };

        if age > stale_after {
            self.entries.remove(&digest);
            return false;
        }
        true
    }

    /// Drop the entry for executed calldata
    pub fn remove(&self, input: &[u8]) {
        let digest = H256::from(keccak256(input));
        self.entries.remove(&digest);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Background task feeding a [`PendingTxSet`] from the node's
/// `newPendingTransactions` subscription. Each announced hash is looked up
/// and recorded if the transaction targets the bridge contract. Reconnects
/// with exponential backoff until the token is cancelled.
pub async fn subscribe_pending_txs(
    set: Arc<PendingTxSet>,
    ws_url: String,
    bridge_contract: Address,
    cancel: CancellationToken,
) {
    let mut reconnect_delay = INITIAL_RECONNECT_DELAY;

    loop {
        if cancel.is_cancelled() {
            return;
        }

        match run_subscription(&set, &ws_url, bridge_contract, &cancel).await {
            Ok(()) => return, // cancelled
            Err(e) => {
                warn!(
                    "pending-tx subscription dropped: {}, reconnecting in {:?}",
                    e, reconnect_delay
                );
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(reconnect_delay) => {}
        }
        reconnect_delay = std::cmp::min(reconnect_delay * 2, MAX_RECONNECT_DELAY);
    }
}

async fn run_subscription(
    set: &PendingTxSet,
    ws_url: &str,
    bridge_contract: Address,
    cancel: &CancellationToken,
) -> OrchestratorResult<()> {
    let provider = Provider::<Ws>::connect(ws_url)
        .await
        .map_err(|e| crate::error::OrchestratorError::EthRpc(e.to_string()))?;
    info!("pending-tx websocket connected");

    let mut stream = provider
        .subscribe_pending_txs()
        .await
        .map_err(|e| crate::error::OrchestratorError::EthRpc(e.to_string()))?;

    loop {
        let hash = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            next = stream.next() => match next {
                Some(hash) => hash,
                None => {
                    return Err(crate::error::OrchestratorError::EthRpc(
                        "pending-tx stream closed".to_string(),
                    ))
                }
            },
        };

        // Per-tx lookup; unknown hashes (already mined or evicted) are skipped
        let tx = match provider.get_transaction(hash).await {
            Ok(Some(tx)) => tx,
            Ok(None) => continue,
            Err(e) => {
                debug!("pending tx {:?} lookup failed: {}", hash, e);
                continue;
            }
        };

        if tx.to == Some(bridge_contract) {
            set.record(&tx.input);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_input_not_pending() {
        let set = PendingTxSet::new();
        assert!(!set.is_pending(b"calldata", Duration::from_secs(60)));
    }

    #[test]
    fn test_fresh_input_is_pending() {
        let set = PendingTxSet::new();
        set.record(b"calldata");
        assert!(set.is_pending(b"calldata", Duration::from_secs(60)));
        // a different payload hashes elsewhere
        assert!(!set.is_pending(b"other calldata", Duration::from_secs(60)));
    }

    #[test]
    fn test_stale_input_pruned() {
        let set = PendingTxSet::new();
        set.record(b"calldata");
        // zero staleness window: any recorded entry is already stale
        assert!(!set.is_pending(b"calldata", Duration::from_secs(0)));
        // the stale entry was pruned, not just hidden
        assert!(set.is_empty());
    }

    #[test]
    fn test_remove_on_execution() {
        let set = PendingTxSet::new();
        set.record(b"calldata");
        set.remove(b"calldata");
        assert!(!set.is_pending(b"calldata", Duration::from_secs(60)));
    }
}
