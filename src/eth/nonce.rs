//! Local nonce tracking for serialized Ethereum transaction submission
//!
//! Each signer account must emit transactions with strictly increasing,
//! gap-free nonces. The cache keeps the next nonce per account locally so
//! concurrent senders collapse onto one ordered stream without a node
//! round-trip per send.

use crate::error::OrchestratorResult;

use dashmap::DashMap;
use ethers::types::Address;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Per-account nonce cache. All nonce mutations for an account must happen
/// inside [`NonceCache::serialize`], which holds that account's exclusive
/// lock across the whole reserve -> build -> submit -> observe region.
#[derive(Default)]
pub struct NonceCache {
    nonces: DashMap<Address, i64>,
    guards: DashMap<Address, Arc<Mutex<()>>>,
}

impl NonceCache {
    pub fn new() -> Self {
        Self {
            nonces: DashMap::new(),
            guards: DashMap::new(),
        }
    }

    fn guard(&self, account: Address) -> Arc<Mutex<()>> {
        self.guards
            .entry(account)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Serialize access to the account's nonce. A submission that increments
    /// the nonce but fails before broadcast has the exclusive right to
    /// decrement it back before anyone else reads it.
    pub async fn serialize<F, Fut, T>(&self, account: Address, f: F) -> OrchestratorResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = OrchestratorResult<T>>,
    {
        let guard = self.guard(account);
        let _held = guard.lock().await;
        f().await
    }

    /// Read the cached nonce. `loaded` is false if the account has never
    /// been set or synced.
    pub fn get(&self, account: Address) -> (i64, bool) {
        match self.nonces.get(&account) {
            Some(entry) => (*entry, true),
            None => (0, false),
        }
    }

    pub fn set(&self, account: Address, nonce: i64) {
        self.nonces.insert(account, nonce);
    }

    /// Increment and return the new value
    pub fn incr(&self, account: Address) -> i64 {
        let mut entry = self.nonces.entry(account).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Decrement and return the new value
    pub fn decr(&self, account: Address) -> i64 {
        let mut entry = self.nonces.entry(account).or_insert(0);
        *entry -= 1;
        *entry
    }

    /// Overwrite the cached value with the authoritative pending nonce
    /// fetched from the node.
    pub async fn sync<F, Fut>(&self, account: Address, fetch: F) -> OrchestratorResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = OrchestratorResult<u64>>,
    {
        let nonce = fetch().await?;
        self.nonces.insert(account, nonce as i64);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    fn account(byte: u8) -> Address {
        Address::from([byte; 20])
    }

    #[test]
    fn test_get_unloaded() {
        let cache = NonceCache::new();
        let (nonce, loaded) = cache.get(account(1));
        assert_eq!(nonce, 0);
        assert!(!loaded);
    }

    #[test]
    fn test_incr_decr_roundtrip() {
        let cache = NonceCache::new();
        cache.set(account(1), 41);
        assert_eq!(cache.incr(account(1)), 42);
        assert_eq!(cache.decr(account(1)), 41);
        let (nonce, loaded) = cache.get(account(1));
        assert_eq!(nonce, 41);
        assert!(loaded);
    }

    #[tokio::test]
    async fn test_sync_overwrites() {
        let cache = NonceCache::new();
        cache.set(account(2), 7);
        cache.sync(account(2), || async { Ok(100u64) }).await.unwrap();
        assert_eq!(cache.get(account(2)).0, 100);
    }

    #[tokio::test]
    async fn test_sync_error_leaves_value() {
        let cache = NonceCache::new();
        cache.set(account(2), 7);
        let res = cache
            .sync(account(2), || async {
                Err(crate::error::OrchestratorError::EthRpc("down".into()))
            })
            .await;
        assert!(res.is_err());
        assert_eq!(cache.get(account(2)).0, 7);
    }

    #[tokio::test]
    async fn test_serialize_reserve_and_give_back() {
        // First sender reserves N and broadcasts. Second sender reserves N+1
        // but fails before broadcast, so it hands N+1 back for reuse.
        let cache = Arc::new(NonceCache::new());
        cache.set(account(3), 10);
        let sent = Arc::new(AtomicI64::new(-1));

        let sent_inner = sent.clone();
        let inner = cache.clone();
        cache
            .serialize(account(3), || async {
                let (nonce, _) = inner.get(account(3));
                inner.incr(account(3));
                sent_inner.store(nonce, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(sent.load(Ordering::SeqCst), 10);
        assert_eq!(cache.get(account(3)).0, 11);

        let inner = cache.clone();
        let res = cache
            .serialize(account(3), || async {
                let (nonce, _) = inner.get(account(3));
                assert_eq!(nonce, 11);
                inner.incr(account(3));
                // fails before broadcast
                inner.decr(account(3));
                Err::<(), _>(crate::error::OrchestratorError::EthRpc(
                    "connection reset".into(),
                ))
            })
            .await;
        assert!(res.is_err());

        // nonce 11 was handed back and is reusable
        assert_eq!(cache.get(account(3)).0, 11);
    }

    #[tokio::test]
    async fn test_serialize_is_exclusive_per_account() {
        let cache = Arc::new(NonceCache::new());
        cache.set(account(4), 0);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                let inner = cache.clone();
                cache
                    .serialize(account(4), || async move {
                        let (before, _) = inner.get(account(4));
                        tokio::task::yield_now().await;
                        let after = inner.incr(account(4));
                        // no interleaving happened inside the critical region
                        assert_eq!(after, before + 1);
                        Ok(())
                    })
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(cache.get(account(4)).0, 8);
    }
}
