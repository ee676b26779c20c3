//! ERC20 to sidechain denom resolution
//!
//! Denoms never change once an ERC20 is adopted, so results are cached for
//! the life of the process. A single lock covers the map; misses hold it
//! across the sidechain query so concurrent misses do not stampede.

use super::query::SidechainQuery;
use crate::error::OrchestratorResult;

use ethers::types::Address;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

pub struct Erc20DenomCache {
    query: Arc<dyn SidechainQuery>,
    cache: Mutex<HashMap<Address, String>>,
}

impl Erc20DenomCache {
    pub fn new(query: Arc<dyn SidechainQuery>) -> Self {
        Self {
            query,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn denom_for(&self, erc20: Address) -> OrchestratorResult<String> {
        let mut cache = self.cache.lock().await;
        if let Some(denom) = cache.get(&erc20) {
            return Ok(denom.clone());
        }

        let denom = self.query.denom_by_erc20(erc20).await?;
        debug!("resolved {:?} to denom {}", erc20, denom);
        cache.insert(erc20, denom.clone());
        Ok(denom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockSidechain;

    #[tokio::test]
    async fn test_miss_queries_then_caches() {
        let sidechain = Arc::new(MockSidechain::default());
        let erc20 = Address::from([0xaa; 20]);
        sidechain.set_denom(erc20, "gantry0xaa");

        let cache = Erc20DenomCache::new(sidechain.clone());
        assert_eq!(cache.denom_for(erc20).await.unwrap(), "gantry0xaa");
        assert_eq!(cache.denom_for(erc20).await.unwrap(), "gantry0xaa");
        // second hit was served from the cache
        assert_eq!(sidechain.denom_query_count(), 1);
    }

    #[tokio::test]
    async fn test_error_is_not_cached() {
        let sidechain = Arc::new(MockSidechain::default());
        let erc20 = Address::from([0xbb; 20]);

        let cache = Erc20DenomCache::new(sidechain.clone());
        assert!(cache.denom_for(erc20).await.is_err());

        sidechain.set_denom(erc20, "gantry0xbb");
        assert_eq!(cache.denom_for(erc20).await.unwrap(), "gantry0xbb");
    }
}
