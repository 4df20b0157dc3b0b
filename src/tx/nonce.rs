//! Nonce management for reliable transaction submission
//!
//! Handles:
//! - Local nonce tracking so back-to-back submissions do not collide
//! - Reconciliation with the chain's view (pool included)
//! - Rollback when a reserved nonce was never broadcast

use crate::chain::ChainClient;
use crate::error::EngineResult;

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Per-chain nonce cache keyed by account
pub struct NonceManager {
    chain: String,
    client: Arc<dyn ChainClient>,
    /// account -> next nonce to hand out
    cache: DashMap<String, u64>,
}

impl NonceManager {
    pub fn new(chain: &str, client: Arc<dyn ChainClient>) -> Self {
        Self {
            chain: chain.to_string(),
            client,
            cache: DashMap::new(),
        }
    }

    fn key(address: &str) -> String {
        address.to_lowercase()
    }

    /// Reserve the next nonce for an account.
    ///
    /// The chain is always asked; the larger of its answer and the cached
    /// value wins, so transactions this process sent that are not yet in the
    /// pool are still accounted for. The compare-and-advance happens under
    /// the map's entry lock, so overlapping reservations for one account
    /// still get distinct nonces.
    pub async fn reserve(&self, address: &str) -> EngineResult<u64> {
        let on_chain = self.client.next_nonce(address).await?;

        let nonce = {
            let mut next = self.cache.entry(Self::key(address)).or_insert(on_chain);
            let nonce = (*next).max(on_chain);
            *next = nonce + 1;
            nonce
        };

        debug!(
            "Reserved nonce {} for {} on chain {} (chain reported {})",
            nonce, address, self.chain, on_chain
        );
        Ok(nonce)
    }

    /// Hand back a nonce that was never broadcast
    pub fn release(&self, address: &str, nonce: u64) {
        if let Some(mut next) = self.cache.get_mut(&Self::key(address)) {
            // Only the most recent reservation can be rolled back
            if *next == nonce + 1 {
                *next = nonce;
                debug!("Released nonce {} for {} on chain {}", nonce, address, self.chain);
            }
        }
    }

    /// Record that a nonce was accepted by the node
    pub fn commit(&self, address: &str, nonce: u64) {
        let mut next = self.cache.entry(Self::key(address)).or_insert(nonce + 1);
        if *next < nonce + 1 {
            *next = nonce + 1;
        }
    }

    /// Forget the cached nonce so the next reservation trusts the chain
    pub fn reset(&self, address: &str) {
        if self.cache.remove(&Self::key(address)).is_some() {
            warn!("Nonce cache reset for {} on chain {}", address, self.chain);
        }
    }

    pub fn reset_all(&self) {
        self.cache.clear();
    }

    /// Next nonce the cache would hand out, if known
    pub fn cached(&self, address: &str) -> Option<u64> {
        self.cache.get(&Self::key(address)).map(|n| *n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChainClient;
    use crate::testing::FakeChain;
    use crate::tx::types::ChainFamily;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    const ADDR: &str = "0xABCDEF0000000000000000000000000000000001";

    fn manager_with_chain_nonce(nonce: Arc<AtomicU64>) -> NonceManager {
        let mut client = MockChainClient::new();
        client
            .expect_next_nonce()
            .returning(move |_| Ok(nonce.load(Ordering::SeqCst)));
        NonceManager::new("evm", Arc::new(client))
    }

    #[tokio::test]
    async fn test_reserve_uses_chain_nonce() {
        let manager = manager_with_chain_nonce(Arc::new(AtomicU64::new(5)));
        assert_eq!(manager.reserve(ADDR).await.unwrap(), 5);
        assert_eq!(manager.cached(ADDR), Some(6));
    }

    #[tokio::test]
    async fn test_sequential_reservations_do_not_collide() {
        let manager = manager_with_chain_nonce(Arc::new(AtomicU64::new(5)));
        let mut nonces = Vec::new();
        for _ in 0..3 {
            nonces.push(manager.reserve(ADDR).await.unwrap());
        }
        assert_eq!(nonces, vec![5, 6, 7]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_reservations_get_distinct_nonces() {
        let chain = Arc::new(FakeChain::new(ChainFamily::Evm, 0));
        chain.set_nonce(5);
        chain.nonce_latency(Duration::from_millis(50));
        let manager = NonceManager::new("evm", chain.clone());

        // All four chain queries are in flight before any reservation lands
        let (a, b, c, d) = tokio::join!(
            manager.reserve(ADDR),
            manager.reserve(ADDR),
            manager.reserve(ADDR),
            manager.reserve(ADDR),
        );

        let mut nonces = vec![a.unwrap(), b.unwrap(), c.unwrap(), d.unwrap()];
        nonces.sort_unstable();
        assert_eq!(nonces, vec![5, 6, 7, 8]);
        assert_eq!(manager.cached(ADDR), Some(9));
    }

    #[tokio::test]
    async fn test_external_jump_wins() {
        let chain = Arc::new(AtomicU64::new(5));
        let manager = manager_with_chain_nonce(chain.clone());
        assert_eq!(manager.reserve(ADDR).await.unwrap(), 5);

        chain.store(9, Ordering::SeqCst);
        assert_eq!(manager.reserve(ADDR).await.unwrap(), 9);
    }

    #[tokio::test]
    async fn test_release_rolls_back_latest_only() {
        let manager = manager_with_chain_nonce(Arc::new(AtomicU64::new(5)));
        let first = manager.reserve(ADDR).await.unwrap();
        let second = manager.reserve(ADDR).await.unwrap();

        manager.release(ADDR, first);
        assert_eq!(manager.cached(ADDR), Some(7));

        manager.release(ADDR, second);
        assert_eq!(manager.cached(ADDR), Some(6));
    }

    #[tokio::test]
    async fn test_reset_defers_to_chain() {
        let chain = Arc::new(AtomicU64::new(5));
        let manager = manager_with_chain_nonce(chain.clone());
        manager.commit(ADDR, 10);
        assert_eq!(manager.reserve(ADDR).await.unwrap(), 11);

        manager.reset(ADDR);
        assert_eq!(manager.cached(ADDR), None);
        assert_eq!(manager.reserve(ADDR).await.unwrap(), 5);
    }

    #[test]
    fn test_keys_are_case_insensitive() {
        let manager = manager_with_chain_nonce(Arc::new(AtomicU64::new(0)));
        manager.commit(ADDR, 3);
        assert_eq!(manager.cached(&ADDR.to_lowercase()), Some(4));
    }
}
