//! Nonce ledger for one signing account
//!
//! Tracks two counters: the account nonce the chain has confirmed
//! (`chain_nonce`, equal to the count of executed transactions) and the
//! next nonce to hand out locally (`next_nonce`). Allocation is
//! optimistic; a failed broadcast rolls back through the same submission
//! worker that allocated, so the guarded decrement never races.

use crate::chain::NonceSource;
use crate::error::KeeperResult;

use alloy_primitives::Address;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

struct Counters {
    /// Account nonce reported by the chain; a nonce `n` is confirmed
    /// iff `n < chain_nonce`
    chain_nonce: u64,
    /// Next nonce to allocate locally; invariant `chain_nonce <= next_nonce`
    next_nonce: u64,
}

pub struct NonceLedger {
    account: Address,
    source: Arc<dyn NonceSource>,
    counters: Mutex<Counters>,
}

impl NonceLedger {
    /// Create a ledger with both counters at zero; callers must
    /// `sync_from_chain` before the first allocation.
    pub fn new(account: Address, source: Arc<dyn NonceSource>) -> Self {
        Self {
            account,
            source,
            counters: Mutex::new(Counters {
                chain_nonce: 0,
                next_nonce: 0,
            }),
        }
    }

    /// Allocate the next nonce, optimistically
    pub async fn allocate(&self) -> u64 {
        let mut counters = self.counters.lock().await;
        let nonce = counters.next_nonce;
        counters.next_nonce += 1;
        debug!(nonce, account = %self.account, "allocated nonce");
        nonce
    }

    /// Compensate a failed broadcast by returning the nonce
    ///
    /// Only decrements when the nonce is still the top of the counter;
    /// anything else means an allocation interleaved and blind decrement
    /// would double-assign, so the gap is logged and left for a resync.
    pub async fn rollback(&self, nonce: u64) {
        let mut counters = self.counters.lock().await;
        if counters.next_nonce == nonce + 1 {
            counters.next_nonce = nonce;
            debug!(nonce, "rolled back nonce allocation");
        } else {
            warn!(
                nonce,
                next_nonce = counters.next_nonce,
                "cannot roll back non-top nonce, leaving gap for resync"
            );
        }
    }

    /// Reconcile with the chain's view of the account
    ///
    /// Counters only move forward here: a lagging node snapshot must not
    /// regress local state. If the chain is ahead of `next_nonce`, some
    /// other issuer used the account and the local counter jumps forward.
    /// Returns the reconciled chain nonce so callers can reap records
    /// whose nonces are now proven confirmed.
    pub async fn sync_from_chain(&self) -> KeeperResult<u64> {
        let fetched = self.source.account_nonce(self.account).await?;
        let mut counters = self.counters.lock().await;

        if fetched > counters.chain_nonce {
            debug!(
                from = counters.chain_nonce,
                to = fetched,
                "chain nonce advanced"
            );
            counters.chain_nonce = fetched;
        }
        if counters.next_nonce < counters.chain_nonce {
            warn!(
                local = counters.next_nonce,
                chain = counters.chain_nonce,
                "account was used elsewhere, raising local nonce"
            );
            counters.next_nonce = counters.chain_nonce;
        }

        Ok(counters.chain_nonce)
    }

    /// Raise `next_nonce` past a nonce recovered from persisted state
    pub async fn observe_persisted(&self, nonce: u64) {
        let mut counters = self.counters.lock().await;
        if counters.next_nonce <= nonce {
            counters.next_nonce = nonce + 1;
        }
    }

    pub async fn is_confirmed(&self, nonce: u64) -> bool {
        nonce < self.counters.lock().await.chain_nonce
    }

    pub async fn chain_nonce(&self) -> u64 {
        self.counters.lock().await.chain_nonce
    }

    pub async fn next_nonce(&self) -> u64 {
        self.counters.lock().await.next_nonce
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KeeperResult;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct FakeSource {
        nonce: AtomicU64,
    }

    #[async_trait]
    impl NonceSource for FakeSource {
        async fn account_nonce(&self, _account: Address) -> KeeperResult<u64> {
            Ok(self.nonce.load(Ordering::SeqCst))
        }
    }

    fn ledger(chain_nonce: u64) -> (NonceLedger, Arc<FakeSource>) {
        let source = Arc::new(FakeSource {
            nonce: AtomicU64::new(chain_nonce),
        });
        (
            NonceLedger::new(Address::repeat_byte(0x11), source.clone()),
            source,
        )
    }

    #[tokio::test]
    async fn allocates_sequentially_from_chain_nonce() {
        let (ledger, _) = ledger(5);
        ledger.sync_from_chain().await.unwrap();
        assert_eq!(ledger.allocate().await, 5);
        assert_eq!(ledger.allocate().await, 6);
        assert_eq!(ledger.next_nonce().await, 7);
    }

    #[tokio::test]
    async fn fresh_account_starts_at_zero() {
        let (ledger, _) = ledger(0);
        ledger.sync_from_chain().await.unwrap();
        assert_eq!(ledger.allocate().await, 0);
        assert!(!ledger.is_confirmed(0).await);
    }

    #[tokio::test]
    async fn rollback_only_from_the_top() {
        let (ledger, _) = ledger(0);
        ledger.sync_from_chain().await.unwrap();
        let first = ledger.allocate().await;
        let second = ledger.allocate().await;

        // first is no longer top of the counter, must not decrement
        ledger.rollback(first).await;
        assert_eq!(ledger.next_nonce().await, 2);

        ledger.rollback(second).await;
        assert_eq!(ledger.next_nonce().await, 1);
    }

    #[tokio::test]
    async fn external_use_raises_local_counter() {
        let (ledger, source) = ledger(3);
        ledger.sync_from_chain().await.unwrap();
        assert_eq!(ledger.next_nonce().await, 3);

        source.nonce.store(9, Ordering::SeqCst);
        let chain_nonce = ledger.sync_from_chain().await.unwrap();
        assert_eq!(chain_nonce, 9);
        assert_eq!(ledger.next_nonce().await, 9);
        assert!(ledger.is_confirmed(8).await);
        assert!(!ledger.is_confirmed(9).await);
    }

    #[tokio::test]
    async fn lagging_snapshot_never_regresses() {
        let (ledger, source) = ledger(7);
        ledger.sync_from_chain().await.unwrap();

        source.nonce.store(4, Ordering::SeqCst);
        let chain_nonce = ledger.sync_from_chain().await.unwrap();
        assert_eq!(chain_nonce, 7);
    }

    #[tokio::test]
    async fn persisted_nonces_raise_next() {
        let (ledger, _) = ledger(2);
        ledger.sync_from_chain().await.unwrap();
        ledger.observe_persisted(8).await;
        assert_eq!(ledger.next_nonce().await, 9);

        // lower persisted nonce does not lower the counter
        ledger.observe_persisted(3).await;
        assert_eq!(ledger.next_nonce().await, 9);
    }
}
