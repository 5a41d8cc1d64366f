//! Scriptable in-memory chain for lifecycle tests
//!
//! One `MockChain` stands in for every collaborator: it quotes fees,
//! signs deterministically, answers status probes, reports the account
//! nonce, and records broadcasts. Tests mutate its state to script
//! network behavior.

use alloy_primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use sha3::{Digest, Keccak256};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use txkeeper::{
    Broadcaster, ChainEndpoint, FeeComponents, FeeMarket, KeeperError, KeeperResult, NonceSource,
    SignedTx, StatusProber, TransactionCodec, TxId, TxStatus, UnsignedTx,
};

pub struct MockChain {
    state: Mutex<State>,
}

struct State {
    account_nonce: u64,
    fees: FeeComponents,
    statuses: HashMap<TxId, TxStatus>,
    /// (nonce, id, max fee) per signing, in call order
    sign_log: Vec<(u64, TxId, U256)>,
    broadcast_log: Vec<TxId>,
    /// Scripted failures consumed by upcoming broadcasts
    broadcast_failures: VecDeque<KeeperError>,
}

fn fees(max_fee: u64, priority: u64) -> FeeComponents {
    FeeComponents {
        max_fee_per_gas: U256::from(max_fee),
        max_priority_fee_per_gas: U256::from(priority),
    }
}

impl MockChain {
    pub fn new(account_nonce: u64, max_fee: u64, priority: u64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                account_nonce,
                fees: fees(max_fee, priority),
                statuses: HashMap::new(),
                sign_log: Vec::new(),
                broadcast_log: Vec::new(),
                broadcast_failures: VecDeque::new(),
            }),
        })
    }

    pub fn endpoint(self: &Arc<Self>) -> ChainEndpoint {
        ChainEndpoint {
            fee_market: self.clone(),
            codec: self.clone(),
            prober: self.clone(),
            nonce_source: self.clone(),
            broadcaster: self.clone(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("mock chain poisoned")
    }

    pub fn set_fees(&self, max_fee: u64, priority: u64) {
        self.lock().fees = fees(max_fee, priority);
    }

    pub fn set_account_nonce(&self, nonce: u64) {
        self.lock().account_nonce = nonce;
    }

    pub fn set_status(&self, id: TxId, status: TxStatus) {
        self.lock().statuses.insert(id, status);
    }

    /// Forget a transaction, as a node does after pruning
    pub fn clear_status(&self, id: TxId) {
        self.lock().statuses.remove(&id);
    }

    pub fn fail_next_broadcast(&self, err: KeeperError) {
        self.lock().broadcast_failures.push_back(err);
    }

    pub fn broadcast_count(&self) -> usize {
        self.lock().broadcast_log.len()
    }

    pub fn last_broadcast(&self) -> Option<TxId> {
        self.lock().broadcast_log.last().copied()
    }

    pub fn signed_nonces(&self) -> Vec<u64> {
        self.lock().sign_log.iter().map(|(n, _, _)| *n).collect()
    }

    pub fn last_signed(&self) -> Option<(u64, TxId, U256)> {
        self.lock().sign_log.last().copied()
    }
}

#[async_trait]
impl FeeMarket for MockChain {
    async fn fee_rate(&self) -> KeeperResult<FeeComponents> {
        Ok(self.lock().fees)
    }
}

#[async_trait]
impl TransactionCodec for MockChain {
    async fn sign(
        &self,
        tx: &UnsignedTx,
        nonce: u64,
        fees: &FeeComponents,
    ) -> KeeperResult<SignedTx> {
        let raw = serde_json::to_vec(&(tx, nonce, fees)).expect("mock signing payload");
        let id = B256::from_slice(&Keccak256::digest(&raw));
        self.lock().sign_log.push((nonce, id, fees.max_fee_per_gas));
        Ok(SignedTx {
            id,
            raw: Bytes::from(raw),
        })
    }
}

#[async_trait]
impl StatusProber for MockChain {
    async fn status(&self, id: TxId) -> KeeperResult<TxStatus> {
        Ok(self
            .lock()
            .statuses
            .get(&id)
            .copied()
            .unwrap_or(TxStatus::NotFound))
    }
}

#[async_trait]
impl NonceSource for MockChain {
    async fn account_nonce(&self, _account: Address) -> KeeperResult<u64> {
        Ok(self.lock().account_nonce)
    }
}

#[async_trait]
impl Broadcaster for MockChain {
    async fn broadcast(&self, raw: &Bytes) -> KeeperResult<TxId> {
        let mut state = self.lock();
        if let Some(err) = state.broadcast_failures.pop_front() {
            return Err(err);
        }
        let id = B256::from_slice(&Keccak256::digest(raw.as_ref()));
        state.broadcast_log.push(id);
        state.statuses.entry(id).or_insert(TxStatus::Pending);
        Ok(id)
    }
}

/// Install a test subscriber once; `RUST_LOG` controls verbosity
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn test_account() -> Address {
    Address::repeat_byte(0x42)
}

pub fn transfer(gas_limit: u64, tag: u8) -> UnsignedTx {
    UnsignedTx {
        to: Address::repeat_byte(0x99),
        value: U256::from(1_000_000u64),
        input: Bytes::from(vec![tag]),
        gas_limit,
        nonce: None,
    }
}

/// Spin on a condition in virtual time, yielding so background tasks
/// and their blocking file writes can make progress
pub async fn wait_until(what: &str, max: Duration, cond: impl Fn() -> bool) {
    let start = tokio::time::Instant::now();
    loop {
        if cond() {
            return;
        }
        assert!(
            start.elapsed() <= max,
            "timed out waiting for {what} after {max:?}"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
