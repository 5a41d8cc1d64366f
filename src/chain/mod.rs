//! Chain-facing interfaces and core wire types
//!
//! The manager never talks to an RPC node directly. Everything it needs
//! from the outside world comes through the narrow traits here: fee
//! quotes, signing, status probes, the account nonce, and raw broadcast.
//! Implementations own transport concerns (endpoints, failover, auth).

pub mod fee;

pub use fee::FeeOracle;

use crate::error::KeeperResult;

use alloy_primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Transaction identifier as assigned by the signer
pub type TxId = B256;

/// Normalized confirmation state of a transaction id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// The node has never seen this id, or has already pruned it
    NotFound,
    /// Accepted into the mempool, not yet executed
    Pending,
    /// Executed and included with success
    Success,
    /// Executed and included, but the ledger rejected its effects
    Reverted,
    /// Explicitly dropped by the network
    Rejected,
}

/// Per-unit fee costs for the chain's resource dimensions
///
/// Replacement rules require every dimension to increase monotonically,
/// so these fields are always raised together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeComponents {
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

/// A transaction prepared by the caller, before nonce and fee assignment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedTx {
    pub to: Address,
    #[serde(default)]
    pub value: U256,
    #[serde(default)]
    pub input: Bytes,
    pub gas_limit: u64,
    /// Callers normally leave this empty and let the manager allocate;
    /// a pre-assigned nonce bypasses allocation and rollback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<u64>,
}

/// A signed transaction ready for broadcast
#[derive(Debug, Clone)]
pub struct SignedTx {
    pub id: TxId,
    pub raw: Bytes,
}

/// Current fee market quote
#[async_trait]
pub trait FeeMarket: Send + Sync {
    async fn fee_rate(&self) -> KeeperResult<FeeComponents>;
}

/// Signs a prepared transaction for a given nonce and fee assignment
#[async_trait]
pub trait TransactionCodec: Send + Sync {
    async fn sign(
        &self,
        tx: &UnsignedTx,
        nonce: u64,
        fees: &FeeComponents,
    ) -> KeeperResult<SignedTx>;
}

/// Queries the node for the confirmation state of a transaction id
#[async_trait]
pub trait StatusProber: Send + Sync {
    async fn status(&self, id: TxId) -> KeeperResult<TxStatus>;
}

/// Fetches the account nonce as seen in the latest confirmed block
#[async_trait]
pub trait NonceSource: Send + Sync {
    async fn account_nonce(&self, account: Address) -> KeeperResult<u64>;
}

/// Submits a raw signed transaction to the network
///
/// Implementations may return `KeeperError::Broadcast` with the node's
/// raw message text; call sites normalize it onto the error taxonomy.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn broadcast(&self, raw: &Bytes) -> KeeperResult<TxId>;
}

/// Bundle of chain collaborators for one account's manager
#[derive(Clone)]
pub struct ChainEndpoint {
    pub fee_market: Arc<dyn FeeMarket>,
    pub codec: Arc<dyn TransactionCodec>,
    pub prober: Arc<dyn StatusProber>,
    pub nonce_source: Arc<dyn NonceSource>,
    pub broadcaster: Arc<dyn Broadcaster>,
}

/// Broadcast with retry on transient transport faults
///
/// Protocol rejections (nonce conflicts, underpriced replacements,
/// duplicates) are returned immediately for the caller to interpret.
pub(crate) async fn broadcast_with_retry(
    broadcaster: &dyn Broadcaster,
    raw: &Bytes,
    max_attempts: u32,
    retry_delay: Duration,
) -> KeeperResult<TxId> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match broadcaster.broadcast(raw).await {
            Ok(id) => return Ok(id),
            Err(e) => {
                let e = e.normalize();
                if e.is_retryable() && attempt < max_attempts {
                    warn!(
                        attempt,
                        max_attempts,
                        error = %e,
                        "broadcast failed, retrying"
                    );
                    tokio::time::sleep(retry_delay).await;
                    continue;
                }
                return Err(e);
            }
        }
    }
}
