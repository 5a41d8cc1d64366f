//! txkeeper - transaction lifecycle management for account-sequenced
//! chains
//!
//! Issues, tracks, and fee-bumps nonce-sequenced transactions against a
//! remote RPC node, surviving process restarts without losing or
//! double-spending nonces:
//!
//! - serialized submission, so concurrent callers never race on nonce
//!   assignment
//! - confirmation tracking that follows fee-bump replacement chains and
//!   resolves transactions the node has already pruned
//! - automatic fee bumping of stuck transactions with monotonic
//!   replacement fees
//! - crash-recoverable checkpointing of every in-flight transaction and
//!   its fee history
//!
//! The chain itself is reached only through the narrow traits in
//! [`chain`]; signing, calldata encoding, fee estimation, and transport
//! all live behind them.

pub mod chain;
pub mod config;
pub mod error;
pub mod events;
pub mod manager;
pub mod metrics;
pub mod tx;

pub use chain::{
    Broadcaster, ChainEndpoint, FeeComponents, FeeMarket, FeeOracle, NonceSource, SignedTx,
    StatusProber, TransactionCodec, TxId, TxStatus, UnsignedTx,
};
pub use config::{FeePolicy, Settings, SubmissionConfig};
pub use error::{KeeperError, KeeperResult};
pub use events::{Replacement, ReplacementHandle};
pub use manager::{KeeperStats, TxManager};
pub use tx::{Confirmation, PendingRecord, PendingStore, PublishHook, TxOutcome, TxVariant};
