//! Error types for the transaction lifecycle manager

use crate::chain::TxId;

use thiserror::Error;

/// Main error type for lifecycle operations
#[derive(Error, Debug)]
pub enum KeeperError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Rate limited by remote node")]
    RateLimited,

    #[error("Nonce conflict: {message}")]
    NonceConflict { message: String },

    #[error("Replacement fee too low: {message}")]
    FeeTooLow { message: String },

    #[error("Transaction already known to the network")]
    AlreadyKnown,

    #[error("Insufficient funds: {message}")]
    InsufficientFunds { message: String },

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Broadcast rejected: {0}")]
    Broadcast(String),

    #[error("Transaction {tx_id} reverted on-chain")]
    Reverted { tx_id: TxId },

    #[error("Transaction {tx_id} and every replacement for its nonce were rejected")]
    Rejected { tx_id: TxId },

    #[error("Transaction {tx_id} is not known to this manager")]
    UnknownTransaction { tx_id: TxId },

    #[error("State persistence failed: {0}")]
    Persistence(#[from] std::io::Error),

    #[error("State serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Confirmation wait cancelled")]
    Cancelled,

    #[error("Manager is shutting down")]
    ShuttingDown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl KeeperError {
    /// Check if the error is a transient fault worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KeeperError::Transport(_) | KeeperError::Timeout { .. } | KeeperError::RateLimited
        )
    }

    /// Check if the error signals that the account nonce moved out from
    /// under the local ledger
    pub fn is_nonce_conflict(&self) -> bool {
        matches!(self, KeeperError::NonceConflict { .. })
    }

    /// Map an opaque `Broadcast` rejection onto the taxonomy by inspecting
    /// the node's message text. Other variants pass through unchanged.
    pub fn normalize(self) -> Self {
        match self {
            KeeperError::Broadcast(message) => classify_broadcast_failure(message),
            other => other,
        }
    }
}

/// Classify a raw broadcast rejection message from the node.
///
/// Node implementations disagree on exact wording, so this matches the
/// common substrings the major RPC servers emit.
pub fn classify_broadcast_failure(message: String) -> KeeperError {
    let lower = message.to_ascii_lowercase();

    if lower.contains("already known") || lower.contains("known transaction") {
        KeeperError::AlreadyKnown
    } else if lower.contains("nonce too low")
        || lower.contains("invalid nonce")
        || lower.contains("nonce already used")
    {
        KeeperError::NonceConflict { message }
    } else if lower.contains("underpriced") {
        KeeperError::FeeTooLow { message }
    } else if lower.contains("insufficient funds") {
        KeeperError::InsufficientFunds { message }
    } else if lower.contains("rate limit") || lower.contains("too many requests") {
        KeeperError::RateLimited
    } else if lower.contains("timeout") || lower.contains("timed out") {
        KeeperError::Timeout {
            operation: "broadcast".to_string(),
        }
    } else {
        KeeperError::Broadcast(message)
    }
}

/// Result type for lifecycle operations
pub type KeeperResult<T> = Result<T, KeeperError>;
