//! Transaction lifecycle: nonce ledger, pending store, serialized
//! submission, confirmation tracking, and fee bumping

pub mod bumper;
pub mod nonce;
pub mod queue;
pub mod store;
pub mod tracker;

pub use nonce::NonceLedger;
pub use queue::{PublishHook, SubmissionQueue};
pub use store::{PendingRecord, PendingStore, TxVariant};
pub use tracker::{Confirmation, TxOutcome};
