//! Per-account transaction lifecycle manager
//!
//! Owns the nonce ledger, the pending store, the submission worker, and
//! the fee-bump loop for one signing account, and exposes the public
//! submit/await surface. Construction recovers persisted in-flight
//! transactions before any new submission is accepted.

use crate::chain::{ChainEndpoint, FeeOracle, TxId, UnsignedTx};
use crate::config::Settings;
use crate::error::KeeperResult;
use crate::events::{Replacement, ReplacementBus, ReplacementHandle};
use crate::metrics;
use crate::tx::bumper::FeeBumper;
use crate::tx::queue::{PublishHook, SubmissionQueue, SubmissionWorker};
use crate::tx::tracker::{Confirmation, ConfirmationTracker};
use crate::tx::{NonceLedger, PendingStore};

use alloy_primitives::Address;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Point-in-time view of the manager's pending set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeeperStats {
    pub pending_records: usize,
    pub total_variants: usize,
    pub chain_nonce: u64,
    pub next_nonce: u64,
}

pub struct TxManager {
    account: Address,
    store: Arc<PendingStore>,
    ledger: Arc<NonceLedger>,
    bus: Arc<ReplacementBus>,
    queue: SubmissionQueue,
    tracker: ConfirmationTracker,
    shutdown: CancellationToken,
}

impl TxManager {
    /// Create a manager for one account, recovering any checkpointed
    /// pending transactions from `data_dir`
    ///
    /// Recovered records are not rebroadcast here; the bump loop picks
    /// them up after their normal quiet period.
    pub async fn new(
        account: Address,
        endpoint: ChainEndpoint,
        settings: Settings,
        data_dir: &Path,
    ) -> KeeperResult<Self> {
        settings
            .validate()
            .map_err(|e| crate::error::KeeperError::Config(e.to_string()))?;

        let account_label = account.to_string();

        let store = Arc::new(PendingStore::open(data_dir).await?);
        let ledger = Arc::new(NonceLedger::new(account, endpoint.nonce_source.clone()));

        let chain_nonce = ledger.sync_from_chain().await?;
        if let Some(highest) = store.highest_nonce().await {
            ledger.observe_persisted(highest).await;
        }
        let reaped = store.reap_confirmed(chain_nonce).await;
        if !reaped.is_empty() {
            info!(?reaped, "checkpointed records were confirmed while offline");
        }

        let recovered = store.len().await;
        if recovered > 0 {
            info!(recovered, "resuming pending transactions from checkpoint");
        }
        metrics::set_pending_records(&account_label, recovered);

        let oracle = Arc::new(FeeOracle::new(
            endpoint.fee_market.clone(),
            settings.fees.fee_cache_ttl(),
        ));
        let bus = Arc::new(ReplacementBus::new(
            settings.submission.replacement_channel_capacity,
        ));
        let shutdown = CancellationToken::new();

        let (queue, _worker_handle) = SubmissionQueue::spawn(
            SubmissionWorker {
                store: store.clone(),
                ledger: ledger.clone(),
                oracle: oracle.clone(),
                codec: endpoint.codec.clone(),
                broadcaster: endpoint.broadcaster.clone(),
                config: settings.submission.clone(),
                account_label: account_label.clone(),
            },
            settings.submission.queue_depth,
            shutdown.child_token(),
        );

        let bumper = Arc::new(FeeBumper {
            store: store.clone(),
            ledger: ledger.clone(),
            oracle,
            codec: endpoint.codec.clone(),
            broadcaster: endpoint.broadcaster.clone(),
            bus: bus.clone(),
            policy: settings.fees.clone(),
            config: settings.submission.clone(),
            account_label: account_label.clone(),
        });
        tokio::spawn(bumper.run(shutdown.child_token()));

        let tracker = ConfirmationTracker {
            store: store.clone(),
            ledger: ledger.clone(),
            prober: endpoint.prober.clone(),
            bus: bus.clone(),
            config: settings.submission.clone(),
            account_label,
        };

        info!(account = %account, chain_nonce, "transaction manager started");

        Ok(Self {
            account,
            store,
            ledger,
            bus,
            queue,
            tracker,
            shutdown,
        })
    }

    /// Submit a prepared transaction; resolves once it is accepted by
    /// the network
    pub async fn submit(&self, tx: UnsignedTx) -> KeeperResult<TxId> {
        self.queue.submit(tx, None).await
    }

    /// Like `submit`, with a hook invoked between signing and broadcast
    pub async fn submit_with_hook(&self, tx: UnsignedTx, hook: PublishHook) -> KeeperResult<TxId> {
        self.queue.submit(tx, Some(hook)).await
    }

    /// Wait for the transaction, or whichever replacement supersedes
    /// it, to reach a terminal state
    pub async fn await_confirmation(
        &self,
        tx_id: TxId,
        cancel: CancellationToken,
    ) -> KeeperResult<Confirmation> {
        self.tracker.await_confirmation(tx_id, cancel).await
    }

    /// Register an observer for fee-bump replacements, invoked in
    /// registration order
    pub fn on_replacement(
        &self,
        callback: impl Fn(&Replacement) + Send + Sync + 'static,
    ) -> ReplacementHandle {
        self.bus.register(callback)
    }

    /// Remove a replacement observer
    pub fn off_replacement(&self, handle: ReplacementHandle) -> bool {
        self.bus.unregister(handle)
    }

    pub fn account(&self) -> Address {
        self.account
    }

    pub async fn stats(&self) -> KeeperStats {
        KeeperStats {
            pending_records: self.store.len().await,
            total_variants: self.store.total_variants().await,
            chain_nonce: self.ledger.chain_nonce().await,
            next_nonce: self.ledger.next_nonce().await,
        }
    }

    /// Stop the background loops; persisted state is left in place for
    /// the next process
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        info!(account = %self.account, "transaction manager shutting down");
    }
}

impl Drop for TxManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
