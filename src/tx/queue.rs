//! Serialized submission queue for one signing account
//!
//! The chain has no way to reserve a nonce, so two submissions racing to
//! sign with the same one would produce mutually exclusive transactions.
//! A single worker draining a FIFO channel makes nonce allocation order
//! equal admission order by construction, trading throughput for
//! correctness on a path that is never hot relative to confirmation
//! latency.

use super::nonce::NonceLedger;
use super::store::{PendingRecord, PendingStore, TxVariant};
use crate::chain::{
    broadcast_with_retry, Broadcaster, FeeOracle, TransactionCodec, TxId, UnsignedTx,
};
use crate::config::SubmissionConfig;
use crate::error::{KeeperError, KeeperResult};
use crate::metrics;

use alloy_primitives::Bytes;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Side-effecting hook invoked after signing and before broadcast, so
/// callers can record provenance while the transaction is still
/// revocable. A hook failure is logged and never blocks publishing.
pub type PublishHook = Box<dyn FnOnce(TxId, Bytes) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

struct SubmitJob {
    tx: UnsignedTx,
    hook: Option<PublishHook>,
    reply: oneshot::Sender<KeeperResult<TxId>>,
}

/// Handle for enqueueing submissions
pub struct SubmissionQueue {
    jobs: mpsc::Sender<SubmitJob>,
}

impl SubmissionQueue {
    /// Spawn the worker and return the queue handle
    pub(crate) fn spawn(
        worker: SubmissionWorker,
        depth: usize,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (jobs, mut rx) = mpsc::channel::<SubmitJob>(depth);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    job = rx.recv() => match job {
                        Some(SubmitJob { tx, hook, reply }) => {
                            let result = worker.process(tx, hook).await;
                            // caller may have given up waiting, that is fine
                            let _ = reply.send(result);
                        }
                        None => break,
                    }
                }
            }
            debug!("submission worker stopped");
        });

        (Self { jobs }, handle)
    }

    /// Enqueue a submission and wait for its broadcast outcome
    pub async fn submit(&self, tx: UnsignedTx, hook: Option<PublishHook>) -> KeeperResult<TxId> {
        let (reply, rx) = oneshot::channel();
        self.jobs
            .send(SubmitJob { tx, hook, reply })
            .await
            .map_err(|_| KeeperError::ShuttingDown)?;
        rx.await.map_err(|_| KeeperError::ShuttingDown)?
    }
}

/// The single worker owning the allocate, sign, record, broadcast cycle
pub(crate) struct SubmissionWorker {
    pub store: Arc<PendingStore>,
    pub ledger: Arc<NonceLedger>,
    pub oracle: Arc<FeeOracle>,
    pub codec: Arc<dyn TransactionCodec>,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub config: SubmissionConfig,
    pub account_label: String,
}

impl SubmissionWorker {
    async fn process(&self, tx: UnsignedTx, hook: Option<PublishHook>) -> KeeperResult<TxId> {
        let (nonce, allocated) = match tx.nonce {
            Some(nonce) => (nonce, false),
            None => (self.ledger.allocate().await, true),
        };

        let result = self.submit_at(&tx, nonce, hook).await;

        if let Err(e) = &result {
            metrics::record_submit_failed(&self.account_label);
            if allocated {
                self.ledger.rollback(nonce).await;
            }
            if e.is_nonce_conflict() {
                // some other issuer advanced the account, reconcile
                // before the caller sees the error
                match self.ledger.sync_from_chain().await {
                    Ok(chain_nonce) => {
                        let reaped = self.store.reap_confirmed(chain_nonce).await;
                        if !reaped.is_empty() {
                            info!(
                                ?reaped,
                                chain_nonce,
                                "records confirmed by external nonce advance"
                            );
                        }
                    }
                    Err(sync_err) => {
                        warn!(error = %sync_err, "ledger resync after nonce conflict failed")
                    }
                }
            }
        }

        metrics::set_pending_records(&self.account_label, self.store.len().await);
        result
    }

    async fn submit_at(
        &self,
        tx: &UnsignedTx,
        nonce: u64,
        hook: Option<PublishHook>,
    ) -> KeeperResult<TxId> {
        let fees = self.oracle.snapshot().await?;
        let signed = self.codec.sign(tx, nonce, &fees).await?;

        if let Some(hook) = hook {
            if let Err(e) = hook(signed.id, signed.raw.clone()).await {
                warn!(tx_id = %signed.id, error = %e, "pre-publish hook failed");
            }
        }

        let variant = TxVariant {
            id: signed.id,
            raw: signed.raw.clone(),
            fees,
        };
        self.store
            .insert(PendingRecord::new(nonce, tx.clone(), variant))
            .await;

        let broadcast = broadcast_with_retry(
            self.broadcaster.as_ref(),
            &signed.raw,
            self.config.max_broadcast_attempts,
            self.config.retry_delay(),
        )
        .await;

        match broadcast {
            Ok(_) | Err(KeeperError::AlreadyKnown) => {
                self.store.release_in_flight(nonce).await;
                metrics::record_submitted(&self.account_label);
                info!(tx_id = %signed.id, nonce, "transaction broadcast");
                Ok(signed.id)
            }
            Err(e) => {
                // the network never saw it, so the record must not
                // survive to be bumped or recovered
                self.store.remove(nonce).await;
                warn!(tx_id = %signed.id, nonce, error = %e, "broadcast failed");
                Err(e)
            }
        }
    }
}
