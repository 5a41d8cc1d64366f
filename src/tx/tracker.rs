//! Confirmation tracking
//!
//! One poll loop per awaited transaction. The loop follows the nonce's
//! replacement chain as the fee bumper supersedes variants, and settles
//! the ambiguity of a `not_found` probe against the nonce ledger: a
//! missing transaction whose nonce the chain has passed must have
//! executed, while one ahead of the chain is simply not propagated yet.

use super::nonce::NonceLedger;
use super::store::PendingStore;
use crate::chain::{StatusProber, TxId, TxStatus};
use crate::config::SubmissionConfig;
use crate::error::{KeeperError, KeeperResult};
use crate::events::{Replacement, ReplacementBus};
use crate::metrics;

use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How a tracked transaction resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    /// Executed with a success status
    Success,
    /// The account nonce advanced past this transaction while no
    /// receipt was observable; it executed, but with unknown status
    ImplicitlyConfirmed,
}

/// Terminal resolution of an awaited transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmation {
    /// The variant that resolved, which may be a fee-bump replacement
    /// of the id originally awaited
    pub tx_id: TxId,
    pub outcome: TxOutcome,
}

pub(crate) struct ConfirmationTracker {
    pub store: Arc<PendingStore>,
    pub ledger: Arc<NonceLedger>,
    pub prober: Arc<dyn StatusProber>,
    pub bus: Arc<ReplacementBus>,
    pub config: SubmissionConfig,
    pub account_label: String,
}

impl ConfirmationTracker {
    /// Poll until the transaction (or a replacement of it) reaches a
    /// terminal state
    ///
    /// Cancelling detaches only this caller's interest; the bump loop
    /// keeps driving the underlying record.
    pub async fn await_confirmation(
        &self,
        tx_id: TxId,
        cancel: CancellationToken,
    ) -> KeeperResult<Confirmation> {
        // subscribe before the first probe so no replacement slips
        // between probe and wait
        let mut events = self.bus.subscribe();

        let nonce = self.store.nonce_of(tx_id);
        let mut tracked = vec![tx_id];
        let mut current = tx_id;
        let mut polls: u32 = 0;

        debug!(tx_id = %tx_id, ?nonce, "awaiting confirmation");

        loop {
            // pick up variants appended while we were waiting, whether
            // or not the event was observed
            if let Some(n) = nonce {
                let ids = self.store.variant_ids(n).await;
                if !ids.is_empty() {
                    current = *ids.last().expect("non-empty variant ids");
                    tracked = ids;
                }
            }

            if let Some(confirmation) = self.probe_round(nonce, &tracked, current).await? {
                return Ok(confirmation);
            }

            polls += 1;
            if polls % self.config.resync_every_polls == 0 {
                // catch a nonce advanced by a replacement this tracker
                // never observed, e.g. across a restart
                if let Err(e) = self.ledger.sync_from_chain().await {
                    warn!(error = %e, "periodic ledger resync failed");
                }
            }

            self.wait_for_poll(&mut events, nonce, &mut tracked, &mut current, &cancel)
                .await?;
        }
    }

    /// Probe the active variant once; `Ok(None)` means keep polling
    async fn probe_round(
        &self,
        nonce: Option<u64>,
        tracked: &[TxId],
        current: TxId,
    ) -> KeeperResult<Option<Confirmation>> {
        let status = match self.prober.status(current).await {
            Ok(status) => status,
            Err(e) if e.is_retryable() => {
                warn!(tx_id = %current, error = %e, "status probe failed, will retry");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        match status {
            TxStatus::Pending => Ok(None),
            TxStatus::Success => Ok(Some(self.resolve_success(nonce, current).await)),
            TxStatus::Reverted => {
                self.resolve_failure(nonce, "reverted").await;
                Err(KeeperError::Reverted { tx_id: current })
            }
            TxStatus::Rejected => self.handle_rejected(nonce, tracked, current).await,
            TxStatus::NotFound => self.handle_not_found(nonce, current).await,
        }
    }

    /// A rejected active variant is terminal only when no sibling
    /// variant for the nonce remains viable, so the rest of the chain
    /// is probed in the same round before declaring the nonce dead
    async fn handle_rejected(
        &self,
        nonce: Option<u64>,
        tracked: &[TxId],
        current: TxId,
    ) -> KeeperResult<Option<Confirmation>> {
        let mut any_viable = false;

        for &sibling in tracked.iter().rev() {
            if sibling == current {
                continue;
            }
            match self.prober.status(sibling).await {
                Ok(TxStatus::Success) => {
                    return Ok(Some(self.resolve_success(nonce, sibling).await));
                }
                Ok(TxStatus::Reverted) => {
                    self.resolve_failure(nonce, "reverted").await;
                    return Err(KeeperError::Reverted { tx_id: sibling });
                }
                Ok(TxStatus::Pending) => any_viable = true,
                Ok(TxStatus::Rejected) | Ok(TxStatus::NotFound) => {}
                Err(e) => {
                    // without a clean probe we cannot rule the sibling
                    // out, so the nonce is not declared dead yet
                    warn!(tx_id = %sibling, error = %e, "sibling probe failed");
                    any_viable = true;
                }
            }
        }

        if any_viable {
            return Ok(None);
        }

        // the nonce may still have been consumed by a variant whose
        // rejection report was stale
        if let Some(n) = nonce {
            if self.ledger.is_confirmed(n).await {
                return Ok(Some(self.resolve_implicit(n, current).await));
            }
        }

        metrics::record_failed(&self.account_label, "rejected");
        Err(KeeperError::Rejected { tx_id: current })
    }

    async fn handle_not_found(
        &self,
        nonce: Option<u64>,
        current: TxId,
    ) -> KeeperResult<Option<Confirmation>> {
        let Some(n) = nonce else {
            // an id this manager never recorded and the node has never
            // seen cannot be disambiguated, refuse instead of polling
            // forever
            return Err(KeeperError::UnknownTransaction { tx_id: current });
        };

        if self.ledger.is_confirmed(n).await {
            return Ok(Some(self.resolve_implicit(n, current).await));
        }

        // not yet propagated, keep polling
        Ok(None)
    }

    async fn resolve_success(&self, nonce: Option<u64>, tx_id: TxId) -> Confirmation {
        if let Some(n) = nonce {
            self.store.remove(n).await;
            metrics::set_pending_records(&self.account_label, self.store.len().await);
        }
        metrics::record_confirmed(&self.account_label, "receipt");
        info!(tx_id = %tx_id, "transaction confirmed");
        Confirmation {
            tx_id,
            outcome: TxOutcome::Success,
        }
    }

    async fn resolve_implicit(&self, nonce: u64, tx_id: TxId) -> Confirmation {
        self.store.remove(nonce).await;
        metrics::record_confirmed(&self.account_label, "implicit");
        metrics::set_pending_records(&self.account_label, self.store.len().await);
        info!(
            tx_id = %tx_id,
            nonce,
            "nonce passed without an observable receipt, treating as confirmed"
        );
        Confirmation {
            tx_id,
            outcome: TxOutcome::ImplicitlyConfirmed,
        }
    }

    async fn resolve_failure(&self, nonce: Option<u64>, kind: &str) {
        if let Some(n) = nonce {
            self.store.remove(n).await;
            metrics::set_pending_records(&self.account_label, self.store.len().await);
        }
        metrics::record_failed(&self.account_label, kind);
    }

    /// Wait for the next poll tick, switching early when the fee bumper
    /// replaces the active variant
    async fn wait_for_poll(
        &self,
        events: &mut broadcast::Receiver<Replacement>,
        nonce: Option<u64>,
        tracked: &mut Vec<TxId>,
        current: &mut TxId,
        cancel: &CancellationToken,
    ) -> KeeperResult<()> {
        let tick = tokio::time::sleep(self.config.status_poll_interval());
        tokio::pin!(tick);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(KeeperError::Cancelled),
                _ = &mut tick => return Ok(()),
                event = events.recv() => match event {
                    Ok(replacement) if Some(replacement.nonce) == nonce => {
                        debug!(
                            old_id = %replacement.old_id,
                            new_id = %replacement.new_id,
                            "switching to replacement variant"
                        );
                        if !tracked.contains(&replacement.new_id) {
                            tracked.push(replacement.new_id);
                        }
                        *current = replacement.new_id;
                        // probe the replacement right away
                        return Ok(());
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "replacement events lagged, resyncing from store");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        // bus gone during shutdown, plain polling still works
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(KeeperError::Cancelled),
                            _ = &mut tick => return Ok(()),
                        }
                    }
                },
            }
        }
    }
}
