//! Fee bumper loop
//!
//! Periodically scans the pending store for submissions that have sat
//! unconfirmed past the quiet period and supersedes them with a
//! higher-fee replacement, or rebroadcasts them unchanged when the fee
//! market has not moved. One bad record never halts bumping for the
//! rest of the account's pending set.

use super::nonce::NonceLedger;
use super::store::{PendingRecord, PendingStore, TxVariant};
use crate::chain::fee::plan_bump;
use crate::chain::{Broadcaster, FeeComponents, FeeOracle, TransactionCodec};
use crate::config::{FeePolicy, SubmissionConfig};
use crate::error::{KeeperError, KeeperResult};
use crate::events::{Replacement, ReplacementBus};
use crate::metrics;

use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub(crate) struct FeeBumper {
    pub store: Arc<PendingStore>,
    pub ledger: Arc<NonceLedger>,
    pub oracle: Arc<FeeOracle>,
    pub codec: Arc<dyn TransactionCodec>,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub bus: Arc<ReplacementBus>,
    pub policy: FeePolicy,
    pub config: SubmissionConfig,
    pub account_label: String,
}

impl FeeBumper {
    /// Run the bump loop until shutdown
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = interval(self.config.bump_check_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            wait_before_bump_ms = self.config.wait_before_bump_ms,
            "fee bumper started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }

        debug!("fee bumper stopped");
    }

    /// One scan over the pending set
    pub async fn tick(&self) {
        // one resync per tick, shared by every record below
        let chain_nonce = match self.ledger.sync_from_chain().await {
            Ok(chain_nonce) => chain_nonce,
            Err(e) => {
                warn!(error = %e, "ledger resync failed, skipping bump tick");
                return;
            }
        };

        let reaped = self.store.reap_confirmed(chain_nonce).await;
        for nonce in &reaped {
            info!(nonce, "pending transaction confirmed by nonce advance");
            metrics::record_confirmed(&self.account_label, "nonce_advance");
        }
        if !reaped.is_empty() {
            metrics::set_pending_records(&self.account_label, self.store.len().await);
        }

        let due = self.store.due_records(self.config.wait_before_bump()).await;
        if due.is_empty() {
            return;
        }

        // one market quote per tick, shared by every record below
        let market = match self.oracle.snapshot().await {
            Ok(market) => market,
            Err(e) => {
                warn!(error = %e, "fee market unavailable, skipping bump tick");
                return;
            }
        };

        for record in due {
            let nonce = record.nonce;
            if !self.store.claim_in_flight(nonce).await {
                continue;
            }
            if let Err(e) = self.bump_or_rebroadcast(record, &market).await {
                error!(nonce, error = %e, "bump cycle failed, will retry next tick");
            }
            self.store.release_in_flight(nonce).await;
        }
    }

    async fn bump_or_rebroadcast(
        &self,
        record: PendingRecord,
        market: &FeeComponents,
    ) -> KeeperResult<()> {
        let active = record.active();

        match plan_bump(&active.fees, market, &self.policy) {
            Some(fees) => self.bump(&record, fees).await,
            None => self.rebroadcast(&record).await,
        }
    }

    /// Replace the active variant with a higher-fee signing of the same
    /// prepared body and nonce
    async fn bump(&self, record: &PendingRecord, fees: FeeComponents) -> KeeperResult<()> {
        let nonce = record.nonce;
        let old = record.active().clone();

        // a signing failure leaves the record unbumped for the next tick
        let signed = match self.codec.sign(&record.tx, nonce, &fees).await {
            Ok(signed) => signed,
            Err(e) => {
                warn!(nonce, error = %e, "replacement signing failed");
                return Ok(());
            }
        };

        let variant = TxVariant {
            id: signed.id,
            raw: signed.raw,
            fees,
        };
        self.store.append_variant(nonce, variant.clone()).await;

        match self.broadcaster.broadcast(&variant.raw).await {
            Ok(_) => {}
            Err(e) => match e.normalize() {
                KeeperError::AlreadyKnown => {}
                e if e.is_nonce_conflict() => {
                    // the prior variant already confirmed; the next
                    // tick's resync will reap this record
                    info!(nonce, "replacement hit a used nonce, prior variant confirmed");
                    return Ok(());
                }
                KeeperError::FeeTooLow { message } => {
                    // the appended variant becomes the new baseline, so
                    // the next bump starts from a higher floor
                    warn!(nonce, message = %message, "replacement underpriced");
                    return Ok(());
                }
                e => return Err(e),
            },
        }

        info!(
            nonce,
            old_id = %old.id,
            new_id = %variant.id,
            max_fee = %variant.fees.max_fee_per_gas,
            priority_fee = %variant.fees.max_priority_fee_per_gas,
            "fee-bumped pending transaction"
        );
        metrics::record_bumped(&self.account_label);

        self.bus.publish(Replacement {
            nonce,
            old_id: old.id,
            old_raw: old.raw,
            new_id: variant.id,
            new_raw: variant.raw,
        });

        Ok(())
    }

    /// Re-send the active variant unchanged to counter mempool loss
    async fn rebroadcast(&self, record: &PendingRecord) -> KeeperResult<()> {
        let nonce = record.nonce;
        let active = record.active();

        // an attempt counts whether or not the node accepts it
        self.store.touch(nonce).await;

        match self.broadcaster.broadcast(&active.raw).await {
            Ok(_) => {}
            Err(e) => match e.normalize() {
                KeeperError::AlreadyKnown => {}
                e if e.is_nonce_conflict() => {
                    info!(nonce, "rebroadcast hit a used nonce, variant confirmed");
                    return Ok(());
                }
                e => return Err(e),
            },
        }

        debug!(
            nonce,
            tx_id = %active.id,
            raw = %hex::encode(&active.raw),
            "rebroadcast active variant"
        );
        metrics::record_rebroadcast(&self.account_label);
        Ok(())
    }
}
